//! The diode transfer protocol: wire codec, pacing, sender and receiver.
//!
//! ```text
//! send side:    manifest builder -> manifest codec -> wire codec
//!                                -> token bucket -> UDP socket
//! receive side: UDP socket -> wire codec -> (manifest reassembly |
//!                file staging) -> atomic promotion
//! ```

pub mod pacer;
pub mod promote;
pub mod protocol;
pub mod receiver;
pub mod sender;

pub use pacer::TokenBucket;
pub use receiver::{Receiver, ReceiverOptions};
pub use sender::{Sender, SenderOptions};
