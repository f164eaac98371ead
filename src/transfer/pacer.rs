//! Token-bucket pacing for outgoing packets.
//!
//! Each packet is charged its payload length plus [`HEADER_OVERHEAD`]
//! lower-layer bytes so the configured cap matches observed wire
//! bandwidth. The bucket belongs to the sender instance and is consulted
//! in its single packet-emit path.

use std::time::Duration;

use tokio::time::Instant;

use crate::transfer::protocol::HEADER_OVERHEAD;

/// Burst allowance, in max-size packets, granted by a full bucket.
const BURST_PACKETS: i64 = 13;

pub struct TokenBucket {
    tokens: i64,
    capacity: i64,
    ns_per_token: f64,
    last: Instant,
}

impl TokenBucket {
    /// `bw_mbit` is the rate cap in Mbit/s; 0 means unthrottled and
    /// yields no bucket.
    pub fn new(bw_mbit: u32, max_packet_size: usize) -> Option<TokenBucket> {
        if bw_mbit == 0 {
            return None;
        }
        let bytes_per_second = 1_000_000 * u64::from(bw_mbit) / 8;
        let capacity = BURST_PACKETS * (max_packet_size + HEADER_OVERHEAD) as i64;
        Some(TokenBucket {
            tokens: capacity,
            capacity,
            ns_per_token: 1e9 / bytes_per_second as f64,
            last: Instant::now(),
        })
    }

    /// Charge one outgoing packet of `payload_len` bytes, sleeping until
    /// the bucket covers the cost.
    pub async fn acquire(&mut self, payload_len: usize) {
        let cost = (payload_len + HEADER_OVERHEAD) as i64;
        loop {
            if self.tokens >= cost {
                self.tokens -= cost;
                return;
            }
            let now = Instant::now();
            let elapsed_ns = now.duration_since(self.last).as_nanos() as f64;
            let refilled = self.tokens + (elapsed_ns / self.ns_per_token).round() as i64;
            if refilled >= cost {
                self.tokens = refilled.min(self.capacity);
                self.last = now;
            } else {
                let wait_ns = ((cost - refilled) as f64 * self.ns_per_token).ceil() as u64;
                tokio::time::sleep(Duration::from_nanos(wait_ns)).await;
            }
        }
    }
}
