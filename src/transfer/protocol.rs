//! Wire packet family.
//!
//! Every packet starts with a one-byte type:
//!
//! | byte        | meaning                                     |
//! |-------------|---------------------------------------------|
//! | `0x00`      | heartbeat (reserved; receivers ignore it)   |
//! | `0x01`      | manifest chunk                              |
//! | `0x02`      | file transfer start                         |
//! | `0x03`      | file transfer complete                      |
//! | `0x80-0xFF` | file data, low 7 bits = sequence number     |
//!
//! `0x02` and `0x03` packets end with a 64-byte HMAC-SHA-512 trailer over
//! all preceding bytes. Manifest content is signed inside its serialized
//! body, not per chunk. Data packets are unsigned; their integrity comes
//! from the SHA-256 carried in the matching complete packet.
//!
//! All multi-byte integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::auth::{AuthKey, SIGNATURE_LEN};
use crate::error::Error;

pub const TYPE_HEARTBEAT: u8 = 0x00;
pub const TYPE_MANIFEST: u8 = 0x01;
pub const TYPE_FILE_START: u8 = 0x02;
pub const TYPE_FILE_COMPLETE: u8 = 0x03;

/// High bit marks a data packet; the low 7 bits carry the sequence.
pub const DATA_TYPE_BIT: u8 = 0x80;
pub const SEQ_MASK: u8 = 0x7F;

/// Lower-layer bytes per packet the pacer accounts for:
/// Ethernet dst + src + ethertype, 802.1Q tag, IPv4 header, UDP header.
pub const HEADER_OVERHEAD: usize = 6 + 6 + 2 + 4 + 20 + 8;

/// Manifest chunk header: type, session id, part index, and (part 0
/// only) the total serialized size.
pub const MANIFEST_PART0_HEADER: usize = 1 + 4 + 2 + 4;
pub const MANIFEST_PART_HEADER: usize = 1 + 4 + 2;

const FILE_START_BODY: usize = 1 + 1 + 4 + 4 + 8 + 8;
const FILE_COMPLETE_BODY: usize = 1 + 4 + 4 + 32;

/// Full length of a transfer start packet.
pub const FILE_START_LEN: usize = FILE_START_BODY + SIGNATURE_LEN;
/// Full length of a transfer complete packet.
pub const FILE_COMPLETE_LEN: usize = FILE_COMPLETE_BODY + SIGNATURE_LEN;

// ── Manifest chunk ───────────────────────────────────────────────────────

/// One fragment of the serialized manifest. All chunks of a broadcast
/// share the sender-chosen 32-bit session id; part 0 additionally
/// declares the total size so the receiver can allocate up front.
#[derive(Debug, Clone)]
pub struct ManifestChunk {
    pub id: u32,
    pub part: u16,
    /// Declared total size; present on part 0 only.
    pub total: Option<u32>,
    pub payload: Bytes,
}

impl ManifestChunk {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MANIFEST_PART0_HEADER + self.payload.len());
        buf.put_u8(TYPE_MANIFEST);
        buf.put_u32(self.id);
        buf.put_u16(self.part);
        if let Some(total) = self.total {
            buf.put_u32(total);
        }
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(packet: &[u8]) -> Result<ManifestChunk, Error> {
        if packet.len() < MANIFEST_PART_HEADER {
            return Err(Error::TruncatedPacket {
                what: "manifest chunk",
                got: packet.len(),
            });
        }
        let mut buf = &packet[1..];
        let id = buf.get_u32();
        let part = buf.get_u16();
        let total = if part == 0 {
            if buf.remaining() < 4 {
                return Err(Error::TruncatedPacket {
                    what: "manifest chunk",
                    got: packet.len(),
                });
            }
            Some(buf.get_u32())
        } else {
            None
        };
        Ok(ManifestChunk {
            id,
            part,
            total,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}

// ── File transfer start (0x02) ───────────────────────────────────────────

/// Announces the next file of the session. Signed.
///
/// The mtime field is carried as seconds since epoch but is redundant:
/// receivers stamp the manifest-recorded timestamp instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStart {
    /// 0 = regular file; receivers reject anything else.
    pub filetype: u8,
    pub manifest_id: u32,
    pub file_index: u32,
    pub size: u64,
    pub mtime: u64,
}

impl FileStart {
    pub fn encode(&self, key: &AuthKey) -> Bytes {
        let mut buf = BytesMut::with_capacity(FILE_START_LEN);
        buf.put_u8(TYPE_FILE_START);
        buf.put_u8(self.filetype);
        buf.put_u32(self.manifest_id);
        buf.put_u32(self.file_index);
        buf.put_u64(self.size);
        buf.put_u64(self.mtime);
        key.append_signature(&mut buf);
        buf.freeze()
    }

    /// Parse the fields without checking the signature; policy checks on
    /// the receiver run before authentication, matching the protocol's
    /// documented handling order.
    pub fn parse(packet: &[u8]) -> Result<FileStart, Error> {
        if packet.len() < FILE_START_LEN {
            return Err(Error::TruncatedPacket {
                what: "transfer start",
                got: packet.len(),
            });
        }
        let mut buf = &packet[1..];
        Ok(FileStart {
            filetype: buf.get_u8(),
            manifest_id: buf.get_u32(),
            file_index: buf.get_u32(),
            size: buf.get_u64(),
            mtime: buf.get_u64(),
        })
    }

    /// Verify the trailing signature over the 26-byte header.
    pub fn verify(packet: &[u8], key: &AuthKey) -> Result<(), Error> {
        if packet.len() < FILE_START_LEN {
            return Err(Error::TruncatedPacket {
                what: "transfer start",
                got: packet.len(),
            });
        }
        key.verify_trailing(&packet[..FILE_START_LEN], "transfer start")
            .map(|_| ())
    }
}

// ── File transfer complete (0x03) ────────────────────────────────────────

/// Ends the current transfer, carrying the SHA-256 of the file content.
/// Signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileComplete {
    pub manifest_id: u32,
    pub file_index: u32,
    pub hash: [u8; 32],
}

impl FileComplete {
    pub fn encode(&self, key: &AuthKey) -> Bytes {
        let mut buf = BytesMut::with_capacity(FILE_COMPLETE_LEN);
        buf.put_u8(TYPE_FILE_COMPLETE);
        buf.put_u32(self.manifest_id);
        buf.put_u32(self.file_index);
        buf.put_slice(&self.hash);
        key.append_signature(&mut buf);
        buf.freeze()
    }

    pub fn parse(packet: &[u8]) -> Result<FileComplete, Error> {
        if packet.len() < FILE_COMPLETE_LEN {
            return Err(Error::TruncatedPacket {
                what: "transfer complete",
                got: packet.len(),
            });
        }
        let mut buf = &packet[1..];
        let manifest_id = buf.get_u32();
        let file_index = buf.get_u32();
        let mut hash = [0u8; 32];
        buf.copy_to_slice(&mut hash);
        Ok(FileComplete {
            manifest_id,
            file_index,
            hash,
        })
    }

    pub fn verify(packet: &[u8], key: &AuthKey) -> Result<(), Error> {
        if packet.len() < FILE_COMPLETE_LEN {
            return Err(Error::TruncatedPacket {
                what: "transfer complete",
                got: packet.len(),
            });
        }
        key.verify_trailing(&packet[..FILE_COMPLETE_LEN], "transfer complete")
            .map(|_| ())
    }
}

// ── File data (0x80-0xFF) ────────────────────────────────────────────────

/// Rolling data-packet type byte. The first emitted byte is `0x80`
/// (sequence 0); after `0xFF` it wraps back to `0x80`, so the low 7 bits
/// cycle 0..=127 indefinitely.
#[derive(Debug)]
pub struct DataSequence(u8);

impl DataSequence {
    pub fn new() -> Self {
        Self(SEQ_MASK)
    }

    pub fn next_type_byte(&mut self) -> u8 {
        self.0 = self.0.wrapping_add(1);
        if self.0 == 0 {
            self.0 = DATA_TYPE_BIT;
        }
        self.0
    }
}

impl Default for DataSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a data packet for `seq` (low 7 bits used).
pub fn encode_data(seq: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(DATA_TYPE_BIT | (seq & SEQ_MASK));
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_start_roundtrip() {
        let key = AuthKey::derive("k");
        let start = FileStart {
            filetype: 0,
            manifest_id: 0xDEAD_BEEF,
            file_index: 7,
            size: 1 << 33,
            mtime: 1_700_000_000,
        };
        let pkt = start.encode(&key);
        assert_eq!(pkt.len(), FILE_START_LEN);
        assert_eq!(pkt[0], TYPE_FILE_START);
        FileStart::verify(&pkt, &key).unwrap();
        assert_eq!(FileStart::parse(&pkt).unwrap(), start);
    }

    #[test]
    fn file_start_tamper_detected() {
        let key = AuthKey::derive("k");
        let pkt = FileStart {
            filetype: 0,
            manifest_id: 1,
            file_index: 0,
            size: 100,
            mtime: 0,
        }
        .encode(&key);
        let mut tampered = pkt.to_vec();
        tampered[10] ^= 0x01; // size field
        assert!(matches!(
            FileStart::verify(&tampered, &key),
            Err(Error::InvalidSignature(_))
        ));
        let mut sig_flipped = pkt.to_vec();
        sig_flipped[FILE_START_LEN - 1] ^= 0x01;
        assert!(FileStart::verify(&sig_flipped, &key).is_err());
    }

    #[test]
    fn file_complete_roundtrip() {
        let key = AuthKey::derive("k");
        let complete = FileComplete {
            manifest_id: 42,
            file_index: 3,
            hash: [0xAB; 32],
        };
        let pkt = complete.encode(&key);
        assert_eq!(pkt.len(), FILE_COMPLETE_LEN);
        FileComplete::verify(&pkt, &key).unwrap();
        assert_eq!(FileComplete::parse(&pkt).unwrap(), complete);
    }

    #[test]
    fn truncated_control_packets() {
        assert!(matches!(
            FileStart::parse(&[TYPE_FILE_START; 40]),
            Err(Error::TruncatedPacket { .. })
        ));
        assert!(matches!(
            FileComplete::parse(&[TYPE_FILE_COMPLETE; 40]),
            Err(Error::TruncatedPacket { .. })
        ));
    }

    #[test]
    fn manifest_chunk_part0_header_is_11_bytes() {
        let chunk = ManifestChunk {
            id: 0x0102_0304,
            part: 0,
            total: Some(5000),
            payload: Bytes::from_static(b"abc"),
        };
        let pkt = chunk.encode();
        assert_eq!(pkt.len(), MANIFEST_PART0_HEADER + 3);

        let back = ManifestChunk::decode(&pkt).unwrap();
        assert_eq!(back.id, 0x0102_0304);
        assert_eq!(back.part, 0);
        assert_eq!(back.total, Some(5000));
        assert_eq!(&back.payload[..], b"abc");
    }

    #[test]
    fn manifest_chunk_later_header_is_7_bytes() {
        let chunk = ManifestChunk {
            id: 9,
            part: 3,
            total: None,
            payload: Bytes::from_static(b"xyz"),
        };
        let pkt = chunk.encode();
        assert_eq!(pkt.len(), MANIFEST_PART_HEADER + 3);

        let back = ManifestChunk::decode(&pkt).unwrap();
        assert_eq!(back.part, 3);
        assert_eq!(back.total, None);
        assert_eq!(&back.payload[..], b"xyz");
    }

    #[test]
    fn sequence_starts_at_0x80_and_wraps_past_0xff() {
        let mut seq = DataSequence::new();
        assert_eq!(seq.next_type_byte(), 0x80);
        assert_eq!(seq.next_type_byte(), 0x81);
        for _ in 2..127 {
            seq.next_type_byte();
        }
        assert_eq!(seq.next_type_byte(), 0xFF);
        // wrap skips 0x00..0x7F entirely
        assert_eq!(seq.next_type_byte(), 0x80);
    }

    #[test]
    fn data_packet_layout() {
        let pkt = encode_data(0, b"hello");
        assert_eq!(pkt[0], 0x80);
        assert_eq!(&pkt[1..], b"hello");
        let pkt = encode_data(127, b"");
        assert_eq!(pkt[0], 0xFF);
    }
}
