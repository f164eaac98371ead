//! Sender state machine.
//!
//! One logical round: emit the signed manifest in paced chunks, give the
//! receiver a moment to create directories and run deletions, then stream
//! every file in manifest order as start / data / complete packets. The
//! whole round repeats `resend_count` times to compensate for loss on the
//! diode link. All packets leave through a single emit path so the token
//! bucket sees every byte.

use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::auth::AuthKey;
use crate::manifest::Manifest;
use crate::transfer::pacer::TokenBucket;
use crate::transfer::protocol::{
    DataSequence, FileComplete, FileStart, ManifestChunk, MANIFEST_PART0_HEADER,
};

/// Settle time after the manifest so the receiver can mkdir and delete.
const ROUND_SETTLE: Duration = Duration::from_secs(1);

pub struct SenderOptions {
    pub max_packet_size: usize,
    /// Rate cap in Mbit/s; 0 means unthrottled.
    pub bw: u32,
    pub resend_count: u32,
    pub resend_manifest: bool,
    pub chunk_delay: Duration,
    pub file_delay: Duration,
}

pub struct Sender {
    socket: UdpSocket,
    key: AuthKey,
    opts: SenderOptions,
    bucket: Option<TokenBucket>,
}

impl Sender {
    /// Resolve and dial the multicast group, optionally from a fixed
    /// source address.
    pub async fn connect(
        maddr: &str,
        baddr: &str,
        opts: SenderOptions,
        key: AuthKey,
    ) -> anyhow::Result<Sender> {
        let target = tokio::net::lookup_host(maddr)
            .await
            .with_context(|| format!("failed to resolve multicast address {maddr}"))?
            .find(|a| a.is_ipv4())
            .ok_or_else(|| anyhow!("no IPv4 address for {maddr}"))?;
        let socket = if baddr.is_empty() {
            UdpSocket::bind("0.0.0.0:0")
                .await
                .context("failed to bind send socket")?
        } else {
            UdpSocket::bind(baddr)
                .await
                .with_context(|| format!("failed to bind {baddr}"))?
        };
        socket
            .connect(target)
            .await
            .with_context(|| format!("failed to dial {target}"))?;
        let bucket = TokenBucket::new(opts.bw, opts.max_packet_size);
        Ok(Sender {
            socket,
            key,
            opts,
            bucket,
        })
    }

    /// Broadcast `source`, a directory tree or a single file.
    pub async fn run(&mut self, source: &Path) -> anyhow::Result<()> {
        let meta = tokio::fs::metadata(source)
            .await
            .with_context(|| format!("failed to stat {}", source.display()))?;
        let build_root = source.to_path_buf();
        let manifest = tokio::task::spawn_blocking(move || Manifest::build(&build_root))
            .await
            .context("manifest build task failed")??;
        if manifest.is_empty() {
            bail!("no files to send");
        }
        let manifest_data = manifest.serialize(&self.key)?;
        let manifest_id: u32 = rand::random();
        info!(
            "manifest {:08x}: {} dirs, {} files, {} bytes serialized",
            manifest_id,
            manifest.dirs.len(),
            manifest.files.len(),
            manifest_data.len()
        );

        for round in 0..self.opts.resend_count {
            self.send_manifest(manifest_id, &manifest_data).await?;
            // give the receiver room to create directories and delete
            sleep(ROUND_SETTLE).await;

            for (index, record) in manifest.files.iter().enumerate() {
                let path = if meta.is_dir() {
                    source.join(&record.path)
                } else {
                    source.to_path_buf()
                };
                if let Err(e) = self.send_file(manifest_id, index as u32, &path).await {
                    error!("failed to send {}: {e}", record.path);
                    continue;
                }
                if self.opts.resend_manifest {
                    self.send_manifest(manifest_id, &manifest_data).await?;
                }
            }
            info!(
                "all files sent, transmission {} of {}",
                round + 1,
                self.opts.resend_count
            );
        }
        Ok(())
    }

    /// Pace and write one packet.
    async fn emit(&mut self, packet: &[u8]) -> std::io::Result<()> {
        if let Some(bucket) = &mut self.bucket {
            bucket.acquire(packet.len()).await;
        }
        self.socket.send(packet).await?;
        Ok(())
    }

    async fn send_manifest(&mut self, id: u32, data: &[u8]) -> anyhow::Result<()> {
        if self.opts.max_packet_size < MANIFEST_PART0_HEADER + 3 {
            bail!(
                "max packet size {} too small for manifest chunks",
                self.opts.max_packet_size
            );
        }
        let chunk_payload = self.opts.max_packet_size - MANIFEST_PART0_HEADER;
        let parts = data.len().div_ceil(chunk_payload);
        if parts > usize::from(u16::MAX) + 1 {
            bail!("manifest would need {parts} chunks");
        }
        debug!("sending manifest {id:08x} in {parts} chunks");
        for (part, slice) in data.chunks(chunk_payload).enumerate() {
            let chunk = ManifestChunk {
                id,
                part: part as u16,
                total: (part == 0).then(|| data.len() as u32),
                payload: Bytes::copy_from_slice(slice),
            };
            self.emit(&chunk.encode())
                .await
                .context("manifest chunk write failed")?;
            sleep(self.opts.chunk_delay).await;
        }
        Ok(())
    }

    async fn send_file(
        &mut self,
        manifest_id: u32,
        file_index: u32,
        path: &Path,
    ) -> anyhow::Result<()> {
        let meta = tokio::fs::metadata(path).await?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let start = FileStart {
            filetype: 0,
            manifest_id,
            file_index,
            size: meta.len(),
            mtime,
        };
        self.emit(&start.encode(&self.key)).await?;
        sleep(self.opts.chunk_delay).await;

        debug!("sending {} ({} bytes)", path.display(), meta.len());
        let file = File::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut reader = BufReader::new(file);
        let mut seq = DataSequence::new();
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; self.opts.max_packet_size];
        loop {
            let n = reader.read(&mut buf[1..]).await?;
            if n == 0 {
                break;
            }
            buf[0] = seq.next_type_byte();
            hasher.update(&buf[1..1 + n]);
            self.emit(&buf[..1 + n]).await?;
        }

        let hash: [u8; 32] = hasher.finalize().into();
        let complete = FileComplete {
            manifest_id,
            file_index,
            hash,
        };
        self.emit(&complete.encode(&self.key)).await?;
        sleep(self.opts.file_delay).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FileRecord;
    use crate::transfer::protocol::TYPE_MANIFEST;

    fn quick_opts(max_packet_size: usize) -> SenderOptions {
        SenderOptions {
            max_packet_size,
            bw: 0,
            resend_count: 1,
            resend_manifest: false,
            chunk_delay: Duration::ZERO,
            file_delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn manifest_chunks_respect_packet_cap_and_reassemble() {
        let key = AuthKey::derive("k");
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = sink.local_addr().unwrap().to_string();
        let mut sender = Sender::connect(&target, "", quick_opts(64), key.clone())
            .await
            .unwrap();

        let manifest = Manifest {
            dirs: vec![],
            files: (0..20)
                .map(|i| FileRecord {
                    path: format!("dir/file-{i:04}.dat"),
                    modts: 1_600_000_000,
                    size: i as u64,
                })
                .collect(),
        };
        let data = manifest.serialize(&key).unwrap();
        sender.send_manifest(0xABCD, &data).await.unwrap();

        let mut reassembled = vec![0u8; data.len()];
        let mut offset = 0;
        let mut expected_part = 0u16;
        let mut buf = [0u8; 256];
        while offset < data.len() {
            let n = sink.recv(&mut buf).await.unwrap();
            assert!(n <= 64, "packet of {n} bytes exceeds the cap");
            assert_eq!(buf[0], TYPE_MANIFEST);
            let chunk = ManifestChunk::decode(&buf[..n]).unwrap();
            assert_eq!(chunk.id, 0xABCD);
            assert_eq!(chunk.part, expected_part);
            if chunk.part == 0 {
                assert_eq!(chunk.total, Some(data.len() as u32));
            }
            reassembled[offset..offset + chunk.payload.len()].copy_from_slice(&chunk.payload);
            offset += chunk.payload.len();
            expected_part += 1;
        }
        assert_eq!(&reassembled[..], &data[..]);
        Manifest::deserialize(&reassembled, &key).unwrap();
    }

    #[tokio::test]
    async fn file_stream_carries_rolling_sequence() {
        let key = AuthKey::derive("k");
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = sink.local_addr().unwrap().to_string();
        // 17-byte packets leave 16 bytes of payload: 200 packets of data,
        // enough to wrap the 7-bit sequence
        let mut sender = Sender::connect(&target, "", quick_opts(17), key.clone())
            .await
            .unwrap();

        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("big.bin");
        let content: Vec<u8> = (0..3200u32).map(|i| i as u8).collect();
        std::fs::write(&path, &content).unwrap();

        // drain concurrently so the loopback socket buffer cannot overflow
        let send_task = tokio::spawn(async move { sender.send_file(1, 0, &path).await });

        let mut buf = [0u8; 256];
        // transfer start
        let n = sink.recv(&mut buf).await.unwrap();
        let start = FileStart::parse(&buf[..n]).unwrap();
        assert_eq!(start.size, 3200);

        let mut received = Vec::new();
        let mut expected_type = 0x80u8;
        loop {
            let n = sink.recv(&mut buf).await.unwrap();
            if buf[0] == crate::transfer::protocol::TYPE_FILE_COMPLETE {
                let complete = FileComplete::parse(&buf[..n]).unwrap();
                let digest: [u8; 32] = Sha256::digest(&content).into();
                assert_eq!(complete.hash, digest);
                break;
            }
            assert_eq!(buf[0], expected_type);
            received.extend_from_slice(&buf[1..n]);
            expected_type = if expected_type == 0xFF {
                0x80
            } else {
                expected_type + 1
            };
        }
        assert_eq!(received, content);
        send_task.await.unwrap().unwrap();
    }
}
