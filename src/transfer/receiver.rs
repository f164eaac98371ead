//! Receiver state machine.
//!
//! A single read loop on the joined socket dispatches on the first byte.
//! Manifest chunks reassemble into the current session; file bytes stage
//! under the temp directory and are promoted atomically once the carried
//! SHA-256 matches. Socket errors are fatal; protocol errors are logged
//! and the loop continues.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, bail, Context};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::auth::AuthKey;
use crate::error::Error;
use crate::manifest::{Manifest, MAX_MANIFEST_SIZE};
use crate::transfer::promote::{spawn_promoter, Promotion};
use crate::transfer::protocol::{
    FileComplete, FileStart, ManifestChunk, DATA_TYPE_BIT, SEQ_MASK, TYPE_FILE_COMPLETE,
    TYPE_FILE_START, TYPE_HEARTBEAT, TYPE_MANIFEST,
};

/// Prefix of staging filenames; leftovers are reaped at startup.
pub const STAGING_PREFIX: &str = "godiodetmp.";

pub struct ReceiverOptions {
    /// Target directory the tree is materialized into.
    pub root: PathBuf,
    /// Staging directory for in-flight files.
    pub tmp_dir: PathBuf,
    /// Remove files and directories absent from the manifest.
    pub delete: bool,
    pub file_permission: u32,
    pub folder_permission: u32,
    pub max_packet_size: usize,
}

/// The established manifest session all file packets are scoped to.
struct Session {
    id: u32,
    manifest: Manifest,
}

/// What the receiver is in the middle of. Transitions are total: any
/// packet either advances the current state or resets it with an error.
enum Transfer {
    Idle,
    Manifest(PendingManifest),
    File(PendingFile),
}

struct PendingManifest {
    id: u32,
    buf: Vec<u8>,
    offset: usize,
    next_part: u16,
}

struct PendingFile {
    manifest_id: u32,
    file_index: u32,
    expected: u64,
    received: u64,
    /// Low 7 bits of the next acceptable data packet type byte.
    next_seq: u8,
    hasher: Sha256,
    file: Option<fs::File>,
    started: Instant,
    modts: u32,
    final_path: PathBuf,
    tmp_path: PathBuf,
    failed: bool,
}

pub struct Receiver {
    opts: ReceiverOptions,
    key: AuthKey,
    session: Option<Session>,
    transfer: Transfer,
    promote_tx: mpsc::Sender<Promotion>,
}

impl Receiver {
    pub fn new(opts: ReceiverOptions, key: AuthKey) -> Receiver {
        let (promote_tx, _worker) = spawn_promoter();
        Receiver {
            opts,
            key,
            session: None,
            transfer: Transfer::Idle,
            promote_tx,
        }
    }

    /// Reap the staging directory, join the multicast group and serve
    /// until the process is terminated.
    pub async fn run(
        opts: ReceiverOptions,
        key: AuthKey,
        maddr: &str,
        nic: &str,
    ) -> anyhow::Result<()> {
        prepare_staging(&opts.tmp_dir).await?;
        let socket = join_multicast(maddr, nic).await?;
        Self::read_loop(socket, opts, key).await
    }

    /// Serve on a pre-bound socket.
    pub async fn serve(
        socket: UdpSocket,
        opts: ReceiverOptions,
        key: AuthKey,
    ) -> anyhow::Result<()> {
        prepare_staging(&opts.tmp_dir).await?;
        Self::read_loop(socket, opts, key).await
    }

    async fn read_loop(
        socket: UdpSocket,
        opts: ReceiverOptions,
        key: AuthKey,
    ) -> anyhow::Result<()> {
        let mut buf = vec![0u8; opts.max_packet_size];
        let mut receiver = Receiver::new(opts, key);
        loop {
            let (n, _from) = socket
                .recv_from(&mut buf)
                .await
                .context("socket read failed")?;
            if n == 0 {
                continue;
            }
            if let Err(e) = receiver.handle_packet(&buf[..n]).await {
                warn!("{e}");
            }
        }
    }

    /// Dispatch one packet. Errors are protocol-level: the caller logs
    /// them and keeps reading.
    pub async fn handle_packet(&mut self, packet: &[u8]) -> Result<(), Error> {
        let Some(&ptype) = packet.first() else {
            return Ok(());
        };
        if ptype & DATA_TYPE_BIT != 0 {
            return self.on_file_data(packet).await;
        }
        match ptype {
            TYPE_MANIFEST => self.on_manifest_chunk(packet).await,
            TYPE_FILE_START => self.on_file_start(packet).await,
            TYPE_FILE_COMPLETE => self.on_file_complete(packet).await,
            TYPE_HEARTBEAT => Ok(()),
            _ => Ok(()),
        }
    }

    // ── Manifest reassembly ──────────────────────────────────────────────

    async fn on_manifest_chunk(&mut self, packet: &[u8]) -> Result<(), Error> {
        let chunk = ManifestChunk::decode(packet)?;

        match std::mem::replace(&mut self.transfer, Transfer::Idle) {
            Transfer::Manifest(mut pending) => {
                if chunk.id != pending.id {
                    warn!(
                        "replacing pending manifest {:08x} before completion",
                        pending.id
                    );
                    return self.start_manifest(chunk).await;
                }
                if chunk.part != pending.next_part {
                    return Err(Error::OutOfOrder {
                        what: "manifest part",
                        expected: u32::from(pending.next_part),
                        got: u32::from(chunk.part),
                    });
                }
                let n = chunk
                    .payload
                    .len()
                    .min(pending.buf.len() - pending.offset);
                pending.buf[pending.offset..pending.offset + n]
                    .copy_from_slice(&chunk.payload[..n]);
                pending.offset += n;
                if pending.offset == pending.buf.len() {
                    let data = std::mem::take(&mut pending.buf);
                    self.complete_manifest(pending.id, &data).await
                } else {
                    pending.next_part += 1;
                    self.transfer = Transfer::Manifest(pending);
                    Ok(())
                }
            }
            Transfer::File(pending) => {
                // the sender never interleaves; a fresh manifest means the
                // in-flight file can no longer complete
                warn!(
                    "discarding pending transfer of {} for incoming manifest",
                    pending.final_path.display()
                );
                drop(pending);
                self.start_manifest(chunk).await
            }
            Transfer::Idle => self.start_manifest(chunk).await,
        }
    }

    async fn start_manifest(&mut self, chunk: ManifestChunk) -> Result<(), Error> {
        let (0, Some(total)) = (chunk.part, chunk.total) else {
            return Err(Error::OutOfOrder {
                what: "manifest part",
                expected: 0,
                got: u32::from(chunk.part),
            });
        };
        if total < 1 || total as usize > MAX_MANIFEST_SIZE {
            return Err(Error::InvalidManifestSize(total));
        }
        let total = total as usize;
        if chunk.payload.len() >= total {
            return self.complete_manifest(chunk.id, &chunk.payload[..total]).await;
        }
        let mut buf = vec![0u8; total];
        buf[..chunk.payload.len()].copy_from_slice(&chunk.payload);
        self.transfer = Transfer::Manifest(PendingManifest {
            id: chunk.id,
            offset: chunk.payload.len(),
            buf,
            next_part: 1,
        });
        Ok(())
    }

    async fn complete_manifest(&mut self, id: u32, data: &[u8]) -> Result<(), Error> {
        let manifest = Manifest::deserialize(data, &self.key)?;
        info!(
            "received manifest {:08x}: {} dirs, {} files",
            id,
            manifest.dirs.len(),
            manifest.files.len()
        );
        self.session = Some(Session { id, manifest });
        self.reconcile().await
    }

    // ── Tree reconciliation ──────────────────────────────────────────────

    async fn reconcile(&self) -> Result<(), Error> {
        let Some(session) = &self.session else {
            return Ok(());
        };
        self.create_dirs(&session.manifest).await;
        if self.opts.delete {
            self.delete_extraneous(&session.manifest).await?;
        }
        Ok(())
    }

    async fn create_dirs(&self, manifest: &Manifest) {
        for dir in &manifest.dirs {
            let full = match validate_path(&self.opts.root, &dir.path) {
                Ok(p) => p,
                Err(e) => {
                    warn!("skipping manifest dir: {e}");
                    continue;
                }
            };
            if let Err(e) = fs::create_dir_all(&full).await {
                warn!("failed to create {}: {e}", full.display());
                continue;
            }
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(self.opts.folder_permission);
                if let Err(e) = fs::set_permissions(&full, perms).await {
                    warn!("failed to set permissions on {}: {e}", full.display());
                }
            }
            let mtime = filetime::FileTime::from_unix_time(i64::from(dir.modts), 0);
            let path = full.clone();
            let stamped =
                tokio::task::spawn_blocking(move || filetime::set_file_mtime(&path, mtime)).await;
            if !matches!(stamped, Ok(Ok(()))) {
                warn!("failed to set mtime on {}", full.display());
            }
        }
    }

    /// Delete-mode sweep: anything under the root that the manifest does
    /// not account for (by path, size and modts for files; by path for
    /// directories) is removed. The staging directory is never touched.
    async fn delete_extraneous(&self, manifest: &Manifest) -> Result<(), Error> {
        let root = self.opts.root.clone();
        let tmp_dir = self.opts.tmp_dir.clone();
        let entries = tokio::task::spawn_blocking(move || scan_tree(&root, &tmp_dir))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;

        let keep_files: HashMap<&str, (u64, u32)> = manifest
            .files
            .iter()
            .map(|f| (f.path.as_str(), (f.size, f.modts)))
            .collect();
        let keep_dirs: HashSet<&str> = manifest.dirs.iter().map(|d| d.path.as_str()).collect();

        let mut stale_dirs: Vec<String> = Vec::new();
        for entry in entries {
            if entry.is_dir {
                if !keep_dirs.contains(entry.rel.as_str()) {
                    stale_dirs.push(entry.rel);
                }
                continue;
            }
            if keep_files.get(entry.rel.as_str()) == Some(&(entry.size, entry.modts)) {
                continue;
            }
            let full = self.opts.root.join(&entry.rel);
            match fs::remove_file(&full).await {
                Ok(()) => debug!("removed file {}", full.display()),
                Err(e) => warn!("failed to delete {}: {e}", full.display()),
            }
        }

        // children before parents
        stale_dirs.sort_by_key(|d| std::cmp::Reverse(d.matches('/').count()));
        for rel in stale_dirs {
            let full = self.opts.root.join(&rel);
            match fs::remove_dir(&full).await {
                Ok(()) => debug!("removed dir {}", full.display()),
                Err(e) => warn!("failed to delete {}: {e}", full.display()),
            }
        }
        Ok(())
    }

    // ── File transfer ────────────────────────────────────────────────────

    async fn on_file_start(&mut self, packet: &[u8]) -> Result<(), Error> {
        let start = FileStart::parse(packet)?;
        if start.filetype != 0 {
            return Err(Error::UnknownFileType(start.filetype));
        }
        let session = self.session.as_ref().ok_or(Error::NoSession)?;
        if start.manifest_id != session.id {
            return Err(Error::UnknownManifest {
                got: start.manifest_id,
                current: session.id,
            });
        }
        let count = session.manifest.files.len() as u32;
        if start.file_index >= count {
            return Err(Error::InvalidFileIndex {
                index: start.file_index,
                count,
            });
        }
        match std::mem::replace(&mut self.transfer, Transfer::Idle) {
            Transfer::Idle => {}
            Transfer::File(pending) => {
                warn!(
                    "new transfer start with {} still pending, discarding it",
                    pending.final_path.display()
                );
            }
            Transfer::Manifest(pending) => {
                warn!(
                    "transfer start while reassembling manifest {:08x}, discarding it",
                    pending.id
                );
            }
        }
        FileStart::verify(packet, &self.key)?;

        let record = &session.manifest.files[start.file_index as usize];
        let final_path = validate_path(&self.opts.root, &record.path)?;
        let tmp_path = self
            .opts
            .tmp_dir
            .join(staging_name(start.manifest_id, start.file_index));

        let mut open = fs::OpenOptions::new();
        open.write(true).create(true).truncate(true);
        #[cfg(unix)]
        open.mode(self.opts.file_permission);
        let file = open.open(&tmp_path).await?;

        debug!(
            "transfer start: {} ({} bytes declared)",
            record.path, start.size
        );
        self.transfer = Transfer::File(PendingFile {
            manifest_id: start.manifest_id,
            file_index: start.file_index,
            expected: start.size,
            received: 0,
            next_seq: 0,
            hasher: Sha256::new(),
            file: Some(file),
            started: Instant::now(),
            modts: record.modts,
            final_path,
            tmp_path,
            failed: false,
        });
        Ok(())
    }

    async fn on_file_data(&mut self, packet: &[u8]) -> Result<(), Error> {
        let Transfer::File(pending) = &mut self.transfer else {
            // data is only meaningful while a transfer is pending
            return Ok(());
        };
        if pending.failed {
            return Ok(());
        }
        let seq = packet[0] & SEQ_MASK;
        let payload = &packet[1..];
        if seq != pending.next_seq {
            let (expected, got) = (pending.next_seq, seq);
            self.fail_pending().await;
            return Err(Error::OutOfOrder {
                what: "file data",
                expected: u32::from(expected),
                got: u32::from(got),
            });
        }
        let received = pending.received + payload.len() as u64;
        if received > pending.expected {
            let expected = pending.expected;
            self.fail_pending().await;
            return Err(Error::OversizeTransfer { expected, received });
        }
        let Some(file) = pending.file.as_mut() else {
            return Ok(());
        };
        if let Err(e) = file.write_all(payload).await {
            self.fail_pending().await;
            return Err(e.into());
        }
        pending.hasher.update(payload);
        pending.received = received;
        pending.next_seq = (pending.next_seq + 1) & SEQ_MASK;
        Ok(())
    }

    /// Mark the in-flight transfer errored and drop its staging file.
    /// The entry itself stays until the next start or complete packet.
    async fn fail_pending(&mut self) {
        if let Transfer::File(pending) = &mut self.transfer {
            pending.failed = true;
            pending.file = None;
            if let Err(e) = fs::remove_file(&pending.tmp_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        "failed to remove staging file {}: {e}",
                        pending.tmp_path.display()
                    );
                }
            }
        }
    }

    async fn on_file_complete(&mut self, packet: &[u8]) -> Result<(), Error> {
        let complete = FileComplete::parse(packet)?;
        let Transfer::File(pending) = &self.transfer else {
            return Err(Error::NoPendingTransfer);
        };
        if complete.manifest_id != pending.manifest_id {
            return Err(Error::UnknownManifest {
                got: complete.manifest_id,
                current: pending.manifest_id,
            });
        }
        if complete.file_index != pending.file_index {
            return Err(Error::OutOfOrder {
                what: "transfer complete",
                expected: pending.file_index,
                got: complete.file_index,
            });
        }
        // on signature mismatch the pending transfer is kept: a
        // retransmitted complete packet may still finish the file
        FileComplete::verify(packet, &self.key)?;

        let mut pending = match std::mem::replace(&mut self.transfer, Transfer::Idle) {
            Transfer::File(pending) => pending,
            other => {
                self.transfer = other;
                return Err(Error::NoPendingTransfer);
            }
        };
        if let Some(mut file) = pending.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        let digest: [u8; 32] = pending.hasher.finalize().into();
        if pending.failed || digest != complete.hash {
            if let Err(e) = fs::remove_file(&pending.tmp_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        "failed to remove staging file {}: {e}",
                        pending.tmp_path.display()
                    );
                }
            }
            return Err(Error::ChecksumMismatch(
                pending.final_path.display().to_string(),
            ));
        }
        self.promote_tx
            .send(Promotion {
                tmp_path: pending.tmp_path,
                final_path: pending.final_path,
                modts: pending.modts,
                size: pending.received,
                started: pending.started,
                checksum: digest,
            })
            .await
            .map_err(|_| Error::Io(std::io::Error::other("promotion worker stopped")))?;
        Ok(())
    }
}

fn staging_name(manifest_id: u32, file_index: u32) -> String {
    format!("{STAGING_PREFIX}{manifest_id:x}.{file_index}")
}

/// Validate a manifest-relative path and resolve it under `root`.
/// Rejects anything absolute, traversing, or escaping the root.
fn validate_path(root: &Path, relative: &str) -> Result<PathBuf, Error> {
    if relative.is_empty() {
        return Err(Error::BadPath(relative.to_string()));
    }
    let rel = Path::new(relative);
    if rel.is_absolute() {
        return Err(Error::BadPath(relative.to_string()));
    }
    for component in rel.components() {
        if matches!(component, Component::ParentDir | Component::Prefix(_)) {
            return Err(Error::BadPath(relative.to_string()));
        }
    }
    let full = root.join(rel);
    if !normalize_path(&full).starts_with(normalize_path(root)) {
        return Err(Error::BadPath(relative.to_string()));
    }
    Ok(full)
}

/// Normalize without touching the filesystem (unlike canonicalize).
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            c => normalized.push(c),
        }
    }
    normalized
}

struct TreeEntry {
    rel: String,
    is_dir: bool,
    size: u64,
    modts: u32,
}

fn scan_tree(root: &Path, tmp_dir: &Path) -> Vec<TreeEntry> {
    let mut entries = Vec::new();
    let walker = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| !e.path().starts_with(tmp_dir));
    for entry in walker.filter_map(|e| e.ok()) {
        if entry.path() == root {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let rel: Vec<_> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        entries.push(TreeEntry {
            rel: rel.join("/"),
            is_dir: meta.is_dir(),
            size: meta.len(),
            modts: crate::manifest::modts_of(&meta),
        });
    }
    entries
}

/// Create the staging directory if needed and remove leftovers from a
/// previous run. Runs before the socket is joined.
pub async fn prepare_staging(tmp_dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(tmp_dir)
        .await
        .with_context(|| format!("could not create staging dir {}", tmp_dir.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(tmp_dir, std::fs::Permissions::from_mode(0o700)).await;
    }
    let mut entries = fs::read_dir(tmp_dir)
        .await
        .with_context(|| format!("could not read staging dir {}", tmp_dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
            if let Err(e) = fs::remove_file(entry.path()).await {
                warn!("failed to reap {}: {e}", entry.path().display());
            }
        }
    }
    Ok(())
}

/// Bind the group port and join the multicast group, optionally on the
/// interface with the given IPv4 address.
pub async fn join_multicast(maddr: &str, nic: &str) -> anyhow::Result<UdpSocket> {
    let addr = tokio::net::lookup_host(maddr)
        .await
        .with_context(|| format!("failed to resolve multicast address {maddr}"))?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| anyhow!("no IPv4 address for {maddr}"))?;
    let std::net::SocketAddr::V4(group) = addr else {
        bail!("only IPv4 multicast is supported");
    };
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, group.port()))
        .await
        .with_context(|| format!("failed to bind port {}", group.port()))?;
    if group.ip().is_multicast() {
        let iface: Ipv4Addr = if nic.is_empty() {
            Ipv4Addr::UNSPECIFIED
        } else {
            nic.parse()
                .context("interface must be given as an IPv4 address")?
        };
        socket
            .join_multicast_v4(*group.ip(), iface)
            .with_context(|| format!("failed to join multicast group {}", group.ip()))?;
    }
    Ok(socket)
}
