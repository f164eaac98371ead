//! Signed manifest: the self-contained description of a directory tree
//! that is broadcast before any file bytes.
//!
//! Wire format, big-endian throughout:
//!
//! ```text
//! uint32  dirCount
//! uint32  fileCount
//! dirCount  x ( uint16 pathLen | path | uint32 modts )
//! fileCount x ( uint16 pathLen | path | uint32 modts | uint64 size )
//! byte[64] hmac
//! ```
//!
//! The position of a file in the file list is its *file index*, the
//! 32-bit identifier used on the wire to name it.

use std::path::{Component, Path};
use std::time::UNIX_EPOCH;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use walkdir::WalkDir;

use crate::auth::{AuthKey, SIGNATURE_LEN};
use crate::error::Error;

/// Hard cap on the serialized manifest, enforced on both ends.
pub const MAX_MANIFEST_SIZE: usize = 5 * 1024 * 1024;

/// Smallest possible manifest: two counts plus the signature.
const MIN_MANIFEST_SIZE: usize = 4 + 4 + SIGNATURE_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRecord {
    /// Forward-slash separated, unrooted, cleaned relative path.
    pub path: String,
    /// Modification time, seconds since epoch.
    pub modts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: String,
    pub modts: u32,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub dirs: Vec<DirRecord>,
    pub files: Vec<FileRecord>,
}

impl Manifest {
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty() && self.files.is_empty()
    }

    /// Serialize and sign. Fails if a path exceeds the u16 length prefix
    /// or the result would exceed [`MAX_MANIFEST_SIZE`].
    pub fn serialize(&self, key: &AuthKey) -> Result<Bytes, Error> {
        if self.dirs.len() > u32::MAX as usize || self.files.len() > u32::MAX as usize {
            return Err(Error::ManifestTooLarge {
                size: usize::MAX,
                limit: MAX_MANIFEST_SIZE,
            });
        }

        let mut size = MIN_MANIFEST_SIZE;
        for d in &self.dirs {
            size += 2 + d.path.len() + 4;
        }
        for f in &self.files {
            size += 2 + f.path.len() + 4 + 8;
        }
        if size > MAX_MANIFEST_SIZE {
            return Err(Error::ManifestTooLarge {
                size,
                limit: MAX_MANIFEST_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(size);
        buf.put_u32(self.dirs.len() as u32);
        buf.put_u32(self.files.len() as u32);
        for d in &self.dirs {
            put_path(&mut buf, &d.path)?;
            buf.put_u32(d.modts);
        }
        for f in &self.files {
            put_path(&mut buf, &f.path)?;
            buf.put_u32(f.modts);
            buf.put_u64(f.size);
        }
        key.append_signature(&mut buf);
        Ok(buf.freeze())
    }

    /// Deserialize and verify a signed manifest.
    pub fn deserialize(data: &[u8], key: &AuthKey) -> Result<Manifest, Error> {
        if data.len() < MIN_MANIFEST_SIZE {
            return Err(Error::TruncatedManifest(data.len()));
        }
        let mut body = key.verify_trailing(data, "manifest")?;

        let dir_count = body.get_u32() as usize;
        let file_count = body.get_u32() as usize;

        let mut manifest = Manifest::default();
        manifest.dirs.reserve(dir_count.min(body.remaining()));
        manifest.files.reserve(file_count.min(body.remaining()));

        for _ in 0..dir_count {
            let (path, modts) = read_record(&mut body, data.len())?;
            manifest.dirs.push(DirRecord { path, modts });
        }
        for _ in 0..file_count {
            let (path, modts) = read_record(&mut body, data.len())?;
            if body.remaining() < 8 {
                return Err(Error::TruncatedManifest(data.len()));
            }
            let size = body.get_u64();
            manifest.files.push(FileRecord { path, modts, size });
        }
        Ok(manifest)
    }

    /// Build a manifest by walking `source`. A plain file yields a single
    /// file record named after it; a directory is walked depth-first in
    /// lexical order, which fixes the file indices for the broadcast.
    pub fn build(source: &Path) -> Result<Manifest, Error> {
        let meta = std::fs::metadata(source)?;
        let mut manifest = Manifest::default();

        if !meta.is_dir() {
            let name = source
                .file_name()
                .ok_or_else(|| Error::BadPath(source.display().to_string()))?
                .to_string_lossy()
                .into_owned();
            manifest.files.push(FileRecord {
                path: clean_path(&name)?,
                modts: modts_of(&meta),
                size: meta.len(),
            });
            return Ok(manifest);
        }

        let walk = WalkDir::new(source)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok());
        for entry in walk {
            if entry.path() == source {
                continue;
            }
            let rel = relative_path(source, entry.path())?;
            let Ok(meta) = entry.metadata() else {
                // entry vanished mid-walk; skip it like any other racy read
                continue;
            };
            let modts = modts_of(&meta);
            if meta.is_dir() {
                manifest.dirs.push(DirRecord { path: rel, modts });
            } else if meta.is_file() {
                manifest.files.push(FileRecord {
                    path: rel,
                    modts,
                    size: meta.len(),
                });
            }
        }
        Ok(manifest)
    }
}

fn put_path(buf: &mut BytesMut, path: &str) -> Result<(), Error> {
    if path.len() > u16::MAX as usize {
        return Err(Error::BadPath(path.to_string()));
    }
    buf.put_u16(path.len() as u16);
    buf.put_slice(path.as_bytes());
    Ok(())
}

fn read_record(body: &mut &[u8], total: usize) -> Result<(String, u32), Error> {
    if body.remaining() < 2 {
        return Err(Error::TruncatedManifest(total));
    }
    let len = body.get_u16() as usize;
    if body.remaining() < len + 4 {
        return Err(Error::TruncatedManifest(total));
    }
    let path = String::from_utf8(body[..len].to_vec())
        .map_err(|e| Error::BadPath(String::from_utf8_lossy(e.as_bytes()).into_owned()))?;
    body.advance(len);
    let modts = body.get_u32();
    Ok((clean_path(&path)?, modts))
}

pub(crate) fn modts_of(meta: &std::fs::Metadata) -> u32 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn relative_path(root: &Path, path: &Path) -> Result<String, Error> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| Error::BadPath(path.display().to_string()))?;
    let parts: Vec<&str> = rel
        .components()
        .map(|c| c.as_os_str().to_str().unwrap_or(""))
        .collect();
    clean_path(&parts.join("/"))
}

/// Validate and normalize a manifest path: non-empty, relative, no `.`,
/// no parent-dir escapes, forward slashes only.
pub fn clean_path(raw: &str) -> Result<String, Error> {
    if raw.is_empty() {
        return Err(Error::BadPath(raw.to_string()));
    }
    let path = Path::new(raw);
    let mut parts: Vec<&str> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(p) => {
                parts.push(p.to_str().ok_or_else(|| Error::BadPath(raw.to_string()))?)
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::BadPath(raw.to_string()));
            }
        }
    }
    if parts.is_empty() {
        return Err(Error::BadPath(raw.to_string()));
    }
    Ok(parts.join("/"))
}
