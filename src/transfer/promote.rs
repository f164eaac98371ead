//! Staged-file promotion.
//!
//! A completed transfer is renamed into place, stamped with the
//! manifest-recorded mtime, and logged with its throughput. This runs on
//! its own task, fed by a bounded channel that blocks rather than drops,
//! so a slow filesystem cannot starve packet intake and no completion is
//! ever lost.

use std::path::PathBuf;
use std::time::Instant;

use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Queue depth for pending promotions.
const PROMOTE_QUEUE: usize = 32;

#[derive(Debug)]
pub struct Promotion {
    pub tmp_path: PathBuf,
    pub final_path: PathBuf,
    /// Manifest-recorded mtime, seconds since epoch.
    pub modts: u32,
    pub size: u64,
    pub started: Instant,
    pub checksum: [u8; 32],
}

/// Spawn the promotion worker. Dropping the sender ends the task after
/// the queue drains.
pub fn spawn_promoter() -> (mpsc::Sender<Promotion>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Promotion>(PROMOTE_QUEUE);
    let handle = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            promote(job).await;
        }
    });
    (tx, handle)
}

async fn promote(job: Promotion) {
    let elapsed = job.started.elapsed();

    if let Err(rename_err) = fs::rename(&job.tmp_path, &job.final_path).await {
        // rename cannot cross filesystems; fall back to copy + unlink
        match fs::copy(&job.tmp_path, &job.final_path).await {
            Ok(_) => {
                let _ = fs::remove_file(&job.tmp_path).await;
            }
            Err(copy_err) => {
                warn!(
                    "failed to move staged file into {}: rename: {rename_err}, copy: {copy_err}",
                    job.final_path.display()
                );
                return;
            }
        }
    }

    let mtime = filetime::FileTime::from_unix_time(i64::from(job.modts), 0);
    let path = job.final_path.clone();
    match tokio::task::spawn_blocking(move || filetime::set_file_mtime(&path, mtime)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("failed to set mtime on {}: {e}", job.final_path.display()),
        Err(e) => warn!("mtime task failed for {}: {e}", job.final_path.display()),
    }

    let secs = elapsed.as_secs_f64();
    let kbit_per_s = if secs > 0.0 {
        (job.size as f64 * 8.0 / 1000.0 / secs).round()
    } else {
        0.0
    };
    let checksum: String = job.checksum.iter().map(|b| format!("{b:02x}")).collect();
    info!(
        "received {} ({} bytes, sha256={checksum}, {kbit_per_s} kbit/s)",
        job.final_path.display(),
        job.size
    );
}
