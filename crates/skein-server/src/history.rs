//! Per-worker result history with a retention cap
//!
//! When history recording is enabled, a detaching worker's result region is
//! written under `<output dir>/<worker>/`. Record names start with a UTC
//! timestamp, so lexicographic order equals chronological order and pruning
//! can simply drop the front of the sorted list.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::Utc;

// disambiguates records written within the same millisecond
static RECORD_SEQ: AtomicU64 = AtomicU64::new(0);

/// Write one history record for `worker` and prune records beyond `cap`
/// (0 = unlimited).
pub fn record(output_dir: &Path, worker: &str, data: &[u8], cap: usize) -> Result<PathBuf> {
    let dir = output_dir.join(worker);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create history dir {}", dir.display()))?;

    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
    let seq = RECORD_SEQ.fetch_add(1, Ordering::Relaxed);
    let path = dir.join(format!("{stamp}-{seq:06}.dat"));
    let tmp = dir.join(format!("{stamp}-{seq:06}.dat.tmp"));
    fs::write(&tmp, data).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, &path)
        .with_context(|| format!("failed to move record into place: {}", path.display()))?;

    prune(&dir, cap)?;
    Ok(path)
}

/// Keep the newest `cap` records in `dir`.
fn prune(dir: &Path, cap: usize) -> Result<()> {
    if cap == 0 {
        return Ok(());
    }
    let pattern = dir.join("*.dat");
    let mut records: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
        .context("invalid glob pattern")?
        .filter_map(|entry| entry.ok())
        .collect();
    records.sort();
    if records.len() <= cap {
        return Ok(());
    }
    let excess = records.len() - cap;
    for old in &records[..excess] {
        fs::remove_file(old).with_context(|| format!("failed to remove {}", old.display()))?;
        log::debug!("pruned history record {}", old.display());
    }
    Ok(())
}
