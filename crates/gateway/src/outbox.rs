// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! On-disk outbox for store-and-forward payloads.
//!
//! Layout: `resend_YYYYMMDDHHMMSS_<seq>.json`, retry escalations become
//! `.retryN.json`, terminal failures become `.fail`. The sender persists
//! every payload here BEFORE the POST; the resend worker is the only
//! deleter/renamer.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::Deserialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct OutboxConfig {
    pub dir: PathBuf,
    #[serde(default = "default_quota_mb")]
    pub resend_quota_mb: u64,
    #[serde(default = "default_fs_free_min_mb")]
    pub fs_free_min_mb: u64,
    #[serde(default = "default_protect_recent_sec")]
    pub resend_protect_recent_sec: u64,
    #[serde(default = "default_cleanup_batch")]
    pub resend_cleanup_batch: usize,
    #[serde(default = "default_cleanup_enabled")]
    pub resend_cleanup_enabled: bool,
}

fn default_quota_mb() -> u64 {
    64
}

fn default_fs_free_min_mb() -> u64 {
    128
}

fn default_protect_recent_sec() -> u64 {
    600
}

fn default_cleanup_batch() -> usize {
    50
}

fn default_cleanup_enabled() -> bool {
    true
}

impl OutboxConfig {
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            resend_quota_mb: default_quota_mb(),
            fs_free_min_mb: default_fs_free_min_mb(),
            resend_protect_recent_sec: default_protect_recent_sec(),
            resend_cleanup_batch: default_cleanup_batch(),
            resend_cleanup_enabled: default_cleanup_enabled(),
        }
    }
}

pub struct OutboxStore {
    config: OutboxConfig,
    seq: AtomicU64,
}

impl OutboxStore {
    pub fn new(config: OutboxConfig) -> std::io::Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        Ok(Self { config, seq: AtomicU64::new(0) })
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Persist one payload as one file, named after its label time.
    pub fn persist_payload(
        &self,
        payload: &serde_json::Value,
        label_time: DateTime<Local>,
    ) -> std::io::Result<PathBuf> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let name = format!("resend_{}_{seq}.json", label_time.format("%Y%m%d%H%M%S"));
        let path = self.config.dir.join(name);
        std::fs::write(&path, serde_json::to_vec(payload)?)?;
        debug!(file = %path.display(), "outbox payload persisted");
        Ok(path)
    }

    pub fn delete(&self, path: &Path) {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(file = %path.display(), "outbox file deleted"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(file = %path.display(), "outbox delete failed: {e}"),
        }
    }

    /// Oldest pending files first, capped at `batch`, skipping files younger
    /// than `min_age_sec` and terminal `.fail` files.
    pub fn pick_batch(&self, batch: usize, min_age_sec: f64) -> Vec<PathBuf> {
        let mut files = self.pending_files();
        files.sort_by_key(|(_, modified)| *modified);
        let now = std::time::SystemTime::now();
        files
            .into_iter()
            .filter(|(_, modified)| {
                now.duration_since(*modified)
                    .map(|age| age.as_secs_f64() >= min_age_sec)
                    .unwrap_or(true)
            })
            .take(batch)
            .map(|(path, _)| path)
            .collect()
    }

    /// Count of pending (non-terminal) files.
    pub fn pending_count(&self) -> usize {
        self.pending_files().len()
    }

    /// Bump the retry counter in the filename, or mark the file terminal.
    /// Returns the new path and whether the file went terminal.
    pub fn retry_or_fail(&self, path: &Path, max_retry: u32) -> (Option<PathBuf>, bool) {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return (None, false);
        };
        let retry = parse_retry(name);
        let next = retry + 1;

        if next >= max_retry {
            let failed = path.with_extension("fail");
            match std::fs::rename(path, &failed) {
                Ok(()) => {
                    warn!(file = %failed.display(), "outbox file marked terminal");
                    return (Some(failed), true);
                }
                Err(e) => {
                    warn!(file = %path.display(), "terminal rename failed: {e}");
                    return (None, false);
                }
            }
        }

        let base = base_name(name);
        let renamed = path.with_file_name(format!("{base}.retry{next}.json"));
        match std::fs::rename(path, &renamed) {
            Ok(()) => (Some(renamed), false),
            Err(e) => {
                warn!(file = %path.display(), "retry rename failed: {e}");
                (None, false)
            }
        }
    }

    /// Keep the outbox inside its disk budget: drop the oldest unprotected
    /// files while the directory exceeds the quota or the filesystem is
    /// below its free-space floor.
    pub fn enforce_budget(&self) {
        if !self.config.resend_cleanup_enabled {
            return;
        }
        let mut files = self.pending_files();
        files.sort_by_key(|(_, modified)| *modified);

        let mut total_bytes: u64 = files
            .iter()
            .filter_map(|(path, _)| std::fs::metadata(path).ok())
            .map(|meta| meta.len())
            .sum();
        let quota_bytes = self.config.resend_quota_mb * 1024 * 1024;
        let now = std::time::SystemTime::now();
        let mut deleted = 0usize;

        for (path, modified) in files {
            let over_quota = total_bytes > quota_bytes;
            let fs_starved = self.fs_free_mb().map(|free| free < self.config.fs_free_min_mb).unwrap_or(false);
            if !over_quota && !fs_starved {
                break;
            }
            if deleted >= self.config.resend_cleanup_batch {
                break;
            }
            let age = now.duration_since(modified).map(|d| d.as_secs()).unwrap_or(u64::MAX);
            if age < self.config.resend_protect_recent_sec {
                // Everything after this file is younger still.
                break;
            }
            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            self.delete(&path);
            total_bytes = total_bytes.saturating_sub(size);
            deleted += 1;
        }
        if deleted > 0 {
            info!(deleted, "outbox budget enforcement removed files");
        }
    }

    fn pending_files(&self) -> Vec<(PathBuf, std::time::SystemTime)> {
        let Ok(entries) = std::fs::read_dir(&self.config.dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                let name = path.file_name()?.to_str()?;
                if !name.starts_with("resend_") || !name.ends_with(".json") {
                    return None;
                }
                let modified = entry.metadata().ok()?.modified().ok()?;
                Some((path, modified))
            })
            .collect()
    }

    fn fs_free_mb(&self) -> Option<u64> {
        let stat = nix::sys::statvfs::statvfs(&self.config.dir).ok()?;
        let free = stat.blocks_available() as u64 * stat.fragment_size() as u64;
        Some(free / (1024 * 1024))
    }
}

/// Retry counter encoded in the filename; 0 when absent.
pub fn parse_retry(name: &str) -> u32 {
    let base = name.strip_suffix(".json").unwrap_or(name);
    let Some(idx) = base.rfind(".retry") else {
        return 0;
    };
    base[idx + ".retry".len()..].parse().unwrap_or(0)
}

/// Filename without `.retryN.json` / `.json` suffixes.
fn base_name(name: &str) -> &str {
    let base = name.strip_suffix(".json").unwrap_or(name);
    match base.rfind(".retry") {
        Some(idx) if base[idx + ".retry".len()..].chars().all(|c| c.is_ascii_digit()) => {
            &base[..idx]
        }
        _ => base,
    }
}

/// Label timestamp encoded in the filename (`resend_YYYYMMDDHHMMSS_...`).
pub fn label_from_filename(name: &str) -> Option<DateTime<Local>> {
    let rest = name.strip_prefix("resend_")?;
    if rest.len() < 14 {
        return None;
    }
    let stamp = &rest[..14];
    if !stamp.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S").ok()?;
    Local.from_local_datetime(&naive).single()
}

#[cfg(test)]
#[path = "outbox_tests.rs"]
mod tests;
