//! Recording cleaner: a background sweeper over every
//! configured path's recording directory, deleting segments past
//! `deleteAfter` and pruning directories it leaves empty.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Local;

use super::segment;
use crate::config::RecordConfig;

#[derive(Clone)]
pub struct CleanerEntry {
    pub path_name: String,
    pub path_format: String,
    pub delete_after: Duration,
}

impl CleanerEntry {
    pub fn from_record_config(path_name: &str, config: &RecordConfig) -> Self {
        Self {
            path_name: path_name.to_string(),
            path_format: config.path_format.clone(),
            delete_after: config.delete_after,
        }
    }
}

/// `min(30 min, min over entries of deleteAfter / 2)`.
pub fn sweep_interval(entries: &[CleanerEntry]) -> Duration {
    let default_cap = Duration::from_secs(30 * 60);
    entries
        .iter()
        .map(|e| e.delete_after / 2)
        .min()
        .map(|d| d.min(default_cap))
        .unwrap_or(default_cap)
}

/// Walk `entries` once, deleting every file whose decoded timestamp is
/// older than its entry's `deleteAfter`, then prune empty directories.
/// Per-file/per-directory failures are logged and don't abort the sweep.
pub fn sweep_once(entries: &[CleanerEntry]) {
    sweep_once_at(entries, Local::now())
}

fn sweep_once_at(entries: &[CleanerEntry], now: chrono::DateTime<Local>) {
    for entry in entries {
        let common = segment::common_path(&entry.path_format, &entry.path_name);
        if !common.exists() {
            continue;
        }
        let file_format = entry
            .path_format
            .rsplit('/')
            .next()
            .unwrap_or(&entry.path_format)
            .to_string();

        let files = match walk_files(&common) {
            Ok(files) => files,
            Err(err) => {
                tracing::warn!(path = %common.display(), error = %err, "cleaner failed to walk directory");
                continue;
            }
        };

        for file in files {
            let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(timestamp) = segment::decode(&file_format, &entry.path_name, name) else {
                continue;
            };
            if now.signed_duration_since(timestamp) > chrono::Duration::from_std(entry.delete_after).unwrap_or_default() {
                if let Err(err) = std::fs::remove_file(&file) {
                    tracing::warn!(path = %file.display(), error = %err, "cleaner failed to delete segment");
                }
            }
        }

        prune_empty_dirs(&common);
    }
}

fn walk_files(root: &std::path::Path) -> std::io::Result<Vec<std::path::PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    Ok(out)
}

/// Second pass: remove every directory left empty by the first pass,
/// working leaves-first so a chain of now-empty parents also collapses.
fn prune_empty_dirs(root: &std::path::Path) {
    let mut dirs = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(read) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in read.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            }
        }
        dirs.push(dir);
    }
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for dir in dirs {
        if dir == root {
            continue;
        }
        if std::fs::read_dir(&dir).is_ok_and(|mut r| r.next().is_none()) {
            let _ = std::fs::remove_dir(&dir);
        }
    }
}

pub struct Cleaner {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Cleaner {
    pub fn spawn(entries: Vec<CleanerEntry>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();
        let interval = sweep_interval(&entries);
        let thread = std::thread::spawn(move || {
            while running_clone.load(Ordering::Relaxed) {
                std::thread::sleep(interval);
                if !running_clone.load(Ordering::Relaxed) {
                    break;
                }
                sweep_once(&entries);
            }
        });
        Self {
            running,
            thread: Some(thread),
        }
    }
}

impl Drop for Cleaner {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecordFormat;
    use chrono::TimeZone;

    fn entry(path_name: &str, delete_after_secs: u64) -> CleanerEntry {
        CleanerEntry::from_record_config(
            path_name,
            &RecordConfig {
                path_format: "%path/%Y-%m-%d_%H-%M-%S-%f.mp4".to_string(),
                format: RecordFormat::Fmp4,
                part_duration: Duration::from_millis(100),
                segment_duration: Duration::from_secs(1),
                delete_after: Duration::from_secs(delete_after_secs),
            },
        )
    }

    #[test]
    fn sweep_interval_caps_at_thirty_minutes() {
        let entries = vec![entry("cam1", 7200)];
        assert_eq!(sweep_interval(&entries), Duration::from_secs(30 * 60));
    }

    #[test]
    fn sweep_interval_is_half_of_smallest_delete_after() {
        let entries = vec![entry("cam1", 100), entry("cam2", 40)];
        assert_eq!(sweep_interval(&entries), Duration::from_secs(20));
    }

    #[test]
    fn sweep_deletes_expired_segment_only() {
        let dir = tempfile::tempdir().unwrap();
        let cam_dir = dir.path().join("cam1");
        std::fs::create_dir_all(&cam_dir).unwrap();
        let old_name = "2008-05-20_22-15-25-000125.mp4";
        let new_name = "2009-05-20_22-15-25-000427.mp4";
        std::fs::write(cam_dir.join(old_name), b"old").unwrap();
        std::fs::write(cam_dir.join(new_name), b"new").unwrap();

        let entry = CleanerEntry {
            path_name: "cam1".to_string(),
            path_format: format!("{}/%Y-%m-%d_%H-%M-%S-%f.mp4", cam_dir.display()),
            delete_after: Duration::from_secs(10),
        };
        let now = chrono::Local
            .with_ymd_and_hms(2009, 5, 20, 22, 15, 25)
            .unwrap()
            + chrono::Duration::microseconds(427);
        sweep_once_at(&[entry], now);

        assert!(!cam_dir.join(old_name).exists());
        assert!(cam_dir.join(new_name).exists());
    }

    #[test]
    fn sweep_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cam_dir = dir.path().join("cam1");
        std::fs::create_dir_all(&cam_dir).unwrap();
        let old_name = "2008-05-20_22-15-25-000125.mp4";
        std::fs::write(cam_dir.join(old_name), b"old").unwrap();
        let entry = CleanerEntry {
            path_name: "cam1".to_string(),
            path_format: format!("{}/%Y-%m-%d_%H-%M-%S-%f.mp4", cam_dir.display()),
            delete_after: Duration::from_secs(10),
        };
        let now = chrono::Local
            .with_ymd_and_hms(2009, 5, 20, 22, 15, 25)
            .unwrap()
            + chrono::Duration::microseconds(427);
        sweep_once_at(&[entry.clone()], now);
        sweep_once_at(&[entry], now);
        assert!(!cam_dir.join(old_name).exists());
    }
}
