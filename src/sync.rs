//! Synchronisation of the local publish directory with the directory service.
//!
//! A run scans the publish directory, fetches what the directory lists for
//! this peer, and sends the difference as one batch. Files are identified by
//! owner and relative path only (see [`peershare_core::SyncKey`]).

use crate::directory::{DirectoryClient, DirectoryError};
use peershare_core::{log_debug, log_info, log_warn, FileRecord, SyncKey, UpdateOperation};
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Synchronisation failures
#[derive(Error, Debug)]
pub enum SyncError {
    /// The publish directory itself could not be read
    #[error("cannot scan {}: {source}", path.display())]
    Scan {
        /// Directory being scanned
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// Fetching or applying the delta failed
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Outcome of one synchronisation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Regular files found locally
    pub scanned: usize,
    /// Entries skipped because they could not be read
    pub skipped: usize,
    /// Records published
    pub added: usize,
    /// Records retracted
    pub removed: usize,
}

impl SyncReport {
    /// True when nothing had to change
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.removed == 0
    }
}

/// Keeps one peer's published files in step with its publish directory.
pub struct SyncEngine {
    directory: Arc<DirectoryClient>,
    owner: String,
    publish_dir: PathBuf,
    shared: parking_lot::RwLock<Vec<FileRecord>>,
    running: Mutex<()>,
}

impl SyncEngine {
    /// Engine for `owner` publishing `publish_dir`.
    pub fn new(directory: Arc<DirectoryClient>, owner: impl Into<String>, publish_dir: impl Into<PathBuf>) -> Self {
        Self {
            directory,
            owner: owner.into(),
            publish_dir: publish_dir.into(),
            shared: parking_lot::RwLock::new(Vec::new()),
            running: Mutex::new(()),
        }
    }

    /// Files published by the last successful run
    pub fn shared_files(&self) -> Vec<FileRecord> {
        self.shared.read().clone()
    }

    /// Scan, diff and apply. Concurrent calls run one after another.
    pub async fn synchronize(&self) -> Result<SyncReport, SyncError> {
        let _running = self.running.lock().await;

        let (local, skipped) = scan_publish_dir(&self.owner, &self.publish_dir).await?;
        let indexed = self.directory.find_files_by_owner(&self.owner).await?;
        let operations = diff(&local, &indexed);

        let added = operations.iter().filter(|op| op.is_add()).count();
        let report = SyncReport {
            scanned: local.len(),
            skipped,
            added,
            removed: operations.len() - added,
        };

        if !operations.is_empty() {
            self.directory.apply_file_updates(&operations).await?;
        }
        *self.shared.write() = local;

        if report.is_noop() {
            log_debug!("Sync for '{}': {} file(s), nothing to change", self.owner, report.scanned);
        } else {
            log_info!(
                "Sync for '{}': {} file(s), published {}, retracted {}",
                self.owner,
                report.scanned,
                report.added,
                report.removed
            );
        }
        Ok(report)
    }
}

/// Operations turning `indexed` into `local`, by sync identity.
pub fn diff(local: &[FileRecord], indexed: &[FileRecord]) -> Vec<UpdateOperation> {
    let local_keys: HashSet<SyncKey> = local.iter().map(FileRecord::sync_key).collect();
    let indexed_keys: HashSet<SyncKey> = indexed.iter().map(FileRecord::sync_key).collect();

    let additions = local
        .iter()
        .filter(|r| !indexed_keys.contains(&r.sync_key()))
        .cloned()
        .map(UpdateOperation::add);
    let removals = indexed
        .iter()
        .filter(|r| !local_keys.contains(&r.sync_key()))
        .cloned()
        .map(UpdateOperation::remove);

    additions.chain(removals).collect()
}

/// Regular files under `root`, named by their `/`-separated relative path.
///
/// Unreadable entries are skipped and counted; only an unreadable root is
/// an error. Symlinks are not followed.
pub async fn scan_publish_dir(owner: &str, root: &Path) -> Result<(Vec<FileRecord>, usize), SyncError> {
    let mut files = BTreeMap::new();
    let mut skipped = 0;
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(source) if dir == root => {
                return Err(SyncError::Scan { path: dir, source });
            }
            Err(e) => {
                log_warn!("Skipping unreadable directory {}: {}", dir.display(), e);
                skipped += 1;
                continue;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    log_warn!("Stopped reading {}: {}", dir.display(), e);
                    skipped += 1;
                    break;
                }
            };
            let path = entry.path();
            let file_type = match entry.file_type().await {
                Ok(t) => t,
                Err(e) => {
                    log_warn!("Skipping {}: {}", path.display(), e);
                    skipped += 1;
                    continue;
                }
            };

            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let Some(name) = relative_name(root, &path) else {
                    log_warn!("Skipping {}: name is not valid UTF-8", path.display());
                    skipped += 1;
                    continue;
                };
                match entry.metadata().await {
                    Ok(meta) => {
                        files.insert(name.clone(), FileRecord::local(owner, name, meta.len()));
                    }
                    Err(e) => {
                        log_warn!("Skipping {}: {}", path.display(), e);
                        skipped += 1;
                    }
                }
            }
        }
    }

    Ok((files.into_values().collect(), skipped))
}

fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use peershare_core::types::file_id;

    #[test]
    fn test_diff_adds_and_removes_by_identity() {
        let local = vec![
            FileRecord::local("alice", "keep.txt", 10),
            FileRecord::local("alice", "new.txt", 1),
        ];
        let mut stale = FileRecord::local("alice", "gone.txt", 5);
        stale.id = Some(file_id("alice", "gone.txt"));
        let mut kept = FileRecord::local("alice", "keep.txt", 999);
        kept.id = Some("file-alice-old".into());
        let indexed = vec![kept, stale];

        let ops = diff(&local, &indexed);
        assert_eq!(ops.len(), 2);
        assert!(matches!(&ops[0], UpdateOperation::Add(r) if r.filename == "new.txt"));
        assert!(matches!(&ops[1], UpdateOperation::Remove(r) if r.filename == "gone.txt"));
    }

    #[test]
    fn test_diff_of_equal_sets_is_empty() {
        let local = vec![FileRecord::local("alice", "a.txt", 1)];
        let indexed = vec![FileRecord::local("alice", "a.txt", 2)];
        assert!(diff(&local, &indexed).is_empty());
    }

    #[tokio::test]
    async fn test_scan_is_recursive_and_skips_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"abc").unwrap();
        std::fs::create_dir_all(dir.path().join("music/live")).unwrap();
        std::fs::write(dir.path().join("music/live/set.mp3"), b"12345").unwrap();

        let (files, skipped) = scan_publish_dir("alice", dir.path()).await.unwrap();
        assert_eq!(skipped, 0);
        let names: Vec<_> = files.iter().map(|f| (f.filename.as_str(), f.size)).collect();
        assert_eq!(names, vec![("a.txt", 3), ("music/live/set.mp3", 5)]);
        assert!(files.iter().all(|f| f.owner == "alice" && f.owner_addr.is_none()));
    }

    #[tokio::test]
    async fn test_scan_of_missing_root_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = scan_publish_dir("alice", &dir.path().join("nope")).await.unwrap_err();
        assert!(matches!(err, SyncError::Scan { .. }));
    }
}
