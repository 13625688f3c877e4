//! Candidate discovery and capacity snapshot.

use anyhow::{Context, Result};
use ignore::WalkBuilder;
use std::path::Path;

use crate::commit::Layout;
use crate::error::MigrationError;
use crate::protocol::QueryInfo;
use crate::transfer::{mtime_millis, DatabaseKind, FileRecord, FIRST_FILE_ID};

#[derive(Debug, Default)]
pub struct ScanResult {
    /// Files within the size cap, sorted by path, ids from [`FIRST_FILE_ID`]
    pub records: Vec<FileRecord>,
    pub dir_count: i64,
    /// Files skipped for exceeding the size cap
    pub skipped: usize,
}

impl ScanResult {
    pub fn total_size(&self) -> i64 {
        self.records.iter().map(|r| r.size).sum()
    }

    pub fn largest(&self) -> i64 {
        self.records.iter().map(|r| r.size).max().unwrap_or(0)
    }
}

/// Walk `root` and collect regular files no larger than `max_file_size`.
pub fn scan_media(root: &Path, max_file_size: i64) -> Result<ScanResult> {
    let mut result = ScanResult::default();
    if !root.exists() {
        return Ok(result);
    }

    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .follow_links(false)
        .build();

    let mut found = Vec::new();
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to scan {}", root.display()))?;
        let Some(file_type) = entry.file_type() else {
            continue;
        };
        if entry.depth() == 0 {
            continue;
        }
        if file_type.is_dir() {
            result.dir_count += 1;
            continue;
        }
        if !file_type.is_file() {
            continue;
        }

        let meta = entry
            .metadata()
            .with_context(|| format!("Failed to stat {}", entry.path().display()))?;
        let size = meta.len() as i64;
        if size > max_file_size {
            tracing::debug!(
                path = %entry.path().display(),
                size,
                max_file_size,
                "Skipping file over the size cap"
            );
            result.skipped += 1;
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("{} is outside {}", entry.path().display(), root.display()))?;
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        found.push((relative, entry.path().to_path_buf(), size, mtime_millis(&meta)));
    }

    found.sort_by(|a, b| a.0.cmp(&b.0));
    result.records = found
        .into_iter()
        .enumerate()
        .map(|(i, (path, source, size, mtime))| {
            FileRecord::new(FIRST_FILE_ID + i as i32, path, source, size, mtime)
        })
        .collect();
    Ok(result)
}

/// The live database as a transfer record; the encrypted variant wins
/// when both are present.
pub fn database_record(layout: &Layout) -> Result<Option<FileRecord>> {
    for kind in DatabaseKind::ALL {
        let path = layout.live_database(kind);
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => {
                return Ok(Some(FileRecord::new(
                    kind.record_id(),
                    kind.file_name().to_string(),
                    path,
                    meta.len() as i64,
                    mtime_millis(&meta),
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to stat {}", path.display()))
            }
        }
    }
    Ok(None)
}

fn free_space(path: &Path) -> i64 {
    // Query the nearest existing ancestor
    let mut probe = path;
    loop {
        if probe.exists() {
            return match fs2::available_space(probe) {
                Ok(n) => n.min(i64::MAX as u64) as i64,
                Err(e) => {
                    tracing::warn!(path = %probe.display(), "Cannot query free space: {}", e);
                    0
                }
            };
        }
        match probe.parent() {
            Some(parent) => probe = parent,
            None => return 0,
        }
    }
}

/// Build this side's capacity snapshot for a negotiation round.
pub fn query_info(layout: &Layout, media: &ScanResult) -> Result<QueryInfo> {
    let db_file_size = database_record(layout)?.map(|r| r.size).unwrap_or(0);
    Ok(QueryInfo {
        dir_count: media.dir_count,
        file_count: media.records.len() as i64,
        max_file_size: media.largest(),
        total_file_size: media.total_size(),
        db_file_size,
        db_free_space: free_space(layout.data_dir()),
        fs_free_space: free_space(&layout.media_dir()),
    })
}

/// Both sides must be able to stage what the other sends.
pub fn check_capacity(local: &QueryInfo, peer: &QueryInfo) -> Result<(), MigrationError> {
    let checks = [
        ("local database", peer.db_file_size, local.db_free_space),
        ("local file", peer.total_file_size, local.fs_free_space),
        ("peer database", local.db_file_size, peer.db_free_space),
        ("peer file", local.total_file_size, peer.fs_free_space),
    ];
    for (volume, needed, available) in checks {
        if needed > available {
            return Err(MigrationError::NoSpaceLeft {
                volume,
                needed: needed.max(0) as u64,
                available: available.max(0) as u64,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_size_filtered_listing() {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path());
        fs::create_dir_all(layout.media_dir().join("photos")).unwrap();
        fs::write(layout.media_dir().join("photos/small.jpg"), vec![0u8; 100]).unwrap();
        fs::write(layout.media_dir().join("big.bin"), vec![0u8; 5_000_000]).unwrap();

        let scan = scan_media(&layout.media_dir(), 1_000_000).unwrap();
        assert_eq!(scan.records.len(), 1);
        assert_eq!(scan.records[0].path, "photos/small.jpg");
        assert_eq!(scan.records[0].id, FIRST_FILE_ID);
        assert_eq!(scan.skipped, 1);
        assert_eq!(scan.dir_count, 1);

        let info = query_info(&layout, &scan).unwrap();
        assert_eq!(info.file_count, 1);
        assert_eq!(info.total_file_size, 100);
        assert_eq!(info.max_file_size, 100);
    }

    #[test]
    fn test_missing_media_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        let scan = scan_media(&tmp.path().join("nope"), 10).unwrap();
        assert!(scan.records.is_empty());
    }

    #[test]
    fn test_database_record_prefers_encrypted() {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path());
        assert!(database_record(&layout).unwrap().is_none());

        fs::write(layout.live_database(DatabaseKind::Plain), b"plain").unwrap();
        assert_eq!(database_record(&layout).unwrap().unwrap().id, 1);

        fs::write(layout.live_database(DatabaseKind::Encrypted), b"enc").unwrap();
        let record = database_record(&layout).unwrap().unwrap();
        assert_eq!(record.id, 2);
        assert_eq!(record.size, 3);
    }

    #[test]
    fn test_capacity_rejects_database_that_does_not_fit() {
        let local = QueryInfo {
            db_file_size: 600,
            db_free_space: 1 << 40,
            fs_free_space: 1 << 40,
            ..Default::default()
        };
        let peer = QueryInfo {
            db_file_size: 600,
            db_free_space: 500,
            fs_free_space: 1 << 40,
            ..Default::default()
        };
        let err = check_capacity(&local, &peer).unwrap_err();
        assert!(matches!(err, MigrationError::NoSpaceLeft { needed: 600, available: 500, .. }));
        assert!(check_capacity(&local, &local).is_ok());
    }
}
