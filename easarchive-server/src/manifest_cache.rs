//! Filesystem-backed manifest cache.
//!
//! The manifest maps recording ids to files. It is memoized in memory and
//! persisted beside the recording directory; both copies are trusted only
//! while the directory mtime they were built against is unchanged.
//!
//! Writers never block each other: whoever notices a stale manifest
//! rebuilds it and replaces the persisted copy with an atomic rename, so a
//! reader only ever sees a complete old manifest or a complete new one.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use log::{debug, info, warn};
use tempfile::NamedTempFile;
use thiserror::Error;

use easarchive_core::manifest::{is_recording_filename, Manifest, RecordingEntry};

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Manifest I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("Manifest encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

// =============================================================================
// Capabilities
// =============================================================================

/// Source of "now" for manifest timestamps.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch
    fn now_secs(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// The directory recordings accumulate in.
pub trait RecordingStore: Send + Sync {
    /// Directory modification time, nanoseconds since the Unix epoch
    fn directory_mtime(&self) -> io::Result<i64>;

    /// Recordings in enumeration order
    fn list(&self) -> io::Result<Vec<RecordingEntry>>;
}

/// [`RecordingStore`] over a real directory.
pub struct FsRecordingStore {
    dir: PathBuf,
}

impl FsRecordingStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

fn system_time_ns(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_nanos()).unwrap_or(i64::MAX),
    }
}

impl RecordingStore for FsRecordingStore {
    fn directory_mtime(&self) -> io::Result<i64> {
        let meta = fs::metadata(&self.dir)?;
        Ok(system_time_ns(meta.modified()?))
    }

    fn list(&self) -> io::Result<Vec<RecordingEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !is_recording_filename(name) {
                continue;
            }
            // DirEntry::metadata does not follow symlinks
            let meta = match entry.metadata() {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                Err(e) => {
                    debug!("Skipping {}: {}", name, e);
                    continue;
                }
            };
            let created = meta.created().or_else(|_| meta.modified())?;
            entries.push(RecordingEntry {
                path: entry.path().to_string_lossy().into_owned(),
                created_ns: system_time_ns(created),
            });
        }
        Ok(entries)
    }
}

// =============================================================================
// ManifestCache
// =============================================================================

pub struct ManifestCache {
    store: Arc<dyn RecordingStore>,
    clock: Arc<dyn Clock>,
    manifest_path: PathBuf,
    memo: RwLock<Option<Arc<Manifest>>>,
}

impl ManifestCache {
    pub fn new(
        store: Arc<dyn RecordingStore>,
        clock: Arc<dyn Clock>,
        manifest_path: PathBuf,
    ) -> Self {
        Self {
            store,
            clock,
            manifest_path,
            memo: RwLock::new(None),
        }
    }

    /// Cache over a real directory using the system clock.
    pub fn for_directory(recording_dir: PathBuf, manifest_path: PathBuf) -> Self {
        Self::new(
            Arc::new(FsRecordingStore::new(recording_dir)),
            Arc::new(SystemClock),
            manifest_path,
        )
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// Current manifest.
    ///
    /// Served from memory or the persisted copy while the directory mtime
    /// matches, rebuilt otherwise or when `force_refresh` is set. An
    /// unreadable directory yields an empty manifest, never an error.
    pub fn get_manifest(&self, force_refresh: bool) -> Arc<Manifest> {
        let mtime = match self.store.directory_mtime() {
            Ok(mtime) => mtime,
            Err(e) => {
                warn!("Recording directory unreadable: {}", e);
                return Arc::new(Manifest::empty(self.clock.now_secs()));
            }
        };

        if !force_refresh {
            if let Some(manifest) = self.memoized(mtime) {
                return manifest;
            }
            if let Some(manifest) = self.load_persisted().filter(|m| m.is_valid_for(mtime)) {
                debug!("Reusing persisted manifest with {} recordings", manifest.count);
                return self.remember(Arc::new(manifest));
            }
        }

        let entries = match self.store.list() {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to enumerate recordings: {}", e);
                return Arc::new(Manifest::empty(self.clock.now_secs()));
            }
        };
        let manifest = Arc::new(Manifest::build(entries, mtime, self.clock.now_secs()));
        info!("Rebuilt manifest: {} recordings", manifest.count);

        if let Err(e) = self.persist(&manifest) {
            warn!(
                "Failed to persist manifest to {}: {}",
                self.manifest_path.display(),
                e
            );
        }
        self.remember(manifest)
    }

    fn memoized(&self, mtime: i64) -> Option<Arc<Manifest>> {
        let memo = self.memo.read().unwrap_or_else(|e| e.into_inner());
        memo.as_ref().filter(|m| m.is_valid_for(mtime)).cloned()
    }

    fn remember(&self, manifest: Arc<Manifest>) -> Arc<Manifest> {
        let mut memo = self.memo.write().unwrap_or_else(|e| e.into_inner());
        *memo = Some(manifest.clone());
        manifest
    }

    fn load_persisted(&self) -> Option<Manifest> {
        let bytes = fs::read(&self.manifest_path).ok()?;
        let manifest = Manifest::from_json(&bytes);
        if manifest.is_none() {
            warn!(
                "Ignoring unreadable manifest {}",
                self.manifest_path.display()
            );
        }
        manifest
    }

    /// Write to a temporary file beside the target, lock, sync and rename.
    /// On failure the temporary file is removed on drop and the previous
    /// manifest stays in place.
    fn persist(&self, manifest: &Manifest) -> Result<(), ManifestError> {
        let dir = match self.manifest_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.as_file().lock_exclusive()?;
        serde_json::to_writer(&mut tmp, manifest)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.as_file().unlock()?;
        tmp.persist(&self.manifest_path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct FixedClock(i64);

    impl Clock for FixedClock {
        fn now_secs(&self) -> i64 {
            self.0
        }
    }

    #[derive(Default)]
    struct FakeStore {
        mtime: Mutex<i64>,
        entries: Mutex<Vec<RecordingEntry>>,
        unreadable: bool,
    }

    impl FakeStore {
        fn add(&self, path: &str, created_ns: i64) {
            self.entries.lock().unwrap().push(RecordingEntry {
                path: path.to_string(),
                created_ns,
            });
        }

        fn touch(&self, mtime: i64) {
            *self.mtime.lock().unwrap() = mtime;
        }
    }

    impl RecordingStore for FakeStore {
        fn directory_mtime(&self) -> io::Result<i64> {
            if self.unreadable {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
            }
            Ok(*self.mtime.lock().unwrap())
        }

        fn list(&self) -> io::Result<Vec<RecordingEntry>> {
            Ok(self.entries.lock().unwrap().clone())
        }
    }

    fn cache_with(store: Arc<FakeStore>, dir: &TempDir) -> ManifestCache {
        ManifestCache::new(
            store,
            Arc::new(FixedClock(1_700_000_000)),
            dir.path().join("recordings.manifest.json"),
        )
    }

    #[test]
    fn test_stale_until_mtime_changes() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FakeStore::default());
        store.touch(10);
        store.add("a.wav", 1);
        let cache = cache_with(store.clone(), &dir);

        assert_eq!(cache.get_manifest(false).count, 1);

        // New file without an mtime change: the cached manifest is still served
        store.add("b.wav", 2);
        assert_eq!(cache.get_manifest(false).count, 1);

        store.touch(11);
        let manifest = cache.get_manifest(false);
        assert_eq!(manifest.count, 2);
        assert_eq!(manifest.directory_mtime, 11);
        assert_eq!(manifest.generated_at, 1_700_000_000);
    }

    #[test]
    fn test_force_refresh_rebuilds() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FakeStore::default());
        let cache = cache_with(store.clone(), &dir);
        assert_eq!(cache.get_manifest(false).count, 0);

        store.add("a.wav", 1);
        assert_eq!(cache.get_manifest(false).count, 0);
        assert_eq!(cache.get_manifest(true).count, 1);
    }

    #[test]
    fn test_ids_follow_creation_time() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FakeStore::default());
        store.add("late.wav", 300);
        store.add("early.wav", 100);
        store.add("middle.wav", 200);
        let manifest = cache_with(store, &dir).get_manifest(false);
        assert_eq!(manifest.get(0), Some("early.wav"));
        assert_eq!(manifest.get(1), Some("middle.wav"));
        assert_eq!(manifest.get(2), Some("late.wav"));
    }

    #[test]
    fn test_persisted_manifest_is_reused() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FakeStore::default());
        store.touch(5);
        store.add("a.wav", 1);
        cache_with(store, &dir).get_manifest(false);
        assert!(dir.path().join("recordings.manifest.json").exists());

        // A fresh cache over a store that now lists differently, same mtime
        let other = Arc::new(FakeStore::default());
        other.touch(5);
        let manifest = cache_with(other, &dir).get_manifest(false);
        assert_eq!(manifest.files, vec!["a.wav"]);
    }

    #[test]
    fn test_corrupt_manifest_is_rebuilt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("recordings.manifest.json");
        fs::write(&path, b"{\"version\":1,\"files\":").unwrap();

        let store = Arc::new(FakeStore::default());
        store.add("a.wav", 1);
        let manifest = cache_with(store, &dir).get_manifest(false);
        assert_eq!(manifest.count, 1);

        let persisted = Manifest::from_json(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(persisted, *manifest);
    }

    #[test]
    fn test_unreadable_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FakeStore {
            unreadable: true,
            ..Default::default()
        });
        let manifest = cache_with(store, &dir).get_manifest(false);
        assert_eq!(manifest.count, 0);
        assert!(!dir.path().join("recordings.manifest.json").exists());
    }

    #[test]
    fn test_persist_failure_still_returns_manifest() {
        let dir = TempDir::new().unwrap();
        // Parent of the manifest path is a regular file
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"x").unwrap();

        let store = Arc::new(FakeStore::default());
        store.add("a.wav", 1);
        let cache = ManifestCache::new(
            store,
            Arc::new(FixedClock(0)),
            blocker.join("recordings.manifest.json"),
        );
        assert_eq!(cache.get_manifest(false).count, 1);
    }

    #[test]
    fn test_fs_store_filters_names() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("EAS_Recording_RWT_1.wav"), b"x").unwrap();
        fs::write(dir.path().join("EAS_Recording_RWT_2.txt"), b"x").unwrap();
        fs::write(dir.path().join("other.wav"), b"x").unwrap();
        fs::create_dir(dir.path().join("EAS_Recording_dir.wav")).unwrap();

        let store = FsRecordingStore::new(dir.path().to_path_buf());
        let entries = store.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].path.ends_with("EAS_Recording_RWT_1.wav"));
        assert!(store.directory_mtime().is_ok());
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let cache = ManifestCache::for_directory(
            dir.path().join("missing"),
            dir.path().join("missing.manifest.json"),
        );
        assert_eq!(cache.get_manifest(false).count, 0);
        assert_eq!(cache.get_manifest(false).latest_id(), None);
    }
}
