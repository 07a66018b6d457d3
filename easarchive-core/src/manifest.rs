//! Recording manifest: the ordered index mapping integer ids to recording files.
//!
//! Ids are 0-based and follow ascending creation time. A manifest is only
//! trusted while the directory modification time it was built against is
//! unchanged; the server side decides when to rebuild, this module only
//! defines the model and the ordering rules.

use serde::{Deserialize, Serialize};

/// Current on-disk manifest version
pub const MANIFEST_VERSION: u32 = 1;

/// File name prefix every recording carries
pub const RECORDING_PREFIX: &str = "EAS_Recording_";

/// File extension every recording carries
pub const RECORDING_EXTENSION: &str = "wav";

/// Check whether a directory entry name follows the recording naming convention.
pub fn is_recording_filename(name: &str) -> bool {
    match name.rsplit_once('.') {
        Some((stem, ext)) => {
            stem.starts_with(RECORDING_PREFIX)
                && stem.len() > RECORDING_PREFIX.len()
                && ext.eq_ignore_ascii_case(RECORDING_EXTENSION)
        }
        None => false,
    }
}

/// One enumerated recording before ids are assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingEntry {
    /// Path as it will be stored in the manifest
    pub path: String,
    /// Creation time, nanoseconds since the Unix epoch
    pub created_ns: i64,
}

/// Persisted manifest object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    /// Build time, seconds since the Unix epoch
    pub generated_at: i64,
    /// Directory mtime the manifest was built against, nanoseconds since the Unix epoch
    pub directory_mtime: i64,
    pub count: usize,
    /// Recording paths, index == recording id
    pub files: Vec<String>,
}

impl Manifest {
    /// Manifest for a store that could not be read.
    pub fn empty(generated_at: i64) -> Self {
        Self {
            version: MANIFEST_VERSION,
            generated_at,
            directory_mtime: 0,
            count: 0,
            files: Vec::new(),
        }
    }

    /// Build a manifest from enumerated entries.
    ///
    /// Entries are ordered by ascending creation time. The sort is stable, so
    /// entries created at the same instant keep their enumeration order.
    pub fn build(mut entries: Vec<RecordingEntry>, directory_mtime: i64, generated_at: i64) -> Self {
        entries.sort_by_key(|e| e.created_ns);
        let files: Vec<String> = entries.into_iter().map(|e| e.path).collect();
        Self {
            version: MANIFEST_VERSION,
            generated_at,
            directory_mtime,
            count: files.len(),
            files,
        }
    }

    /// Parse a persisted manifest. Any decode problem, a version mismatch or
    /// an inconsistent count yields `None`, which callers treat as a cache miss.
    pub fn from_json(bytes: &[u8]) -> Option<Self> {
        let manifest: Manifest = serde_json::from_slice(bytes).ok()?;
        if manifest.version != MANIFEST_VERSION || manifest.count != manifest.files.len() {
            return None;
        }
        Some(manifest)
    }

    /// True while the store's directory mtime matches the snapshot.
    pub fn is_valid_for(&self, directory_mtime: i64) -> bool {
        self.directory_mtime == directory_mtime
    }

    /// Path of recording `id`, if present.
    pub fn get(&self, id: u64) -> Option<&str> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.files.get(i))
            .map(String::as_str)
    }

    /// Highest assigned id, `None` when the store is empty.
    pub fn latest_id(&self) -> Option<u64> {
        self.count.checked_sub(1).map(|id| id as u64)
    }
}

/// Parse a recording id as received from a query string.
///
/// Only plain non-negative decimal integers are accepted.
pub fn parse_recording_id(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, created_ns: i64) -> RecordingEntry {
        RecordingEntry {
            path: path.to_string(),
            created_ns,
        }
    }

    #[test]
    fn test_ids_follow_creation_time() {
        // Listing order deliberately differs from creation order
        let entries = vec![
            entry("c.wav", 300),
            entry("a.wav", 100),
            entry("b.wav", 200),
        ];
        let manifest = Manifest::build(entries, 42, 0);
        assert_eq!(manifest.files, vec!["a.wav", "b.wav", "c.wav"]);
        assert_eq!(manifest.count, 3);
        assert_eq!(manifest.get(0), Some("a.wav"));
        assert_eq!(manifest.get(2), Some("c.wav"));
        assert_eq!(manifest.get(3), None);
        assert_eq!(manifest.latest_id(), Some(2));
    }

    #[test]
    fn test_ties_keep_enumeration_order() {
        let entries = vec![entry("x.wav", 5), entry("y.wav", 5), entry("w.wav", 1)];
        let manifest = Manifest::build(entries, 0, 0);
        assert_eq!(manifest.files, vec!["w.wav", "x.wav", "y.wav"]);
    }

    #[test]
    fn test_empty_manifest() {
        let manifest = Manifest::empty(10);
        assert_eq!(manifest.count, 0);
        assert_eq!(manifest.latest_id(), None);
    }

    #[test]
    fn test_from_json_rejects_corrupt() {
        assert!(Manifest::from_json(b"{not json").is_none());
        assert!(Manifest::from_json(
            br#"{"version":1,"generated_at":0,"directory_mtime":0,"count":2,"files":["a"]}"#
        )
        .is_none());
        assert!(Manifest::from_json(
            br#"{"version":9,"generated_at":0,"directory_mtime":0,"count":0,"files":[]}"#
        )
        .is_none());

        let good = Manifest::build(vec![entry("a.wav", 1)], 7, 3);
        let bytes = serde_json::to_vec(&good).unwrap();
        assert_eq!(Manifest::from_json(&bytes), Some(good));
    }

    #[test]
    fn test_validity_follows_mtime() {
        let manifest = Manifest::build(vec![], 1_000, 0);
        assert!(manifest.is_valid_for(1_000));
        assert!(!manifest.is_valid_for(1_001));
    }

    #[test]
    fn test_recording_filename_convention() {
        assert!(is_recording_filename("EAS_Recording_TOR_2024-05-01_10-00-00_WXJ.wav"));
        assert!(is_recording_filename("EAS_Recording_RWT.WAV"));
        assert!(!is_recording_filename("EAS_Recording_.wav"));
        assert!(!is_recording_filename("notes.wav"));
        assert!(!is_recording_filename("EAS_Recording_TOR.mp3"));
        assert!(!is_recording_filename("EAS_Recording_TOR"));
    }

    #[test]
    fn test_parse_recording_id() {
        assert_eq!(parse_recording_id("0"), Some(0));
        assert_eq!(parse_recording_id(" 42 "), Some(42));
        assert_eq!(parse_recording_id("-1"), None);
        assert_eq!(parse_recording_id("1.5"), None);
        assert_eq!(parse_recording_id("abc"), None);
        assert_eq!(parse_recording_id(""), None);
    }
}
