//! Filesystem locations and option parsing shared by the subcommands.

use std::path::{Path, PathBuf};

use chrono::FixedOffset;
use directories::ProjectDirs;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid UTC offset '{0}', expected e.g. \"+00:00\" or \"-05:00\"")]
    UtcOffset(String),
}

/// Project directories for the archive, falling back to the working
/// directory when the platform has no home directory.
pub fn get_project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "easarchive", "easarchive")
}

fn data_dir() -> PathBuf {
    get_project_dirs()
        .map(|dirs| dirs.data_dir().to_owned())
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn default_recording_dir() -> PathBuf {
    data_dir().join("recordings")
}

pub fn default_alert_log() -> PathBuf {
    data_dir().join("alerts.log")
}

/// `<recording_dir>.manifest.json`, beside the directory rather than inside
/// it so writing the manifest never touches the directory mtime.
pub fn default_manifest_path(recording_dir: &Path) -> PathBuf {
    let mut name = recording_dir
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "recordings".into());
    name.push(".manifest.json");
    recording_dir.with_file_name(name)
}

/// Parse "+HH:MM", "-HH:MM", "+HHMM" or "Z".
pub fn parse_utc_offset(text: &str) -> Result<FixedOffset, ConfigError> {
    let err = || ConfigError::UtcOffset(text.to_string());
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("z") || trimmed.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(err);
    }

    let (sign, rest) = match trimmed.as_bytes().first() {
        Some(b'+') => (1, &trimmed[1..]),
        Some(b'-') => (-1, &trimmed[1..]),
        _ => return Err(err()),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(err());
    }
    let hours: i32 = digits[0..2].parse().map_err(|_| err())?;
    let minutes: i32 = digits[2..4].parse().map_err(|_| err())?;
    if hours > 23 || minutes > 59 {
        return Err(err());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(err)
}
