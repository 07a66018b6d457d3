//! HTTP `Range: bytes=...` resolution against a resource of known size.
//!
//! Only single byte ranges are served. For a multi-range request the first
//! range is honoured and the rest are ignored. A header that is not of the
//! `bytes=` form is treated as absent.

/// Outcome of resolving an optional Range header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    /// No usable Range header: serve the whole resource (200)
    Full,
    /// Serve `start..=end` (206)
    Partial { start: u64, end: u64 },
    /// Range cannot be satisfied (416)
    Unsatisfiable,
}

impl RangeOutcome {
    /// Number of body bytes this outcome transfers for a resource of `size` bytes.
    pub fn content_length(&self, size: u64) -> u64 {
        match self {
            RangeOutcome::Full => size,
            RangeOutcome::Partial { start, end } => end - start + 1,
            RangeOutcome::Unsatisfiable => 0,
        }
    }

    /// Offset the body starts at.
    pub fn offset(&self) -> u64 {
        match self {
            RangeOutcome::Partial { start, .. } => *start,
            _ => 0,
        }
    }

    /// `Content-Range` header value, if this outcome carries one.
    pub fn content_range(&self, size: u64) -> Option<String> {
        match self {
            RangeOutcome::Full => None,
            RangeOutcome::Partial { start, end } => Some(format!("bytes {start}-{end}/{size}")),
            RangeOutcome::Unsatisfiable => Some(format!("bytes */{size}")),
        }
    }
}

/// Resolve a Range header value against a resource of `size` bytes.
///
/// Supports `N-`, `-N` (last N bytes) and `A-B`. A range is unsatisfiable
/// when its start would be negative, its start exceeds its end, or its end
/// reaches past the last byte.
pub fn resolve(header: Option<&str>, size: u64) -> RangeOutcome {
    let Some(spec) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
        return RangeOutcome::Full;
    };
    let first = spec.split(',').next().unwrap_or("").trim();
    let Some((start_str, end_str)) = first.split_once('-') else {
        return RangeOutcome::Full;
    };
    let (start_str, end_str) = (start_str.trim(), end_str.trim());

    let start: i128;
    let end: i128;
    match (start_str.is_empty(), end_str.is_empty()) {
        (true, true) => return RangeOutcome::Full,
        (true, false) => {
            let Ok(suffix) = end_str.parse::<u64>() else {
                return RangeOutcome::Full;
            };
            start = size as i128 - suffix as i128;
            end = size as i128 - 1;
        }
        (false, true) => {
            let Ok(s) = start_str.parse::<u64>() else {
                return RangeOutcome::Full;
            };
            start = s as i128;
            end = size as i128 - 1;
        }
        (false, false) => {
            let (Ok(s), Ok(e)) = (start_str.parse::<u64>(), end_str.parse::<u64>()) else {
                return RangeOutcome::Full;
            };
            start = s as i128;
            end = e as i128;
        }
    }

    if start < 0 || start > end || end >= size as i128 {
        return RangeOutcome::Unsatisfiable;
    }

    RangeOutcome::Partial {
        start: start as u64,
        end: end as u64,
    }
}
