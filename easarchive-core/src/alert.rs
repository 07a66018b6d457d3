//! SAME/EAS alert log parsing.
//!
//! The decoder appends one entry per received alert to a text log, entries
//! separated by blank lines:
//!
//! ```text
//! ZCZC-WXR-TOR-051059-051107+0130-1231530-KLWX/NWS-: The National Weather Service has issued a Tornado Warning for Fairfax, VA; beginning at 03:30 PM and ending at 05:00 PM (KLWX/NWS) (Received @ 2024-05-02  3:30:12 PM)
//! ```
//!
//! The header is tokenized into a [`SameHeader`]; the free text is split on
//! its fixed phrases ("has issued", " for ") into originator, event text and
//! area. Lines that do not follow the grammar are skipped. A header whose
//! purge duration is present but invalid fails the whole batch.

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use serde::Serialize;

use crate::error::ParseError;

/// Maximum number of records returned per request
pub const DEFAULT_WINDOW: usize = 50;

/// Location code meaning "all areas"
pub const ALL_AREAS: &str = "000000";

const HEADER_START: &str = "ZCZC-";
const RECEIVED_MARKER: &str = " (Received @ ";
const RECEIVED_FORMAT: &str = "%Y-%m-%d %I:%M:%S %p";

// =============================================================================
// Header tokenizer
// =============================================================================

/// Typed SAME header:
/// `ZCZC-ORG-EEE-PSSCCC(-PSSCCC)*+TTTT-JJJHHMM-LLLLLLLL-`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SameHeader {
    /// Originator class code (e.g. `WXR`, `CIV`, `EAS`, `PEP`)
    pub originator: String,
    /// Event type code (e.g. `TOR`, `SVR`, `RWT`)
    pub event_code: String,
    /// Location codes in header order
    pub locations: Vec<String>,
    /// Purge duration as written (`HHMM`)
    pub duration: String,
    /// Purge duration in seconds
    pub duration_seconds: i64,
    /// Issue time as written (`JJJHHMM`)
    pub issued: String,
    /// Sender identification
    pub sender: String,
    /// The canonical header text
    pub raw: String,
}

impl SameHeader {
    /// Tokenize a header.
    ///
    /// Returns `Ok(None)` when the text does not follow the grammar and
    /// `Err` when the grammar matches but the duration is not a valid
    /// `HHMM` value.
    pub fn parse(raw: &str) -> Result<Option<Self>, ParseError> {
        let raw = raw.trim();
        let Some(body) = raw.strip_prefix(HEADER_START) else {
            return Ok(None);
        };
        let Some(body) = body.strip_suffix('-') else {
            return Ok(None);
        };

        // Split "ORG-EEE-LOC-LOC" from "TTTT-JJJHHMM-SENDER"
        let Some((codes, tail)) = body.split_once('+') else {
            return Ok(None);
        };

        let mut parts = codes.split('-');
        let (Some(originator), Some(event_code)) = (parts.next(), parts.next()) else {
            return Ok(None);
        };
        if !is_code(originator) || !is_code(event_code) {
            return Ok(None);
        }
        let locations: Vec<String> = parts.map(str::to_string).collect();
        if locations.is_empty() || !locations.iter().all(|l| is_digits(l, 6)) {
            return Ok(None);
        }

        let mut tail_parts = tail.splitn(3, '-');
        let (Some(duration), Some(issued), Some(sender)) =
            (tail_parts.next(), tail_parts.next(), tail_parts.next())
        else {
            return Ok(None);
        };
        if !is_digits(duration, 4) || !is_digits(issued, 7) {
            return Ok(None);
        }
        if sender.is_empty()
            || sender.len() > 8
            || sender.contains('-')
            || sender.chars().any(|c| c.is_control())
        {
            return Ok(None);
        }

        let duration_seconds = duration_to_seconds(duration)?;

        Ok(Some(Self {
            originator: originator.to_string(),
            event_code: event_code.to_string(),
            locations,
            duration: duration.to_string(),
            duration_seconds,
            issued: issued.to_string(),
            sender: sender.to_string(),
            raw: raw.to_string(),
        }))
    }
}

fn is_code(s: &str) -> bool {
    s.len() == 3
        && s
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '?')
}

fn is_digits(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_digit())
}

/// Convert a 4-digit `HHMM` purge duration into seconds.
///
/// The minutes part must be below 60.
pub fn duration_to_seconds(hhmm: &str) -> Result<i64, ParseError> {
    let invalid = || ParseError::MandatoryFieldMissing {
        field: "duration",
        value: hhmm.to_string(),
    };
    if !is_digits(hhmm, 4) {
        return Err(invalid());
    }
    let hours: i64 = hhmm[0..2].parse().map_err(|_| invalid())?;
    let minutes: i64 = hhmm[2..4].parse().map_err(|_| invalid())?;
    if minutes >= 60 {
        return Err(invalid());
    }
    Ok(hours * 3600 + minutes * 60)
}

// =============================================================================
// Description text
// =============================================================================

/// Fields pulled out of the decoder's free-text description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Description {
    pub originator: String,
    pub event_text: String,
    pub area: String,
}

impl Description {
    /// Split "<originator> has issued a <event> for <area>...".
    ///
    /// Text not following that shape yields empty fields.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        let Some((originator, rest)) = text
            .split_once(" has issued ")
            .or_else(|| text.split_once(" have issued "))
        else {
            return Self::default();
        };

        let rest = rest
            .strip_prefix("an ")
            .or_else(|| rest.strip_prefix("a "))
            .unwrap_or(rest);

        let (event_text, area) = match rest.split_once(" for ") {
            Some((event, area)) => (event, extract_area(area)),
            None => (rest.split('.').next().unwrap_or(rest), String::new()),
        };

        Self {
            originator: originator.trim().to_string(),
            event_text: event_text.trim().to_string(),
            area,
        }
    }
}

fn extract_area(text: &str) -> String {
    let text = text.trim_start();
    let text = strip_prefix_ignore_case(text, "the following counties/areas:").unwrap_or(text);

    let mut cut = text.len();
    for marker in [" beginning at ", " until ", "; at ", " Effective", ". Message from"] {
        if let Some(pos) = text.find(marker) {
            cut = cut.min(pos);
        }
    }
    // " at " immediately followed by a clock time
    let mut search = 0;
    while let Some(pos) = text[search..].find(" at ") {
        let at = search + pos;
        if text[at + 4..].starts_with(|c: char| c.is_ascii_digit()) {
            cut = cut.min(at);
            break;
        }
        search = at + 4;
    }

    text[..cut]
        .trim()
        .trim_end_matches([';', ',', '.'])
        .trim()
        .to_string()
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&text[prefix.len()..])
    } else {
        None
    }
}

/// Split a phrase into words on whitespace and lower-to-upper case boundaries.
///
/// `"Severe Thunderstorm Warning"` and `"SevereThunderstormWarning"` both give
/// `["Severe", "Thunderstorm", "Warning"]`.
pub fn split_words(phrase: &str) -> Vec<String> {
    let mut words = Vec::new();
    for token in phrase.split_whitespace() {
        let mut current = String::new();
        let mut prev_lower = false;
        for c in token.chars() {
            if c.is_uppercase() && prev_lower && !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = c.is_lowercase();
            current.push(c);
        }
        if !current.is_empty() {
            words.push(current);
        }
    }
    words
}

/// Positional severity guess: the 3rd word of the event phrase if present,
/// else the 2nd, else the 1st.
pub fn severity_from_event_text(event_text: &str) -> Option<String> {
    let words = split_words(event_text);
    words
        .get(2)
        .or_else(|| words.get(1))
        .or_else(|| words.first())
        .cloned()
}

/// Severity from the last letter of the event code, used when the
/// description carries no event phrase.
pub fn severity_from_event_code(code: &str) -> &'static str {
    match code.chars().last() {
        Some('W') => "Warning",
        Some('A') => "Watch",
        Some('E') => "Emergency",
        Some('S') => "Statement",
        Some('T') => "Test",
        Some('M') => "Message",
        _ => "Unknown",
    }
}

// =============================================================================
// Watch list
// =============================================================================

/// Operator-supplied location filter.
///
/// An empty list, or one made only of `000000`, disables filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchList {
    codes: Vec<String>,
}

impl WatchList {
    /// Parse a comma-separated list, trimming each entry.
    pub fn parse(list: &str) -> Self {
        Self::from_codes(list.split(','))
    }

    pub fn from_codes<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let codes = codes
            .into_iter()
            .map(|c| c.as_ref().trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        Self { codes }
    }

    /// True when the list does not filter anything out.
    pub fn is_disabled(&self) -> bool {
        self.codes.iter().all(|c| c == ALL_AREAS)
    }

    /// True when an alert for `locations` passes the filter.
    pub fn matches(&self, locations: &[String]) -> bool {
        if self.is_disabled() {
            return true;
        }
        if locations.iter().any(|l| l == ALL_AREAS) {
            return true;
        }
        locations.iter().any(|l| self.codes.contains(l))
    }

    pub fn codes(&self) -> &[String] {
        &self.codes
    }
}

// =============================================================================
// Records
// =============================================================================

/// One parsed alert log entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRecord {
    /// Position of this entry among all parsed entries in the log
    pub recording_id: u64,
    pub raw_line: String,
    pub originator_code: String,
    pub event_code: String,
    pub event_text: String,
    pub originator: String,
    pub locations: Vec<String>,
    pub area: String,
    pub severity: String,
    pub duration: String,
    pub duration_seconds: i64,
    pub description: String,
    pub raw_header: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub received_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub expires_at: DateTime<Utc>,
}

/// Parses the alert log into a newest-first window of [`AlertRecord`]s.
#[derive(Debug, Clone)]
pub struct AlertLogParser {
    window: usize,
    offset: FixedOffset,
}

impl Default for AlertLogParser {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, Utc.fix())
    }
}

impl AlertLogParser {
    /// `offset` is the UTC offset the decoder wrote receipt times in.
    pub fn new(window: usize, offset: FixedOffset) -> Self {
        Self { window, offset }
    }

    /// Parse a single log line.
    ///
    /// `Ok(None)` means the line is not an alert entry and should be skipped.
    pub fn parse_line(&self, line: &str, recording_id: u64) -> Result<Option<AlertRecord>, ParseError> {
        let line = line.trim();
        let Some((header_text, rest)) = line.split_once(": ") else {
            return Ok(None);
        };
        let Some(header) = SameHeader::parse(header_text)? else {
            return Ok(None);
        };
        let Some(rest) = rest.strip_suffix(')') else {
            return Ok(None);
        };
        let Some((description, stamp)) = rest.rsplit_once(RECEIVED_MARKER) else {
            return Ok(None);
        };
        let Some(received_at) = self.parse_received(stamp) else {
            return Ok(None);
        };

        let parsed = Description::parse(description);
        let severity = severity_from_event_text(&parsed.event_text)
            .unwrap_or_else(|| severity_from_event_code(&header.event_code).to_string());
        let expires_at = received_at + Duration::seconds(header.duration_seconds);

        Ok(Some(AlertRecord {
            recording_id,
            raw_line: line.to_string(),
            originator_code: header.originator,
            event_code: header.event_code,
            event_text: parsed.event_text,
            originator: parsed.originator,
            locations: header.locations,
            area: parsed.area,
            severity,
            duration: header.duration,
            duration_seconds: header.duration_seconds,
            description: description.trim().to_string(),
            raw_header: header.raw,
            received_at,
            expires_at,
        }))
    }

    fn parse_received(&self, stamp: &str) -> Option<DateTime<Utc>> {
        // The decoder space-pads the hour ("2024-05-02  3:30:12 PM")
        let normalized = stamp.split_whitespace().collect::<Vec<_>>().join(" ");
        let naive = NaiveDateTime::parse_from_str(&normalized, RECEIVED_FORMAT).ok()?;
        let local = self.offset.from_local_datetime(&naive).single()?;
        Some(local.with_timezone(&Utc))
    }

    /// Parse a whole log.
    ///
    /// Every grammar-matching line takes the next `recording_id` (starting at
    /// 0) before the watch-list filter and the window are applied, so ids
    /// reflect the entry's position in the full log. The result holds at most
    /// `window` records, newest first.
    pub fn parse(&self, log: &str, watch: &WatchList) -> Result<Vec<AlertRecord>, ParseError> {
        let mut counter: u64 = 0;
        let mut kept = std::collections::VecDeque::with_capacity(self.window + 1);

        for line in log.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let Some(record) = self.parse_line(line, counter)? else {
                continue;
            };
            counter += 1;

            if !watch.matches(&record.locations) {
                continue;
            }
            kept.push_back(record);
            if kept.len() > self.window {
                kept.pop_front();
            }
        }

        Ok(kept.into_iter().rev().collect())
    }
}
