//! # EAS Archive Core
//!
//! Platform-independent logic for the broadcast-alert recording archive.
//!
//! This crate contains pure parsing and state-machine logic with **zero I/O
//! dependencies**. Timestamps are passed in by the caller, so everything here
//! is deterministic under test.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  easarchive-core (no tokio/async deps)                      │
//! │  ├── wav        (container header, finalization check)      │
//! │  ├── range      (HTTP byte-range arithmetic)                │
//! │  ├── manifest   (recording index model and ordering)        │
//! │  ├── alert      (SAME alert log tokenizer and parser)       │
//! │  ├── sync       (realtime messages, reconciliation)         │
//! │  └── probe      (audio availability scheduling)             │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                 ┌────────────┴────────────┐
//!                 │  easarchive-server      │
//!                 │  (axum + tokio runtime) │
//!                 └─────────────────────────┘
//! ```
//!
//! ## Example: Parsing the alert log
//!
//! ```rust
//! use easarchive_core::alert::{AlertLogParser, WatchList};
//!
//! let log = "ZCZC-WXR-RWT-006001+0015-1231530-KLWX/NWS-: The National Weather Service has issued a Required Weekly Test for Alameda, CA (Received @ 2024-05-02 10:00:00 AM)\n\n";
//! let records = AlertLogParser::default()
//!     .parse(log, &WatchList::parse("006001"))
//!     .unwrap();
//! assert_eq!(records[0].event_code, "RWT");
//! assert_eq!(records[0].duration_seconds, 900);
//! ```
//!
//! ## Example: Reconnect backoff
//!
//! ```rust
//! use easarchive_core::ChannelManager;
//!
//! let mut conn = ChannelManager::default();
//! conn.start_connecting(0);
//! assert_eq!(conn.failed(10), Some(2000));
//! conn.start_connecting(2010);
//! assert_eq!(conn.failed(2020), Some(3600));
//! ```

pub mod alert;
pub mod error;
pub mod manifest;
pub mod probe;
pub mod range;
pub mod sync;
pub mod wav;

// Re-export commonly used types
pub use alert::{AlertLogParser, AlertRecord, SameHeader, WatchList};
pub use error::{HeaderError, ParseError};
pub use manifest::{Manifest, RecordingEntry};
pub use probe::{ProbeConfig, ProbeOutcome, ProbeScheduler, ProbeTicket};
pub use range::RangeOutcome;
pub use sync::{
    ActiveAlert, AlertSignature, ChannelManager, LogEntry, ServerMessage, StreamStatus, SyncState,
};
pub use wav::WavHeader;
