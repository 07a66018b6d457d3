//! # EAS Archive Server
//!
//! Recording archive and monitoring server for a broadcast-alert decoder.
//!
//! This crate provides:
//! - A manifest cache assigning stable ids to recordings on disk
//! - Byte-range delivery of finalized recordings
//! - Parsed alert log access with location filtering
//! - A realtime WebSocket channel carrying stream telemetry, logs and the
//!   active alert list
//! - A headless monitoring client that mirrors that channel and probes for
//!   newly finalized recordings
//!
//! ## Architecture
//!
//! The server is built on top of [`easarchive_core`] for the platform-independent
//! parsing and state machines, with [`tokio`] providing the async runtime.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  easarchive-server                      │
//! │  ┌─────────────┐  ┌─────────────┐  ┌──────────────────┐ │
//! │  │ /archive    │  │ /ws         │  │ /api/*           │ │
//! │  │ (axum)      │  │ (realtime)  │  │ (status, logs)   │ │
//! │  └──────┬──────┘  └──────┬──────┘  └────────┬─────────┘ │
//! │         │                │                  │           │
//! │         ▼                ▼                  ▼           │
//! │  ┌──────────────┐  ┌──────────────────────────────────┐ │
//! │  │ManifestCache │  │ MonitoringHub (RwLock+broadcast) │ │
//! │  └──────────────┘  └──────────────────────────────────┘ │
//! │                              ▲                          │
//! │                     ┌────────┴────────┐                 │
//! │                     │  AlertWatcher   │                 │
//! │                     └─────────────────┘                 │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## HTTP API
//!
//! | Endpoint | Description |
//! |----------|-------------|
//! | `GET /archive?latest_id=true` | Newest recording id, `-1` when empty |
//! | `GET\|HEAD /archive?recording_id=N` | Recording audio, Range aware |
//! | `GET /archive?fetch_alerts=true` | Parsed alert log, newest first |
//! | `GET /ws` | Realtime snapshot and deltas |
//! | `GET /api/health` | Liveness |
//! | `GET /api/status` | Streams and active alerts |
//! | `GET /api/logs?tail=N` | Recent server log entries |
//! | `POST /api/streams` | Stream telemetry from the capture process |
//!
//! ## Command-Line Interface
//!
//! See [`Cli`]. `easarchive-server serve` runs the archive server,
//! `easarchive-server monitor --server URL` runs the monitoring client.

extern crate tokio;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::FixedOffset;
use clap::{Args, Parser, Subcommand};
use easarchive_core::{AlertLogParser, WatchList};

pub mod alert_watcher;
pub mod archive;
pub mod client;
pub mod config;
pub mod manifest_cache;
pub mod monitoring;
pub mod web;

use manifest_cache::ManifestCache;
use monitoring::{HubConfig, MonitoringHub};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Clone, Debug)]
#[command(version, about)]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Serve the recording archive, alert log and realtime channel
    Serve(ServeArgs),
    /// Mirror a running server and probe for new recordings
    Monitor(MonitorArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    /// Port for webserver
    #[arg(short, long, env = "EASARCHIVE_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Directory the recorder writes EAS_Recording_*.wav files into
    #[arg(long, env = "EASARCHIVE_RECORDING_DIR")]
    pub recording_dir: Option<PathBuf>,

    /// Where the manifest is persisted, default `<recording_dir>.manifest.json`
    #[arg(long, env = "EASARCHIVE_MANIFEST_PATH")]
    pub manifest_path: Option<PathBuf>,

    /// Alert log written by the decoder
    #[arg(long, env = "EASARCHIVE_ALERT_LOG")]
    pub alert_log: Option<PathBuf>,

    /// Comma-separated location codes to watch, empty watches everything
    #[arg(long, env = "EASARCHIVE_WATCHED_FIPS", default_value = "")]
    pub watched_fips: String,

    /// UTC offset the decoder writes receipt times in, e.g. "-05:00"
    #[arg(long, env = "EASARCHIVE_LOG_UTC_OFFSET", default_value = "+00:00")]
    pub log_utc_offset: String,

    /// Log entries kept for /api/logs and new subscribers
    #[arg(long, env = "EASARCHIVE_MAX_LOGS", default_value_t = 500)]
    pub max_logs: usize,

    /// Seconds without audio before a stream is reported as silent
    #[arg(long, env = "EASARCHIVE_ACTIVITY_WINDOW_SECS", default_value_t = 45)]
    pub activity_window_secs: u64,

    /// Seconds between alert log scans
    #[arg(long, env = "EASARCHIVE_ALERT_POLL_SECS", default_value_t = 5)]
    pub alert_poll_secs: u64,
}

#[derive(Args, Clone, Debug)]
pub struct MonitorArgs {
    /// Base URL of the archive server
    #[arg(long, env = "EASARCHIVE_SERVER", default_value = "http://127.0.0.1:8080")]
    pub server: String,

    /// Log entries kept locally
    #[arg(long, env = "EASARCHIVE_LOG_RETENTION", default_value_t = 200)]
    pub log_retention: usize,

    /// Seconds between consistency polls of /api/status and /api/logs
    #[arg(long, env = "EASARCHIVE_POLL_SECS", default_value_t = 60)]
    pub poll_secs: u64,
}

pub struct SessionInner {
    pub args: ServeArgs,
    pub recording_dir: PathBuf,
    pub alert_log: PathBuf,
    pub manifest: Arc<ManifestCache>,
    pub hub: Arc<MonitoringHub>,
    pub parser: AlertLogParser,
    pub watch_list: WatchList,
}

/// Shared server state handed to every handler and subsystem.
#[derive(Clone)]
pub struct Session {
    pub inner: Arc<SessionInner>,
}

impl Session {
    /// Build the session from validated serve arguments.
    ///
    /// The hub is created beforehand so that logging can be wired into it
    /// before anything else runs.
    pub fn new(args: ServeArgs, hub: Arc<MonitoringHub>) -> Result<Self, config::ConfigError> {
        let offset: FixedOffset = config::parse_utc_offset(&args.log_utc_offset)?;
        let recording_dir = args
            .recording_dir
            .clone()
            .unwrap_or_else(config::default_recording_dir);
        let manifest_path = args
            .manifest_path
            .clone()
            .unwrap_or_else(|| config::default_manifest_path(&recording_dir));
        let alert_log = args
            .alert_log
            .clone()
            .unwrap_or_else(config::default_alert_log);

        let manifest = Arc::new(ManifestCache::for_directory(
            recording_dir.clone(),
            manifest_path,
        ));
        log::info!("Recording directory: {}", recording_dir.display());
        log::info!("Manifest file: {}", manifest.manifest_path().display());
        log::info!("Alert log: {}", alert_log.display());
        let watch_list = WatchList::parse(&args.watched_fips);
        if watch_list.is_disabled() {
            log::info!("Watching all locations");
        } else {
            log::info!("Watching locations {:?}", watch_list.codes());
        }

        Ok(Session {
            inner: Arc::new(SessionInner {
                recording_dir,
                alert_log,
                manifest,
                hub,
                parser: AlertLogParser::new(easarchive_core::alert::DEFAULT_WINDOW, offset),
                watch_list,
                args,
            }),
        })
    }

    pub fn hub_config(args: &ServeArgs) -> HubConfig {
        HubConfig {
            max_logs: args.max_logs.max(1),
            activity_window: Duration::from_secs(args.activity_window_secs),
            ..HubConfig::default()
        }
    }

    pub fn args(&self) -> &ServeArgs {
        &self.inner.args
    }

    pub fn manifest(&self) -> &Arc<ManifestCache> {
        &self.inner.manifest
    }

    pub fn hub(&self) -> &Arc<MonitoringHub> {
        &self.inner.hub
    }

    pub fn parser(&self) -> &AlertLogParser {
        &self.inner.parser
    }

    pub fn watch_list(&self) -> &WatchList {
        &self.inner.watch_list
    }

    pub fn alert_log(&self) -> &PathBuf {
        &self.inner.alert_log
    }

    #[cfg(test)]
    pub fn new_fake(recording_dir: &std::path::Path, alert_log: &std::path::Path) -> Self {
        // This does not start anything - only use for testing
        let args = ServeArgs {
            port: 0,
            recording_dir: Some(recording_dir.to_path_buf()),
            manifest_path: None,
            alert_log: Some(alert_log.to_path_buf()),
            watched_fips: "006001,006003".to_string(),
            log_utc_offset: "+00:00".to_string(),
            max_logs: 50,
            activity_window_secs: 45,
            alert_poll_secs: 5,
        };
        let hub = Arc::new(MonitoringHub::new(Self::hub_config(&args)));
        match Self::new(args, hub) {
            Ok(session) => session,
            Err(e) => panic!("fake session: {e}"),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session {{ {} }}", self.inner.recording_dir.display())
    }
}
