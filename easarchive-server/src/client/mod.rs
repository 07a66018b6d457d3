//! Headless monitoring client.
//!
//! Mirrors a running server over its realtime channel ([`sync`]) and looks
//! for the recordings belonging to active alerts ([`prober`]). The single
//! media source is held by the [`ticker::AlertTicker`].

use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, info};
use reqwest::header;
use thiserror::Error;
use tokio::sync::watch;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};

use easarchive_core::sync::{LogEntry, LogsResponse, StatusResponse, SyncState};
use easarchive_core::ProbeConfig;

use crate::MonitorArgs;

pub mod prober;
pub mod sync;
pub mod ticker;

use prober::{HttpWavSurface, Prober};
use sync::SyncRuntime;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Invalid server URL '{0}'")]
    Url(String),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unexpected status {0}")]
    Status(u16),
    #[error("WebSocket failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Malformed response: {0}")]
    Decode(String),
}

/// Result of a `HEAD` on a recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadInfo {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
}

// =============================================================================
// ArchiveClient
// =============================================================================

/// HTTP access to the archive server's endpoints.
#[derive(Clone, Debug)]
pub struct ArchiveClient {
    http: reqwest::Client,
    base: String,
}

impl ArchiveClient {
    pub fn new(base: &str) -> Result<Self, ClientError> {
        let base = base.trim().trim_end_matches('/').to_string();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ClientError::Url(base));
        }
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, base })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// `ws://` or `wss://` URL of the realtime channel.
    pub fn ws_url(&self) -> String {
        let rest = self
            .base
            .strip_prefix("https://")
            .map(|r| format!("wss://{r}"))
            .or_else(|| self.base.strip_prefix("http://").map(|r| format!("ws://{r}")))
            .unwrap_or_else(|| self.base.clone());
        format!("{rest}/ws")
    }

    pub fn recording_url(&self, recording_id: u64) -> String {
        format!("{}/archive?recording_id={}", self.base, recording_id)
    }

    /// Newest recording id, `None` when the archive is empty.
    pub async fn latest_id(&self) -> Result<Option<u64>, ClientError> {
        let response = self
            .http
            .get(format!("{}/archive?latest_id=true", self.base))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ClientError::Status(response.status().as_u16()));
        }
        let text = response.text().await?;
        parse_latest_id(&text)
    }

    pub async fn status(&self) -> Result<StatusResponse, ClientError> {
        let response = self
            .http
            .get(format!("{}/api/status", self.base))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn logs(&self, tail: usize) -> Result<Vec<LogEntry>, ClientError> {
        let response = self
            .http
            .get(format!("{}/api/logs?tail={}", self.base, tail))
            .send()
            .await?
            .error_for_status()?;
        let body: LogsResponse = response.json().await?;
        Ok(body.logs)
    }

    pub async fn head_recording(&self, recording_id: u64) -> Result<HeadInfo, ClientError> {
        let response = self.http.head(self.recording_url(recording_id)).send().await?;
        let headers = response.headers();
        // Read the header itself: the body size hint of a HEAD response is 0
        let content_length = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(HeadInfo {
            status: response.status().as_u16(),
            content_type,
            content_length,
        })
    }

    /// First `len` bytes of `url`, requested with a Range header.
    pub async fn fetch_prefix(&self, url: &str, len: usize) -> Result<Vec<u8>, ClientError> {
        let response = self
            .http
            .get(url)
            .header(header::RANGE, format!("bytes=0-{}", len.saturating_sub(1)))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status(status.as_u16()));
        }
        let mut bytes = response.bytes().await?.to_vec();
        bytes.truncate(len);
        Ok(bytes)
    }
}

fn parse_latest_id(text: &str) -> Result<Option<u64>, ClientError> {
    let text = text.trim();
    if text == "-1" {
        return Ok(None);
    }
    text.parse()
        .map(Some)
        .map_err(|_| ClientError::Decode(format!("latest id '{text}'")))
}

// =============================================================================
// Monitor
// =============================================================================

/// The `monitor` subcommand: sync runtime plus prober.
pub struct Monitor {
    args: MonitorArgs,
}

impl Monitor {
    pub fn new(args: MonitorArgs) -> Self {
        Self { args }
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), ClientError> {
        let client = ArchiveClient::new(&self.args.server)?;
        info!("Monitoring {}", client.base());

        let state = Arc::new(RwLock::new(SyncState::new(self.args.log_retention)));
        let (alerts_tx, alerts_rx) = watch::channel(Vec::new());

        let sync = SyncRuntime::new(
            client.clone(),
            state,
            alerts_tx,
            Duration::from_secs(self.args.poll_secs.max(1)),
            self.args.log_retention,
        );
        let foreground = sync.foreground_handle();

        let surface = Arc::new(HttpWavSurface::new(client.clone()));
        let prober = Prober::new(client, surface, alerts_rx, ProbeConfig::default());

        subsys.start(SubsystemBuilder::new("Sync", |s| sync.run(s)));
        subsys.start(SubsystemBuilder::new("Prober", |s| prober.run(s)));

        // SIGUSR1 stands in for the surface regaining the foreground
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            if let Ok(mut usr1) = signal(SignalKind::user_defined1()) {
                loop {
                    tokio::select! {
                        _ = subsys.on_shutdown_requested() => break,
                        Some(_) = usr1.recv() => {
                            debug!("Foreground regained");
                            foreground.raise();
                        }
                    }
                }
                return Ok(());
            }
        }

        let _ = foreground;
        subsys.on_shutdown_requested().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let client = ArchiveClient::new("http://radio.local:8080/").unwrap();
        assert_eq!(client.ws_url(), "ws://radio.local:8080/ws");
        assert_eq!(
            client.recording_url(42),
            "http://radio.local:8080/archive?recording_id=42"
        );

        let tls = ArchiveClient::new("https://radio.example").unwrap();
        assert_eq!(tls.ws_url(), "wss://radio.example/ws");

        assert!(matches!(
            ArchiveClient::new("radio.local"),
            Err(ClientError::Url(_))
        ));
    }

    #[test]
    fn test_parse_latest_id() {
        assert_eq!(parse_latest_id("42\n").unwrap(), Some(42));
        assert_eq!(parse_latest_id("-1").unwrap(), None);
        assert!(parse_latest_id("<html>").is_err());
    }
}
