//! Realtime message model and client-side reconciliation.
//!
//! The server pushes a `Snapshot` when a subscriber connects and then
//! incremental `Stream`, `Log` and `Alerts` messages, all wrapped in a
//! `{type, payload}` envelope. [`SyncState`] folds those messages (and the
//! periodic REST poll results) into the mirrored view. [`ChannelManager`] is
//! the reconnect state machine for the push channel; like the rest of this
//! crate it does no I/O and takes timestamps from the caller.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// Message model
// =============================================================================

/// Telemetry for one monitored audio stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub stream_url: String,
    #[serde(default)]
    pub is_connected: bool,
    #[serde(default)]
    pub is_receiving_audio: bool,
    #[serde(default)]
    pub connection_attempts: u64,
    #[serde(default)]
    pub alerts_received: u64,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub connected_since: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub last_disconnect: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub last_alert_received: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub uptime_seconds: Option<u64>,
}

impl StreamStatus {
    pub fn new(stream_url: impl Into<String>) -> Self {
        Self {
            stream_url: stream_url.into(),
            is_connected: false,
            is_receiving_audio: false,
            connection_attempts: 0,
            alerts_received: 0,
            connected_since: None,
            last_activity: None,
            last_disconnect: None,
            last_alert_received: None,
            last_error: None,
            uptime_seconds: None,
        }
    }
}

/// One captured server log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

/// Decoded alert content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertData {
    pub eas_text: String,
    pub event_text: String,
    pub event_code: String,
    pub fips: Vec<String>,
    pub locations: String,
    pub originator: String,
}

/// An alert that has not yet expired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveAlert {
    pub data: AlertData,
    pub raw_header: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub received_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub expires_at: DateTime<Utc>,
}

/// Initial state sent to every new subscriber.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub streams: Vec<StreamStatus>,
    pub active_alerts: Vec<ActiveAlert>,
    pub logs: Vec<LogEntry>,
}

/// Body of `GET /api/status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub streams: Vec<StreamStatus>,
    pub active_alerts: Vec<ActiveAlert>,
}

/// Body of `GET /api/logs`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogsResponse {
    pub logs: Vec<LogEntry>,
}

/// Server push message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerMessage {
    Snapshot(Snapshot),
    Stream(StreamStatus),
    Log(LogEntry),
    Alerts(Vec<ActiveAlert>),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl ServerMessage {
    /// Decode a text frame.
    ///
    /// Returns `Ok(None)` for a well-formed envelope of an unknown type and
    /// `Err` for anything malformed.
    pub fn parse(text: &str) -> Result<Option<Self>, serde_json::Error> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let message = match envelope.kind.as_str() {
            "Snapshot" => ServerMessage::Snapshot(serde_json::from_value(envelope.payload)?),
            "Stream" => ServerMessage::Stream(serde_json::from_value(envelope.payload)?),
            "Log" => ServerMessage::Log(serde_json::from_value(envelope.payload)?),
            "Alerts" => ServerMessage::Alerts(serde_json::from_value(envelope.payload)?),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Composite identity of an alert list: `(received_at, event_code, raw_header)`
/// per alert, in list order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct AlertSignature(Vec<(i64, String, String)>);

impl AlertSignature {
    pub fn of(alerts: &[ActiveAlert]) -> Self {
        Self(
            alerts
                .iter()
                .map(|a| {
                    (
                        a.received_at.timestamp(),
                        a.data.event_code.clone(),
                        a.raw_header.clone(),
                    )
                })
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What an applied update changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncChange {
    pub streams: bool,
    pub alerts: bool,
    pub logs: bool,
}

impl SyncChange {
    pub fn any(&self) -> bool {
        self.streams || self.alerts || self.logs
    }
}

/// Default number of log entries kept by the client
pub const DEFAULT_LOG_RETENTION: usize = 200;

/// Client-side mirror of the server's monitoring state.
#[derive(Debug, Clone)]
pub struct SyncState {
    streams: BTreeMap<String, StreamStatus>,
    active_alerts: Vec<ActiveAlert>,
    signature: AlertSignature,
    logs: Vec<LogEntry>,
    log_retention: usize,
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_RETENTION)
    }
}

impl SyncState {
    pub fn new(log_retention: usize) -> Self {
        Self {
            streams: BTreeMap::new(),
            active_alerts: Vec::new(),
            signature: AlertSignature::default(),
            logs: Vec::new(),
            log_retention: log_retention.max(1),
        }
    }

    pub fn streams(&self) -> impl Iterator<Item = &StreamStatus> {
        self.streams.values()
    }

    pub fn stream(&self, url: &str) -> Option<&StreamStatus> {
        self.streams.get(url)
    }

    pub fn active_alerts(&self) -> &[ActiveAlert] {
        &self.active_alerts
    }

    pub fn alert_signature(&self) -> &AlertSignature {
        &self.signature
    }

    /// Newest first
    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    pub fn apply(&mut self, message: ServerMessage) -> SyncChange {
        match message {
            ServerMessage::Snapshot(snapshot) => {
                let streams = self.replace_streams(snapshot.streams);
                let alerts = self.set_alerts(snapshot.active_alerts);
                let logs = self.replace_logs(snapshot.logs);
                SyncChange {
                    streams,
                    alerts,
                    logs,
                }
            }
            ServerMessage::Stream(status) => SyncChange {
                streams: self.upsert_stream(status),
                ..Default::default()
            },
            ServerMessage::Log(entry) => SyncChange {
                logs: self.merge_logs(vec![entry]),
                ..Default::default()
            },
            ServerMessage::Alerts(alerts) => SyncChange {
                alerts: self.set_alerts(alerts),
                ..Default::default()
            },
        }
    }

    /// Fold in a `GET /api/status` poll result.
    pub fn apply_status(&mut self, status: StatusResponse) -> SyncChange {
        SyncChange {
            streams: self.replace_streams(status.streams),
            alerts: self.set_alerts(status.active_alerts),
            logs: false,
        }
    }

    /// Fold in a `GET /api/logs` poll result.
    pub fn apply_logs(&mut self, logs: Vec<LogEntry>) -> SyncChange {
        SyncChange {
            logs: self.merge_logs(logs),
            ..Default::default()
        }
    }

    fn upsert_stream(&mut self, status: StreamStatus) -> bool {
        let changed = self.streams.get(&status.stream_url) != Some(&status);
        self.streams.insert(status.stream_url.clone(), status);
        changed
    }

    fn replace_streams(&mut self, streams: Vec<StreamStatus>) -> bool {
        let next: BTreeMap<String, StreamStatus> = streams
            .into_iter()
            .map(|s| (s.stream_url.clone(), s))
            .collect();
        let changed = next != self.streams;
        self.streams = next;
        changed
    }

    fn set_alerts(&mut self, alerts: Vec<ActiveAlert>) -> bool {
        let signature = AlertSignature::of(&alerts);
        self.active_alerts = alerts;
        if signature == self.signature {
            return false;
        }
        self.signature = signature;
        true
    }

    /// A snapshot is authoritative: ids restart from 1 when the server
    /// restarts, so nothing held before it survives.
    fn replace_logs(&mut self, incoming: Vec<LogEntry>) -> bool {
        let before: Vec<u64> = self.logs.iter().map(|l| l.id).collect();
        self.logs.clear();
        self.merge_logs(incoming);
        self.logs.iter().map(|l| l.id).ne(before)
    }

    fn merge_logs(&mut self, incoming: Vec<LogEntry>) -> bool {
        if incoming.is_empty() {
            return false;
        }
        let before: Vec<u64> = self.logs.iter().map(|l| l.id).collect();

        let mut by_id: BTreeMap<u64, LogEntry> =
            self.logs.drain(..).map(|l| (l.id, l)).collect();
        for entry in incoming {
            by_id.insert(entry.id, entry);
        }
        self.logs = by_id
            .into_values()
            .rev()
            .take(self.log_retention)
            .collect();

        self.logs.iter().map(|l| l.id).ne(before)
    }
}

// =============================================================================
// Reconnect
// =============================================================================

/// Exponential backoff parameters for the push channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 2000,
            multiplier: 1.8,
            max_ms: 30000,
        }
    }
}

/// Push channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out a backoff delay
    Backoff,
    ShuttingDown,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Disconnected => write!(f, "Disconnected"),
            ChannelState::Connecting => write!(f, "Connecting"),
            ChannelState::Connected => write!(f, "Connected"),
            ChannelState::Backoff => write!(f, "Backoff"),
            ChannelState::ShuttingDown => write!(f, "Shutting Down"),
        }
    }
}

/// Reconnect state machine for the push channel.
///
/// Pure state; the runtime performs the connect and sleeps for whatever
/// [`ChannelManager::failed`] returns.
#[derive(Debug, Clone)]
pub struct ChannelManager {
    config: BackoffConfig,
    state: ChannelState,
    next_delay_ms: u64,
    failure_count: u32,
    last_state_change_ms: u64,
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

impl ChannelManager {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            state: ChannelState::Disconnected,
            next_delay_ms: config.initial_ms,
            failure_count: 0,
            last_state_change_ms: 0,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    pub fn time_in_state_ms(&self, current_time_ms: u64) -> u64 {
        current_time_ms.saturating_sub(self.last_state_change_ms)
    }

    pub fn start_connecting(&mut self, current_time_ms: u64) {
        if self.state != ChannelState::ShuttingDown {
            self.set_state(ChannelState::Connecting, current_time_ms);
        }
    }

    /// Connection established: backoff starts over.
    pub fn connected(&mut self, current_time_ms: u64) {
        if self.state == ChannelState::Connecting {
            self.set_state(ChannelState::Connected, current_time_ms);
            self.failure_count = 0;
            self.next_delay_ms = self.config.initial_ms;
        }
    }

    /// Connect failed or an open channel dropped.
    ///
    /// Returns the delay to wait before the next attempt, or `None` when
    /// shutting down.
    pub fn failed(&mut self, current_time_ms: u64) -> Option<u64> {
        if self.state == ChannelState::ShuttingDown {
            return None;
        }
        self.set_state(ChannelState::Backoff, current_time_ms);
        self.failure_count = self.failure_count.saturating_add(1);

        let delay = self.next_delay_ms.min(self.config.max_ms);
        let grown = (self.next_delay_ms as f64 * self.config.multiplier).round() as u64;
        self.next_delay_ms = grown.max(delay).min(self.config.max_ms);
        Some(delay)
    }

    /// The surface came back to the foreground.
    ///
    /// Returns true when a reconnect should start right away, skipping any
    /// pending backoff.
    pub fn foreground_regained(&mut self, current_time_ms: u64) -> bool {
        match self.state {
            ChannelState::Disconnected | ChannelState::Backoff => {
                self.set_state(ChannelState::Disconnected, current_time_ms);
                true
            }
            _ => false,
        }
    }

    pub fn shutdown(&mut self, current_time_ms: u64) {
        self.set_state(ChannelState::ShuttingDown, current_time_ms);
    }

    fn set_state(&mut self, new_state: ChannelState, current_time_ms: u64) {
        if self.state != new_state {
            self.state = new_state;
            self.last_state_change_ms = current_time_ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn alert(code: &str, received: i64) -> ActiveAlert {
        ActiveAlert {
            data: AlertData {
                eas_text: format!("{code} text"),
                event_text: format!("{code} event"),
                event_code: code.to_string(),
                fips: vec!["006001".into()],
                locations: "Alameda, CA".into(),
                originator: "Primary Entry Point System".into(),
            },
            raw_header: format!("ZCZC-WXR-{code}-006001+0030-1231530-KLWX-"),
            received_at: Utc.timestamp_opt(received, 0).unwrap(),
            expires_at: Utc.timestamp_opt(received + 1800, 0).unwrap(),
        }
    }

    fn log(id: u64) -> LogEntry {
        LogEntry {
            id,
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_000 + id as i64).unwrap(),
            level: "INFO".into(),
            target: "easarchive".into(),
            message: format!("entry {id}"),
            fields: Map::new(),
        }
    }

    #[test]
    fn test_envelope_round_trip() {
        let msg = ServerMessage::Alerts(vec![alert("TOR", 1_700_000_000)]);
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.starts_with(r#"{"type":"Alerts","payload":["#));
        assert_eq!(ServerMessage::parse(&text).unwrap(), Some(msg));
    }

    #[test]
    fn test_unknown_and_malformed_messages() {
        assert_eq!(
            ServerMessage::parse(r#"{"type":"Heartbeat","payload":{}}"#).unwrap(),
            None
        );
        assert!(ServerMessage::parse("not json").is_err());
        assert!(ServerMessage::parse(r#"{"type":"Stream","payload":{"nope":1}}"#).is_err());
    }

    #[test]
    fn test_stream_last_write_wins() {
        let mut state = SyncState::default();
        let mut status = StreamStatus::new("http://a/stream");
        assert!(state.apply(ServerMessage::Stream(status.clone())).streams);
        assert!(!state.apply(ServerMessage::Stream(status.clone())).streams);

        status.is_connected = true;
        assert!(state.apply(ServerMessage::Stream(status)).streams);
        assert!(state.stream("http://a/stream").unwrap().is_connected);
        assert_eq!(state.streams().count(), 1);
    }

    #[test]
    fn test_alert_signature_change_detection() {
        let mut state = SyncState::default();
        let alerts = vec![alert("TOR", 100), alert("SVR", 200)];
        assert!(state.apply(ServerMessage::Alerts(alerts.clone())).alerts);
        assert!(!state.apply(ServerMessage::Alerts(alerts.clone())).alerts);

        // Same identity, different text: not a change
        let mut edited = alerts.clone();
        edited[0].data.eas_text = "reworded".into();
        assert!(!state.apply(ServerMessage::Alerts(edited)).alerts);

        assert!(state.apply(ServerMessage::Alerts(vec![alerts[1].clone()])).alerts);
        assert_eq!(state.alert_signature().len(), 1);
    }

    #[test]
    fn test_log_merge_dedupes_and_truncates() {
        let mut state = SyncState::new(3);
        state.apply_logs(vec![log(1), log(3)]);
        assert!(state.apply(ServerMessage::Log(log(2))).logs);
        assert!(!state.apply(ServerMessage::Log(log(2))).logs);

        let ids: Vec<u64> = state.logs().iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);

        state.apply_logs(vec![log(5), log(4)]);
        let ids: Vec<u64> = state.logs().iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
    }

    #[test]
    fn test_snapshot_replaces_streams() {
        let mut state = SyncState::default();
        state.apply(ServerMessage::Stream(StreamStatus::new("http://old")));
        let change = state.apply(ServerMessage::Snapshot(Snapshot {
            streams: vec![StreamStatus::new("http://new")],
            active_alerts: vec![],
            logs: vec![log(1)],
        }));
        assert!(change.streams && change.logs && !change.alerts);
        assert!(state.stream("http://old").is_none());
        assert!(state.stream("http://new").is_some());
    }

    #[test]
    fn test_snapshot_after_server_restart_replaces_logs() {
        let mut state = SyncState::new(3);
        state.apply_logs(vec![log(100), log(101), log(102)]);

        // Restarted server numbers its log from 1 again
        let change = state.apply(ServerMessage::Snapshot(Snapshot {
            logs: vec![log(1), log(2), log(2)],
            ..Default::default()
        }));
        assert!(change.logs);
        state.apply(ServerMessage::Log(log(3)));

        let ids: Vec<u64> = state.logs().iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn test_backoff_sequence() {
        let mut conn = ChannelManager::default();
        conn.start_connecting(0);
        let mut delays = Vec::new();
        for i in 0..12 {
            delays.push(conn.failed(i).unwrap());
            conn.start_connecting(i);
        }
        assert_eq!(&delays[..4], &[2000, 3600, 6480, 11664]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|&d| d <= 30000));
        assert_eq!(*delays.last().unwrap(), 30000);
    }

    #[test]
    fn test_backoff_resets_on_connect() {
        let mut conn = ChannelManager::default();
        conn.start_connecting(0);
        conn.failed(1);
        conn.start_connecting(2);
        assert_eq!(conn.failed(3), Some(3600));

        conn.start_connecting(4);
        conn.connected(5);
        assert!(conn.is_connected());
        assert_eq!(conn.failure_count(), 0);
        assert_eq!(conn.failed(6), Some(2000));
    }

    #[test]
    fn test_foreground_regain() {
        let mut conn = ChannelManager::default();
        conn.start_connecting(0);
        conn.failed(1);
        assert!(conn.foreground_regained(2));

        conn.start_connecting(3);
        conn.connected(4);
        assert!(!conn.foreground_regained(5));

        conn.shutdown(6);
        assert!(!conn.foreground_regained(7));
        assert_eq!(conn.failed(8), None);
    }
}
