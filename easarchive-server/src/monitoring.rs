//! MonitoringHub - registry of stream telemetry, recent log records and the
//! active alert list.
//!
//! Every change is broadcast to realtime subscribers as a
//! [`ServerMessage`]. New subscribers start from [`MonitoringHub::snapshot`].
//! Subscribers that fall behind lose the missed events and carry on.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use log::kv::{self, Key, Source, VisitSource};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use easarchive_core::sync::{
    ActiveAlert, AlertSignature, LogEntry, ServerMessage, Snapshot, StatusResponse, StreamStatus,
};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Log records kept in the ring buffer
    pub max_logs: usize,

    /// Broadcast channel capacity
    pub broadcast_capacity: usize,

    /// A connected stream with no audio for this long is reported silent
    pub activity_window: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_logs: 500,
            broadcast_capacity: 256,
            activity_window: Duration::from_secs(45),
        }
    }
}

// =============================================================================
// MonitoringHub
// =============================================================================

pub struct MonitoringHub {
    config: HubConfig,
    streams: RwLock<BTreeMap<String, StreamStatus>>,
    active_alerts: RwLock<Vec<ActiveAlert>>,
    logs: RwLock<VecDeque<LogEntry>>,
    event_tx: broadcast::Sender<ServerMessage>,
    /// Next log id, starting at 1
    next_log_id: AtomicU64,
}

impl Default for MonitoringHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl MonitoringHub {
    pub fn new(config: HubConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            streams: RwLock::new(BTreeMap::new()),
            active_alerts: RwLock::new(Vec::new()),
            logs: RwLock::new(VecDeque::with_capacity(config.max_logs)),
            event_tx,
            next_log_id: AtomicU64::new(1),
            config,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Subscribe to realtime events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.event_tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.event_tx.receiver_count()
    }

    fn publish(&self, message: ServerMessage) {
        // No subscribers is not an error
        let _ = self.event_tx.send(message);
    }

    // -------------------------------------------------------------------------
    // Logs
    // -------------------------------------------------------------------------

    /// Store a log record and broadcast it.
    ///
    /// Must not log itself: it runs inside the installed logger.
    pub fn record_log(
        &self,
        level: &str,
        target: &str,
        message: String,
        fields: Map<String, Value>,
    ) -> LogEntry {
        let entry = LogEntry {
            id: self.next_log_id.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            level: level.to_string(),
            target: target.to_string(),
            message,
            fields,
        };
        {
            let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
            if logs.len() >= self.config.max_logs {
                logs.pop_front();
            }
            logs.push_back(entry.clone());
        }
        self.publish(ServerMessage::Log(entry.clone()));
        entry
    }

    /// Most recent `tail` log records, newest first.
    pub fn logs(&self, tail: usize) -> Vec<LogEntry> {
        let logs = self.logs.read().unwrap_or_else(|e| e.into_inner());
        logs.iter().rev().take(tail).cloned().collect()
    }

    /// Clamp a requested tail length to what the hub keeps.
    pub fn clamp_tail(&self, tail: Option<usize>) -> usize {
        tail.unwrap_or(100).clamp(1, self.config.max_logs.max(1))
    }

    // -------------------------------------------------------------------------
    // Streams
    // -------------------------------------------------------------------------

    /// Store telemetry pushed by the capture process and broadcast it.
    pub fn update_stream(&self, status: StreamStatus) -> StreamStatus {
        let status = self.derive(status);
        {
            let mut streams = self.streams.write().unwrap_or_else(|e| e.into_inner());
            streams.insert(status.stream_url.clone(), status.clone());
        }
        self.publish(ServerMessage::Stream(status.clone()));
        status
    }

    /// Fill the fields the hub computes from timestamps.
    fn derive(&self, mut status: StreamStatus) -> StreamStatus {
        let now = Utc::now();
        let window = chrono::Duration::from_std(self.config.activity_window)
            .unwrap_or(chrono::Duration::seconds(45));

        status.is_receiving_audio = status.is_connected
            && status
                .last_activity
                .is_some_and(|last| now.signed_duration_since(last) <= window);
        status.uptime_seconds = match (status.is_connected, status.connected_since) {
            (true, Some(since)) => Some(now.signed_duration_since(since).num_seconds().max(0) as u64),
            _ => None,
        };
        status
    }

    pub fn streams(&self) -> Vec<StreamStatus> {
        let streams = self.streams.read().unwrap_or_else(|e| e.into_inner());
        streams.values().cloned().map(|s| self.derive(s)).collect()
    }

    // -------------------------------------------------------------------------
    // Alerts
    // -------------------------------------------------------------------------

    /// Replace the active alert list. Broadcasts only when its signature
    /// changed; returns whether it did.
    pub fn set_active_alerts(&self, alerts: Vec<ActiveAlert>) -> bool {
        let changed = {
            let mut current = self.active_alerts.write().unwrap_or_else(|e| e.into_inner());
            let changed = AlertSignature::of(&current) != AlertSignature::of(&alerts);
            *current = alerts.clone();
            changed
        };
        if changed {
            self.publish(ServerMessage::Alerts(alerts));
        }
        changed
    }

    pub fn active_alerts(&self) -> Vec<ActiveAlert> {
        self.active_alerts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // -------------------------------------------------------------------------
    // Views
    // -------------------------------------------------------------------------

    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            streams: self.streams(),
            active_alerts: self.active_alerts(),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            streams: self.streams(),
            active_alerts: self.active_alerts(),
            logs: self.logs(self.config.max_logs),
        }
    }
}

// =============================================================================
// Log capture
// =============================================================================

/// Logger that forwards to `env_logger` and copies every record it lets
/// through into the hub.
pub struct HubLogger {
    inner: env_logger::Logger,
    hub: Arc<MonitoringHub>,
}

impl HubLogger {
    pub fn new(inner: env_logger::Logger, hub: Arc<MonitoringHub>) -> Self {
        Self { inner, hub }
    }

    /// Install as the global logger.
    pub fn init(self) -> Result<(), log::SetLoggerError> {
        let max_level = self.inner.filter();
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(max_level);
        Ok(())
    }
}

/// Gathers a record's key-values as JSON. Booleans and numbers keep their
/// type, everything else is rendered as a string.
#[derive(Default)]
struct FieldCollector(Map<String, Value>);

impl<'kvs> VisitSource<'kvs> for FieldCollector {
    fn visit_pair(&mut self, key: Key<'kvs>, value: kv::Value<'kvs>) -> Result<(), kv::Error> {
        let json = if let Some(b) = value.to_bool() {
            Value::Bool(b)
        } else if let Some(n) = value.to_i64() {
            Value::from(n)
        } else if let Some(n) = value.to_u64() {
            Value::from(n)
        } else if let Some(n) = value.to_f64() {
            Value::from(n)
        } else {
            Value::String(value.to_string())
        };
        self.0.insert(key.as_str().to_string(), json);
        Ok(())
    }
}

impl log::Log for HubLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if !self.inner.matches(record) {
            return;
        }
        self.inner.log(record);
        let mut fields = FieldCollector::default();
        // A failed visit keeps what was gathered before it
        let _ = record.key_values().visit(&mut fields);
        self.hub.record_log(
            record.level().as_str(),
            record.target(),
            record.args().to_string(),
            fields.0,
        );
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use easarchive_core::sync::AlertData;
    use log::Log;

    fn alert(code: &str) -> ActiveAlert {
        ActiveAlert {
            data: AlertData {
                eas_text: String::new(),
                event_text: String::new(),
                event_code: code.to_string(),
                fips: vec!["006001".into()],
                locations: String::new(),
                originator: String::new(),
            },
            raw_header: format!("ZCZC-WXR-{code}-006001+0030-1231530-KLWX-"),
            received_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            expires_at: Utc.timestamp_opt(1_700_001_800, 0).unwrap(),
        }
    }

    #[test]
    fn test_log_ids_and_ring_buffer() {
        let hub = MonitoringHub::new(HubConfig {
            max_logs: 3,
            ..Default::default()
        });
        for i in 0..5 {
            hub.record_log("INFO", "test", format!("message {i}"), Map::new());
        }
        let logs = hub.logs(10);
        let ids: Vec<u64> = logs.iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
        assert_eq!(hub.logs(1)[0].message, "message 4");
    }

    #[test]
    fn test_tail_clamp() {
        let hub = MonitoringHub::new(HubConfig {
            max_logs: 50,
            ..Default::default()
        });
        assert_eq!(hub.clamp_tail(None), 50);
        assert_eq!(hub.clamp_tail(Some(0)), 1);
        assert_eq!(hub.clamp_tail(Some(10)), 10);
        assert_eq!(hub.clamp_tail(Some(1000)), 50);
    }

    #[test]
    fn test_broadcast_events() {
        let hub = MonitoringHub::default();
        let mut rx = hub.subscribe();

        assert_eq!(hub.subscriber_count(), 1);

        hub.record_log("WARN", "test", "hello".into(), Map::new());
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Log(l)) if l.message == "hello"));

        assert!(hub.set_active_alerts(vec![alert("TOR")]));
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Alerts(a)) if a.len() == 1));

        // Same signature: no event
        assert!(!hub.set_active_alerts(vec![alert("TOR")]));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stream_derived_fields() {
        let hub = MonitoringHub::default();
        let now = Utc::now();

        let mut status = StreamStatus::new("http://radio/stream");
        status.is_connected = true;
        status.connected_since = Some(now - chrono::Duration::seconds(120));
        status.last_activity = Some(now - chrono::Duration::seconds(5));
        let stored = hub.update_stream(status.clone());
        assert!(stored.is_receiving_audio);
        assert!(stored.uptime_seconds.unwrap() >= 120);

        status.last_activity = Some(now - chrono::Duration::seconds(300));
        assert!(!hub.update_stream(status.clone()).is_receiving_audio);

        status.is_connected = false;
        let stored = hub.update_stream(status);
        assert_eq!(stored.uptime_seconds, None);
        assert_eq!(hub.streams().len(), 1);
    }

    #[test]
    fn test_snapshot_contents() {
        let hub = MonitoringHub::default();
        hub.update_stream(StreamStatus::new("http://a"));
        hub.set_active_alerts(vec![alert("RWT")]);
        hub.record_log("INFO", "test", "x".into(), Map::new());

        let snapshot = hub.snapshot();
        assert_eq!(snapshot.streams.len(), 1);
        assert_eq!(snapshot.active_alerts.len(), 1);
        assert_eq!(snapshot.logs.len(), 1);
    }

    #[test]
    fn test_logger_captures_records() {
        let hub = Arc::new(MonitoringHub::default());
        let inner = env_logger::Builder::new()
            .filter_level(log::LevelFilter::Info)
            .is_test(true)
            .build();
        let logger = HubLogger::new(inner, hub.clone());

        logger.log(
            &log::Record::builder()
                .args(format_args!("captured"))
                .level(log::Level::Info)
                .target("easarchive")
                .build(),
        );
        logger.log(
            &log::Record::builder()
                .args(format_args!("filtered"))
                .level(log::Level::Trace)
                .target("easarchive")
                .build(),
        );

        let logs = hub.logs(10);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "captured");
        assert_eq!(logs[0].level, "INFO");
        assert_eq!(logs[0].target, "easarchive");
        assert!(logs[0].fields.is_empty());
    }

    #[test]
    fn test_logger_keeps_structured_fields() {
        let hub = Arc::new(MonitoringHub::default());
        let inner = env_logger::Builder::new()
            .filter_level(log::LevelFilter::Info)
            .is_test(true)
            .build();
        let logger = HubLogger::new(inner, hub.clone());

        let stream: &[(&str, &str)] = &[("stream", "http://radio/a")];
        let retries: &[(&str, i64)] = &[("retries", 3)];
        logger.log(
            &log::Record::builder()
                .args(format_args!("stream reconnecting"))
                .level(log::Level::Warn)
                .target("easarchive")
                .key_values(&stream)
                .build(),
        );
        logger.log(
            &log::Record::builder()
                .args(format_args!("still down"))
                .level(log::Level::Warn)
                .target("easarchive")
                .key_values(&retries)
                .build(),
        );

        let logs = hub.logs(10);
        assert_eq!(logs[1].fields["stream"], Value::from("http://radio/a"));
        assert_eq!(logs[0].fields["retries"], Value::from(3));

        // Fields travel with the realtime message too
        let json = serde_json::to_value(&logs[1]).unwrap();
        assert_eq!(json["fields"]["stream"], "http://radio/a");
    }
}
