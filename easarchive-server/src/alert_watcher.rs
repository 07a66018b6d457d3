//! Periodic scan of the alert log feeding the hub's active alert list.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio_graceful_shutdown::SubsystemHandle;

use easarchive_core::sync::{ActiveAlert, AlertData};
use easarchive_core::AlertRecord;

use crate::{archive, Session};

/// Alerts from `records` (newest first) that have not expired at `now`,
/// in the same order. A header relayed more than once is listed once, at
/// its newest receipt.
pub fn active_alerts(records: &[AlertRecord], now: DateTime<Utc>) -> Vec<ActiveAlert> {
    let mut seen = HashSet::new();
    records
        .iter()
        .filter(|r| r.expires_at > now)
        .filter(|r| seen.insert(r.raw_header.as_str()))
        .map(|r| ActiveAlert {
            data: AlertData {
                eas_text: r.description.clone(),
                event_text: r.event_text.clone(),
                event_code: r.event_code.clone(),
                fips: r.locations.clone(),
                locations: r.area.clone(),
                originator: r.originator.clone(),
            },
            raw_header: r.raw_header.clone(),
            received_at: r.received_at,
            expires_at: r.expires_at,
        })
        .collect()
}

pub struct AlertWatcher {
    session: Session,
    interval: Duration,
    /// Records from the last log that parsed
    last_good: RwLock<Vec<AlertRecord>>,
}

impl AlertWatcher {
    pub fn new(session: Session) -> Self {
        let interval = Duration::from_secs(session.args().alert_poll_secs.max(1));
        Self {
            session,
            interval,
            last_good: RwLock::new(Vec::new()),
        }
    }

    /// Rescan once and publish the result.
    pub async fn scan(&self) {
        self.scan_at(Utc::now()).await;
    }

    /// Rescan as of `now`. When the log fails to parse, the records from
    /// the last good scan are filtered again so their expiry still applies.
    pub async fn scan_at(&self, now: DateTime<Utc>) {
        let active = match archive::load_alerts(&self.session, self.session.watch_list()).await {
            Ok(records) => {
                let active = active_alerts(&records, now);
                *self.last_good.write().unwrap_or_else(|e| e.into_inner()) = records;
                active
            }
            Err(e) => {
                warn!("Alert log scan failed, keeping last good alert list: {}", e);
                let records = self.last_good.read().unwrap_or_else(|e| e.into_inner());
                active_alerts(&records, now)
            }
        };
        let count = active.len();
        if self.session.hub().set_active_alerts(active) {
            info!(active = count; "Active alerts changed: {} active", count);
        }
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), Infallible> {
        debug!("Alert watcher polling every {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = subsys.on_shutdown_requested() => {
                    debug!("Alert watcher shutting down");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.scan().await;
                }
            }
        }
    }
}
