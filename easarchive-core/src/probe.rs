//! Audio availability probe scheduling.
//!
//! Recordings are correlated to alerts by position: the Nth most recent
//! active alert (0-based) is assumed to be recording `latest_id - N`. The
//! recorder only finalizes a file some time after the alert arrives, so each
//! candidate is polled with its own exponential backoff until a probe
//! confirms it is playable.
//!
//! [`ProbeScheduler`] decides which ids are due and folds probe outcomes
//! back in. Each ticket carries the attempt version it was issued under;
//! outcomes from an older version (the alert list changed meanwhile) are
//! dropped.

use std::collections::{BTreeMap, BTreeSet};

use crate::sync::AlertSignature;

/// Probe tuning. All times in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Probes in flight at once
    pub max_in_flight: usize,
    /// Delay after an alert list change before the first probe
    pub holdoff_ms: u64,
    /// Bound on the playability check
    pub playability_timeout_ms: u64,
    /// Tracked ids before pruning kicks in
    pub capacity: usize,
    /// Ids further than this from the latest id are pruned
    pub prune_window: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: 5_000,
            max_backoff_ms: 60_000,
            max_in_flight: 2,
            holdoff_ms: 4_000,
            playability_timeout_ms: 5_000,
            capacity: 256,
            prune_window: 64,
        }
    }
}

/// Retry bookkeeping for one candidate id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProbeState {
    pub failures: u32,
    pub next_eligible_ms: u64,
}

/// A probe the runtime should perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTicket {
    pub recording_id: u64,
    /// Position of the alert in the active list (0 = newest)
    pub alert_index: usize,
    pub version: u64,
}

/// Result the runtime reports for a ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Available,
    Unavailable(ProbeFailure),
}

/// Why a probe did not confirm a recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    /// 425: the recording exists but is still being written
    NotReady,
    Status(u16),
    ContentType(String),
    Empty,
    /// Decoding or playback did not start within the bound
    NotPlayable,
    Network(String),
}

impl std::fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeFailure::NotReady => write!(f, "recording not finalized"),
            ProbeFailure::Status(s) => write!(f, "unexpected status {s}"),
            ProbeFailure::ContentType(ct) => write!(f, "unexpected content type {ct}"),
            ProbeFailure::Empty => write!(f, "empty body"),
            ProbeFailure::NotPlayable => write!(f, "not playable"),
            ProbeFailure::Network(e) => write!(f, "network error: {e}"),
        }
    }
}

/// What a completed ticket did to the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResolution {
    Confirmed { recording_id: u64, alert_index: usize },
    /// Eligible again at this time
    Retry { recording_id: u64, at_ms: u64 },
    /// Issued under an older attempt version
    Stale,
}

/// Judge a `HEAD` response for a recording.
///
/// Anything but a 2xx carrying a non-empty, non-textual body is a failure.
pub fn check_head(
    status: u16,
    content_type: Option<&str>,
    content_length: Option<u64>,
) -> Result<(), ProbeFailure> {
    if status == 425 {
        return Err(ProbeFailure::NotReady);
    }
    if !(200..300).contains(&status) {
        return Err(ProbeFailure::Status(status));
    }
    if let Some(ct) = content_type {
        let mime = ct
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        if mime.starts_with("text/") || mime.contains("html") || mime.contains("json") {
            return Err(ProbeFailure::ContentType(mime));
        }
    }
    if content_length == Some(0) {
        return Err(ProbeFailure::Empty);
    }
    Ok(())
}

/// Candidate recording ids for `alert_count` active alerts, newest first.
pub fn candidates(latest_id: u64, alert_count: usize) -> Vec<u64> {
    (0..alert_count)
        .map_while(|n| latest_id.checked_sub(n as u64))
        .collect()
}

/// Per-candidate probe scheduler.
#[derive(Debug, Clone)]
pub struct ProbeScheduler {
    config: ProbeConfig,
    signature: AlertSignature,
    alert_count: usize,
    latest_id: Option<u64>,
    version: u64,
    holdoff_until_ms: u64,
    states: BTreeMap<u64, ProbeState>,
    confirmed: BTreeSet<u64>,
    in_flight: BTreeSet<u64>,
    /// Confirmed ids that then failed to play, per alert list
    revocations: BTreeMap<u64, u32>,
}

impl Default for ProbeScheduler {
    fn default() -> Self {
        Self::new(ProbeConfig::default())
    }
}

impl ProbeScheduler {
    pub fn new(config: ProbeConfig) -> Self {
        Self {
            config,
            signature: AlertSignature::default(),
            alert_count: 0,
            latest_id: None,
            version: 0,
            holdoff_until_ms: 0,
            states: BTreeMap::new(),
            confirmed: BTreeSet::new(),
            in_flight: BTreeSet::new(),
            revocations: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn latest_id(&self) -> Option<u64> {
        self.latest_id
    }

    pub fn is_confirmed(&self, recording_id: u64) -> bool {
        self.confirmed.contains(&recording_id)
    }

    pub fn state(&self, recording_id: u64) -> Option<&ProbeState> {
        self.states.get(&recording_id)
    }

    pub fn tracked(&self) -> usize {
        self.states.len()
    }

    /// Current candidate ids, newest alert first.
    pub fn candidates(&self) -> Vec<u64> {
        match self.latest_id {
            Some(latest) => candidates(latest, self.alert_count),
            None => Vec::new(),
        }
    }

    /// Track the active alert list.
    ///
    /// A changed signature drops all probe state, invalidates in-flight
    /// tickets and starts the holdoff. Returns true when that happened.
    pub fn update_alerts(&mut self, signature: &AlertSignature, now_ms: u64) -> bool {
        if *signature == self.signature {
            return false;
        }
        self.signature = signature.clone();
        self.alert_count = signature.len();
        self.version += 1;
        self.holdoff_until_ms = now_ms + self.config.holdoff_ms;
        self.states.clear();
        self.confirmed.clear();
        self.in_flight.clear();
        self.revocations.clear();
        true
    }

    /// Track the newest recording id known to the server.
    pub fn set_latest_id(&mut self, latest_id: Option<u64>) {
        if self.latest_id == latest_id {
            return;
        }
        self.latest_id = latest_id;
        self.prune();
    }

    /// Issue tickets for every candidate that is due, up to the in-flight cap.
    pub fn due(&mut self, now_ms: u64) -> Vec<ProbeTicket> {
        if now_ms < self.holdoff_until_ms {
            return Vec::new();
        }
        let slots = self.config.max_in_flight.saturating_sub(self.in_flight.len());
        if slots == 0 {
            return Vec::new();
        }

        let mut tickets = Vec::new();
        for (alert_index, id) in self.candidates().into_iter().enumerate() {
            if tickets.len() == slots {
                break;
            }
            if self.confirmed.contains(&id) || self.in_flight.contains(&id) {
                continue;
            }
            let state = self.states.entry(id).or_default();
            if state.next_eligible_ms > now_ms {
                continue;
            }
            self.in_flight.insert(id);
            tickets.push(ProbeTicket {
                recording_id: id,
                alert_index,
                version: self.version,
            });
        }
        self.prune();
        tickets
    }

    /// Fold a probe outcome back in.
    pub fn complete(
        &mut self,
        ticket: ProbeTicket,
        outcome: ProbeOutcome,
        now_ms: u64,
    ) -> ProbeResolution {
        if ticket.version != self.version {
            return ProbeResolution::Stale;
        }
        self.in_flight.remove(&ticket.recording_id);

        match outcome {
            ProbeOutcome::Available => {
                self.states.remove(&ticket.recording_id);
                self.confirmed.insert(ticket.recording_id);
                ProbeResolution::Confirmed {
                    recording_id: ticket.recording_id,
                    alert_index: ticket.alert_index,
                }
            }
            ProbeOutcome::Unavailable(_) => {
                let failures = self
                    .states
                    .get(&ticket.recording_id)
                    .map_or(0, |s| s.failures)
                    .saturating_add(1);
                let at_ms = now_ms + self.backoff_ms(failures);
                self.states.insert(
                    ticket.recording_id,
                    ProbeState {
                        failures,
                        next_eligible_ms: at_ms,
                    },
                );
                ProbeResolution::Retry {
                    recording_id: ticket.recording_id,
                    at_ms,
                }
            }
        }
    }

    /// A confirmed recording failed to play: forget the association and
    /// poll the id again after a backoff that grows with every revocation.
    /// Returns when the id is eligible again.
    pub fn revoke(&mut self, recording_id: u64, now_ms: u64) -> u64 {
        self.confirmed.remove(&recording_id);
        let revocations = self.revocations.entry(recording_id).or_default();
        *revocations = revocations.saturating_add(1);
        let failures = *revocations;
        let at_ms = now_ms + self.backoff_ms(failures);
        self.states.insert(
            recording_id,
            ProbeState {
                failures,
                next_eligible_ms: at_ms,
            },
        );
        at_ms
    }

    /// Backoff after `failures` consecutive failures: base, doubling, capped.
    pub fn backoff_ms(&self, failures: u32) -> u64 {
        let shift = failures.saturating_sub(1).min(16);
        (self.config.base_backoff_ms << shift).min(self.config.max_backoff_ms)
    }

    fn prune(&mut self) {
        if self.states.len() <= self.config.capacity {
            return;
        }
        if let Some(latest) = self.latest_id {
            let window = self.config.prune_window;
            self.states.retain(|id, _| latest.abs_diff(*id) <= window);
            self.revocations.retain(|id, _| latest.abs_diff(*id) <= window);
        }
        while self.states.len() > self.config.capacity {
            let Some(&oldest) = self.states.keys().next() else {
                break;
            };
            self.states.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{ActiveAlert, AlertData};
    use chrono::{TimeZone, Utc};

    fn signature(codes: &[&str]) -> AlertSignature {
        let alerts: Vec<ActiveAlert> = codes
            .iter()
            .enumerate()
            .map(|(i, code)| ActiveAlert {
                data: AlertData {
                    eas_text: String::new(),
                    event_text: String::new(),
                    event_code: code.to_string(),
                    fips: vec![],
                    locations: String::new(),
                    originator: String::new(),
                },
                raw_header: format!("ZCZC-WXR-{code}-006001+0030-1231530-KLWX-"),
                received_at: Utc.timestamp_opt(1_700_000_000 - i as i64, 0).unwrap(),
                expires_at: Utc.timestamp_opt(1_700_001_800, 0).unwrap(),
            })
            .collect();
        AlertSignature::of(&alerts)
    }

    fn failed() -> ProbeOutcome {
        ProbeOutcome::Unavailable(ProbeFailure::NotReady)
    }

    #[test]
    fn test_candidates_by_position() {
        assert_eq!(candidates(42, 3), vec![42, 41, 40]);
        assert_eq!(candidates(1, 3), vec![1, 0]);
        assert_eq!(candidates(5, 0), Vec::<u64>::new());
    }

    #[test]
    fn test_holdoff_and_in_flight_cap() {
        let mut sched = ProbeScheduler::default();
        sched.set_latest_id(Some(42));
        assert!(sched.update_alerts(&signature(&["A", "B", "C"]), 1_000));
        assert_eq!(sched.candidates(), vec![42, 41, 40]);

        assert!(sched.due(4_999).is_empty());
        let tickets = sched.due(5_000);
        let ids: Vec<u64> = tickets.iter().map(|t| t.recording_id).collect();
        assert_eq!(ids, vec![42, 41]);
        assert!(sched.due(5_000).is_empty());
    }

    #[test]
    fn test_confirmed_not_reprobed_while_signature_unchanged() {
        let mut sched = ProbeScheduler::default();
        let sig = signature(&["A", "B", "C"]);
        sched.set_latest_id(Some(42));
        sched.update_alerts(&sig, 0);

        let tickets = sched.due(4_000);
        assert_eq!(
            sched.complete(tickets[0], ProbeOutcome::Available, 4_100),
            ProbeResolution::Confirmed {
                recording_id: 42,
                alert_index: 0
            }
        );
        assert_eq!(
            sched.complete(tickets[1], failed(), 4_100),
            ProbeResolution::Retry {
                recording_id: 41,
                at_ms: 9_100
            }
        );
        assert!(sched.is_confirmed(42));
        assert!(sched.state(42).is_none());

        assert!(!sched.update_alerts(&sig, 4_200));
        let ids: Vec<u64> = sched.due(4_200).iter().map(|t| t.recording_id).collect();
        assert_eq!(ids, vec![40]);

        let ids: Vec<u64> = sched.due(100_000).iter().map(|t| t.recording_id).collect();
        assert_eq!(ids, vec![41]);
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let sched = ProbeScheduler::default();
        let delays: Vec<u64> = (1..=6).map(|f| sched.backoff_ms(f)).collect();
        assert_eq!(delays, vec![5_000, 10_000, 20_000, 40_000, 60_000, 60_000]);
        assert_eq!(sched.backoff_ms(u32::MAX), 60_000);
    }

    #[test]
    fn test_signature_change_discards_stale_results() {
        let mut sched = ProbeScheduler::default();
        sched.set_latest_id(Some(10));
        sched.update_alerts(&signature(&["A"]), 0);
        let ticket = sched.due(4_000)[0];

        sched.update_alerts(&signature(&["B", "A"]), 4_500);
        assert_eq!(
            sched.complete(ticket, ProbeOutcome::Available, 4_600),
            ProbeResolution::Stale
        );
        assert!(!sched.is_confirmed(10));
        assert!(sched.due(5_000).is_empty());
        assert_eq!(sched.due(8_500).len(), 2);
    }

    #[test]
    fn test_revoke_backs_off() {
        let mut sched = ProbeScheduler::default();
        sched.set_latest_id(Some(3));
        sched.update_alerts(&signature(&["A"]), 0);
        let ticket = sched.due(4_000)[0];
        sched.complete(ticket, ProbeOutcome::Available, 4_000);
        assert!(sched.due(4_001).is_empty());

        // Confirmed but unplayable: re-armed behind a backoff
        assert_eq!(sched.revoke(3, 5_000), 10_000);
        assert!(!sched.is_confirmed(3));
        assert_eq!(sched.state(3).unwrap().failures, 1);
        assert!(sched.due(9_999).is_empty());
        let ticket = sched.due(10_000)[0];
        assert_eq!(ticket.recording_id, 3);

        // A second revocation waits longer
        sched.complete(ticket, ProbeOutcome::Available, 10_000);
        assert_eq!(sched.revoke(3, 11_000), 21_000);

        // Polling an unplayable id once a second for 10 s probes it once
        let mut probes = 0;
        for now in (21_000..31_000).step_by(1_000) {
            for ticket in sched.due(now) {
                probes += 1;
                sched.complete(ticket, ProbeOutcome::Available, now);
                sched.revoke(ticket.recording_id, now);
            }
        }
        assert_eq!(probes, 1);
    }

    #[test]
    fn test_repeated_failures_accumulate() {
        let mut sched = ProbeScheduler::default();
        sched.set_latest_id(Some(7));
        sched.update_alerts(&signature(&["A"]), 0);
        let ticket = sched.due(4_000)[0];
        assert_eq!(
            sched.complete(ticket, failed(), 4_000),
            ProbeResolution::Retry {
                recording_id: 7,
                at_ms: 9_000
            }
        );
        let ticket = sched.due(9_000)[0];
        assert_eq!(
            sched.complete(ticket, failed(), 9_000),
            ProbeResolution::Retry {
                recording_id: 7,
                at_ms: 19_000
            }
        );
        assert_eq!(sched.state(7).unwrap().failures, 2);
    }

    #[test]
    fn test_prune_keeps_window_around_latest() {
        let config = ProbeConfig {
            capacity: 4,
            prune_window: 2,
            ..Default::default()
        };
        let mut sched = ProbeScheduler::new(config);
        for id in 0..6u64 {
            sched.states.insert(id, ProbeState::default());
        }
        sched.set_latest_id(Some(100));
        assert_eq!(sched.tracked(), 0);

        for id in 95..101u64 {
            sched.states.insert(id, ProbeState::default());
        }
        sched.set_latest_id(Some(101));
        let kept: Vec<u64> = sched.states.keys().copied().collect();
        assert_eq!(kept, vec![99, 100]);
    }

    #[test]
    fn test_head_checks() {
        assert_eq!(check_head(200, Some("audio/wav"), Some(1024)), Ok(()));
        assert_eq!(check_head(206, None, None), Ok(()));
        assert_eq!(check_head(425, Some("text/plain"), None), Err(ProbeFailure::NotReady));
        assert_eq!(check_head(404, None, None), Err(ProbeFailure::Status(404)));
        assert!(matches!(
            check_head(200, Some("text/html; charset=utf-8"), Some(10)),
            Err(ProbeFailure::ContentType(_))
        ));
        assert!(matches!(
            check_head(200, Some("application/json"), Some(10)),
            Err(ProbeFailure::ContentType(_))
        ));
        assert_eq!(check_head(200, Some("audio/wav"), Some(0)), Err(ProbeFailure::Empty));
    }
}
