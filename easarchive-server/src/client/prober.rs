//! Audio availability prober.
//!
//! Drives a [`ProbeScheduler`] from the mirrored active alert list: each
//! pass asks the server for the newest recording id, probes the candidate
//! ids that are due and hands confirmed recordings to the [`AlertTicker`].

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio_graceful_shutdown::SubsystemHandle;

use easarchive_core::probe::{check_head, ProbeFailure, ProbeResolution};
use easarchive_core::sync::{ActiveAlert, AlertSignature};
use easarchive_core::wav::HEADER_SIZE;
use easarchive_core::{ProbeConfig, ProbeOutcome, ProbeScheduler, ProbeTicket, WavHeader};

use super::ticker::{AlertTicker, TickerSource};
use super::{ArchiveClient, ClientError, HeadInfo};

const PASS_INTERVAL: Duration = Duration::from_secs(1);

/// Where recordings are decoded and played.
#[async_trait]
pub trait PlaybackSurface: Send + Sync {
    /// Check that the source at `url` decodes, without keeping it.
    async fn check_playable(&self, url: &str) -> Result<(), ProbeFailure>;

    /// Make `url` the surface's media source.
    async fn load(&self, url: &str) -> Result<(), ProbeFailure>;
}

impl From<ClientError> for ProbeFailure {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Status(425) => ProbeFailure::NotReady,
            ClientError::Status(status) => ProbeFailure::Status(status),
            e => ProbeFailure::Network(e.to_string()),
        }
    }
}

// =============================================================================
// HttpWavSurface
// =============================================================================

/// Headless surface: a recording is playable when its container header
/// describes PCM audio it could decode.
pub struct HttpWavSurface {
    client: ArchiveClient,
}

impl HttpWavSurface {
    pub fn new(client: ArchiveClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PlaybackSurface for HttpWavSurface {
    async fn check_playable(&self, url: &str) -> Result<(), ProbeFailure> {
        let bytes = self.client.fetch_prefix(url, HEADER_SIZE).await?;
        let header = WavHeader::parse(&bytes).map_err(|_| ProbeFailure::NotPlayable)?;
        if header.audio_format != 1 || header.channels == 0 || header.sample_rate == 0 {
            return Err(ProbeFailure::NotPlayable);
        }
        Ok(())
    }

    async fn load(&self, url: &str) -> Result<(), ProbeFailure> {
        self.check_playable(url).await?;
        debug!("Loaded {}", url);
        Ok(())
    }
}

// =============================================================================
// Probing
// =============================================================================

/// Judge a recording from its `HEAD` response, then through the surface
/// within `timeout`.
pub async fn confirm(
    head: &HeadInfo,
    surface: &dyn PlaybackSurface,
    url: &str,
    timeout: Duration,
) -> ProbeOutcome {
    if let Err(failure) = check_head(
        head.status,
        head.content_type.as_deref(),
        head.content_length,
    ) {
        return ProbeOutcome::Unavailable(failure);
    }
    match tokio::time::timeout(timeout, surface.check_playable(url)).await {
        Ok(Ok(())) => ProbeOutcome::Available,
        Ok(Err(failure)) => ProbeOutcome::Unavailable(failure),
        Err(_) => ProbeOutcome::Unavailable(ProbeFailure::NotPlayable),
    }
}

pub async fn probe_recording(
    client: &ArchiveClient,
    surface: &dyn PlaybackSurface,
    recording_id: u64,
    timeout: Duration,
) -> ProbeOutcome {
    match client.head_recording(recording_id).await {
        Ok(head) => confirm(&head, surface, &client.recording_url(recording_id), timeout).await,
        Err(e) => ProbeOutcome::Unavailable(e.into()),
    }
}

// =============================================================================
// Prober
// =============================================================================

pub struct Prober {
    client: ArchiveClient,
    surface: Arc<dyn PlaybackSurface>,
    alerts_rx: watch::Receiver<Vec<ActiveAlert>>,
    scheduler: ProbeScheduler,
    ticker: AlertTicker,
    start: Instant,
}

impl Prober {
    pub fn new(
        client: ArchiveClient,
        surface: Arc<dyn PlaybackSurface>,
        alerts_rx: watch::Receiver<Vec<ActiveAlert>>,
        config: ProbeConfig,
    ) -> Self {
        Self {
            client,
            ticker: AlertTicker::new(surface.clone()),
            surface,
            alerts_rx,
            scheduler: ProbeScheduler::new(config),
            start: Instant::now(),
        }
    }

    pub fn ticker(&self) -> &AlertTicker {
        &self.ticker
    }

    pub fn scheduler(&self) -> &ProbeScheduler {
        &self.scheduler
    }

    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Take the current alert list into the scheduler. A new list restarts
    /// probing and invalidates every ticket issued under the old one.
    fn refresh_alerts(&mut self) -> AlertSignature {
        let signature = AlertSignature::of(&self.alerts_rx.borrow_and_update());
        if self.scheduler.update_alerts(&signature, self.now_ms()) {
            debug!("Active alerts changed ({}), probing restarts", signature.len());
            self.ticker.reset();
        }
        signature
    }

    /// One scheduling pass.
    pub async fn pass(&mut self) {
        if self.refresh_alerts().is_empty() {
            return;
        }

        match self.client.latest_id().await {
            Ok(latest) => self.scheduler.set_latest_id(latest),
            Err(e) => {
                debug!("Latest id unavailable: {}", e);
                return;
            }
        }

        let tickets = self.scheduler.due(self.now_ms());
        if tickets.is_empty() {
            return;
        }
        debug!(
            "Probing {} candidate(s) below latest id {:?}",
            tickets.len(),
            self.scheduler.latest_id()
        );

        let timeout = Duration::from_millis(self.scheduler.config().playability_timeout_ms);
        let in_flight = self.scheduler.config().max_in_flight.max(1);
        let client = &self.client;
        let surface = self.surface.as_ref();
        let results: Vec<(ProbeTicket, ProbeOutcome)> = stream::iter(tickets)
            .map(|ticket| async move {
                let outcome =
                    probe_recording(client, surface, ticket.recording_id, timeout).await;
                (ticket, outcome)
            })
            .buffer_unordered(in_flight)
            .collect()
            .await;

        for (ticket, outcome) in results {
            // The list may have been replaced while the probes ran
            if self.alerts_rx.has_changed().unwrap_or(false) {
                self.refresh_alerts();
            }
            if let ProbeOutcome::Unavailable(failure) = &outcome {
                debug!("Recording {} unavailable: {}", ticket.recording_id, failure);
            }
            let now = self.now_ms();
            match self.scheduler.complete(ticket, outcome, now) {
                ProbeResolution::Confirmed {
                    recording_id,
                    alert_index,
                } => {
                    info!(
                        "Recording {} confirmed for alert {}",
                        recording_id, alert_index
                    );
                    let source = TickerSource {
                        recording_id,
                        alert_index,
                        url: self.client.recording_url(recording_id),
                    };
                    if let Err(failure) = self.ticker.offer(source).await {
                        let now = self.now_ms();
                        let at_ms = self.scheduler.revoke(recording_id, now);
                        warn!(
                            "Recording {} failed to play: {}, retry in {} ms",
                            recording_id,
                            failure,
                            at_ms.saturating_sub(now)
                        );
                    }
                }
                ProbeResolution::Retry {
                    recording_id,
                    at_ms,
                } => debug!(
                    "Recording {} retry in {} ms",
                    recording_id,
                    at_ms.saturating_sub(now)
                ),
                ProbeResolution::Stale => {
                    debug!("Dropping stale probe of {}", ticket.recording_id)
                }
            }
        }
    }

    pub async fn run(mut self, subsys: SubsystemHandle) -> Result<(), Infallible> {
        let mut ticker = tokio::time::interval(PASS_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = subsys.on_shutdown_requested() => {
                    debug!("Prober shutting down");
                    return Ok(());
                }
                _ = ticker.tick() => self.pass().await,
            }
        }
    }
}
