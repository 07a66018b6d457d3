//! The alert ticker owns the playback surface's one media source.

use std::sync::Arc;

use log::{debug, info};

use easarchive_core::probe::ProbeFailure;

use super::prober::PlaybackSurface;

/// Recording currently loaded into the surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickerSource {
    pub recording_id: u64,
    /// Position of the alert it belongs to (0 = newest)
    pub alert_index: usize,
    pub url: String,
}

pub struct AlertTicker {
    surface: Arc<dyn PlaybackSurface>,
    current: Option<TickerSource>,
}

impl AlertTicker {
    pub fn new(surface: Arc<dyn PlaybackSurface>) -> Self {
        Self {
            surface,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&TickerSource> {
        self.current.as_ref()
    }

    /// Forget the loaded source; the alert list it belonged to is gone.
    pub fn reset(&mut self) {
        if let Some(source) = self.current.take() {
            debug!("Ticker released recording {}", source.recording_id);
        }
    }

    /// Offer a recording whose availability has been confirmed.
    ///
    /// The source is only swapped for a newer alert than the one loaded.
    /// Returns whether the swap happened. If the surface fails to load the
    /// new source the previous one stays in place.
    pub async fn offer(&mut self, source: TickerSource) -> Result<bool, ProbeFailure> {
        if let Some(current) = &self.current {
            if current.recording_id == source.recording_id
                || current.alert_index <= source.alert_index
            {
                return Ok(false);
            }
        }
        self.surface.load(&source.url).await?;
        info!(
            "Ticker now playing recording {} for alert {}",
            source.recording_id, source.alert_index
        );
        self.current = Some(source);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::prober::tests::FakeSurface;

    fn source(recording_id: u64, alert_index: usize) -> TickerSource {
        TickerSource {
            recording_id,
            alert_index,
            url: format!("http://radio/archive?recording_id={recording_id}"),
        }
    }

    #[tokio::test]
    async fn test_prefers_newer_alerts() {
        let surface = Arc::new(FakeSurface::default());
        let mut ticker = AlertTicker::new(surface.clone());

        assert!(ticker.offer(source(40, 2)).await.unwrap());
        assert!(ticker.offer(source(42, 0)).await.unwrap());
        // Older alert, or the one already loaded: no swap
        assert!(!ticker.offer(source(41, 1)).await.unwrap());
        assert!(!ticker.offer(source(42, 0)).await.unwrap());

        assert_eq!(ticker.current().unwrap().recording_id, 42);
        assert_eq!(surface.loaded(), vec![40, 42]);

        ticker.reset();
        assert!(ticker.current().is_none());
        assert!(ticker.offer(source(41, 1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_load_keeps_previous_source() {
        let surface = Arc::new(FakeSurface::default());
        surface.fail_load(42);
        let mut ticker = AlertTicker::new(surface.clone());

        assert!(ticker.offer(source(41, 1)).await.unwrap());
        assert_eq!(
            ticker.offer(source(42, 0)).await,
            Err(ProbeFailure::NotPlayable)
        );
        assert_eq!(ticker.current().unwrap().recording_id, 41);
    }
}
