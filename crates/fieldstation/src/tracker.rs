//! The tracker orchestrator.
//!
//! Wires decode ingestion to the shared components: each incoming decode is
//! enriched with the last-signaled band and the current fix, then persisted
//! to the outbox and broadcast to subscribers. Persistence and broadcast are
//! attempted independently, so a storage failure never silences the live
//! stream and a dead stream never blocks persistence. Control-channel
//! updates mutate the position and band state consulted at enrichment time;
//! they never rewrite stored records.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::band::{Band, BandState};
use crate::config::Config;
use crate::control::{self, ControlEvent, ControlState};
use crate::decode::{is_valid_grid, DecodeEvent};
use crate::error::Result;
use crate::hub::{stream::StreamServer, BroadcastHub};
use crate::outbox::{Outbox, OutboxStats};
use crate::position::{Position, PositionState};
use crate::uploader::{CollectorClient, HttpCollectorClient, Uploader, UploaderStats};

/// Queue depth for incoming decode events.
const DECODE_QUEUE: usize = 256;

/// Queue depth for position updates.
const POSITION_QUEUE: usize = 64;

/// Queue depth for control-channel events.
const CONTROL_QUEUE: usize = 64;

/// Senders feeding the tracker's ingest tasks.
///
/// Sources hold these; the tracker owns the receiving ends.
#[derive(Debug, Clone)]
pub struct TrackerChannels {
    /// Decode events from the decode source.
    pub decodes: mpsc::Sender<DecodeEvent>,
    /// Position updates from the local position source.
    pub positions: mpsc::Sender<Position>,
    /// Validated control-channel events.
    pub control: mpsc::Sender<ControlEvent>,
}

/// Aggregate tracker status.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerStatus {
    /// Whether the pipeline tasks are running.
    pub running: bool,
    /// Decodes processed since startup.
    pub decode_count: u64,
    /// Whether a fresh local fix is currently available.
    pub gps_fix: bool,
    /// Connected broadcast subscribers.
    pub subscribers: usize,
    /// Outbox counters.
    pub outbox: OutboxStats,
    /// Uploader counters, when an uploader is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploader: Option<UploaderStats>,
}

/// Coordinates the decode pipeline.
#[derive(Debug)]
pub struct Tracker {
    config: Config,
    outbox: Arc<Outbox>,
    hub: Arc<BroadcastHub>,
    position: Arc<PositionState>,
    band: Arc<BandState>,
    uploader: Option<Arc<Uploader>>,
    decode_count: AtomicU64,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Tracker {
    /// Open the tracker against the configured outbox database.
    ///
    /// # Errors
    ///
    /// Returns an error if the outbox cannot be opened or the collector
    /// client cannot be built.
    pub fn open(config: &Config) -> Result<Self> {
        let outbox = Arc::new(Outbox::open(config.database_path())?);

        let collector: Option<Arc<dyn CollectorClient>> = if config.uploader.enabled {
            Some(Arc::new(HttpCollectorClient::new(&config.uploader)?))
        } else {
            None
        };

        Ok(Self::with_outbox(config, outbox, collector))
    }

    /// Build a tracker over an existing outbox and optional collector client.
    #[must_use]
    pub fn with_outbox(
        config: &Config,
        outbox: Arc<Outbox>,
        collector: Option<Arc<dyn CollectorClient>>,
    ) -> Self {
        let uploader = collector.map(|client| {
            Arc::new(Uploader::new(
                Arc::clone(&outbox),
                client,
                &config.uploader,
                config.station.id.clone(),
            ))
        });

        let (shutdown, _) = watch::channel(false);

        Self {
            config: config.clone(),
            outbox,
            hub: Arc::new(BroadcastHub::new(config.broadcast.queue_capacity)),
            position: Arc::new(PositionState::new()),
            band: Arc::new(BandState::new()),
            uploader,
            decode_count: AtomicU64::new(0),
            running: AtomicBool::new(false),
            shutdown,
        }
    }

    /// The outbox backing this tracker.
    #[must_use]
    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// The broadcast hub backing this tracker.
    #[must_use]
    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// The uploader, when one is configured.
    #[must_use]
    pub fn uploader(&self) -> Option<&Arc<Uploader>> {
        self.uploader.as_ref()
    }

    /// Process one decode event: enrich, persist, broadcast.
    pub fn handle_decode(&self, mut event: DecodeEvent) {
        let count = self.decode_count.fetch_add(1, Ordering::Relaxed) + 1;

        // Sources occasionally hand over junk locator text; store it empty
        // rather than as a bogus grid
        if !event.grid.is_empty() && !is_valid_grid(&event.grid) {
            debug!("Discarding invalid grid locator '{}'", event.grid);
            event.grid = String::new();
        }

        // Last-signaled band wins over whatever the source derived
        let current_band = self.band.current();
        if current_band != Band::Unknown {
            event.band = current_band;
        }

        // Only a fresh local fix is attached; stale or external-only
        // positions are not used for enrichment
        if let Some(fix) = self.position.fix() {
            event.position = Some(fix);
        }

        let line = event.display_line();
        info!("Decode #{}: {}", count, line);

        // Persistence and broadcast are independent; neither failure
        // suppresses the other
        if let Err(e) = self.outbox.append(&event) {
            error!("Failed to persist decode: {}", e);
        }

        let delivered = self.hub.publish(&line);
        debug!("Broadcast to {} subscribers", delivered);
    }

    /// Process one position update from the local source.
    pub fn handle_position(&self, position: Position) {
        debug!(
            "Position update ({}): {:.4}, {:.4} grid={}",
            position.origin,
            position.latitude,
            position.longitude,
            position.maidenhead(6)
        );
        self.position.update(position);
    }

    /// Process one validated control-channel event.
    pub fn handle_control(&self, event: ControlEvent) {
        match event {
            ControlEvent::PositionUpdate(position) => {
                info!(
                    "External position update: {:.4}, {:.4}",
                    position.latitude, position.longitude
                );
                // External fixes always go to the audit log, whether or not
                // they ever influence enrichment
                if let Err(e) = self.outbox.record_position(&position) {
                    error!("Failed to log external position: {}", e);
                }
                self.position.update(position);
            }
            ControlEvent::BandChange { band, source } => {
                info!("Band changed to {} (source: {})", band, source);
                self.band.set(band);
                if let Err(e) = self.outbox.record_band_change(band, &source) {
                    error!("Failed to log band change: {}", e);
                }
            }
        }
    }

    /// Aggregate status across all components.
    ///
    /// # Errors
    ///
    /// Returns an error if the outbox stats query fails.
    pub fn status(&self) -> Result<TrackerStatus> {
        Ok(TrackerStatus {
            running: self.running.load(Ordering::Relaxed),
            decode_count: self.decode_count.load(Ordering::Relaxed),
            gps_fix: self.position.has_fix(),
            subscribers: self.hub.subscriber_count(),
            outbox: self.outbox.stats(None)?,
            uploader: self.uploader.as_ref().map(|u| u.stats()),
        })
    }

    /// Spawn the pipeline tasks and return the ingest channels.
    ///
    /// # Errors
    ///
    /// Returns an error if a listener cannot be bound.
    pub async fn start(self: &Arc<Self>) -> Result<TrackerChannels> {
        info!("Starting tracker...");

        let (decode_tx, mut decode_rx) = mpsc::channel::<DecodeEvent>(DECODE_QUEUE);
        let (position_tx, mut position_rx) = mpsc::channel::<Position>(POSITION_QUEUE);
        let (control_tx, mut control_rx) = mpsc::channel::<ControlEvent>(CONTROL_QUEUE);

        // Decode ingest
        let tracker = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = decode_rx.recv() => {
                        let Some(event) = event else { break };
                        tracker.handle_decode(event);
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Decode ingest stopped");
        });

        // Position ingest
        let tracker = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    position = position_rx.recv() => {
                        let Some(position) = position else { break };
                        tracker.handle_position(position);
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Position ingest stopped");
        });

        // Control ingest
        let tracker = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = control_rx.recv() => {
                        let Some(event) = event else { break };
                        tracker.handle_control(event);
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Control ingest stopped");
        });

        // Subscriber stream
        if self.config.broadcast.enabled {
            let server = StreamServer::bind(&self.config.broadcast_addr()).await?;
            let hub = Arc::clone(&self.hub);
            let keepalive = self.config.keepalive_interval();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                server.run(hub, keepalive, shutdown).await;
            });
        }

        // Control channel
        if self.config.control.enabled {
            let state = ControlState::new(
                control_tx.clone(),
                Arc::clone(&self.band),
                Arc::clone(&self.hub),
            );
            let addr = self.config.control_addr();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                if let Err(e) = control::serve(&addr, state, shutdown).await {
                    error!("Control channel failed: {}", e);
                }
            });
        }

        // Uploader loop
        if let Some(uploader) = &self.uploader {
            let uploader = Arc::clone(uploader);
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                uploader.run(shutdown).await;
            });
        }

        // Retention cleanup
        let outbox = Arc::clone(&self.outbox);
        let retention_days = self.config.outbox.retention_days;
        let cleanup_interval = self.config.cleanup_interval();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(cleanup_interval) => {
                        match outbox.cleanup(retention_days) {
                            Ok(deleted) if deleted > 0 => {
                                info!("Retention cleanup removed {} records", deleted);
                            }
                            Ok(_) => {}
                            Err(e) => warn!("Retention cleanup failed: {}", e),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Retention cleanup stopped");
        });

        self.running.store(true, Ordering::Relaxed);
        info!("Tracker started");

        Ok(TrackerChannels {
            decodes: decode_tx,
            positions: position_tx,
            control: control_tx,
        })
    }

    /// Signal every pipeline task to stop.
    pub fn stop(&self) {
        info!("Stopping tracker...");
        self.running.store(false, Ordering::Relaxed);
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{Duration as ChronoDuration, Utc};

    use crate::position::{PositionOrigin, FIX_FRESHNESS_SECS};

    fn test_tracker() -> Tracker {
        let mut config = Config::default();
        config.broadcast.enabled = false;
        config.control.enabled = false;
        let outbox = Arc::new(Outbox::open_in_memory().unwrap());
        Tracker::with_outbox(&config, outbox, None)
    }

    fn decode_on_40m(message: &str) -> DecodeEvent {
        DecodeEvent::new(message, -12, 0.3, 7_074_000)
    }

    #[tokio::test]
    async fn test_decode_persisted_and_broadcast() {
        let tracker = test_tracker();
        let mut subscription = tracker.hub().subscribe();

        tracker.handle_decode(decode_on_40m("CQ K1ABC FN42"));

        let batch = tracker.outbox().unsent_batch(10).unwrap();
        assert_eq!(batch.len(), 1);

        let line = subscription.receiver.recv().await.unwrap();
        assert!(line.contains("CQ K1ABC FN42"));
    }

    #[tokio::test]
    async fn test_decode_without_subscribers_still_persists() {
        let tracker = test_tracker();
        tracker.handle_decode(decode_on_40m("nobody listening"));
        assert_eq!(tracker.outbox().count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_last_signaled_band_wins_at_enrichment() {
        let tracker = test_tracker();

        // Band not signaled yet: the source-derived band stands
        tracker.handle_decode(decode_on_40m("first"));

        tracker.handle_control(ControlEvent::BandChange {
            band: Band::M40,
            source: "control".to_string(),
        });
        tracker.handle_decode(decode_on_40m("second"));

        tracker.handle_control(ControlEvent::BandChange {
            band: Band::M20,
            source: "control".to_string(),
        });
        tracker.handle_decode(decode_on_40m("third"));

        let batch = tracker.outbox().unsent_batch(10).unwrap();
        assert_eq!(batch[0].event.band, Band::M40);
        assert_eq!(batch[1].event.band, Band::M40);
        // The signaled band overrides the frequency-derived one
        assert_eq!(batch[2].event.band, Band::M20);

        // Enrichment is not retroactive: earlier records keep their band
        assert_eq!(batch[0].event.band, Band::M40);
    }

    #[tokio::test]
    async fn test_invalid_grid_cleared_on_ingest() {
        let tracker = test_tracker();

        let mut event = decode_on_40m("junk grid");
        event.grid = "ZZ!!".to_string();
        tracker.handle_decode(event);

        let mut event = decode_on_40m("good grid");
        event.grid = "FN42".to_string();
        tracker.handle_decode(event);

        let batch = tracker.outbox().unsent_batch(10).unwrap();
        assert!(batch[0].event.grid.is_empty());
        assert_eq!(batch[1].event.grid, "FN42");
    }

    #[tokio::test]
    async fn test_fresh_local_fix_attached() {
        let tracker = test_tracker();
        tracker.handle_position(Position::new(47.6062, -122.3321, PositionOrigin::Local));

        tracker.handle_decode(decode_on_40m("with position"));

        let batch = tracker.outbox().unsent_batch(1).unwrap();
        let position = batch[0].event.position.as_ref().unwrap();
        assert!((position.latitude - 47.6062).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_stale_fix_not_attached() {
        let tracker = test_tracker();
        let mut position = Position::new(47.6, -122.3, PositionOrigin::Local);
        position.timestamp = Utc::now() - ChronoDuration::seconds(FIX_FRESHNESS_SECS + 5);
        tracker.handle_position(position);

        tracker.handle_decode(decode_on_40m("no position"));

        let batch = tracker.outbox().unsent_batch(1).unwrap();
        assert!(batch[0].event.position.is_none());
    }

    #[tokio::test]
    async fn test_external_position_not_used_for_enrichment() {
        let tracker = test_tracker();
        tracker.handle_control(ControlEvent::PositionUpdate(Position::new(
            47.6,
            -122.3,
            PositionOrigin::External,
        )));

        tracker.handle_decode(decode_on_40m("external only"));

        let batch = tracker.outbox().unsent_batch(1).unwrap();
        assert!(batch[0].event.position.is_none());
    }

    #[tokio::test]
    async fn test_external_position_audited() {
        let tracker = test_tracker();
        tracker.handle_control(ControlEvent::PositionUpdate(Position::new(
            47.6,
            -122.3,
            PositionOrigin::External,
        )));

        let logged = tracker
            .outbox()
            .latest_position(Some(PositionOrigin::External))
            .unwrap();
        assert!(logged.is_some());
    }

    #[tokio::test]
    async fn test_band_change_audited() {
        let tracker = test_tracker();
        tracker.handle_control(ControlEvent::BandChange {
            band: Band::M17,
            source: "control".to_string(),
        });

        let changes = tracker.outbox().band_changes(10).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].band, Band::M17);
    }

    #[tokio::test]
    async fn test_status_aggregates() {
        let tracker = test_tracker();
        tracker.handle_decode(decode_on_40m("one"));
        tracker.handle_decode(decode_on_40m("two"));

        let status = tracker.status().unwrap();
        assert!(!status.running);
        assert_eq!(status.decode_count, 2);
        assert!(!status.gps_fix);
        assert_eq!(status.subscribers, 0);
        assert_eq!(status.outbox.total, 2);
        assert_eq!(status.outbox.pending, 2);
        assert!(status.uploader.is_none());
    }

    #[tokio::test]
    async fn test_start_and_stop_pipeline() {
        let mut config = Config::default();
        config.broadcast.enabled = false;
        config.control.enabled = false;
        let outbox = Arc::new(Outbox::open_in_memory().unwrap());
        let tracker = Arc::new(Tracker::with_outbox(&config, outbox, None));

        let channels = tracker.start().await.unwrap();
        assert!(tracker.status().unwrap().running);

        channels
            .decodes
            .send(decode_on_40m("through the channel"))
            .await
            .unwrap();

        // Wait for the ingest task to drain the event
        for _ in 0..100 {
            if tracker.outbox().count().unwrap() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(tracker.outbox().count().unwrap(), 1);

        tracker.stop();
        assert!(!tracker.status().unwrap().running);
    }

    #[tokio::test]
    async fn test_channel_events_processed_in_order() {
        let mut config = Config::default();
        config.broadcast.enabled = false;
        config.control.enabled = false;
        let outbox = Arc::new(Outbox::open_in_memory().unwrap());
        let tracker = Arc::new(Tracker::with_outbox(&config, outbox, None));

        let channels = tracker.start().await.unwrap();

        channels
            .control
            .send(ControlEvent::BandChange {
                band: Band::M20,
                source: "control".to_string(),
            })
            .await
            .unwrap();

        for _ in 0..100 {
            if tracker.outbox().band_changes(1).unwrap().len() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        channels.decodes.send(decode_on_40m("after")).await.unwrap();
        for _ in 0..100 {
            if tracker.outbox().count().unwrap() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let batch = tracker.outbox().unsent_batch(1).unwrap();
        assert_eq!(batch[0].event.band, Band::M20);

        tracker.stop();
    }
}
