//! Periodic upload of unsent outbox records to the remote collector.
//!
//! The uploader probes connectivity, pulls oldest-first batches from the
//! outbox, and sends each batch as a single request. A batch is marked
//! uploaded only on a successful response; failures count toward a backoff
//! that doubles the cycle delay, and nothing in here is ever fatal to the
//! rest of the pipeline.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::UploaderConfig;
use crate::error::{Error, Result};
use crate::outbox::{Outbox, OutboxRecord};

/// Delay before re-probing when no connectivity is available.
const PROBE_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Timeout for the connectivity probe request.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive failures after which the cycle delay doubles.
const BACKOFF_THRESHOLD: u32 = 3;

/// Upload endpoint path on the collector.
const UPLOAD_PATH: &str = "/api/decodes/upload";

/// One batch request to the remote collector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadBatch {
    /// Station identifier.
    pub station: String,
    /// Unix timestamp of when the batch was assembled.
    pub timestamp: i64,
    /// The decodes in the batch, oldest first.
    pub decodes: Vec<UploadEntry>,
}

/// One decode inside an upload batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadEntry {
    /// Unix timestamp of the decode.
    pub timestamp: i64,
    /// Derived callsign, possibly empty.
    pub callsign: String,
    /// Derived grid locator, possibly empty.
    pub grid: String,
    /// Signal-to-noise ratio in dB.
    pub snr: i32,
    /// Carrier frequency in Hz.
    pub frequency: u64,
    /// Operating band label.
    pub band: String,
    /// Raw message text.
    pub message: String,
    /// Attached position, when the decode was enriched with one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<UploadPosition>,
}

/// Position attached to an uploaded decode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadPosition {
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Altitude in meters.
    pub altitude: f64,
    /// Ground speed in km/h.
    pub speed: f64,
    /// Heading in degrees true.
    pub heading: f64,
}

impl UploadBatch {
    /// Assemble a batch from outbox records.
    #[must_use]
    pub fn from_records(station: &str, records: &[OutboxRecord]) -> Self {
        let decodes = records
            .iter()
            .map(|record| {
                let event = &record.event;
                UploadEntry {
                    timestamp: event.timestamp.timestamp(),
                    callsign: event.callsign.clone(),
                    grid: event.grid.clone(),
                    snr: event.snr,
                    frequency: event.frequency,
                    band: event.band.label().to_string(),
                    message: event.message.clone(),
                    position: event.position.as_ref().map(|p| UploadPosition {
                        latitude: p.latitude,
                        longitude: p.longitude,
                        altitude: p.altitude,
                        speed: p.speed,
                        heading: p.heading,
                    }),
                }
            })
            .collect();

        Self {
            station: station.to_string(),
            timestamp: Utc::now().timestamp(),
            decodes,
        }
    }
}

/// Client for the remote collector.
///
/// Abstracts the HTTP transport so the upload cycle can be exercised
/// without network access.
#[async_trait]
pub trait CollectorClient: Send + Sync + std::fmt::Debug {
    /// Whether the collector looks reachable right now.
    async fn probe(&self) -> bool;

    /// Deliver one batch. Success means the whole batch was accepted.
    ///
    /// # Errors
    ///
    /// Returns a connectivity error on transport failure or a rejection
    /// error on a non-success response.
    async fn upload(&self, batch: &UploadBatch) -> Result<()>;
}

/// HTTP implementation of [`CollectorClient`] using bearer-token auth.
#[derive(Debug)]
pub struct HttpCollectorClient {
    client: reqwest::Client,
    server_url: String,
    api_key: String,
    probe_url: String,
}

impl HttpCollectorClient {
    /// Build the HTTP client from uploader configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be constructed.
    pub fn new(config: &UploaderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            server_url: config.server_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            probe_url: config.probe_url.clone(),
        })
    }
}

#[async_trait]
impl CollectorClient for HttpCollectorClient {
    async fn probe(&self) -> bool {
        match self
            .client
            .get(&self.probe_url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Connectivity probe failed: {}", e);
                false
            }
        }
    }

    async fn upload(&self, batch: &UploadBatch) -> Result<()> {
        let endpoint = format!("{}{}", self.server_url, UPLOAD_PATH);
        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(batch)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::UploadRejected {
                status: status.as_u16(),
            })
        }
    }
}

/// Outcome of one upload cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The connectivity probe failed; nothing was attempted.
    NoConnection,
    /// No unsent records were waiting.
    Empty,
    /// A batch of this many records was delivered and marked.
    Uploaded(usize),
    /// The batch (or the outbox read) failed; records stay queued.
    Failed,
}

/// Uploader statistics, surfaced through the status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploaderStats {
    /// Whether the periodic loop is configured to run.
    pub enabled: bool,
    /// Records delivered since startup.
    pub total_uploaded: u64,
    /// When the last successful upload finished.
    pub last_upload_time: Option<DateTime<Utc>>,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Collector base URL.
    pub server_url: String,
    /// Station identifier sent with each batch.
    pub station: String,
}

/// Periodically drains unsent outbox records to the remote collector.
#[derive(Debug)]
pub struct Uploader {
    outbox: Arc<Outbox>,
    client: Arc<dyn CollectorClient>,
    station: String,
    server_url: String,
    enabled: bool,
    interval: Duration,
    batch_size: usize,
    total_uploaded: AtomicU64,
    consecutive_failures: AtomicU32,
    last_upload: Mutex<Option<DateTime<Utc>>>,
}

impl Uploader {
    /// Create an uploader over the given outbox and collector client.
    #[must_use]
    pub fn new(
        outbox: Arc<Outbox>,
        client: Arc<dyn CollectorClient>,
        config: &UploaderConfig,
        station: impl Into<String>,
    ) -> Self {
        Self {
            outbox,
            client,
            station: station.into(),
            server_url: config.server_url.clone(),
            enabled: config.enabled,
            interval: Duration::from_secs(config.upload_interval_secs),
            batch_size: config.batch_size,
            total_uploaded: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            last_upload: Mutex::new(None),
        }
    }

    /// Run one probe-fetch-send-mark cycle.
    pub async fn run_cycle(&self) -> CycleOutcome {
        if !self.client.probe().await {
            debug!("No connectivity, skipping upload cycle");
            return CycleOutcome::NoConnection;
        }

        let records = match self.outbox.unsent_batch(self.batch_size) {
            Ok(records) => records,
            Err(e) => {
                warn!("Failed to read unsent batch: {}", e);
                return CycleOutcome::Failed;
            }
        };

        if records.is_empty() {
            debug!("No decodes to upload");
            return CycleOutcome::Empty;
        }

        info!("Uploading {} decodes to {}", records.len(), self.server_url);
        let batch = UploadBatch::from_records(&self.station, &records);

        match self.client.upload(&batch).await {
            Ok(()) => {
                let ids: Vec<i64> = records.iter().map(|record| record.id).collect();
                if let Err(e) = self.outbox.mark_uploaded(&ids) {
                    // The batch will be re-sent next cycle; receivers
                    // tolerate duplicates
                    warn!("Failed to mark {} decodes uploaded: {}", ids.len(), e);
                }

                self.total_uploaded
                    .fetch_add(records.len() as u64, Ordering::Relaxed);
                self.consecutive_failures.store(0, Ordering::Relaxed);
                if let Ok(mut guard) = self.last_upload.lock() {
                    *guard = Some(Utc::now());
                }

                info!("Successfully uploaded {} decodes", records.len());
                CycleOutcome::Uploaded(records.len())
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("Upload failed (consecutive failures: {}): {}", failures, e);
                CycleOutcome::Failed
            }
        }
    }

    /// How long to sleep after a cycle with the given outcome.
    fn next_delay(&self, outcome: CycleOutcome) -> Duration {
        match outcome {
            CycleOutcome::NoConnection => PROBE_RETRY_DELAY,
            CycleOutcome::Failed
                if self.consecutive_failures.load(Ordering::Relaxed) > BACKOFF_THRESHOLD =>
            {
                self.interval * 2
            }
            _ => self.interval,
        }
    }

    /// Run the periodic upload loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Uploader started (server: {}, interval: {}s)",
            self.server_url,
            self.interval.as_secs()
        );

        loop {
            let outcome = self.run_cycle().await;
            let delay = self.next_delay(outcome);

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("Uploader stopped");
    }

    /// Run exactly one cycle outside the schedule.
    ///
    /// Returns true when there was nothing to send or the batch was
    /// delivered; the periodic timer is unaffected.
    pub async fn force_upload(&self) -> bool {
        info!("Forcing immediate upload");
        matches!(
            self.run_cycle().await,
            CycleOutcome::Empty | CycleOutcome::Uploaded(_)
        )
    }

    /// Current uploader statistics.
    #[must_use]
    pub fn stats(&self) -> UploaderStats {
        UploaderStats {
            enabled: self.enabled,
            total_uploaded: self.total_uploaded.load(Ordering::Relaxed),
            last_upload_time: *self
                .last_upload
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            server_url: self.server_url.clone(),
            station: self.station.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicBool;

    use crate::decode::DecodeEvent;

    /// In-memory collector double: scriptable connectivity and failure.
    #[derive(Debug, Default)]
    struct MockCollector {
        batches: Mutex<Vec<UploadBatch>>,
        offline: AtomicBool,
        failing: AtomicBool,
    }

    impl MockCollector {
        fn received(&self) -> Vec<UploadBatch> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CollectorClient for MockCollector {
        async fn probe(&self) -> bool {
            !self.offline.load(Ordering::Relaxed)
        }

        async fn upload(&self, batch: &UploadBatch) -> Result<()> {
            if self.failing.load(Ordering::Relaxed) {
                return Err(Error::UploadRejected { status: 503 });
            }
            self.batches.lock().unwrap().push(batch.clone());
            Ok(())
        }
    }

    fn test_config(batch_size: usize) -> UploaderConfig {
        UploaderConfig {
            enabled: true,
            server_url: "https://collector.example.org".to_string(),
            api_key: "test-key".to_string(),
            upload_interval_secs: 300,
            batch_size,
            request_timeout_secs: 30,
            probe_url: "https://dns.example.org".to_string(),
        }
    }

    fn uploader_with(
        batch_size: usize,
        records: usize,
    ) -> (Arc<Outbox>, Arc<MockCollector>, Uploader) {
        let outbox = Arc::new(Outbox::open_in_memory().unwrap());
        for i in 0..records {
            outbox
                .append(&DecodeEvent::new(format!("msg {i}"), -10, 0.1, 7_074_000))
                .unwrap();
        }

        let collector = Arc::new(MockCollector::default());
        let uploader = Uploader::new(
            Arc::clone(&outbox),
            Arc::clone(&collector) as Arc<dyn CollectorClient>,
            &test_config(batch_size),
            "N0CALL-M",
        );
        (outbox, collector, uploader)
    }

    #[tokio::test]
    async fn test_batches_drain_oldest_first() {
        let (outbox, collector, uploader) = uploader_with(2, 5);

        assert_eq!(uploader.run_cycle().await, CycleOutcome::Uploaded(2));
        assert_eq!(outbox.stats(None).unwrap().pending, 3);

        assert_eq!(uploader.run_cycle().await, CycleOutcome::Uploaded(2));
        assert_eq!(outbox.stats(None).unwrap().pending, 1);

        assert_eq!(uploader.run_cycle().await, CycleOutcome::Uploaded(1));
        assert_eq!(outbox.stats(None).unwrap().pending, 0);

        assert_eq!(uploader.run_cycle().await, CycleOutcome::Empty);

        let batches = collector.received();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].decodes[0].message, "msg 0");
        assert_eq!(batches[0].decodes[1].message, "msg 1");
        assert_eq!(batches[2].decodes[0].message, "msg 4");
    }

    #[tokio::test]
    async fn test_no_connection_skips_cycle() {
        let (outbox, collector, uploader) = uploader_with(10, 3);
        collector.offline.store(true, Ordering::Relaxed);

        assert_eq!(uploader.run_cycle().await, CycleOutcome::NoConnection);
        assert_eq!(outbox.stats(None).unwrap().pending, 3);
        assert!(collector.received().is_empty());

        // No-connection retries on the short probe delay, not the interval
        assert_eq!(
            uploader.next_delay(CycleOutcome::NoConnection),
            PROBE_RETRY_DELAY
        );
    }

    #[tokio::test]
    async fn test_failure_keeps_records_queued() {
        let (outbox, collector, uploader) = uploader_with(10, 3);
        collector.failing.store(true, Ordering::Relaxed);

        assert_eq!(uploader.run_cycle().await, CycleOutcome::Failed);
        assert_eq!(outbox.stats(None).unwrap().pending, 3);
        assert!(collector.received().is_empty());
        assert_eq!(uploader.stats().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_backoff_engages_after_threshold() {
        let (_outbox, collector, uploader) = uploader_with(10, 5);
        collector.failing.store(true, Ordering::Relaxed);

        for expected in 1..=4_u32 {
            assert_eq!(uploader.run_cycle().await, CycleOutcome::Failed);
            assert_eq!(uploader.stats().consecutive_failures, expected);
        }

        // Four consecutive failures: the sleep before the next retry doubles
        assert_eq!(
            uploader.next_delay(CycleOutcome::Failed),
            uploader.interval * 2
        );

        // A success resets the failure count and the delay
        collector.failing.store(false, Ordering::Relaxed);
        assert!(matches!(
            uploader.run_cycle().await,
            CycleOutcome::Uploaded(5)
        ));
        assert_eq!(uploader.stats().consecutive_failures, 0);
        assert_eq!(uploader.next_delay(CycleOutcome::Empty), uploader.interval);
    }

    #[tokio::test]
    async fn test_backoff_not_engaged_below_threshold() {
        let (_outbox, collector, uploader) = uploader_with(10, 1);
        collector.failing.store(true, Ordering::Relaxed);

        for _ in 0..3 {
            uploader.run_cycle().await;
        }
        assert_eq!(uploader.stats().consecutive_failures, 3);
        assert_eq!(uploader.next_delay(CycleOutcome::Failed), uploader.interval);
    }

    #[tokio::test]
    async fn test_force_upload_success() {
        let (outbox, collector, uploader) = uploader_with(10, 2);

        assert!(uploader.force_upload().await);
        assert_eq!(outbox.stats(None).unwrap().pending, 0);
        assert_eq!(collector.received().len(), 1);

        // Nothing left: still reports success
        assert!(uploader.force_upload().await);
        assert_eq!(collector.received().len(), 1);
    }

    #[tokio::test]
    async fn test_force_upload_failure() {
        let (_outbox, collector, uploader) = uploader_with(10, 2);
        collector.failing.store(true, Ordering::Relaxed);

        assert!(!uploader.force_upload().await);
    }

    #[tokio::test]
    async fn test_stats_track_totals() {
        let (_outbox, _collector, uploader) = uploader_with(10, 4);

        let stats = uploader.stats();
        assert!(stats.enabled);
        assert_eq!(stats.total_uploaded, 0);
        assert!(stats.last_upload_time.is_none());

        uploader.run_cycle().await;

        let stats = uploader.stats();
        assert_eq!(stats.total_uploaded, 4);
        assert!(stats.last_upload_time.is_some());
        assert_eq!(stats.station, "N0CALL-M");
    }

    #[tokio::test]
    async fn test_batch_payload_shape() {
        let outbox = Arc::new(Outbox::open_in_memory().unwrap());

        let mut event = DecodeEvent::new("CQ K1ABC FN42", -12, 0.3, 7_074_000);
        event.callsign = "K1ABC".to_string();
        event.grid = "FN42".to_string();
        event.position = Some(crate::position::Position::new(
            47.6062,
            -122.3321,
            crate::position::PositionOrigin::Local,
        ));
        outbox.append(&event).unwrap();
        outbox
            .append(&DecodeEvent::new("CQ W9XYZ", -3, 0.0, 7_074_000))
            .unwrap();

        let records = outbox.unsent_batch(10).unwrap();
        let batch = UploadBatch::from_records("N0CALL-M", &records);

        assert_eq!(batch.station, "N0CALL-M");
        assert_eq!(batch.decodes.len(), 2);
        assert_eq!(batch.decodes[0].band, "40m");
        assert!(batch.decodes[0].position.is_some());
        assert!(batch.decodes[1].position.is_none());

        let json = serde_json::to_value(&batch).unwrap();
        assert!(json["decodes"][0]["position"]["latitude"].is_number());
        // Absent position is omitted, not null
        assert!(json["decodes"][1].get("position").is_none());
    }

    #[test]
    fn test_http_client_construction() {
        let client = HttpCollectorClient::new(&test_config(10)).unwrap();
        assert_eq!(client.server_url, "https://collector.example.org");

        // Trailing slash is normalized away
        let mut config = test_config(10);
        config.server_url = "https://collector.example.org/".to_string();
        let client = HttpCollectorClient::new(&config).unwrap();
        assert_eq!(client.server_url, "https://collector.example.org");
    }
}
