//! Event source abstractions.
//!
//! The orchestrator consumes decode events and position updates from
//! channels; these traits are the contract a backend fulfills to feed them.
//! A backend may wrap a live decoder, a hardware GPS daemon, or a replay
//! file; the orchestrator never knows the difference.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::decode::DecodeEvent;
use crate::error::{Error, Result};
use crate::position::Position;

/// A backend that produces decode events.
pub trait DecodeSource: Send + Sync {
    /// The name of this source (for logging/debugging).
    fn name(&self) -> &'static str;

    /// Start the source.
    ///
    /// This should begin producing decode events and sending them through
    /// the provided channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the source fails to start.
    fn start(&mut self, tx: mpsc::Sender<DecodeEvent>) -> Result<()>;

    /// Stop the source.
    ///
    /// # Errors
    ///
    /// Returns an error if the source fails to stop cleanly.
    fn stop(&mut self) -> Result<()>;

    /// Check if the source is currently running.
    fn is_running(&self) -> bool;
}

/// A backend that produces position updates.
pub trait PositionSource: Send + Sync {
    /// The name of this source (for logging/debugging).
    fn name(&self) -> &'static str;

    /// Start the source, sending position updates through the channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the source fails to start.
    fn start(&mut self, tx: mpsc::Sender<Position>) -> Result<()>;

    /// Stop the source.
    ///
    /// # Errors
    ///
    /// Returns an error if the source fails to stop cleanly.
    fn stop(&mut self) -> Result<()>;

    /// Check if the source is currently running.
    fn is_running(&self) -> bool;
}

/// How often the replay source polls for appended lines.
const REPLAY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Decode source that tails a JSON-lines file of decode events.
///
/// Each line is one serialized [`DecodeEvent`]. Existing lines are replayed
/// on start, then the file is followed for appends; malformed lines are
/// skipped. Useful for testing the pipeline and for re-driving it from a
/// recorded session.
#[derive(Debug)]
pub struct JsonReplaySource {
    path: PathBuf,
    running: Arc<AtomicBool>,
}

impl JsonReplaySource {
    /// Create a replay source over the given JSON-lines file.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn follow(path: PathBuf, running: Arc<AtomicBool>, tx: mpsc::Sender<DecodeEvent>) {
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                warn!("Replay file {} unreadable: {}", path.display(), e);
                running.store(false, Ordering::SeqCst);
                return;
            }
        };

        let mut reader = BufReader::new(file);
        let mut line = String::new();

        while running.load(Ordering::SeqCst) {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => tokio::time::sleep(REPLAY_POLL_INTERVAL).await,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<DecodeEvent>(trimmed) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                debug!("Decode channel closed, stopping replay");
                                break;
                            }
                        }
                        Err(e) => debug!("Skipping malformed replay line: {}", e),
                    }
                }
                Err(e) => {
                    warn!("Replay read error: {}", e);
                    break;
                }
            }
        }

        running.store(false, Ordering::SeqCst);
        info!("Replay source stopped");
    }
}

impl DecodeSource for JsonReplaySource {
    fn name(&self) -> &'static str {
        "json-replay"
    }

    fn start(&mut self, tx: mpsc::Sender<DecodeEvent>) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(Error::source_start(self.name(), "already running"));
        }
        if !self.path.exists() {
            return Err(Error::source_start(
                self.name(),
                format!("replay file not found: {}", self.path.display()),
            ));
        }

        self.running.store(true, Ordering::SeqCst);

        let path = self.path.clone();
        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            Self::follow(path, running, tx).await;
        });

        info!("Replay source started: {}", self.path.display());
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
