//! Decode event types.
//!
//! A [`DecodeEvent`] is one overheard digital-mode transmission, as delivered
//! by a decode source. Events are enriched with the current band and position
//! before persistence; once persisted they never change.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::band::{band_for_frequency, Band};
use crate::position::Position;

/// A single decoded transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodeEvent {
    /// When the transmission was captured.
    pub timestamp: DateTime<Utc>,
    /// The raw decoded message text.
    pub message: String,
    /// Callsign derived from the message, empty when none was found.
    #[serde(default)]
    pub callsign: String,
    /// Grid locator derived from the message, empty when none was found.
    #[serde(default)]
    pub grid: String,
    /// Signal-to-noise ratio in dB.
    pub snr: i32,
    /// Time offset from the decode window in seconds.
    pub dt: f64,
    /// Carrier frequency in Hz (audio offset for some decoders).
    pub frequency: u64,
    /// Operating band; overwritten by the last-signaled band at enrichment.
    #[serde(default = "default_band")]
    pub band: Band,
    /// Vehicle position attached at enrichment, when a fix was available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

fn default_band() -> Band {
    Band::Unknown
}

impl DecodeEvent {
    /// Create a decode event stamped now, with the band derived from the
    /// carrier frequency.
    #[must_use]
    pub fn new(message: impl Into<String>, snr: i32, dt: f64, frequency: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            callsign: String::new(),
            grid: String::new(),
            snr,
            dt,
            frequency,
            band: band_for_frequency(frequency),
            position: None,
        }
    }

    /// Render the classic decoder display line sent to subscribers:
    /// `HHMMSS SNR DT FREQ ~ MESSAGE`.
    #[must_use]
    pub fn display_line(&self) -> String {
        format!(
            "{} {:+3}  {:4.1} {:4} ~ {}",
            self.timestamp.format("%H%M%S"),
            self.snr,
            self.dt,
            self.frequency,
            self.message
        )
    }

    /// Whether a callsign was derived for this decode.
    #[must_use]
    pub fn has_callsign(&self) -> bool {
        !self.callsign.is_empty()
    }
}

/// Validate a Maidenhead grid locator (4 or 6 characters).
#[must_use]
pub fn is_valid_grid(grid: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"^[A-R]{2}[0-9]{2}([A-X]{2})?$").expect("grid locator pattern is valid")
    });
    pattern.is_match(&grid.to_uppercase())
}
