//! Operating band representation and band state tracking.
//!
//! The control channel accepts a fixed set of operating bands; the
//! frequency lookup table additionally knows 160m and 70cm, which can show
//! up in decode metadata but are not accepted as control-channel input.

use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// An amateur radio operating band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Band {
    /// 160 meters (1.8 MHz). Lookup-only, not accepted by the control channel.
    #[serde(rename = "160m")]
    M160,
    /// 80 meters (3.5 MHz).
    #[serde(rename = "80m")]
    M80,
    /// 60 meters (5.3 MHz).
    #[serde(rename = "60m")]
    M60,
    /// 40 meters (7 MHz).
    #[serde(rename = "40m")]
    M40,
    /// 30 meters (10.1 MHz).
    #[serde(rename = "30m")]
    M30,
    /// 20 meters (14 MHz).
    #[serde(rename = "20m")]
    M20,
    /// 17 meters (18 MHz).
    #[serde(rename = "17m")]
    M17,
    /// 15 meters (21 MHz).
    #[serde(rename = "15m")]
    M15,
    /// 12 meters (24.9 MHz).
    #[serde(rename = "12m")]
    M12,
    /// 10 meters (28 MHz).
    #[serde(rename = "10m")]
    M10,
    /// 6 meters (50 MHz).
    #[serde(rename = "6m")]
    M6,
    /// 70 centimeters (430 MHz). Lookup-only, not accepted by the control channel.
    #[serde(rename = "70cm")]
    Cm70,
    /// Band not known.
    #[serde(rename = "unknown")]
    Unknown,
}

/// Bands accepted by the control channel's band-change endpoint.
pub const CONTROL_BANDS: &[Band] = &[
    Band::M80,
    Band::M60,
    Band::M40,
    Band::M30,
    Band::M20,
    Band::M17,
    Band::M15,
    Band::M12,
    Band::M10,
    Band::M6,
];

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Band {
    /// The canonical text label for this band.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::M160 => "160m",
            Self::M80 => "80m",
            Self::M60 => "60m",
            Self::M40 => "40m",
            Self::M30 => "30m",
            Self::M20 => "20m",
            Self::M17 => "17m",
            Self::M15 => "15m",
            Self::M12 => "12m",
            Self::M10 => "10m",
            Self::M6 => "6m",
            Self::Cm70 => "70cm",
            Self::Unknown => "unknown",
        }
    }

    /// Parse any known band label, including the lookup-only bands.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "160m" => Some(Self::M160),
            "80m" => Some(Self::M80),
            "60m" => Some(Self::M60),
            "40m" => Some(Self::M40),
            "30m" => Some(Self::M30),
            "20m" => Some(Self::M20),
            "17m" => Some(Self::M17),
            "15m" => Some(Self::M15),
            "12m" => Some(Self::M12),
            "10m" => Some(Self::M10),
            "6m" => Some(Self::M6),
            "70cm" => Some(Self::Cm70),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Parse a band label from the control channel.
    ///
    /// Only labels in [`CONTROL_BANDS`] are accepted; everything else,
    /// including the lookup-only 160m and 70cm, is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBand`] when the label is not in the accepted set.
    pub fn from_control_label(label: &str) -> Result<Self> {
        match Self::parse(label) {
            Some(band) if CONTROL_BANDS.contains(&band) => Ok(band),
            _ => Err(Error::InvalidBand {
                label: label.to_string(),
                valid: CONTROL_BANDS
                    .iter()
                    .map(Band::label)
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }
}

/// Determine the band for a carrier frequency in Hz.
///
/// Returns [`Band::Unknown`] for frequencies outside every known segment.
#[must_use]
pub fn band_for_frequency(frequency_hz: u64) -> Band {
    #[allow(clippy::cast_precision_loss)]
    let mhz = frequency_hz as f64 / 1_000_000.0;

    const SEGMENTS: &[(f64, f64, Band)] = &[
        (1.8, 2.0, Band::M160),
        (3.5, 4.0, Band::M80),
        (5.3, 5.4, Band::M60),
        (7.0, 7.3, Band::M40),
        (10.1, 10.15, Band::M30),
        (14.0, 14.35, Band::M20),
        (18.068, 18.168, Band::M17),
        (21.0, 21.45, Band::M15),
        (24.89, 24.99, Band::M12),
        (28.0, 29.7, Band::M10),
        (50.0, 54.0, Band::M6),
        (430.0, 440.0, Band::Cm70),
    ];

    for &(start, end, band) in SEGMENTS {
        if mhz >= start && mhz <= end {
            return band;
        }
    }

    Band::Unknown
}

/// The most recently signaled operating band.
///
/// A single last-write-wins value; validation happens at the parse boundary
/// ([`Band::from_control_label`]), so `set` only ever sees accepted bands.
#[derive(Debug, Default)]
pub struct BandState {
    inner: RwLock<Option<(Band, DateTime<Utc>)>>,
}

impl BandState {
    /// Create a new band state with no band signaled yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a band change.
    pub fn set(&self, band: Band) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = Some((band, Utc::now()));
        }
    }

    /// The last accepted band, or [`Band::Unknown`] if never set.
    #[must_use]
    pub fn current(&self) -> Band {
        self.inner
            .read()
            .ok()
            .and_then(|guard| guard.map(|(band, _)| band))
            .unwrap_or(Band::Unknown)
    }

    /// When the band last changed, if it ever has.
    #[must_use]
    pub fn last_changed(&self) -> Option<DateTime<Utc>> {
        self.inner
            .read()
            .ok()
            .and_then(|guard| guard.map(|(_, at)| at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_labels_round_trip() {
        for band in [
            Band::M160,
            Band::M80,
            Band::M60,
            Band::M40,
            Band::M30,
            Band::M20,
            Band::M17,
            Band::M15,
            Band::M12,
            Band::M10,
            Band::M6,
            Band::Cm70,
            Band::Unknown,
        ] {
            assert_eq!(Band::parse(band.label()), Some(band));
        }
    }

    #[test]
    fn test_control_label_accepts_operating_bands() {
        assert_eq!(Band::from_control_label("40m").unwrap(), Band::M40);
        assert_eq!(Band::from_control_label("6m").unwrap(), Band::M6);
    }

    #[test]
    fn test_control_label_rejects_unknown_labels() {
        let err = Band::from_control_label("2m").unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("2m"));
    }

    #[test]
    fn test_control_label_rejects_lookup_only_bands() {
        assert!(Band::from_control_label("160m").is_err());
        assert!(Band::from_control_label("70cm").is_err());
    }

    #[test]
    fn test_band_for_frequency() {
        assert_eq!(band_for_frequency(7_074_000), Band::M40);
        assert_eq!(band_for_frequency(14_074_000), Band::M20);
        assert_eq!(band_for_frequency(1_840_000), Band::M160);
        assert_eq!(band_for_frequency(432_100_000), Band::Cm70);
        assert_eq!(band_for_frequency(100_000_000), Band::Unknown);
        assert_eq!(band_for_frequency(0), Band::Unknown);
    }

    #[test]
    fn test_band_serde_label() {
        let json = serde_json::to_string(&Band::M40).unwrap();
        assert_eq!(json, r#""40m""#);
        let band: Band = serde_json::from_str(r#""70cm""#).unwrap();
        assert_eq!(band, Band::Cm70);
    }

    #[test]
    fn test_band_state_starts_unknown() {
        let state = BandState::new();
        assert_eq!(state.current(), Band::Unknown);
        assert!(state.last_changed().is_none());
    }

    #[test]
    fn test_band_state_last_write_wins() {
        let state = BandState::new();
        state.set(Band::M40);
        assert_eq!(state.current(), Band::M40);

        state.set(Band::M20);
        assert_eq!(state.current(), Band::M20);
        assert!(state.last_changed().is_some());
    }
}
