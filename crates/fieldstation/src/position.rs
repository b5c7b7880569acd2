//! Vehicle position tracking.
//!
//! Holds the most recently known position and the freshness rule that decides
//! whether it still counts as a fix. Positions arrive from a local GPS feed or
//! from an external push over the control channel; the two origins are kept
//! distinct because only a fresh local position qualifies as a fix.

use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How long a position counts as a current fix.
pub const FIX_FRESHNESS_SECS: i64 = 10;

/// Where a position reading came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionOrigin {
    /// The vehicle's own GPS feed.
    Local,
    /// Pushed in over the control channel.
    External,
}

impl fmt::Display for PositionOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::External => f.write_str("external"),
        }
    }
}

/// A single position reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// When the reading was taken.
    pub timestamp: DateTime<Utc>,
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
    /// Where the reading came from.
    pub origin: PositionOrigin,
}

impl Position {
    /// Create a position reading stamped now.
    #[must_use]
    pub fn new(latitude: f64, longitude: f64, origin: PositionOrigin) -> Self {
        Self {
            timestamp: Utc::now(),
            latitude,
            longitude,
            altitude: 0.0,
            speed: 0.0,
            heading: 0.0,
            origin,
        }
    }

    /// Whether this reading is still inside the freshness window.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        Utc::now() - self.timestamp <= Duration::seconds(FIX_FRESHNESS_SECS)
    }

    /// Encode the position as a Maidenhead grid locator.
    ///
    /// `precision` is the number of locator characters; 4 gives a square,
    /// 6 adds the subsquare.
    #[must_use]
    pub fn maidenhead(&self, precision: usize) -> String {
        let lon = self.longitude + 180.0;
        let lat = self.latitude + 90.0;

        let mut grid = String::new();

        // Field: 20 degrees of longitude, 10 of latitude
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            grid.push((b'A' + (lon / 20.0) as u8) as char);
            grid.push((b'A' + (lat / 10.0) as u8) as char);

            // Square: 2 degrees of longitude, 1 of latitude
            let lon = (lon % 20.0) / 2.0;
            let lat = lat % 10.0;
            grid.push((b'0' + lon as u8) as char);
            grid.push((b'0' + lat as u8) as char);

            if precision >= 6 {
                // Subsquare: 5 minutes of longitude, 2.5 of latitude
                let lon = (lon - lon.floor()) * 24.0;
                let lat = (lat - lat.floor()) * 24.0;
                grid.push((b'a' + lon as u8) as char);
                grid.push((b'a' + lat as u8) as char);
            }
        }

        grid
    }
}

/// The most recently known vehicle position.
///
/// A single last-write-wins value. `has_fix` is satisfied only by a fresh
/// local reading; external readings stay readable through `current` but do
/// not count as a fix on their own.
#[derive(Debug, Default)]
pub struct PositionState {
    inner: RwLock<Option<Position>>,
}

impl PositionState {
    /// Create a new position state with no reading yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current position unconditionally.
    pub fn update(&self, position: Position) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = Some(position);
        }
    }

    /// The stored position together with its freshness.
    #[must_use]
    pub fn current(&self) -> Option<(Position, bool)> {
        self.inner
            .read()
            .ok()
            .and_then(|guard| guard.clone())
            .map(|position| {
                let fresh = position.is_fresh();
                (position, fresh)
            })
    }

    /// Whether a fresh local fix is available.
    #[must_use]
    pub fn has_fix(&self) -> bool {
        self.inner
            .read()
            .ok()
            .and_then(|guard| guard.clone())
            .is_some_and(|position| position.origin == PositionOrigin::Local && position.is_fresh())
    }

    /// The current position if a fresh local fix is available.
    #[must_use]
    pub fn fix(&self) -> Option<Position> {
        self.inner
            .read()
            .ok()
            .and_then(|guard| guard.clone())
            .filter(|position| position.origin == PositionOrigin::Local && position.is_fresh())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_position() -> Position {
        Position::new(47.6062, -122.3321, PositionOrigin::Local)
    }

    #[test]
    fn test_origin_display() {
        assert_eq!(PositionOrigin::Local.to_string(), "local");
        assert_eq!(PositionOrigin::External.to_string(), "external");
    }

    #[test]
    fn test_no_fix_without_update() {
        let state = PositionState::new();
        assert!(!state.has_fix());
        assert!(state.current().is_none());
        assert!(state.fix().is_none());
    }

    #[test]
    fn test_fresh_local_update_is_a_fix() {
        let state = PositionState::new();
        state.update(local_position());
        assert!(state.has_fix());

        let (position, fresh) = state.current().unwrap();
        assert!(fresh);
        assert_eq!(position.origin, PositionOrigin::Local);
    }

    #[test]
    fn test_stale_local_update_is_not_a_fix() {
        let state = PositionState::new();
        let mut position = local_position();
        position.timestamp = Utc::now() - Duration::seconds(FIX_FRESHNESS_SECS + 1);
        state.update(position);

        assert!(!state.has_fix());
        let (_, fresh) = state.current().unwrap();
        assert!(!fresh);
    }

    #[test]
    fn test_external_update_is_not_a_fix() {
        let state = PositionState::new();
        state.update(Position::new(47.6, -122.3, PositionOrigin::External));

        assert!(!state.has_fix());
        assert!(state.fix().is_none());

        // Still readable, and fresh
        let (position, fresh) = state.current().unwrap();
        assert!(fresh);
        assert_eq!(position.origin, PositionOrigin::External);
    }

    #[test]
    fn test_last_write_wins() {
        let state = PositionState::new();
        state.update(local_position());
        state.update(Position::new(40.7128, -74.0060, PositionOrigin::External));

        let (position, _) = state.current().unwrap();
        assert!((position.latitude - 40.7128).abs() < f64::EPSILON);
        assert!(!state.has_fix());
    }

    #[test]
    fn test_maidenhead_seattle() {
        let position = local_position();
        assert_eq!(position.maidenhead(4), "CN87");
        assert_eq!(position.maidenhead(6), "CN87uo");
    }

    #[test]
    fn test_maidenhead_boston() {
        let position = Position::new(42.3601, -71.0589, PositionOrigin::Local);
        assert_eq!(position.maidenhead(4), "FN42");
    }

    #[test]
    fn test_position_serde_round_trip() {
        let position = local_position();
        let json = serde_json::to_string(&position).unwrap();
        let back: Position = serde_json::from_str(&json).unwrap();
        assert_eq!(position, back);
    }
}
