//! `fieldstation` - Mobile field-station telemetry pipeline
//!
//! This library receives decode events from a vehicle-mounted radio decoder,
//! enriches them with the current position and operating band, fans them out
//! to live local subscribers, and durably queues them for opportunistic
//! upload to a remote collector.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod band;
pub mod cli;
pub mod config;
pub mod control;
pub mod decode;
pub mod error;
pub mod hub;
pub mod logging;
pub mod outbox;
pub mod position;
pub mod sources;
pub mod tracker;
pub mod uploader;

pub use band::{Band, BandState};
pub use config::Config;
pub use control::ControlEvent;
pub use decode::DecodeEvent;
pub use error::{Error, Result};
pub use hub::BroadcastHub;
pub use logging::init_logging;
pub use outbox::{Outbox, OutboxRecord, OutboxStats};
pub use position::{Position, PositionOrigin, PositionState};
pub use sources::{DecodeSource, JsonReplaySource, PositionSource};
pub use tracker::{Tracker, TrackerStatus};
pub use uploader::{CollectorClient, Uploader, UploaderStats};
