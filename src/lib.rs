//! Camera-based fall detection with SMS and voice-call alerting over a cellular modem.
//!
//! Frames flow through [`source`] into the [`posture`] classifier and the
//! [`fall_state`] machine; a confirmed fall is handed to [`alert`] once.

pub mod alert;
pub mod clock;
pub mod config;
pub mod dashboard;
pub mod fall_state;
pub mod incident;
pub mod live_status;
pub mod metrics;
pub mod monitor;
pub mod posture;
pub mod source;
pub mod types;

pub use fall_state::{FallConfig, FallState, FallStateMachine, Observation, TrackingLossPolicy};
pub use incident::Incident;
pub use monitor::{Monitor, SessionSummary};
pub use posture::{PostureClassifier, PosturePolicy};
