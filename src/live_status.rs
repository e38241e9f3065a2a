use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::alert::AlertReport;
pub use crate::clock::current_timestamp;
use crate::fall_state::FallState;
use crate::posture::PostureFeatures;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub uptime_seconds: u64,
    pub source: String,
    pub policy: String,
    // Detection
    pub frames_processed: u64,
    pub fps: f64,
    pub fall_state: FallState,
    pub state_label: String,
    pub person_present: bool,
    pub is_upright: Option<bool>,
    pub features: Option<PostureFeatures>,
    pub high_velocity_latched: bool,
    pub unstable_elapsed_secs: Option<f64>,
    pub incidents_detected: u64,
    // Alerting
    pub modem_available: bool,
    pub modem_status: String,
    pub alerts_dispatched: u64,
    pub last_alert: Option<AlertReport>,
    // Resources
    pub cpu_percent: Option<f32>,
    pub memory_mb: Option<f64>,
    pub worst_frame_ms: f64,
    pub frame_budget_misses: u64,
}

impl LiveStatus {
    pub fn new() -> Self {
        Self {
            timestamp: current_timestamp(),
            uptime_seconds: 0,
            source: String::new(),
            policy: String::new(),
            frames_processed: 0,
            fps: 0.0,
            fall_state: FallState::Stable,
            state_label: FallState::Stable.label().to_string(),
            person_present: false,
            is_upright: None,
            features: None,
            high_velocity_latched: false,
            unstable_elapsed_secs: None,
            incidents_detected: 0,
            modem_available: false,
            modem_status: String::new(),
            alerts_dispatched: 0,
            last_alert: None,
            cpu_percent: None,
            memory_mb: None,
            worst_frame_ms: 0.0,
            frame_budget_misses: 0,
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

impl Default for LiveStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Latest status and JPEG frame, published by the frame loop and pulled by the dashboard.
#[derive(Clone, Default)]
pub struct LiveView {
    status: Arc<RwLock<LiveStatus>>,
    frame: Arc<RwLock<Option<Arc<Vec<u8>>>>>,
}

impl LiveView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called from the blocking frame loop, never from async context.
    pub fn publish_status(&self, status: LiveStatus) {
        *self.status.blocking_write() = status;
    }

    pub fn publish_frame(&self, jpeg: Vec<u8>) {
        *self.frame.blocking_write() = Some(Arc::new(jpeg));
    }

    pub async fn status(&self) -> LiveStatus {
        self.status.read().await.clone()
    }

    pub async fn latest_frame(&self) -> Option<Arc<Vec<u8>>> {
        self.frame.read().await.clone()
    }

    pub fn status_blocking(&self) -> LiveStatus {
        self.status.blocking_read().clone()
    }
}
