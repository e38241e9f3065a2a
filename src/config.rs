use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fall_state::{FallConfig, TrackingLossPolicy};
use crate::posture::PosturePolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub camera: CameraConfig,
    pub detection: DetectionConfig,
    pub alert: AlertConfig,
    pub metrics: MetricsConfig,
    pub dashboard: DashboardConfig,
}

impl MonitorConfig {
    /// Defaults when `path` is None; otherwise the JSON file with missing fields defaulted.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Fixed device index; probed when None.
    pub index: Option<u32>,
    pub probe_limit: u32,
    /// Pose estimator process; `{camera}` is replaced with the device index.
    pub estimator_command: Vec<String>,
    pub min_detection_confidence: f64,
    pub min_tracking_confidence: f64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: None,
            probe_limit: 15,
            estimator_command: vec![
                "pose_estimator".to_string(),
                "--camera".to_string(),
                "{camera}".to_string(),
            ],
            min_detection_confidence: 0.6,
            min_tracking_confidence: 0.5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub policy: PosturePolicy,
    pub velocity_threshold: f64,
    pub confirm_time_secs: f64,
    pub latch_required: bool,
    pub tracking_loss: TrackingLossPolicy,
    /// Wall-clock limit for repeating the last frame once a recording ends.
    pub hold_timeout_secs: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        let fall = FallConfig::default();
        Self {
            policy: PosturePolicy::default(),
            velocity_threshold: fall.velocity_threshold,
            confirm_time_secs: fall.confirm_time_secs,
            latch_required: fall.latch_required,
            tracking_loss: fall.tracking_loss,
            hold_timeout_secs: 10.0,
        }
    }
}

impl DetectionConfig {
    /// Profile used by the video test harness: trunk/leg/head rules, short confirm, no latch.
    pub fn trunk_leg_head_profile() -> Self {
        Self {
            policy: PosturePolicy::trunk_leg_head(),
            velocity_threshold: 5.0,
            confirm_time_secs: 1.0,
            latch_required: false,
            ..Self::default()
        }
    }

    pub fn fall_config(&self) -> FallConfig {
        FallConfig {
            velocity_threshold: self.velocity_threshold,
            confirm_time_secs: self.confirm_time_secs,
            latch_required: self.latch_required,
            tracking_loss: self.tracking_loss,
        }
    }
}

/// What the callee hears once the call is up.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertMode {
    Tones {
        #[serde(default = "default_tone_duration")]
        duration_secs: f64,
    },
    VoiceMessage {
        text: String,
        #[serde(default = "default_language")]
        language: String,
        #[serde(default = "default_audio_path")]
        audio_path: PathBuf,
        #[serde(default = "default_repeats")]
        repeats: u32,
        #[serde(default = "default_pause")]
        pause_secs: f64,
    },
}

fn default_tone_duration() -> f64 {
    20.0
}

fn default_language() -> String {
    "pt".to_string()
}

fn default_audio_path() -> PathBuf {
    PathBuf::from("alert_message.mp3")
}

fn default_repeats() -> u32 {
    2
}

fn default_pause() -> f64 {
    1.0
}

impl Default for AlertMode {
    fn default() -> Self {
        AlertMode::Tones {
            duration_secs: default_tone_duration(),
        }
    }
}

/// Wait windows for each modem step, in seconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModemTimings {
    pub text_mode_wait: f64,
    pub recipient_wait: f64,
    pub body_wait: f64,
    pub submit_wait: f64,
    pub dial_wait: f64,
    pub answer_wait: f64,
    pub tone_wait: f64,
    pub tone_gap: f64,
    pub hangup_wait: f64,
    pub ping_wait: f64,
}

impl Default for ModemTimings {
    fn default() -> Self {
        Self {
            text_mode_wait: 1.0,
            recipient_wait: 5.0,
            body_wait: 0.5,
            submit_wait: 5.0,
            dial_wait: 5.0,
            answer_wait: 5.0,
            tone_wait: 0.2,
            tone_gap: 0.2,
            hangup_wait: 2.0,
            ping_wait: 2.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Empty disables alerting; detection still runs.
    pub phone_number: String,
    pub modem_port: String,
    pub baud_rate: u32,
    pub sms_message: String,
    pub mode: AlertMode,
    pub call_when_sms_fails: bool,
    pub timings: ModemTimings,
    /// `{text}`, `{lang}` and `{out}` are substituted.
    pub tts_command: Vec<String>,
    /// `{file}` is substituted, or the file is appended.
    pub player_command: Vec<String>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            phone_number: String::new(),
            modem_port: "/dev/serial0".to_string(),
            baud_rate: 115_200,
            sms_message: "FALL ALERT! A fall was detected and confirmed by the monitor."
                .to_string(),
            mode: AlertMode::default(),
            call_when_sms_fails: true,
            timings: ModemTimings::default(),
            tts_command: ["gtts-cli", "{text}", "--lang", "{lang}", "--output", "{out}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            player_command: vec!["mpg123".to_string(), "-q".to_string()],
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub sample_interval_secs: f64,
    pub status_interval_secs: f64,
    pub output_dir: PathBuf,
    /// Per-frame processing budget; slower frames are counted as misses.
    pub frame_budget_ms: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 5.0,
            status_interval_secs: 2.0,
            output_dir: PathBuf::from("fall_monitor_output"),
            frame_budget_ms: 1000.0 / 30.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{
            "alert": { "phone_number": "+15550100", "mode": { "kind": "voice_message", "text": "help" } },
            "detection": { "confirm_time_secs": 3.0, "tracking_loss": "pause" }
        }"#;
        let config: MonitorConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.alert.phone_number, "+15550100");
        assert_eq!(config.alert.baud_rate, 115_200);
        match &config.alert.mode {
            AlertMode::VoiceMessage {
                repeats, pause_secs, ..
            } => {
                assert_eq!(*repeats, 2);
                assert_eq!(*pause_secs, 1.0);
            }
            other => panic!("unexpected mode {:?}", other),
        }
        assert_eq!(config.detection.confirm_time_secs, 3.0);
        assert_eq!(config.detection.tracking_loss, TrackingLossPolicy::Pause);
        assert_eq!(config.detection.velocity_threshold, 20.0);
        assert_eq!(config.camera.probe_limit, 15);
        assert_eq!(config.camera.min_detection_confidence, 0.6);
        assert!(config.dashboard.enabled);
    }

    #[test]
    fn test_trunk_leg_head_profile() {
        let detection = DetectionConfig::trunk_leg_head_profile();
        let fall = detection.fall_config();
        assert!(!fall.latch_required);
        assert_eq!(fall.confirm_time_secs, 1.0);
        assert_eq!(detection.policy.name(), PosturePolicy::trunk_leg_head().name());
    }

    #[test]
    fn test_load_missing_file() {
        let err = MonitorConfig::load(Some(Path::new("/nonexistent/fall_monitor.json")));
        assert!(matches!(err, Err(ConfigError::Read { .. })));
        assert!(MonitorConfig::load(None).is_ok());
    }
}
