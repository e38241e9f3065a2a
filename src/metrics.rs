use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};

use crate::alert::{AlertReport, Channel};
use crate::config::MetricsConfig;
use crate::incident::Incident;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    UnstableSince,
    FallConfirmed,
    SmsSent,
    CallStarted,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    pub kind: MetricKind,
    pub timestamp: f64,
    pub incident_id: Option<u64>,
    /// time_to_confirm for FallConfirmed, dispatch latency for the alert channels.
    pub value_secs: Option<f64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub timestamp: f64,
    pub cpu_percent: Option<f32>,
    pub memory_mb: Option<f64>,
}

/// Frame processing time against a fixed budget.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameTiming {
    pub frames: u64,
    pub total_ms: f64,
    pub worst_ms: f64,
    pub budget_ms: f64,
    pub budget_misses: u64,
}

impl FrameTiming {
    pub fn new(budget_ms: f64) -> Self {
        Self {
            budget_ms,
            ..Self::default()
        }
    }

    pub fn record(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.frames += 1;
        self.total_ms += ms;
        if ms > self.worst_ms {
            self.worst_ms = ms;
        }
        if ms > self.budget_ms {
            self.budget_misses += 1;
        }
    }

    pub fn mean_ms(&self) -> f64 {
        if self.frames == 0 {
            0.0
        } else {
            self.total_ms / self.frames as f64
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub frame_timing: FrameTiming,
    pub mean_frame_ms: f64,
    pub last_sample: Option<ResourceSample>,
    pub peak_memory_mb: Option<f64>,
    pub samples_taken: u64,
    pub events: Vec<MetricEvent>,
}

/// Current-process CPU and resident memory via sysinfo.
pub struct ProcessSampler {
    system: System,
    pid: Option<Pid>,
}

impl ProcessSampler {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("[METRIC] cannot resolve own pid: {}", e);
                None
            }
        };
        Self {
            system: System::new(),
            pid,
        }
    }

    /// Empty sample when the process cannot be read.
    pub fn sample(&mut self, timestamp: f64) -> ResourceSample {
        let Some(pid) = self.pid else {
            return ResourceSample {
                timestamp,
                ..ResourceSample::default()
            };
        };
        if !self.system.refresh_process(pid) {
            return ResourceSample {
                timestamp,
                ..ResourceSample::default()
            };
        }
        match self.system.process(pid) {
            Some(process) => ResourceSample {
                timestamp,
                cpu_percent: Some(process.cpu_usage()),
                memory_mb: Some(process.memory() as f64 / (1024.0 * 1024.0)),
            },
            None => ResourceSample {
                timestamp,
                ..ResourceSample::default()
            },
        }
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Observes the pipeline. Nothing here feeds back into detection or alerting.
pub struct MetricsRecorder {
    sampler: ProcessSampler,
    sample_interval: f64,
    next_sample_at: f64,
    frame_timing: FrameTiming,
    last_sample: Option<ResourceSample>,
    peak_memory_mb: Option<f64>,
    samples_taken: u64,
    events: Vec<MetricEvent>,
}

impl MetricsRecorder {
    pub fn new(config: &MetricsConfig) -> Self {
        Self {
            sampler: ProcessSampler::new(),
            sample_interval: config.sample_interval_secs,
            next_sample_at: 0.0,
            frame_timing: FrameTiming::new(config.frame_budget_ms),
            last_sample: None,
            peak_memory_mb: None,
            samples_taken: 0,
            events: Vec::new(),
        }
    }

    pub fn record_unstable(&mut self, timestamp: f64) {
        info!("[METRIC] unstable_since={:.3}", timestamp);
        self.push(MetricKind::UnstableSince, timestamp, None, None);
    }

    pub fn record_confirmed(&mut self, incident: &Incident) {
        info!(
            "[METRIC] fall_confirmed incident={} confirmed_at={:.3} time_to_confirm={:.3}s",
            incident.id, incident.confirmed_at, incident.time_to_confirm
        );
        self.push(
            MetricKind::FallConfirmed,
            incident.confirmed_at,
            Some(incident.id),
            Some(incident.time_to_confirm),
        );
    }

    /// SMS send time and call start time of successful channels.
    pub fn record_alert(&mut self, report: &AlertReport) {
        for attempt in report.attempts.iter().filter(|a| a.success) {
            let kind = match attempt.channel {
                Channel::Sms => MetricKind::SmsSent,
                Channel::VoiceCall => MetricKind::CallStarted,
            };
            info!(
                "[METRIC] {:?} incident={} at={:.3} latency={:.3}s",
                kind, report.incident_id, attempt.timestamp, attempt.latency_secs
            );
            self.push(
                kind,
                attempt.timestamp,
                Some(report.incident_id),
                Some(attempt.latency_secs),
            );
        }
    }

    pub fn record_frame(&mut self, elapsed: Duration) {
        self.frame_timing.record(elapsed);
    }

    /// Sample CPU/memory if the interval has elapsed since the last sample.
    pub fn maybe_sample(&mut self, now: f64) -> Option<ResourceSample> {
        if now < self.next_sample_at {
            return None;
        }
        self.next_sample_at = now + self.sample_interval;
        let sample = self.sampler.sample(now);
        self.samples_taken += 1;
        if let Some(mb) = sample.memory_mb {
            self.peak_memory_mb = Some(self.peak_memory_mb.map_or(mb, |peak| peak.max(mb)));
        }
        if let (Some(cpu), Some(mb)) = (sample.cpu_percent, sample.memory_mb) {
            info!("[METRIC] cpu={:.1}% memory={:.1}MB", cpu, mb);
        }
        self.last_sample = Some(sample);
        Some(sample)
    }

    pub fn last_sample(&self) -> Option<ResourceSample> {
        self.last_sample
    }

    pub fn frame_timing(&self) -> &FrameTiming {
        &self.frame_timing
    }

    pub fn events(&self) -> &[MetricEvent] {
        &self.events
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frame_timing: self.frame_timing,
            mean_frame_ms: self.frame_timing.mean_ms(),
            last_sample: self.last_sample,
            peak_memory_mb: self.peak_memory_mb,
            samples_taken: self.samples_taken,
            events: self.events.clone(),
        }
    }

    fn push(&mut self, kind: MetricKind, timestamp: f64, incident_id: Option<u64>, value_secs: Option<f64>) {
        self.events.push(MetricEvent {
            kind,
            timestamp,
            incident_id,
            value_secs,
        });
    }
}
