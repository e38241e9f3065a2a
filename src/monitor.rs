//! The frame loop: acquire, estimate, classify, transition, alert.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Utc;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::alert::{AlertDispatcher, AlertReport, Transport};
use crate::clock::Clock;
use crate::fall_state::{FallState, FallStateMachine, Observation, Transition};
use crate::incident::Incident;
use crate::live_status::{LiveStatus, LiveView};
use crate::metrics::{MetricsRecorder, MetricsSnapshot};
use crate::posture::{PostureClassifier, PostureJudgment};
use crate::source::{FrameSource, PoseEstimator, SourceError};
use crate::types::Frame;

/// What one frame did to the pipeline.
#[derive(Clone, Debug)]
pub struct FrameOutcome {
    pub transition: Transition,
    pub judgment: Option<PostureJudgment>,
    pub alert: Option<AlertReport>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSummary {
    pub started_at: String,
    pub ended_at: String,
    pub source: String,
    pub policy: String,
    pub frames_processed: u64,
    pub duration_secs: f64,
    pub final_state: FallState,
    pub incidents: Vec<Incident>,
    pub alerts: Vec<AlertReport>,
    pub metrics: MetricsSnapshot,
}

impl SessionSummary {
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }
}

pub struct Monitor<E: PoseEstimator, T: Transport, C: Clock + Clone> {
    estimator: E,
    classifier: PostureClassifier,
    machine: FallStateMachine,
    dispatcher: Option<AlertDispatcher<T, C>>,
    metrics: MetricsRecorder,
    clock: C,
    view: Option<LiveView>,
    status_path: Option<PathBuf>,
    status_interval: f64,
    next_status_at: f64,
    source_label: String,
    started_wall: f64,
    started_rfc3339: String,
    frames: u64,
    last_timestamp: Option<f64>,
    last_judgment: Option<PostureJudgment>,
    incidents: Vec<Incident>,
    alerts: Vec<AlertReport>,
}

impl<E: PoseEstimator, T: Transport, C: Clock + Clone> Monitor<E, T, C> {
    pub fn new(
        estimator: E,
        classifier: PostureClassifier,
        machine: FallStateMachine,
        metrics: MetricsRecorder,
        clock: C,
    ) -> Self {
        let started_wall = clock.now();
        Self {
            estimator,
            classifier,
            machine,
            dispatcher: None,
            metrics,
            clock,
            view: None,
            status_path: None,
            status_interval: 2.0,
            next_status_at: 0.0,
            source_label: String::new(),
            started_wall,
            started_rfc3339: Utc::now().to_rfc3339(),
            frames: 0,
            last_timestamp: None,
            last_judgment: None,
            incidents: Vec::new(),
            alerts: Vec::new(),
        }
    }

    /// Without a dispatcher the monitor only detects.
    pub fn with_dispatcher(mut self, dispatcher: AlertDispatcher<T, C>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_live_view(mut self, view: LiveView) -> Self {
        self.view = Some(view);
        self
    }

    /// Write `live_status.json` to `path` every `interval_secs`.
    pub fn with_status_file(mut self, path: PathBuf, interval_secs: f64) -> Self {
        self.status_path = Some(path);
        self.status_interval = interval_secs;
        self
    }

    pub fn machine(&self) -> &FallStateMachine {
        &self.machine
    }

    pub fn incidents(&self) -> &[Incident] {
        &self.incidents
    }

    pub fn alerts(&self) -> &[AlertReport] {
        &self.alerts
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames
    }

    /// Run until the source ends or `shutdown` is set. Acquisition errors end the loop.
    pub fn run(&mut self, source: &mut dyn FrameSource, shutdown: &AtomicBool) -> Result<(), SourceError> {
        self.source_label = source.describe();
        info!(
            "[MONITOR] watching {} with {} policy",
            self.source_label,
            self.classifier.policy().name()
        );

        let result = loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("[MONITOR] shutdown requested");
                break Ok(());
            }
            match source.next_frame() {
                Ok(Some(frame)) => {
                    self.process_frame(&frame);
                }
                Ok(None) => {
                    info!("[MONITOR] end of stream after {} frames", self.frames);
                    break Ok(());
                }
                Err(e) => {
                    error!("[MONITOR] frame acquisition failed: {}", e);
                    break Err(e);
                }
            }
        };
        self.publish_status(true);
        result
    }

    pub fn process_frame(&mut self, frame: &Frame) -> FrameOutcome {
        let started = Instant::now();
        self.frames += 1;

        let judgment = self.estimator.estimate(frame).map(|sample| {
            self.classifier
                .classify(&sample, frame.size, self.machine.tracking_context())
        });
        let observation = match judgment {
            Some(j) => Observation::Person(j),
            None => Observation::NoPerson,
        };

        let countdown_before = self.machine.unstable_since();
        let transition = self.machine.ingest(observation, frame.timestamp);
        self.last_judgment = judgment;
        self.last_timestamp = Some(frame.timestamp);

        if countdown_before.is_none() {
            if let Some(since) = self.machine.unstable_since() {
                self.metrics.record_unstable(since);
            }
        }
        if transition.changed() {
            info!(
                "[MONITOR] frame {} t={:.2}s {} -> {}",
                frame.index,
                frame.timestamp,
                transition.from.label(),
                transition.to.label()
            );
        }
        self.metrics.record_frame(started.elapsed());

        let alert = match &transition.incident {
            Some(incident) => self.handle_incident(incident),
            None => None,
        };

        if let (Some(view), Some(jpeg)) = (&self.view, &frame.image) {
            view.publish_frame(jpeg.clone());
        }
        self.metrics.maybe_sample(self.clock.now());
        self.publish_status(false);

        FrameOutcome {
            transition,
            judgment,
            alert,
        }
    }

    fn handle_incident(&mut self, incident: &Incident) -> Option<AlertReport> {
        warn!(
            "[MONITOR] FALL CONFIRMED (incident {}, {:.2}s after becoming unstable)",
            incident.id, incident.time_to_confirm
        );
        self.metrics.record_confirmed(incident);
        self.incidents.push(incident.clone());

        let Some(dispatcher) = self.dispatcher.as_mut() else {
            warn!("[MONITOR] no alert channel configured, incident {} not sent", incident.id);
            return None;
        };
        let report = dispatcher.dispatch(incident);
        self.metrics.record_alert(&report);
        self.alerts.push(report.clone());
        Some(report)
    }

    pub fn status(&self) -> LiveStatus {
        let now = self.clock.now();
        let uptime = (now - self.started_wall).max(0.0);
        let timing = self.metrics.frame_timing();
        let sample = self.metrics.last_sample();
        let person = self.last_judgment.is_some();

        LiveStatus {
            timestamp: now,
            uptime_seconds: uptime as u64,
            source: self.source_label.clone(),
            policy: self.classifier.policy().name().to_string(),
            frames_processed: self.frames,
            fps: if uptime > 0.0 { self.frames as f64 / uptime } else { 0.0 },
            fall_state: self.machine.state(),
            state_label: self.machine.state().label().to_string(),
            person_present: person,
            is_upright: self.last_judgment.map(|j| j.is_upright),
            features: self.last_judgment.map(|j| j.features),
            high_velocity_latched: self.machine.high_velocity_latched(),
            unstable_elapsed_secs: self
                .last_timestamp
                .and_then(|t| self.machine.unstable_elapsed(t)),
            incidents_detected: self.machine.incidents(),
            modem_available: self
                .dispatcher
                .as_ref()
                .map(|d| d.transport().is_connected())
                .unwrap_or(false),
            modem_status: self
                .dispatcher
                .as_ref()
                .map(|d| d.transport().link_status())
                .unwrap_or_else(|| "disabled".to_string()),
            alerts_dispatched: self.alerts.len() as u64,
            last_alert: self.alerts.last().cloned(),
            cpu_percent: sample.and_then(|s| s.cpu_percent),
            memory_mb: sample.and_then(|s| s.memory_mb),
            worst_frame_ms: timing.worst_ms,
            frame_budget_misses: timing.budget_misses,
        }
    }

    fn publish_status(&mut self, force: bool) {
        let now = self.clock.now();
        if !force && now < self.next_status_at {
            return;
        }
        self.next_status_at = now + self.status_interval;

        let status = self.status();
        if let Some(path) = &self.status_path {
            if let Err(e) = status.save(path) {
                warn!("[MONITOR] failed to write {}: {}", path.display(), e);
            }
        }
        if let Some(view) = &self.view {
            view.publish_status(status);
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            started_at: self.started_rfc3339.clone(),
            ended_at: Utc::now().to_rfc3339(),
            source: self.source_label.clone(),
            policy: self.classifier.policy().name().to_string(),
            frames_processed: self.frames,
            duration_secs: (self.clock.now() - self.started_wall).max(0.0),
            final_state: self.machine.state(),
            incidents: self.incidents.clone(),
            alerts: self.alerts.clone(),
            metrics: self.metrics.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::transport::scripted::ScriptedTransport;
    use crate::alert::Channel;
    use crate::clock::fake::FakeClock;
    use crate::config::{AlertConfig, MetricsConfig};
    use crate::fall_state::FallConfig;
    use crate::posture::fixtures::{lying, standing};
    use crate::posture::PosturePolicy;
    use crate::source::fakes::FramesFromVec;
    use crate::source::AttachedLandmarks;
    use crate::types::{FrameSize, PoseSample};

    const FPS: f64 = 30.0;

    fn frame(index: u64, sample: Option<PoseSample>) -> Frame {
        Frame {
            index,
            timestamp: index as f64 / FPS,
            size: FrameSize::new(640, 480),
            landmarks: sample.map(|s| s.all),
            image: None,
        }
    }

    /// Upright for 10 frames, then on the floor until `total`.
    fn fall_sequence(total: u64) -> Vec<Frame> {
        (0..total)
            .map(|i| {
                if i < 10 {
                    frame(i, Some(standing(0.5)))
                } else {
                    frame(i, Some(lying(0.8)))
                }
            })
            .collect()
    }

    fn monitor(clock: FakeClock) -> Monitor<AttachedLandmarks, ScriptedTransport, FakeClock> {
        Monitor::new(
            AttachedLandmarks::new(0.5, 0.5),
            PostureClassifier::new(PosturePolicy::default()),
            FallStateMachine::new(FallConfig::default(), "fall detected"),
            MetricsRecorder::new(&MetricsConfig::default()),
            clock,
        )
    }

    fn alert_config() -> AlertConfig {
        AlertConfig {
            phone_number: "+15550100".to_string(),
            ..AlertConfig::default()
        }
    }

    #[test]
    fn test_fall_sequence_dispatches_once() {
        let clock = FakeClock::starting_at(1000.0);
        let modem = ScriptedTransport::cooperative();
        let dispatcher = AlertDispatcher::new(modem.clone(), clock.clone(), alert_config());
        let mut monitor = monitor(clock).with_dispatcher(dispatcher);

        let mut source = FramesFromVec::new(fall_sequence(200));
        monitor.run(&mut source, &AtomicBool::new(false)).unwrap();

        assert_eq!(monitor.frames_processed(), 200);
        assert_eq!(monitor.incidents().len(), 1);
        assert_eq!(monitor.alerts().len(), 1);
        assert!(monitor.alerts()[0].attempt(Channel::Sms).unwrap().success);
        assert_eq!(modem.count("AT+CMGS"), 1);
        assert_eq!(monitor.machine().state(), FallState::Confirmed);

        let summary = monitor.summary();
        assert_eq!(summary.incidents[0].id, 1);
        assert!(summary.metrics.events.len() >= 3);
    }

    #[test]
    fn test_loop_continues_after_failed_alert() {
        let clock = FakeClock::starting_at(0.0);
        // Silent modem: nothing ever answers OK.
        let dispatcher = AlertDispatcher::new(ScriptedTransport::default(), clock.clone(), alert_config());
        let mut monitor = monitor(clock).with_dispatcher(dispatcher);

        let mut frames = fall_sequence(200);
        // Person gets up afterwards.
        frames.extend((200..260).map(|i| frame(i, Some(standing(0.5)))));
        let mut source = FramesFromVec::new(frames);
        monitor.run(&mut source, &AtomicBool::new(false)).unwrap();

        assert_eq!(monitor.frames_processed(), 260);
        assert!(!monitor.alerts()[0].any_success());
        assert_eq!(monitor.machine().state(), FallState::Stable);
    }

    #[test]
    fn test_detection_only_without_dispatcher() {
        let mut monitor = monitor(FakeClock::default());
        let mut source = FramesFromVec::new(fall_sequence(200));
        monitor.run(&mut source, &AtomicBool::new(false)).unwrap();

        assert_eq!(monitor.incidents().len(), 1);
        assert!(monitor.alerts().is_empty());
        assert_eq!(monitor.status().modem_status, "disabled");
    }

    #[test]
    fn test_no_person_frames() {
        let mut monitor = monitor(FakeClock::default());
        let frames: Vec<Frame> = (0..50).map(|i| frame(i, None)).collect();
        monitor.run(&mut FramesFromVec::new(frames), &AtomicBool::new(false)).unwrap();

        let status = monitor.status();
        assert_eq!(status.fall_state, FallState::NoPerson);
        assert!(!status.person_present);
        assert_eq!(status.incidents_detected, 0);
    }

    #[test]
    fn test_shutdown_flag_stops_before_first_frame() {
        let mut monitor = monitor(FakeClock::default());
        let mut source = FramesFromVec::new(fall_sequence(20));
        monitor.run(&mut source, &AtomicBool::new(true)).unwrap();
        assert_eq!(monitor.frames_processed(), 0);
    }

    #[test]
    fn test_status_reports_countdown() {
        let mut monitor = monitor(FakeClock::default());
        for f in fall_sequence(40) {
            monitor.process_frame(&f);
        }
        let status = monitor.status();
        assert_eq!(status.fall_state, FallState::Unstable);
        assert_eq!(status.is_upright, Some(false));
        // Countdown started at frame 10, last frame is 39.
        let elapsed = status.unstable_elapsed_secs.unwrap();
        assert!((elapsed - 29.0 / FPS).abs() < 1e-9);
    }

    #[test]
    fn test_status_reports_modem_backoff() {
        use crate::alert::transport::Opener;
        use crate::alert::{ModemLink, TransportError};

        let clock = FakeClock::starting_at(0.0);
        let opener: Opener<ScriptedTransport> = Box::new(|| Err(TransportError::Unavailable));
        let link = ModemLink::connect(opener, clock.clone());
        let dispatcher = AlertDispatcher::new(link, clock.clone(), alert_config());
        let monitor = Monitor::new(
            AttachedLandmarks::new(0.5, 0.5),
            PostureClassifier::new(PosturePolicy::default()),
            FallStateMachine::new(FallConfig::default(), "fall detected"),
            MetricsRecorder::new(&MetricsConfig::default()),
            clock.clone(),
        )
        .with_dispatcher(dispatcher);

        let status = monitor.status();
        assert!(!status.modem_available);
        assert!(status.modem_status.starts_with("Modem: RECONNECT_PENDING"));

        clock.advance(60.0);
        assert!(monitor.status().modem_status.starts_with("Modem: READY_TO_RECONNECT"));
    }
}
