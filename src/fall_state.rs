//! Temporal fall detection.
//!
//! A fast downward hip movement only latches a fall *candidate*. The fall is
//! confirmed once the person has stayed out of an upright posture for the
//! confirmation window, which filters out crouching and short occlusions.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::incident::Incident;
use crate::posture::{PostureJudgment, TrackingContext};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FallState {
    Stable,
    Unstable,
    Falling,
    Confirmed,
    NoPerson,
}

impl FallState {
    pub fn label(&self) -> &'static str {
        match self {
            FallState::Stable => "Stable",
            FallState::Unstable => "Unstable",
            FallState::Falling => "Falling",
            FallState::Confirmed => "FALL CONFIRMED",
            FallState::NoPerson => "No person detected",
        }
    }
}

/// What happens to a running unstable countdown when the person leaves the frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingLossPolicy {
    /// Countdown keeps running through the gap.
    #[default]
    Hold,
    /// Countdown is frozen for the length of the gap.
    Pause,
    /// Countdown and velocity latch are dropped.
    Reset,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallConfig {
    /// Hip drop in pixels/frame that latches a fall candidate.
    pub velocity_threshold: f64,
    /// Seconds of continuous non-upright posture before a fall is confirmed.
    pub confirm_time_secs: f64,
    /// When false, any non-upright frame starts the countdown.
    pub latch_required: bool,
    pub tracking_loss: TrackingLossPolicy,
}

impl Default for FallConfig {
    fn default() -> Self {
        Self {
            velocity_threshold: 20.0,
            confirm_time_secs: 4.5,
            latch_required: true,
            tracking_loss: TrackingLossPolicy::Hold,
        }
    }
}

/// Per-frame input.
#[derive(Clone, Copy, Debug)]
pub enum Observation {
    Person(PostureJudgment),
    NoPerson,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub from: FallState,
    pub to: FallState,
    /// Set on the single frame where the fall is confirmed.
    pub incident: Option<Incident>,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

pub struct FallStateMachine {
    config: FallConfig,
    message: String,
    state: FallState,
    tracking: TrackingContext,
    high_velocity: bool,
    unstable_since: Option<f64>,
    confirmed: bool,
    confirmed_at: Option<f64>,
    gap_started: Option<f64>,
    /// Displayed state when tracking was lost.
    state_before_gap: Option<FallState>,
    incidents: u64,
}

impl FallStateMachine {
    pub fn new(config: FallConfig, message: &str) -> Self {
        Self {
            config,
            message: message.to_string(),
            state: FallState::Stable,
            tracking: TrackingContext {
                previous_hip_y: None,
                previous_right_hip_y: None,
                last_stable_hip_y: None,
                was_tracking: true,
            },
            high_velocity: false,
            unstable_since: None,
            confirmed: false,
            confirmed_at: None,
            gap_started: None,
            state_before_gap: None,
            incidents: 0,
        }
    }

    pub fn state(&self) -> FallState {
        self.state
    }

    pub fn config(&self) -> &FallConfig {
        &self.config
    }

    /// Hip history for the classifier's next call.
    pub fn tracking_context(&self) -> TrackingContext {
        self.tracking
    }

    pub fn unstable_since(&self) -> Option<f64> {
        self.unstable_since
    }

    pub fn confirmed_at(&self) -> Option<f64> {
        self.confirmed_at
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn high_velocity_latched(&self) -> bool {
        self.high_velocity
    }

    pub fn incidents(&self) -> u64 {
        self.incidents
    }

    /// Seconds spent in the current countdown, if one is running.
    pub fn unstable_elapsed(&self, now: f64) -> Option<f64> {
        if self.confirmed {
            return None;
        }
        self.unstable_since.map(|since| (now - since).max(0.0))
    }

    pub fn ingest(&mut self, observation: Observation, now: f64) -> Transition {
        let from = self.state;
        let incident = match observation {
            Observation::Person(judgment) => self.on_person(judgment, now),
            Observation::NoPerson => {
                self.on_no_person(now);
                None
            }
        };

        if from != self.state {
            debug!("fall state {:?} -> {:?} at {:.3}", from, self.state, now);
        }

        Transition {
            from,
            to: self.state,
            incident,
        }
    }

    fn on_no_person(&mut self, now: f64) {
        if self.tracking.was_tracking {
            self.state_before_gap = Some(self.state);
            match self.config.tracking_loss {
                TrackingLossPolicy::Hold => {}
                TrackingLossPolicy::Pause => {
                    if self.unstable_since.is_some() && !self.confirmed {
                        self.gap_started = Some(now);
                    }
                }
                TrackingLossPolicy::Reset => {
                    self.unstable_since = None;
                    self.high_velocity = false;
                }
            }
        }
        self.tracking.was_tracking = false;
        self.state = FallState::NoPerson;
    }

    fn on_person(&mut self, judgment: PostureJudgment, now: f64) -> Option<Incident> {
        let features = judgment.features;

        if !self.tracking.was_tracking {
            if let (Some(gap), Some(since)) = (self.gap_started.take(), self.unstable_since) {
                self.unstable_since = Some(since + (now - gap));
            }
            self.state = self.resumed_state();
        }
        self.tracking.was_tracking = true;
        self.tracking.previous_hip_y = Some(features.hip_mid_y);
        self.tracking.previous_right_hip_y = Some(features.right_hip_y);

        let spiked = features.vertical_velocity > self.config.velocity_threshold;
        if spiked {
            self.high_velocity = true;
            if self.unstable_since.is_none() && !self.confirmed {
                self.state = FallState::Falling;
            }
        }

        if judgment.is_upright {
            self.enter_stable(features.hip_mid_y);
            return None;
        }

        if self.confirmed {
            self.state = FallState::Confirmed;
            return None;
        }

        if self.unstable_since.is_none() && (self.high_velocity || !self.config.latch_required) {
            self.unstable_since = Some(now);
        }

        let since = self.unstable_since?;
        self.state = FallState::Unstable;
        if now - since >= self.config.confirm_time_secs {
            return Some(self.confirm(since, now));
        }
        None
    }

    /// State shown on the first person frame after a gap, before this frame's
    /// posture is applied. Without a countdown there is nothing unstable to resume.
    fn resumed_state(&mut self) -> FallState {
        match self.state_before_gap.take() {
            Some(FallState::Unstable) | Some(FallState::Falling) if self.unstable_since.is_none() => {
                FallState::Stable
            }
            Some(FallState::NoPerson) | None => FallState::Stable,
            Some(state) => state,
        }
    }

    fn enter_stable(&mut self, hip_mid_y: f64) {
        self.state = FallState::Stable;
        self.unstable_since = None;
        self.confirmed = false;
        self.confirmed_at = None;
        self.high_velocity = false;
        self.gap_started = None;
        self.tracking.last_stable_hip_y = Some(hip_mid_y);
    }

    fn confirm(&mut self, since: f64, now: f64) -> Incident {
        self.confirmed = true;
        self.confirmed_at = Some(now);
        self.state = FallState::Confirmed;
        self.incidents += 1;
        Incident::new(self.incidents, since, now, &self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posture::PostureFeatures;

    const FPS: f64 = 30.0;

    fn person(upright: bool, hip_y: f64, velocity: f64) -> Observation {
        Observation::Person(PostureJudgment {
            features: PostureFeatures {
                hip_mid_y: hip_y,
                vertical_velocity: velocity,
                ..PostureFeatures::default()
            },
            is_upright: upright,
            reacquired: false,
        })
    }

    fn machine() -> FallStateMachine {
        FallStateMachine::new(FallConfig::default(), "fall")
    }

    fn with_policy(policy: TrackingLossPolicy) -> FallStateMachine {
        FallStateMachine::new(
            FallConfig {
                tracking_loss: policy,
                ..FallConfig::default()
            },
            "fall",
        )
    }

    #[test]
    fn test_all_upright_stays_stable() {
        let mut m = machine();
        for i in 0..100 {
            let t = m.ingest(person(true, 240.0, 0.0), i as f64 / FPS);
            assert!(t.incident.is_none());
        }
        assert_eq!(m.state(), FallState::Stable);
        assert_eq!(m.incidents(), 0);
    }

    #[test]
    fn test_spike_then_sustained_fall_confirms_once() {
        let mut m = machine();
        let mut fired = Vec::new();

        for i in 0..=200u32 {
            let now = f64::from(i) / FPS;
            let obs = if i < 10 {
                person(true, 240.0, 0.0)
            } else if i == 10 {
                person(false, 265.0, 25.0)
            } else {
                person(false, 380.0, 0.0)
            };
            if let Some(incident) = m.ingest(obs, now).incident {
                fired.push((i, incident));
            }
        }

        assert_eq!(fired.len(), 1);
        let (frame, incident) = &fired[0];
        assert!((145..=146).contains(frame), "confirmed at frame {}", frame);
        assert!((incident.time_to_confirm - 4.5).abs() < 0.05);
        assert_eq!(m.state(), FallState::Confirmed);
    }

    #[test]
    fn test_no_person_never_confirms() {
        let mut m = machine();
        for i in 0..50 {
            let t = m.ingest(Observation::NoPerson, i as f64 / FPS);
            assert!(t.incident.is_none());
        }
        assert_eq!(m.state(), FallState::NoPerson);
        assert!(!m.tracking_context().was_tracking);
    }

    #[test]
    fn test_confirm_boundary_is_inclusive() {
        let mut m = machine();
        m.ingest(person(false, 300.0, 30.0), 1.0);
        assert_eq!(m.state(), FallState::Unstable);
        assert_eq!(m.unstable_since(), Some(1.0));

        let early = m.ingest(person(false, 300.0, 0.0), 5.25);
        assert!(early.incident.is_none());
        assert_eq!(m.state(), FallState::Unstable);

        let exact = m.ingest(person(false, 300.0, 0.0), 5.5);
        assert!(exact.incident.is_some());
        assert_eq!(exact.to, FallState::Confirmed);
    }

    #[test]
    fn test_one_shot_until_stable() {
        let mut m = machine();
        m.ingest(person(false, 300.0, 30.0), 0.0);
        assert!(m.ingest(person(false, 300.0, 0.0), 5.0).incident.is_some());

        // Still on the floor, another spike: no second alert.
        for k in 1..20 {
            let t = m.ingest(person(false, 300.0, 40.0), 5.0 + k as f64);
            assert!(t.incident.is_none());
            assert_eq!(t.to, FallState::Confirmed);
        }

        // Gets up, falls again: a new incident.
        m.ingest(person(true, 240.0, 0.0), 30.0);
        assert_eq!(m.state(), FallState::Stable);
        assert!(!m.is_confirmed());
        m.ingest(person(false, 300.0, 30.0), 31.0);
        let second = m.ingest(person(false, 300.0, 0.0), 36.0).incident;
        assert_eq!(second.map(|i| i.id), Some(2));
    }

    #[test]
    fn test_upright_spike_clears_latch_then_later_latch_persists() {
        let mut m = machine();
        // Upright frame clears the latch it just set.
        m.ingest(person(true, 240.0, 30.0), 0.0);
        assert!(!m.high_velocity_latched());

        // A spike on a non-upright frame stays latched after velocity drops.
        m.ingest(person(false, 280.0, 30.0), 0.1);
        assert!(m.high_velocity_latched());
        m.ingest(person(false, 280.0, 0.0), 0.2);
        assert!(m.high_velocity_latched());
        assert_eq!(m.state(), FallState::Unstable);
        assert_eq!(m.unstable_since(), Some(0.1));
    }

    #[test]
    fn test_spike_frame_starts_countdown_as_unstable() {
        let mut m = machine();
        let t = m.ingest(person(false, 280.0, 30.0), 0.0);
        assert_eq!(t.from, FallState::Stable);
        assert_eq!(t.to, FallState::Unstable);
        assert_eq!(m.unstable_since(), Some(0.0));

        // With a countdown running, a second spike keeps Unstable instead of Falling.
        let t = m.ingest(person(false, 320.0, 40.0), 0.5);
        assert_eq!(t.to, FallState::Unstable);
        assert_eq!(m.unstable_since(), Some(0.0));
    }

    #[test]
    fn test_slow_crouch_without_spike_never_confirms() {
        let mut m = machine();
        m.ingest(person(true, 240.0, 0.0), 0.0);
        for i in 1..300 {
            let t = m.ingest(person(false, 240.0 + i as f64 * 0.2, 0.2), i as f64 / FPS);
            assert!(t.incident.is_none());
        }
        assert_eq!(m.state(), FallState::Stable);
        assert!(m.unstable_since().is_none());
    }

    #[test]
    fn test_latch_not_required_starts_on_posture() {
        let mut m = FallStateMachine::new(
            FallConfig {
                latch_required: false,
                confirm_time_secs: 1.0,
                ..FallConfig::default()
            },
            "fall",
        );
        m.ingest(person(false, 300.0, 0.0), 0.0);
        assert_eq!(m.state(), FallState::Unstable);
        assert!(m.ingest(person(false, 300.0, 0.0), 1.0).incident.is_some());
    }

    #[test]
    fn test_stable_records_last_stable_hip() {
        let mut m = machine();
        m.ingest(person(true, 236.0, 0.0), 0.0);
        m.ingest(person(false, 300.0, 0.0), 0.1);
        m.ingest(Observation::NoPerson, 0.2);

        let ctx = m.tracking_context();
        assert_eq!(ctx.last_stable_hip_y, Some(236.0));
        assert_eq!(ctx.previous_hip_y, Some(300.0));
        assert!(!ctx.was_tracking);
    }

    #[test]
    fn test_hold_policy_keeps_timer_through_gap() {
        let mut m = with_policy(TrackingLossPolicy::Hold);
        m.ingest(person(false, 300.0, 30.0), 0.0);
        for i in 1..=30 {
            m.ingest(Observation::NoPerson, i as f64 * 0.1);
        }
        assert_eq!(m.state(), FallState::NoPerson);
        assert_eq!(m.unstable_since(), Some(0.0));

        // Back in view at 4.5 s: gap time counts toward confirmation.
        let t = m.ingest(person(false, 300.0, 0.0), 4.5);
        assert!(t.incident.is_some());
    }

    #[test]
    fn test_pause_policy_excludes_gap() {
        let mut m = with_policy(TrackingLossPolicy::Pause);
        m.ingest(person(false, 300.0, 30.0), 0.0);
        m.ingest(person(false, 300.0, 0.0), 1.0);
        m.ingest(Observation::NoPerson, 1.0);
        m.ingest(Observation::NoPerson, 3.0);

        // Gap of 2 s (1.0 -> 3.0) is added to the start time.
        let t = m.ingest(person(false, 300.0, 0.0), 3.0);
        assert!(t.incident.is_none());
        assert_eq!(m.unstable_since(), Some(2.0));
        assert_eq!(t.to, FallState::Unstable);

        assert!(m.ingest(person(false, 300.0, 0.0), 6.0).incident.is_none());
        assert!(m.ingest(person(false, 300.0, 0.0), 6.5).incident.is_some());
    }

    #[test]
    fn test_reset_policy_drops_candidate() {
        let mut m = with_policy(TrackingLossPolicy::Reset);
        m.ingest(person(false, 300.0, 30.0), 0.0);
        m.ingest(Observation::NoPerson, 1.0);
        assert!(m.unstable_since().is_none());
        assert!(!m.high_velocity_latched());

        // No fresh spike after reacquisition: never confirms.
        for i in 0..100 {
            let t = m.ingest(person(false, 300.0, 0.0), 2.0 + i as f64 * 0.1);
            assert!(t.incident.is_none());
        }
    }

    #[test]
    fn test_confirmed_survives_tracking_gap() {
        let mut m = machine();
        m.ingest(person(false, 300.0, 30.0), 0.0);
        assert!(m.ingest(person(false, 300.0, 0.0), 4.5).incident.is_some());

        m.ingest(Observation::NoPerson, 5.0);
        assert_eq!(m.state(), FallState::NoPerson);

        let t = m.ingest(person(false, 300.0, 0.0), 6.0);
        assert!(t.incident.is_none());
        assert_eq!(t.to, FallState::Confirmed);
    }

    #[test]
    fn test_unstable_elapsed() {
        let mut m = machine();
        assert!(m.unstable_elapsed(1.0).is_none());
        m.ingest(person(false, 300.0, 30.0), 1.0);
        assert_eq!(m.unstable_elapsed(3.0), Some(2.0));
    }

    #[test]
    fn test_reacquired_without_countdown_leaves_no_person() {
        let mut m = machine();
        m.ingest(person(true, 240.0, 0.0), 0.0);
        m.ingest(Observation::NoPerson, 0.1);
        assert_eq!(m.state(), FallState::NoPerson);

        // Back in view seated, no spike: the pre-gap state returns.
        for i in 0..300 {
            let t = m.ingest(person(false, 300.0, 0.0), 0.2 + i as f64 / FPS);
            assert!(t.incident.is_none());
        }
        assert_eq!(m.state(), FallState::Stable);
        assert!(m.unstable_since().is_none());
    }

    #[test]
    fn test_reset_gap_during_countdown_resumes_stable() {
        let mut m = with_policy(TrackingLossPolicy::Reset);
        m.ingest(person(false, 300.0, 30.0), 0.0);
        assert_eq!(m.state(), FallState::Unstable);
        m.ingest(Observation::NoPerson, 1.0);

        let t = m.ingest(person(false, 300.0, 0.0), 2.0);
        assert_eq!(t.from, FallState::NoPerson);
        assert_eq!(t.to, FallState::Stable);
    }
}
