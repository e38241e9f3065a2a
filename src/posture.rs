use serde::{Deserialize, Serialize};

use crate::types::{
    angle_from_horizontal_deg, angle_from_up_deg, extent, FrameSize, Point2, PoseSample,
};

/// Posture rule set. The two formulations come from different field trials and
/// are kept apart: pick one, never mix thresholds across them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PosturePolicy {
    /// Upright when the torso is near vertical and the body box is tall and narrow.
    AngleAspect {
        torso_vertical_deg: f64,
        aspect_ratio_upright: f64,
    },
    /// Fallen when the hips are low and either the hips dropped fast or the
    /// trunk is horizontal with the head low. Heights are normalized [0, 1].
    TrunkLegHead {
        trunk_horizontal_deg: f64,
        low_posture_y: f64,
        head_low_y: f64,
        fast_drop_px: f64,
    },
}

impl PosturePolicy {
    pub fn angle_aspect() -> Self {
        PosturePolicy::AngleAspect {
            torso_vertical_deg: 70.0,
            aspect_ratio_upright: 1.2,
        }
    }

    pub fn trunk_leg_head() -> Self {
        PosturePolicy::TrunkLegHead {
            trunk_horizontal_deg: 35.0,
            low_posture_y: 0.65,
            head_low_y: 0.7,
            fast_drop_px: 5.0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PosturePolicy::AngleAspect { .. } => "angle_aspect",
            PosturePolicy::TrunkLegHead { .. } => "trunk_leg_head",
        }
    }
}

impl Default for PosturePolicy {
    fn default() -> Self {
        Self::angle_aspect()
    }
}

/// Hip tracking history the classifier needs to compute velocity.
/// Owned by the state machine, passed in by value each frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TrackingContext {
    pub previous_hip_y: Option<f64>,
    /// Right hip height on the last person frame, pixels.
    pub previous_right_hip_y: Option<f64>,
    pub last_stable_hip_y: Option<f64>,
    pub was_tracking: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PostureFeatures {
    pub torso_angle_deg: f64,
    pub aspect_ratio: f64,
    pub hip_mid_y: f64,          // pixels
    pub vertical_velocity: f64,  // pixels/frame, positive = moving down
    pub right_hip_y: f64,        // pixels
    pub right_hip_velocity: f64, // pixels/frame against the last person frame
    pub trunk_angle_deg: f64,    // right hip -> right shoulder vs. up
    pub leg_angle_deg: f64,      // right knee -> right ankle vs. up
    pub hip_y_norm: f64,
    pub nose_y_norm: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PostureJudgment {
    pub features: PostureFeatures,
    pub is_upright: bool,
    /// First person frame after a gap with nobody in view.
    pub reacquired: bool,
}

pub struct PostureClassifier {
    policy: PosturePolicy,
}

impl PostureClassifier {
    pub fn new(policy: PosturePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PosturePolicy {
        &self.policy
    }

    pub fn classify(
        &self,
        sample: &PoseSample,
        size: FrameSize,
        ctx: TrackingContext,
    ) -> PostureJudgment {
        let features = compute_features(sample, size, ctx);
        PostureJudgment {
            features,
            is_upright: self.is_upright(&features),
            reacquired: !ctx.was_tracking,
        }
    }

    fn is_upright(&self, f: &PostureFeatures) -> bool {
        match self.policy {
            PosturePolicy::AngleAspect {
                torso_vertical_deg,
                aspect_ratio_upright,
            } => f.torso_angle_deg > torso_vertical_deg && f.aspect_ratio > aspect_ratio_upright,
            PosturePolicy::TrunkLegHead {
                trunk_horizontal_deg,
                low_posture_y,
                head_low_y,
                fast_drop_px,
            } => {
                let fast_drop = f.right_hip_velocity.abs() > fast_drop_px;
                let low_posture = f.hip_y_norm > low_posture_y;
                let trunk_horizontal = f.trunk_angle_deg > trunk_horizontal_deg;
                let head_low = f.nose_y_norm > head_low_y;

                let fallen = (fast_drop && low_posture) || (low_posture && trunk_horizontal && head_low);
                !fallen
            }
        }
    }
}

/// Velocity is measured against the last stable hip height when tracking was
/// just reacquired, so the gap itself does not look like a drop.
pub fn compute_features(sample: &PoseSample, size: FrameSize, ctx: TrackingContext) -> PostureFeatures {
    let width = f64::from(size.width);
    let height = f64::from(size.height);

    let hip_mid = sample.hip_mid();
    let shoulder_mid = sample.shoulder_mid();
    let hip_mid_y = hip_mid.y * height;

    let reference = match (ctx.was_tracking, ctx.last_stable_hip_y) {
        (false, Some(stable)) => Some(stable),
        _ => ctx.previous_hip_y,
    };
    let vertical_velocity = reference.map(|prev| hip_mid_y - prev).unwrap_or(0.0);

    let right_hip_y = sample.right_hip.y * height;
    let right_hip_velocity = ctx
        .previous_right_hip_y
        .map(|prev| right_hip_y - prev)
        .unwrap_or(0.0);

    let torso_angle_deg = angle_from_horizontal_deg(shoulder_mid.to(&hip_mid));

    let aspect_ratio = extent(
        sample
            .all
            .iter()
            .map(|lm| Point2::new(lm.x * width, lm.y * height)),
    )
    .map(|(w, h)| if w > 0.0 { h / w } else { 0.0 })
    .unwrap_or(0.0);

    let trunk_angle_deg = angle_from_up_deg(sample.right_hip.point().to(&sample.right_shoulder.point()));
    let leg_angle_deg = angle_from_up_deg(sample.right_knee.point().to(&sample.right_ankle.point()));

    PostureFeatures {
        torso_angle_deg,
        aspect_ratio,
        hip_mid_y,
        vertical_velocity,
        right_hip_y,
        right_hip_velocity,
        trunk_angle_deg,
        leg_angle_deg,
        hip_y_norm: sample.right_hip.y,
        nose_y_norm: sample.nose.y,
    }
}
