pub mod geometry;

pub use geometry::*;

use serde::{Deserialize, Serialize};

/// MediaPipe pose topology (33 landmarks). The discriminant is the landmark's
/// position in the estimator's output list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LandmarkKind {
    Nose = 0,
    LeftEyeInner = 1,
    LeftEye = 2,
    LeftEyeOuter = 3,
    RightEyeInner = 4,
    RightEye = 5,
    RightEyeOuter = 6,
    LeftEar = 7,
    RightEar = 8,
    MouthLeft = 9,
    MouthRight = 10,
    LeftShoulder = 11,
    RightShoulder = 12,
    LeftElbow = 13,
    RightElbow = 14,
    LeftWrist = 15,
    RightWrist = 16,
    LeftPinky = 17,
    RightPinky = 18,
    LeftIndex = 19,
    RightIndex = 20,
    LeftThumb = 21,
    RightThumb = 22,
    LeftHip = 23,
    RightHip = 24,
    LeftKnee = 25,
    RightKnee = 26,
    LeftAnkle = 27,
    RightAnkle = 28,
    LeftHeel = 29,
    RightHeel = 30,
    LeftFootIndex = 31,
    RightFootIndex = 32,
}

pub const NUM_LANDMARKS: usize = 33;

impl LandmarkKind {
    pub fn idx(self) -> usize {
        self as usize
    }
}

/// Joints the posture classifier cannot work without.
pub const REQUIRED_LANDMARKS: [LandmarkKind; 9] = [
    LandmarkKind::Nose,
    LandmarkKind::LeftShoulder,
    LandmarkKind::RightShoulder,
    LandmarkKind::LeftHip,
    LandmarkKind::RightHip,
    LandmarkKind::LeftKnee,
    LandmarkKind::RightKnee,
    LandmarkKind::LeftAnkle,
    LandmarkKind::RightAnkle,
];

/// A single landmark in normalized image coordinates ([0, 1] of frame width/height).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub visibility: Option<f64>,
}

impl Landmark {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            visibility: None,
        }
    }

    pub fn point(&self) -> Point2 {
        Point2::new(self.x, self.y)
    }
}

/// One detected person for one frame.
///
/// Only constructible when every joint in [`REQUIRED_LANDMARKS`] is present, so
/// the classifier never has to deal with a partial skeleton.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PoseSample {
    pub nose: Landmark,
    pub left_shoulder: Landmark,
    pub right_shoulder: Landmark,
    pub left_hip: Landmark,
    pub right_hip: Landmark,
    pub left_knee: Landmark,
    pub right_knee: Landmark,
    pub left_ankle: Landmark,
    pub right_ankle: Landmark,
    /// Every landmark the estimator returned, used for the body bounding box.
    pub all: Vec<Landmark>,
}

impl PoseSample {
    /// Build a sample from an estimator list indexed by [`LandmarkKind`].
    pub fn from_landmarks(landmarks: Vec<Landmark>) -> Option<Self> {
        let get = |kind: LandmarkKind| landmarks.get(kind.idx()).copied();

        Some(Self {
            nose: get(LandmarkKind::Nose)?,
            left_shoulder: get(LandmarkKind::LeftShoulder)?,
            right_shoulder: get(LandmarkKind::RightShoulder)?,
            left_hip: get(LandmarkKind::LeftHip)?,
            right_hip: get(LandmarkKind::RightHip)?,
            left_knee: get(LandmarkKind::LeftKnee)?,
            right_knee: get(LandmarkKind::RightKnee)?,
            left_ankle: get(LandmarkKind::LeftAnkle)?,
            right_ankle: get(LandmarkKind::RightAnkle)?,
            all: landmarks,
        })
    }

    pub fn required(&self) -> [&Landmark; 9] {
        [
            &self.nose,
            &self.left_shoulder,
            &self.right_shoulder,
            &self.left_hip,
            &self.right_hip,
            &self.left_knee,
            &self.right_knee,
            &self.left_ankle,
            &self.right_ankle,
        ]
    }

    /// Mean visibility over the required joints. Landmarks without a score count as fully visible.
    pub fn mean_visibility(&self) -> f64 {
        let joints = self.required();
        let total: f64 = joints.iter().map(|lm| lm.visibility.unwrap_or(1.0)).sum();
        total / joints.len() as f64
    }

    pub fn hip_mid(&self) -> Point2 {
        self.left_hip.point().midpoint(&self.right_hip.point())
    }

    pub fn shoulder_mid(&self) -> Point2 {
        self.left_shoulder.point().midpoint(&self.right_shoulder.point())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// One acquired frame. `landmarks` is filled when an external estimator already
/// processed the image; `image` holds the encoded JPEG when the source provides one.
#[derive(Clone, Debug)]
pub struct Frame {
    pub index: u64,
    pub timestamp: f64,
    pub size: FrameSize,
    pub landmarks: Option<Vec<Landmark>>,
    pub image: Option<Vec<u8>>,
}
