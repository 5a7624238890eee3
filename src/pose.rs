use crate::error::Error;
use num_traits::cast::FromPrimitive;
use ordered_float::NotNan;
use serde::{Deserialize, Serialize};

/// The 33 landmarks of the MediaPipe pose model, in model output order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, num_derive::FromPrimitive)]
#[repr(usize)]
pub enum Landmark {
    Nose,
    LeftEyeInner,
    LeftEye,
    LeftEyeOuter,
    RightEyeInner,
    RightEye,
    RightEyeOuter,
    LeftEar,
    RightEar,
    MouthLeft,
    MouthRight,
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    RightElbow,
    LeftWrist,
    RightWrist,
    LeftPinky,
    RightPinky,
    LeftIndex,
    RightIndex,
    LeftThumb,
    RightThumb,
    LeftHip,
    RightHip,
    LeftKnee,
    RightKnee,
    LeftAnkle,
    RightAnkle,
    LeftHeel,
    RightHeel,
    LeftFootIndex,
    RightFootIndex,
}

pub const NUM_LANDMARKS: usize = 33;

impl Landmark {
    pub fn idx(self) -> usize {
        self as usize
    }

    pub fn from_idx(index: usize) -> Result<Self, Error> {
        Self::from_usize(index).ok_or(Error::ConvertUSizeToLandmark(index))
    }
}

/// A single normalized 2D keypoint with finite coordinates.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawKeypoint")]
pub struct Keypoint {
    x: f32,
    y: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    visibility: Option<f32>,
}

#[derive(Deserialize)]
struct RawKeypoint {
    x: f32,
    y: f32,
    #[serde(default)]
    visibility: Option<f32>,
}

impl TryFrom<RawKeypoint> for Keypoint {
    type Error = Error;

    fn try_from(raw: RawKeypoint) -> Result<Self, Error> {
        Self::new(raw.x, raw.y, raw.visibility)
    }
}

fn finite(value: f32) -> Result<f32, Error> {
    let value = NotNan::new(value)
        .map_err(|e| Error::ConstructNotNan(e, value))?
        .into_inner();
    if value.is_infinite() {
        return Err(Error::InfiniteCoordinate(value));
    }
    Ok(value)
}

impl Keypoint {
    pub fn new(x: f32, y: f32, visibility: Option<f32>) -> Result<Self, Error> {
        Ok(Self {
            x: finite(x)?,
            y: finite(y)?,
            visibility: visibility.map(finite).transpose()?,
        })
    }

    #[inline]
    pub fn x(self) -> f32 {
        self.x
    }

    #[inline]
    pub fn y(self) -> f32 {
        self.y
    }

    #[inline]
    pub fn visibility(self) -> Option<f32> {
        self.visibility
    }

    /// Points without a visibility estimate are treated as visible.
    pub fn is_visible(self, threshold: f32) -> bool {
        self.visibility.map_or(true, |v| v > threshold)
    }

    pub fn squared_distance(self, other: Self) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        dx * dx + dy * dy
    }

    pub fn distance(self, other: Self) -> f32 {
        self.squared_distance(other).sqrt()
    }
}

/// The full ordered set of keypoints for one subject in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeypointSet {
    keypoints: Vec<Keypoint>,
}

impl KeypointSet {
    pub fn new(keypoints: Vec<Keypoint>) -> Self {
        Self { keypoints }
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Keypoint> {
        self.keypoints.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = Keypoint> + '_ {
        self.keypoints.iter().copied()
    }

    /// Interleaved `[x0, y0, x1, y1, ...]`, the layout clients draw from.
    pub fn to_flat(&self) -> Vec<f32> {
        self.keypoints.iter().flat_map(|k| [k.x, k.y]).collect()
    }
}

pub mod constants {
    use super::Landmark::{self, *};

    /// Limbs of the MediaPipe pose skeleton.
    pub const POSE_CONNECTIONS: [(Landmark, Landmark); 35] = [
        (Nose, LeftEyeInner),
        (LeftEyeInner, LeftEye),
        (LeftEye, LeftEyeOuter),
        (LeftEyeOuter, LeftEar),
        (Nose, RightEyeInner),
        (RightEyeInner, RightEye),
        (RightEye, RightEyeOuter),
        (RightEyeOuter, RightEar),
        (MouthLeft, MouthRight),
        (LeftShoulder, RightShoulder),
        (LeftShoulder, LeftElbow),
        (LeftElbow, LeftWrist),
        (LeftWrist, LeftPinky),
        (LeftWrist, LeftIndex),
        (LeftWrist, LeftThumb),
        (LeftPinky, LeftIndex),
        (RightShoulder, RightElbow),
        (RightElbow, RightWrist),
        (RightWrist, RightPinky),
        (RightWrist, RightIndex),
        (RightWrist, RightThumb),
        (RightPinky, RightIndex),
        (LeftShoulder, LeftHip),
        (RightShoulder, RightHip),
        (LeftHip, RightHip),
        (LeftHip, LeftKnee),
        (RightHip, RightKnee),
        (LeftKnee, LeftAnkle),
        (RightKnee, RightAnkle),
        (LeftAnkle, LeftHeel),
        (RightAnkle, RightHeel),
        (LeftHeel, LeftFootIndex),
        (RightHeel, RightFootIndex),
        (LeftAnkle, LeftFootIndex),
        (RightAnkle, RightFootIndex),
    ];

    pub fn pose_topology() -> Vec<(usize, usize)> {
        POSE_CONNECTIONS
            .iter()
            .map(|&(a, b)| (a.idx(), b.idx()))
            .collect()
    }
}
