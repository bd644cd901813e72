#![warn(clippy::all)]
//! Frame-to-frame feature tracking and geometric verification for a
//! visual(-inertial) odometry frontend.
//!
//! Poses follow the `ref_T_cur` convention: a point expressed in the current
//! camera maps into the reference camera as `p_ref = R * p_cur + t`.

pub mod camera;
mod channel;
pub mod config;
mod diagnostics;
pub mod features;
pub mod frame;
pub mod geometry;
pub mod mask;
pub mod matching;
pub mod predictor;
pub mod ransac;
pub mod stereo;
mod tracker;
#[cfg(feature = "rerun")]
mod viz;

#[cfg(test)]
mod test_helpers;

pub use camera::{CameraError, PinholeCamera, StereoCamera};
pub use channel::{
    bounded_channel, ChannelCapacity, ChannelCapacityError, ChannelStats, ChannelStatsHandle,
    DropPolicy, DropReceiver, DropSender, SendOutcome,
};
pub use config::{DetectorParams, ParamsError, RansacParams, StereoParams, TrackerParams};
pub use diagnostics::{DebugTrackerInfo, KeypointStatusCounts};
pub use features::{DetectedFeature, FeatureDetector, FlowRefiner};
pub use frame::{Frame, FrameError, StereoFrame};
pub use matching::{compute_median_disparity, find_outliers, match_mono, match_stereo};
pub use predictor::{
    CorrespondencePredictor, ExternalFlowPredictor, NoMotionPredictor, PredictorKind,
    RotationalPredictor,
};
pub use stereo::{get_point3_and_covariance, TriangulationError};
pub use tracker::{Tracker, TrackerError, TrackerImagePacket};
#[cfg(feature = "rerun")]
pub use viz::{RerunSink, VizDecimation, VizDecimationError, VizLogError};

/// Relative rigid transform `ref_T_cur`.
pub type Pose = nalgebra::Isometry3<f64>;

#[derive(Clone, Copy, PartialEq, Eq, Debug, PartialOrd, Ord, Hash)]
pub struct FrameId(u64);

impl FrameId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, PartialOrd, Ord)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn from_nanos(ns: i64) -> Self {
        Self(ns)
    }

    pub fn as_nanos(&self) -> i64 {
        self.0
    }
}

/// Identity of a tracked scene point. Minted once by a [`Tracker`] and never reused.
#[derive(Clone, Copy, PartialEq, Eq, Debug, PartialOrd, Ord, Hash)]
pub struct LandmarkId(u64);

impl LandmarkId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Pixel coordinate in a (rectified) image.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Keypoint {
    pub x: f64,
    pub y: f64,
}

impl Keypoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Keypoint) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoredKeypoint {
    pub keypoint: Keypoint,
    pub score: f64,
}

/// Index pair into a reference and a current keypoint set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KeypointMatch {
    pub ref_idx: usize,
    pub cur_idx: usize,
}

impl KeypointMatch {
    pub fn new(ref_idx: usize, cur_idx: usize) -> Self {
        Self { ref_idx, cur_idx }
    }
}

/// Outcome of one geometric estimation attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrackingStatus {
    Valid,
    FewMatches,
    LowDisparity,
    Invalid,
    Disabled,
}

impl TrackingStatus {
    pub fn is_valid(self) -> bool {
        matches!(self, TrackingStatus::Valid)
    }
}

/// Stereo status of one left keypoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeypointStatus {
    Valid,
    NoLeftRect,
    NoRightRect,
    NoDepth,
    FailedArun,
}
