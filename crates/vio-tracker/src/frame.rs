//! Per-frame feature containers.
//!
//! A [`Frame`] stores index-aligned keypoints, landmark ids, ages and scores.
//! Landmark ids are unique within a frame. A [`StereoFrame`] adds right-image
//! observations and stereo status aligned with the left frame.

use std::collections::HashSet;
use std::sync::Arc;

use image::GrayImage;
use nalgebra::Vector3;
use thiserror::Error;

use crate::camera::StereoCamera;
use crate::config::StereoParams;
use crate::features::DetectedFeature;
use crate::stereo::triangulate_rectified;
use crate::{FrameId, Keypoint, KeypointStatus, LandmarkId, Timestamp};

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("{field} has {actual} entries, expected {expected}")]
    LenMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("landmark {landmark:?} appears more than once")]
    DuplicateLandmark { landmark: LandmarkId },
}

#[derive(Clone, Debug)]
pub struct Frame {
    id: FrameId,
    timestamp: Timestamp,
    image: Arc<GrayImage>,
    keypoints: Vec<Keypoint>,
    landmarks: Vec<LandmarkId>,
    ages: Vec<u32>,
    scores: Vec<f64>,
}

impl Frame {
    pub fn new(id: FrameId, timestamp: Timestamp, image: Arc<GrayImage>) -> Self {
        Self {
            id,
            timestamp,
            image,
            keypoints: Vec::new(),
            landmarks: Vec::new(),
            ages: Vec::new(),
            scores: Vec::new(),
        }
    }

    /// Frame with previously established observations, each of age 1 and score 0.
    pub fn from_observations(
        id: FrameId,
        timestamp: Timestamp,
        image: Arc<GrayImage>,
        keypoints: Vec<Keypoint>,
        landmarks: Vec<LandmarkId>,
    ) -> Result<Self, FrameError> {
        if landmarks.len() != keypoints.len() {
            return Err(FrameError::LenMismatch {
                field: "landmarks",
                expected: keypoints.len(),
                actual: landmarks.len(),
            });
        }
        ensure_unique(&landmarks)?;
        let n = keypoints.len();
        Ok(Self {
            id,
            timestamp,
            image,
            keypoints,
            landmarks,
            ages: vec![1; n],
            scores: vec![0.0; n],
        })
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    pub fn keypoints(&self) -> &[Keypoint] {
        &self.keypoints
    }

    pub fn landmarks(&self) -> &[LandmarkId] {
        &self.landmarks
    }

    /// Number of consecutive frames each landmark has been observed in.
    pub fn ages(&self) -> &[u32] {
        &self.ages
    }

    pub fn scores(&self) -> &[f64] {
        &self.scores
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    /// Appends new detections. Fails without modifying the frame if any
    /// landmark is already present.
    pub fn merge_detections(&mut self, detections: &[DetectedFeature]) -> Result<(), FrameError> {
        let mut seen: HashSet<LandmarkId> = self.landmarks.iter().copied().collect();
        for det in detections {
            if !seen.insert(det.landmark) {
                return Err(FrameError::DuplicateLandmark {
                    landmark: det.landmark,
                });
            }
        }
        for det in detections {
            self.push_feature(det.keypoint.keypoint, det.landmark, 1, det.keypoint.score);
        }
        Ok(())
    }

    pub(crate) fn clear_features(&mut self) {
        self.keypoints.clear();
        self.landmarks.clear();
        self.ages.clear();
        self.scores.clear();
    }

    /// Caller guarantees `landmark` is not yet in the frame.
    pub(crate) fn push_feature(&mut self, keypoint: Keypoint, landmark: LandmarkId, age: u32, score: f64) {
        debug_assert!(!self.landmarks.contains(&landmark));
        self.keypoints.push(keypoint);
        self.landmarks.push(landmark);
        self.ages.push(age);
        self.scores.push(score);
    }

    /// Keeps entries whose `keep` flag is set, preserving order.
    pub(crate) fn retain_flags(&mut self, keep: &[bool]) {
        debug_assert_eq!(keep.len(), self.len());
        self.keypoints = select(&self.keypoints, keep);
        self.landmarks = select(&self.landmarks, keep);
        self.ages = select(&self.ages, keep);
        self.scores = select(&self.scores, keep);
    }
}

fn ensure_unique(landmarks: &[LandmarkId]) -> Result<(), FrameError> {
    let mut seen = HashSet::with_capacity(landmarks.len());
    for &landmark in landmarks {
        if !seen.insert(landmark) {
            return Err(FrameError::DuplicateLandmark { landmark });
        }
    }
    Ok(())
}

fn select<T: Clone>(values: &[T], keep: &[bool]) -> Vec<T> {
    values
        .iter()
        .zip(keep)
        .filter(|(_, k)| **k)
        .map(|(v, _)| v.clone())
        .collect()
}

/// Rectified stereo observation of a left [`Frame`].
#[derive(Clone, Debug)]
pub struct StereoFrame {
    left: Frame,
    camera: StereoCamera,
    right_keypoints: Vec<Option<Keypoint>>,
    status: Vec<KeypointStatus>,
    depths: Vec<Option<f64>>,
    points: Vec<Option<Vector3<f64>>>,
}

impl StereoFrame {
    /// Classifies each left keypoint against its right observation and
    /// triangulates the valid ones.
    pub fn from_rectified(
        left: Frame,
        right_keypoints: Vec<Option<Keypoint>>,
        camera: StereoCamera,
        params: &StereoParams,
    ) -> Result<Self, FrameError> {
        if right_keypoints.len() != left.len() {
            return Err(FrameError::LenMismatch {
                field: "right_keypoints",
                expected: left.len(),
                actual: right_keypoints.len(),
            });
        }
        let n = left.len();
        let mut status = Vec::with_capacity(n);
        let mut depths = Vec::with_capacity(n);
        let mut points = Vec::with_capacity(n);
        for (left_kp, right_kp) in left.keypoints().iter().zip(&right_keypoints) {
            let (s, point) = classify(&camera, params, left_kp, right_kp.as_ref());
            status.push(s);
            depths.push(point.map(|p| p.z));
            points.push(point);
        }
        Ok(Self {
            left,
            camera,
            right_keypoints,
            status,
            depths,
            points,
        })
    }

    pub fn left(&self) -> &Frame {
        &self.left
    }

    pub fn camera(&self) -> &StereoCamera {
        &self.camera
    }

    pub fn right_keypoints(&self) -> &[Option<Keypoint>] {
        &self.right_keypoints
    }

    pub fn status(&self) -> &[KeypointStatus] {
        &self.status
    }

    pub fn depths(&self) -> &[Option<f64>] {
        &self.depths
    }

    /// Left-camera 3D points of `Valid` keypoints.
    pub fn points(&self) -> &[Option<Vector3<f64>>] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.left.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }

    pub(crate) fn retain_flags(&mut self, keep: &[bool]) {
        self.left.retain_flags(keep);
        self.right_keypoints = select(&self.right_keypoints, keep);
        self.status = select(&self.status, keep);
        self.depths = select(&self.depths, keep);
        self.points = select(&self.points, keep);
    }
}

fn classify(
    camera: &StereoCamera,
    params: &StereoParams,
    left: &Keypoint,
    right: Option<&Keypoint>,
) -> (KeypointStatus, Option<Vector3<f64>>) {
    if !camera.left().contains(left) {
        return (KeypointStatus::NoLeftRect, None);
    }
    let Some(right) = right.filter(|r| r.is_finite()) else {
        return (KeypointStatus::NoRightRect, None);
    };
    if (left.y - right.y).abs() > params.max_epipolar_error_px {
        return (KeypointStatus::NoRightRect, None);
    }
    if left.x - right.x < params.min_disparity_px.max(f64::EPSILON) {
        return (KeypointStatus::NoDepth, None);
    }
    match triangulate_rectified(camera, left, right) {
        Some(point) if point.z <= params.max_depth_m => (KeypointStatus::Valid, Some(point)),
        _ => (KeypointStatus::NoDepth, None),
    }
}
