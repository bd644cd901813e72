use std::collections::{HashMap, HashSet};
use std::time::Instant;

use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_circle_mut, draw_line_segment_mut};
use nalgebra::{Isometry3, Matrix3, Rotation3, Translation3, UnitQuaternion, Vector3};
use thiserror::Error;
use tracing::debug;

use crate::camera::PinholeCamera;
use crate::channel::{DropSender, SendOutcome};
use crate::config::{ParamsError, TrackerParams};
use crate::diagnostics::{DebugTrackerInfo, KeypointStatusCounts};
use crate::features::{DetectedFeature, FeatureDetector, FlowRefiner};
use crate::frame::{Frame, FrameError, StereoFrame};
use crate::geometry::{
    decompose_essential, ArunEstimator, BearingPair, EssentialEstimator, PointPair,
    TranslationGivenRotation, TranslationVote, TranslationVoting,
};
use crate::mask;
use crate::matching::{compute_median_disparity, match_mono, match_stereo};
use crate::predictor::CorrespondencePredictor;
use crate::ransac::ransac;
use crate::stereo::get_point3_and_covariance;
use crate::{
    FrameId, Keypoint, KeypointMatch, KeypointStatus, LandmarkId, Pose, ScoredKeypoint,
    Timestamp, TrackingStatus,
};

const TRACKED_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const NEW_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const GRAY_COLOR: Rgb<u8> = Rgb([128, 128, 128]);
const BLUE_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
const MARKER_RADIUS: i32 = 4;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Params(#[from] ParamsError),
    #[error("camera mask is {actual:?}, expected {expected:?}")]
    MaskSize {
        expected: (u32, u32),
        actual: (u32, u32),
    },
}

/// Annotated tracking image handed to an external display.
#[derive(Clone, Debug)]
pub struct TrackerImagePacket {
    pub frame_id: FrameId,
    pub timestamp: Timestamp,
    pub image: RgbImage,
}

/// Frame-to-frame feature tracker and geometric verifier.
///
/// Owns the landmark id counter: ids start at zero (or the value passed to
/// [`Tracker::with_landmark_count`]) and only ever increase. A tracker is not
/// shareable between threads without external serialization.
pub struct Tracker {
    params: TrackerParams,
    camera: PinholeCamera,
    landmark_count: u64,
    predictor: Box<dyn CorrespondencePredictor>,
    detector: Box<dyn FeatureDetector>,
    flow: Box<dyn FlowRefiner>,
    camera_mask: GrayImage,
    detection_mask: GrayImage,
    debug_info: DebugTrackerInfo,
    display_queue: Option<DropSender<TrackerImagePacket>>,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("landmark_count", &self.landmark_count)
            .field("camera", &self.camera)
            .field("has_display_queue", &self.display_queue.is_some())
            .finish_non_exhaustive()
    }
}

impl Tracker {
    pub fn new(
        params: TrackerParams,
        camera: PinholeCamera,
        detector: Box<dyn FeatureDetector>,
        flow: Box<dyn FlowRefiner>,
    ) -> Result<Self, TrackerError> {
        params.validate()?;
        let predictor = params.predictor.build(camera);
        let camera_mask = mask::open_mask(camera.width(), camera.height());
        Ok(Self {
            params,
            camera,
            landmark_count: 0,
            predictor,
            detector,
            flow,
            detection_mask: camera_mask.clone(),
            camera_mask,
            debug_info: DebugTrackerInfo::default(),
            display_queue: None,
        })
    }

    /// Resumes id assignment at `next_landmark`.
    pub fn with_landmark_count(mut self, next_landmark: u64) -> Self {
        self.landmark_count = next_landmark;
        self
    }

    pub fn with_predictor(mut self, predictor: Box<dyn CorrespondencePredictor>) -> Self {
        self.predictor = predictor;
        self
    }

    pub fn with_display_queue(mut self, queue: DropSender<TrackerImagePacket>) -> Self {
        self.display_queue = Some(queue);
        self
    }

    /// Static region of interest; zero pixels are never tracked into or detected in.
    pub fn with_camera_mask(mut self, camera_mask: GrayImage) -> Result<Self, TrackerError> {
        let expected = (self.camera.width(), self.camera.height());
        let actual = camera_mask.dimensions();
        if expected != actual {
            return Err(TrackerError::MaskSize { expected, actual });
        }
        self.detection_mask = camera_mask.clone();
        self.camera_mask = camera_mask;
        Ok(self)
    }

    pub fn params(&self) -> &TrackerParams {
        &self.params
    }

    /// Id the next detected landmark will receive.
    pub fn landmark_count(&self) -> u64 {
        self.landmark_count
    }

    /// Exclusion mask around the live keypoints as of the most recent
    /// [`Tracker::track`] or [`Tracker::feature_detection`]. Outlier removal
    /// does not refresh it.
    pub fn detection_mask(&self) -> &GrayImage {
        &self.detection_mask
    }

    pub fn debug_info(&self) -> DebugTrackerInfo {
        self.debug_info.clone()
    }

    /// Replaces `current`'s features with the landmarks of `reference` that
    /// survive prediction and refinement. No ids are minted.
    pub fn track(&mut self, reference: &Frame, current: &mut Frame, rotation: &Rotation3<f64>) {
        let start = Instant::now();
        current.clear_features();

        let refined = if reference.is_empty() {
            Vec::new()
        } else {
            let predicted = self.predictor.predict(reference.keypoints(), rotation);
            self.flow.refine(
                reference.image(),
                current.image(),
                reference.keypoints(),
                &predicted,
            )
        };
        if refined.len() != reference.len() {
            tracing::warn!(
                expected = reference.len(),
                actual = refined.len(),
                "flow refiner returned wrong length, missing points are dropped"
            );
        }

        let mut dropped_age = 0;
        let mut dropped_flow = 0;
        for (i, &landmark) in reference.landmarks().iter().enumerate() {
            let age = reference.ages()[i];
            if age >= self.params.max_feature_age {
                dropped_age += 1;
                continue;
            }
            match refined.get(i).copied().flatten() {
                Some(kp) if self.camera.contains(&kp) && mask::is_open(&self.camera_mask, &kp) => {
                    current.push_feature(kp, landmark, age.saturating_add(1), reference.scores()[i]);
                }
                _ => dropped_flow += 1,
            }
        }

        self.detection_mask = mask::exclusion_mask(
            &self.camera_mask,
            current.keypoints(),
            self.params.detector.min_distance_px,
        );

        self.debug_info.nr_tracked = current.len();
        self.debug_info.nr_dropped_age = dropped_age;
        self.debug_info.nr_dropped_flow = dropped_flow;
        self.debug_info.feature_tracking_time = start.elapsed();
        debug!(
            frame = current.id().as_u64(),
            tracked = current.len(),
            dropped_age,
            dropped_flow,
            "tracked features"
        );

        self.publish_tracker_image(reference, current);
    }

    /// Detects up to `target_count` new points where `mask` is open and
    /// assigns each a fresh landmark id. `frame` is left untouched.
    pub fn detect(
        &mut self,
        frame: &Frame,
        mask: &GrayImage,
        target_count: usize,
    ) -> Vec<DetectedFeature> {
        let max_corners = target_count.min(self.params.detector.max_corners);
        if max_corners == 0 {
            return Vec::new();
        }
        let candidates = self
            .detector
            .detect(frame.image(), mask, &self.params.detector, max_corners);
        let selection_start = Instant::now();
        let accepted: Vec<ScoredKeypoint> = candidates
            .into_iter()
            .filter(|c| self.camera.contains(&c.keypoint) && mask::is_open(mask, &c.keypoint))
            .take(max_corners)
            .collect();
        self.debug_info.feature_selection_time = selection_start.elapsed();
        accepted
            .into_iter()
            .map(|keypoint| DetectedFeature {
                landmark: self.mint_landmark(),
                keypoint,
            })
            .collect()
    }

    /// Tops `frame` up to `max_features_per_frame` with detections away from
    /// its live keypoints. Returns the number of features added.
    pub fn feature_detection(&mut self, frame: &mut Frame) -> Result<usize, FrameError> {
        let start = Instant::now();
        let radius = self.params.detector.min_distance_px;
        let mask = mask::exclusion_mask(&self.camera_mask, frame.keypoints(), radius);
        let need = self.params.max_features_per_frame.saturating_sub(frame.len());
        let detected = self.detect(frame, &mask, need);
        frame.merge_detections(&detected)?;
        self.detection_mask = mask::exclusion_mask(&self.camera_mask, frame.keypoints(), radius);

        self.debug_info.need_n_corners = need;
        self.debug_info.extracted_corners = detected.len();
        self.debug_info.nr_keypoints = frame.len();
        self.debug_info.feature_detection_time = start.elapsed();
        debug!(
            frame = frame.id().as_u64(),
            need,
            extracted = detected.len(),
            total = frame.len(),
            "detected features"
        );
        Ok(detected.len())
    }

    /// Five-DoF relative pose from 2D-2D correspondences; translation has unit norm.
    pub fn geometric_outlier_rejection_mono(
        &mut self,
        reference: &mut Frame,
        current: &mut Frame,
    ) -> (TrackingStatus, Pose) {
        self.mono_rejection(reference, current, None)
    }

    /// Translation direction with the rotation fixed to `rotation`.
    pub fn geometric_outlier_rejection_mono_given_rotation(
        &mut self,
        reference: &mut Frame,
        current: &mut Frame,
        rotation: &Rotation3<f64>,
    ) -> (TrackingStatus, Pose) {
        self.mono_rejection(reference, current, Some(rotation))
    }

    fn mono_rejection(
        &mut self,
        reference: &mut Frame,
        current: &mut Frame,
        rotation: Option<&Rotation3<f64>>,
    ) -> (TrackingStatus, Pose) {
        if !self.params.enable_outlier_rejection {
            return (TrackingStatus::Disabled, Pose::identity());
        }
        let start = Instant::now();
        let mut matches = match_mono(reference, current);
        self.debug_info.nr_mono_putatives = matches.len();
        self.debug_info.nr_mono_inliers = 0;
        self.debug_info.mono_ransac_iters = 0;
        if matches.len() < self.params.min_matches_mono.get() {
            debug!(matches = matches.len(), "mono rejection: too few matches");
            return (TrackingStatus::FewMatches, Pose::identity());
        }

        let data: Vec<BearingPair> = matches
            .iter()
            .map(|m| BearingPair {
                reference: self.camera.ray(&reference.keypoints()[m.ref_idx]),
                current: self.camera.ray(&current.keypoints()[m.cur_idx]),
            })
            .collect();
        let opts = self.params.ransac_mono.options();
        let (pose, inliers, iterations) = match rotation {
            None => {
                let result = ransac(&EssentialEstimator, &data, &opts);
                let pose = result
                    .model
                    .as_ref()
                    .and_then(|e| decompose_essential(e, &data, &result.inliers))
                    .map(|(r, t)| make_pose(&r, t));
                (pose, result.inliers, result.iterations)
            }
            Some(rotation) => {
                let estimator = TranslationGivenRotation::new(rotation);
                let result = ransac(&estimator, &data, &opts);
                let pose = result.model.map(|t| {
                    make_pose(rotation, estimator.resolve_sign(&t, &data, &result.inliers))
                });
                (pose, result.inliers, result.iterations)
            }
        };
        self.debug_info.mono_ransac_iters = iterations;
        self.debug_info.mono_ransac_time = start.elapsed();

        let Some(pose) = pose else {
            debug!(matches = matches.len(), iterations, "mono rejection: no model");
            return (TrackingStatus::Invalid, Pose::identity());
        };
        self.debug_info.nr_mono_inliers = inliers.len();
        if !self.inlier_ratio_ok(inliers.len(), matches.len()) {
            debug!(
                matches = matches.len(),
                inliers = inliers.len(),
                "mono rejection: inlier ratio too low"
            );
            return (TrackingStatus::Invalid, pose);
        }

        let inlier_matches: Vec<KeypointMatch> = inliers.iter().map(|&k| matches[k]).collect();
        let disparity =
            compute_median_disparity(reference.keypoints(), current.keypoints(), &inlier_matches);
        let status = match disparity {
            Some(d) if d >= self.params.disparity_threshold_px => TrackingStatus::Valid,
            _ => TrackingStatus::LowDisparity,
        };
        Self::remove_outliers_mono(&inliers, reference, current, &mut matches);
        debug!(
            ?status,
            matches = inlier_matches.len(),
            iterations,
            "mono rejection finished"
        );
        (status, pose)
    }

    /// Rigid 3D-3D alignment of triangulated stereo points.
    pub fn geometric_outlier_rejection_stereo(
        &mut self,
        reference: &mut StereoFrame,
        current: &mut StereoFrame,
    ) -> (TrackingStatus, Pose) {
        let mut matches = match self.stereo_precheck(reference, current) {
            Ok(matches) => matches,
            Err(status) => return (status, Pose::identity()),
        };
        let start = Instant::now();

        let data: Vec<PointPair> = matches
            .iter()
            .filter_map(|m| {
                Some(PointPair {
                    reference: reference.points()[m.ref_idx]?,
                    current: current.points()[m.cur_idx]?,
                })
            })
            .collect();
        debug_assert_eq!(data.len(), matches.len());

        let result = ransac(&ArunEstimator, &data, &self.params.ransac_stereo.options());
        self.debug_info.stereo_ransac_iters = result.iterations;
        self.debug_info.stereo_ransac_time = start.elapsed();
        let Some(pose) = result.model else {
            return (TrackingStatus::Invalid, Pose::identity());
        };
        self.debug_info.nr_stereo_inliers = result.inliers.len();
        if !self.inlier_ratio_ok(result.inliers.len(), matches.len()) {
            debug!(
                matches = matches.len(),
                inliers = result.inliers.len(),
                "stereo rejection: inlier ratio too low"
            );
            return (TrackingStatus::Invalid, pose);
        }
        Self::remove_outliers_stereo(&result.inliers, reference, current, &mut matches);
        debug!(
            matches = matches.len(),
            iterations = result.iterations,
            "stereo rejection finished"
        );
        (TrackingStatus::Valid, pose)
    }

    /// Translation-only stereo solve under a rotation prior. Also returns the
    /// 3x3 covariance of the translation (zero unless the status is `Valid`).
    pub fn geometric_outlier_rejection_stereo_given_rotation(
        &mut self,
        reference: &mut StereoFrame,
        current: &mut StereoFrame,
        rotation: &Rotation3<f64>,
    ) -> ((TrackingStatus, Pose), Matrix3<f64>) {
        let mut matches = match self.stereo_precheck(reference, current) {
            Ok(matches) => matches,
            Err(status) => return ((status, Pose::identity()), Matrix3::zeros()),
        };
        let start = Instant::now();

        let sigma = self.params.stereo.pixel_sigma_px;
        let measurement = Matrix3::identity() * (sigma * sigma);
        let ref_camera = *reference.camera();
        let cur_camera = *current.camera();
        let (matches_used, votes): (Vec<KeypointMatch>, Vec<TranslationVote>) = matches
            .iter()
            .filter_map(|m| {
                let (p_ref, cov_ref) =
                    get_point3_and_covariance(reference, &ref_camera, m.ref_idx, &measurement, None)
                        .ok()?;
                let (p_cur, cov_cur) = get_point3_and_covariance(
                    current,
                    &cur_camera,
                    m.cur_idx,
                    &measurement,
                    Some(rotation),
                )
                .ok()?;
                let vote = TranslationVote {
                    translation: p_ref - rotation * p_cur,
                    covariance: cov_ref + cov_cur,
                };
                Some((*m, vote))
            })
            .unzip();
        matches = matches_used;

        let opts = self
            .params
            .ransac_stereo
            .options_with_threshold(self.params.stereo_rotation_chi2_threshold);
        let result = ransac(&TranslationVoting, &votes, &opts);
        self.debug_info.stereo_ransac_iters = result.iterations;
        self.debug_info.stereo_ransac_time = start.elapsed();
        let Some(estimate) = result.model else {
            return ((TrackingStatus::Invalid, Pose::identity()), Matrix3::zeros());
        };
        let pose = make_pose(rotation, estimate.translation);
        self.debug_info.nr_stereo_inliers = result.inliers.len();
        if !self.inlier_ratio_ok(result.inliers.len(), matches.len()) {
            debug!(
                matches = matches.len(),
                inliers = result.inliers.len(),
                "stereo rejection given rotation: inlier ratio too low"
            );
            return ((TrackingStatus::Invalid, pose), Matrix3::zeros());
        }
        Self::remove_outliers_stereo(&result.inliers, reference, current, &mut matches);
        debug!(
            matches = matches.len(),
            iterations = result.iterations,
            "stereo rejection given rotation finished"
        );
        ((TrackingStatus::Valid, pose), estimate.covariance)
    }

    /// Shared gate of the stereo entry points: putative matches, or the
    /// status the call ends with.
    fn stereo_precheck(
        &mut self,
        reference: &StereoFrame,
        current: &StereoFrame,
    ) -> Result<Vec<KeypointMatch>, TrackingStatus> {
        self.debug_info.nr_stereo_inliers = 0;
        self.debug_info.stereo_ransac_iters = 0;
        if !self.params.enable_outlier_rejection {
            return Err(TrackingStatus::Disabled);
        }
        let matches = match_stereo(reference, current, None);
        self.debug_info.nr_stereo_putatives = matches.len();
        if matches.len() < self.params.min_matches_stereo.get() {
            debug!(matches = matches.len(), "stereo rejection: too few matches");
            return Err(TrackingStatus::FewMatches);
        }
        let disparity = compute_median_disparity(
            reference.left().keypoints(),
            current.left().keypoints(),
            &matches,
        );
        match disparity {
            Some(d) if d >= self.params.disparity_threshold_px => Ok(matches),
            _ => {
                debug!(?disparity, "stereo rejection: low disparity");
                Err(TrackingStatus::LowDisparity)
            }
        }
    }

    fn inlier_ratio_ok(&self, inliers: usize, matches: usize) -> bool {
        matches > 0 && inliers as f64 / matches as f64 >= self.params.min_inlier_ratio
    }

    /// Drops keypoints of outlier matches from both frames and rewrites
    /// `matches` to the surviving inlier pairs under the new indices.
    /// Unmatched keypoints and relative order are preserved.
    ///
    /// Panics if a match indexes past either frame.
    pub fn remove_outliers_mono(
        inliers: &[usize],
        reference: &mut Frame,
        current: &mut Frame,
        matches: &mut Vec<KeypointMatch>,
    ) {
        let plan = CompactionPlan::new(inliers, matches, reference.len(), current.len());
        reference.retain_flags(&plan.keep_ref);
        current.retain_flags(&plan.keep_cur);
        *matches = plan.matches;
    }

    /// Stereo counterpart of [`Tracker::remove_outliers_mono`]; right
    /// keypoints, status and depth stay aligned with the left frame.
    pub fn remove_outliers_stereo(
        inliers: &[usize],
        reference: &mut StereoFrame,
        current: &mut StereoFrame,
        matches: &mut Vec<KeypointMatch>,
    ) {
        let plan = CompactionPlan::new(inliers, matches, reference.len(), current.len());
        reference.retain_flags(&plan.keep_ref);
        current.retain_flags(&plan.keep_cur);
        *matches = plan.matches;
    }

    /// Records per-status counts of a stereo frame's right keypoints.
    pub fn check_status_right_keypoints(
        &mut self,
        statuses: &[KeypointStatus],
    ) -> KeypointStatusCounts {
        let counts = KeypointStatusCounts::from_statuses(statuses);
        self.debug_info.stereo_status = counts;
        counts
    }

    /// Draws `current` over its image: tracked features in green with a line
    /// from their reference position, new features in red, and the optional
    /// extra markers in gray and blue.
    pub fn get_tracker_image(
        &self,
        reference: &Frame,
        current: &Frame,
        extra_gray: &[Keypoint],
        extra_blue: &[Keypoint],
    ) -> RgbImage {
        let mut canvas = DynamicImage::ImageLuma8(current.image().clone()).to_rgb8();
        let previous: HashMap<LandmarkId, Keypoint> = reference
            .landmarks()
            .iter()
            .copied()
            .zip(reference.keypoints().iter().copied())
            .collect();

        for (kp, landmark) in current.keypoints().iter().zip(current.landmarks()) {
            match previous.get(landmark) {
                Some(prev) => {
                    draw_line_segment_mut(
                        &mut canvas,
                        (prev.x as f32, prev.y as f32),
                        (kp.x as f32, kp.y as f32),
                        TRACKED_COLOR,
                    );
                    draw_hollow_circle_mut(&mut canvas, pixel(kp), MARKER_RADIUS, TRACKED_COLOR);
                }
                None => draw_hollow_circle_mut(&mut canvas, pixel(kp), MARKER_RADIUS, NEW_COLOR),
            }
        }
        for kp in extra_gray {
            draw_hollow_circle_mut(&mut canvas, pixel(kp), MARKER_RADIUS, GRAY_COLOR);
        }
        for kp in extra_blue {
            draw_hollow_circle_mut(&mut canvas, pixel(kp), MARKER_RADIUS, BLUE_COLOR);
        }
        canvas
    }

    fn publish_tracker_image(&self, reference: &Frame, current: &Frame) {
        if !self.params.visualize {
            return;
        }
        let Some(queue) = &self.display_queue else {
            return;
        };
        let packet = TrackerImagePacket {
            frame_id: current.id(),
            timestamp: current.timestamp(),
            image: self.get_tracker_image(reference, current, &[], &[]),
        };
        let outcome = queue.try_send(packet);
        if outcome != SendOutcome::Enqueued {
            debug!(?outcome, frame = current.id().as_u64(), "tracker image not enqueued");
        }
    }

    fn mint_landmark(&mut self) -> LandmarkId {
        let id = LandmarkId::new(self.landmark_count);
        self.landmark_count += 1;
        id
    }
}

struct CompactionPlan {
    keep_ref: Vec<bool>,
    keep_cur: Vec<bool>,
    matches: Vec<KeypointMatch>,
}

impl CompactionPlan {
    fn new(inliers: &[usize], matches: &[KeypointMatch], ref_len: usize, cur_len: usize) -> Self {
        let inliers: HashSet<usize> = inliers.iter().copied().collect();
        let mut keep_ref = vec![true; ref_len];
        let mut keep_cur = vec![true; cur_len];
        for (k, m) in matches.iter().enumerate() {
            if !inliers.contains(&k) {
                keep_ref[m.ref_idx] = false;
                keep_cur[m.cur_idx] = false;
            }
        }
        let ref_map = new_positions(&keep_ref);
        let cur_map = new_positions(&keep_cur);
        let matches = matches
            .iter()
            .enumerate()
            .filter(|(k, _)| inliers.contains(k))
            .filter_map(|(_, m)| Some(KeypointMatch::new(ref_map[m.ref_idx]?, cur_map[m.cur_idx]?)))
            .collect();
        Self {
            keep_ref,
            keep_cur,
            matches,
        }
    }
}

fn new_positions(keep: &[bool]) -> Vec<Option<usize>> {
    let mut next = 0;
    keep.iter()
        .map(|&k| {
            k.then(|| {
                next += 1;
                next - 1
            })
        })
        .collect()
}

fn make_pose(rotation: &Rotation3<f64>, translation: Vector3<f64>) -> Pose {
    Isometry3::from_parts(
        Translation3::from(translation),
        UnitQuaternion::from_rotation_matrix(rotation),
    )
}

fn pixel(kp: &Keypoint) -> (i32, i32) {
    (kp.x.round() as i32, kp.y.round() as i32)
}
