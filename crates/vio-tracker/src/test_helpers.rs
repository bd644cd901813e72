#![allow(dead_code)]

use std::sync::Arc;

use image::GrayImage;
use nalgebra::{Rotation3, Vector3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::camera::{PinholeCamera, StereoCamera};
use crate::config::{DetectorParams, StereoParams, TrackerParams};
use crate::features::{FeatureDetector, FlowRefiner};
use crate::frame::{Frame, StereoFrame};
use crate::mask::is_open;
use crate::tracker::Tracker;
use crate::{FrameId, Keypoint, LandmarkId, ScoredKeypoint, Timestamp};

pub(crate) const WIDTH: u32 = 640;
pub(crate) const HEIGHT: u32 = 480;
pub(crate) const BASELINE_M: f64 = 0.11;

pub(crate) fn make_camera() -> PinholeCamera {
    PinholeCamera::try_new(450.0, 450.0, 320.0, 240.0, WIDTH, HEIGHT).expect("camera")
}

pub(crate) fn make_stereo_camera() -> StereoCamera {
    StereoCamera::try_new(make_camera(), BASELINE_M).expect("stereo camera")
}

pub(crate) fn blank_image() -> Arc<GrayImage> {
    Arc::new(GrayImage::new(WIDTH, HEIGHT))
}

pub(crate) fn axis_angle(w: [f64; 3]) -> Rotation3<f64> {
    Rotation3::from_scaled_axis(Vector3::new(w[0], w[1], w[2]))
}

/// Non-coplanar points 4-8 m in front of the camera, all visible in a
/// 640x480 image with the default intrinsics.
pub(crate) fn scene_points(n: usize) -> Vec<Vector3<f64>> {
    (0..n)
        .map(|i| {
            let col = (i % 10) as f64;
            let row = ((i / 10) % 5) as f64;
            let z = 4.0 + ((i * 7) % 11) as f64 * 0.4;
            let x = (-0.45 + 0.1 * col) * z;
            let y = (-0.3 + 0.12 * row) * z;
            Vector3::new(x, y, z)
        })
        .collect()
}

pub(crate) fn make_frame(id: u64, keypoints: Vec<Keypoint>, landmarks: &[u64]) -> Frame {
    Frame::from_observations(
        FrameId::new(id),
        Timestamp::from_nanos(id as i64 * 50_000_000),
        blank_image(),
        keypoints,
        landmarks.iter().map(|&l| LandmarkId::new(l)).collect(),
    )
    .expect("frame")
}

/// Frame whose keypoints are spread on a diagonal, one per landmark id.
pub(crate) fn frame_with_landmarks(ids: &[u64]) -> Frame {
    let keypoints = (0..ids.len())
        .map(|i| Keypoint::new(40.0 + 25.0 * i as f64, 30.0 + 20.0 * i as f64))
        .collect();
    make_frame(0, keypoints, ids)
}

/// Stereo frame observing left-camera `points`, landmark ids starting at `first_landmark`.
pub(crate) fn make_stereo_frame(points: &[Vector3<f64>], first_landmark: u64) -> StereoFrame {
    let ids: Vec<u64> = (0..points.len() as u64).map(|i| first_landmark + i).collect();
    stereo_frame_from_points(0, points, &ids)
}

pub(crate) fn stereo_frame_from_points(
    frame_id: u64,
    points: &[Vector3<f64>],
    landmarks: &[u64],
) -> StereoFrame {
    let camera = make_stereo_camera();
    let (left, right): (Vec<Keypoint>, Vec<Option<Keypoint>>) = points
        .iter()
        .map(|p| {
            let (l, r) = camera.project(p).expect("point projects");
            (l, Some(r))
        })
        .unzip();
    stereo_frame_from_pixels(frame_id, left, right, landmarks)
}

pub(crate) fn stereo_frame_from_pixels(
    frame_id: u64,
    left: Vec<Keypoint>,
    right: Vec<Option<Keypoint>>,
    landmarks: &[u64],
) -> StereoFrame {
    StereoFrame::from_rectified(
        make_frame(frame_id, left, landmarks),
        right,
        make_stereo_camera(),
        &StereoParams::default(),
    )
    .expect("stereo frame")
}

/// Two stereo frames of the same scene related by `p_ref = R p_cur + t`.
/// Every `outlier_every`-th correspondence is displaced by 40 px in both
/// images of the current frame. Current landmarks are stored in reverse order.
pub(crate) fn synthetic_stereo_pair(
    n: usize,
    rotation: &Rotation3<f64>,
    translation: &Vector3<f64>,
    outlier_every: Option<usize>,
) -> (StereoFrame, StereoFrame) {
    let camera = make_stereo_camera();
    let points = scene_points(n);
    let ids: Vec<u64> = (0..n as u64).collect();
    let reference = stereo_frame_from_points(0, &points, &ids);

    let mut left = Vec::with_capacity(n);
    let mut right = Vec::with_capacity(n);
    let mut cur_ids = Vec::with_capacity(n);
    for i in (0..n).rev() {
        let p_cur = rotation.inverse() * (points[i] - translation);
        let (mut l, mut r) = camera.project(&p_cur).expect("point projects");
        if outlier_every.is_some_and(|k| i % k == 0) {
            l = Keypoint::new(l.x + 40.0, l.y + 40.0);
            r = Keypoint::new(r.x + 40.0, r.y + 40.0);
        }
        left.push(l);
        right.push(Some(r));
        cur_ids.push(i as u64);
    }
    let current = stereo_frame_from_pixels(1, left, right, &cur_ids);
    (reference, current)
}

/// Copy of `frame` with each left keypoint moved by uniform noise in
/// `[-amplitude_px, amplitude_px]` per axis. Right keypoints are kept.
pub(crate) fn jitter_left(frame: &StereoFrame, amplitude_px: f64, seed: u64) -> StereoFrame {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let left = frame
        .left()
        .keypoints()
        .iter()
        .map(|kp| {
            Keypoint::new(
                kp.x + rng.random_range(-amplitude_px..=amplitude_px),
                kp.y + rng.random_range(-amplitude_px..=amplitude_px),
            )
        })
        .collect();
    let ids: Vec<u64> = frame.left().landmarks().iter().map(|l| l.as_u64()).collect();
    stereo_frame_from_pixels(
        frame.left().id().as_u64(),
        left,
        frame.right_keypoints().to_vec(),
        &ids,
    )
}

/// Scans a regular grid and reports open mask cells, strongest first.
pub(crate) struct GridDetector {
    pub spacing: u32,
}

impl FeatureDetector for GridDetector {
    fn detect(
        &mut self,
        image: &GrayImage,
        mask: &GrayImage,
        _params: &DetectorParams,
        max_corners: usize,
    ) -> Vec<ScoredKeypoint> {
        let half = self.spacing / 2;
        let mut out = Vec::new();
        for y in (half..image.height()).step_by(self.spacing as usize) {
            for x in (half..image.width()).step_by(self.spacing as usize) {
                let keypoint = Keypoint::new(f64::from(x), f64::from(y));
                if is_open(mask, &keypoint) {
                    out.push(ScoredKeypoint {
                        keypoint,
                        score: 1.0 - out.len() as f64 * 1e-4,
                    });
                }
            }
        }
        out.truncate(max_corners);
        out
    }
}

/// Moves predictions by a fixed offset; loses every `lose_every`-th point.
pub(crate) struct ShiftFlow {
    pub dx: f64,
    pub dy: f64,
    pub lose_every: Option<usize>,
}

impl FlowRefiner for ShiftFlow {
    fn refine(
        &mut self,
        _previous_image: &GrayImage,
        _current_image: &GrayImage,
        _previous: &[Keypoint],
        predicted: &[Keypoint],
    ) -> Vec<Option<Keypoint>> {
        predicted
            .iter()
            .enumerate()
            .map(|(i, p)| {
                if self.lose_every.is_some_and(|k| i % k == 0) {
                    None
                } else {
                    Some(Keypoint::new(p.x + self.dx, p.y + self.dy))
                }
            })
            .collect()
    }
}

pub(crate) fn make_tracker(params: TrackerParams) -> Tracker {
    Tracker::new(
        params,
        make_camera(),
        Box::new(GridDetector { spacing: 40 }),
        Box::new(ShiftFlow {
            dx: 0.0,
            dy: 0.0,
            lose_every: None,
        }),
    )
    .expect("tracker")
}
