//! Rerun sink for annotated tracker images and per-frame telemetry.

use std::num::NonZeroUsize;

use thiserror::Error;

use crate::diagnostics::DebugTrackerInfo;
use crate::tracker::TrackerImagePacket;
use crate::Timestamp;

const TIMELINE_CAPTURE_NS: &str = "capture_ns";

const PATH_TRACKER_IMAGE: &str = "tracker/image";

const PATH_FEATURES_KEYPOINTS: &str = "tracker/features/keypoints";
const PATH_FEATURES_NEED: &str = "tracker/features/need_corners";
const PATH_FEATURES_EXTRACTED: &str = "tracker/features/extracted";
const PATH_FEATURES_TRACKED: &str = "tracker/features/tracked";
const PATH_FEATURES_DROPPED_AGE: &str = "tracker/features/dropped_age";
const PATH_FEATURES_DROPPED_FLOW: &str = "tracker/features/dropped_flow";

const PATH_MONO_PUTATIVES: &str = "tracker/mono/putatives";
const PATH_MONO_INLIERS: &str = "tracker/mono/inliers";
const PATH_MONO_ITERATIONS: &str = "tracker/mono/ransac_iterations";

const PATH_STEREO_PUTATIVES: &str = "tracker/stereo/putatives";
const PATH_STEREO_INLIERS: &str = "tracker/stereo/inliers";
const PATH_STEREO_ITERATIONS: &str = "tracker/stereo/ransac_iterations";
const PATH_STEREO_VALID: &str = "tracker/stereo/valid_keypoints";

const PATH_TIMING_DETECTION_MS: &str = "tracker/timing/detection_ms";
const PATH_TIMING_TRACKING_MS: &str = "tracker/timing/tracking_ms";
const PATH_TIMING_MONO_MS: &str = "tracker/timing/mono_ransac_ms";
const PATH_TIMING_STEREO_MS: &str = "tracker/timing/stereo_ransac_ms";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VizDecimation(NonZeroUsize);

impl VizDecimation {
    pub fn every_n(n: NonZeroUsize) -> Self {
        Self(n)
    }

    pub fn get(self) -> usize {
        self.0.get()
    }

    fn should_log(self, index: u64) -> bool {
        index % self.0.get() as u64 == 0
    }
}

impl Default for VizDecimation {
    fn default() -> Self {
        Self(NonZeroUsize::MIN)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VizDecimationError {
    #[error("decimation must be > 0")]
    Zero,
}

impl TryFrom<usize> for VizDecimation {
    type Error = VizDecimationError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        NonZeroUsize::new(value)
            .map(VizDecimation)
            .ok_or(VizDecimationError::Zero)
    }
}

#[derive(Debug, Error)]
pub enum VizLogError {
    #[error("rerun logging error: {0}")]
    Rerun(#[from] rerun::RecordingStreamError),
}

/// Drains tracker images into a Rerun recording, logging every n-th one.
#[derive(Debug)]
pub struct RerunSink {
    rec: rerun::RecordingStream,
    decimation: VizDecimation,
    frame_index: u64,
}

impl RerunSink {
    pub fn new(rec: rerun::RecordingStream, decimation: VizDecimation) -> Self {
        Self {
            rec,
            decimation,
            frame_index: 0,
        }
    }

    pub fn log_tracker_image(&mut self, packet: &TrackerImagePacket) -> Result<(), VizLogError> {
        let index = self.frame_index;
        self.frame_index = self.frame_index.saturating_add(1);
        if !self.decimation.should_log(index) {
            return Ok(());
        }
        set_capture_time(&self.rec, packet.timestamp);
        let (width, height) = packet.image.dimensions();
        let image = rerun::Image::from_color_model_and_bytes(
            packet.image.as_raw().clone(),
            [width, height],
            rerun::ColorModel::RGB,
            rerun::ChannelDatatype::U8,
        );
        self.rec.log(PATH_TRACKER_IMAGE, &image)?;
        Ok(())
    }

    pub fn log_debug_info(
        &self,
        timestamp: Timestamp,
        info: &DebugTrackerInfo,
    ) -> Result<(), VizLogError> {
        set_capture_time(&self.rec, timestamp);
        for (path, value) in debug_scalars(info) {
            self.rec.log(path, &rerun::Scalars::single(value))?;
        }
        Ok(())
    }
}

fn set_capture_time(rec: &rerun::RecordingStream, timestamp: Timestamp) {
    rec.set_time(
        TIMELINE_CAPTURE_NS,
        rerun::TimeCell::from_duration_nanos(timestamp.as_nanos()),
    );
}

fn debug_scalars(info: &DebugTrackerInfo) -> Vec<(&'static str, f64)> {
    let ms = |d: std::time::Duration| d.as_secs_f64() * 1e3;
    vec![
        (PATH_FEATURES_KEYPOINTS, info.nr_keypoints as f64),
        (PATH_FEATURES_NEED, info.need_n_corners as f64),
        (PATH_FEATURES_EXTRACTED, info.extracted_corners as f64),
        (PATH_FEATURES_TRACKED, info.nr_tracked as f64),
        (PATH_FEATURES_DROPPED_AGE, info.nr_dropped_age as f64),
        (PATH_FEATURES_DROPPED_FLOW, info.nr_dropped_flow as f64),
        (PATH_MONO_PUTATIVES, info.nr_mono_putatives as f64),
        (PATH_MONO_INLIERS, info.nr_mono_inliers as f64),
        (PATH_MONO_ITERATIONS, info.mono_ransac_iters as f64),
        (PATH_STEREO_PUTATIVES, info.nr_stereo_putatives as f64),
        (PATH_STEREO_INLIERS, info.nr_stereo_inliers as f64),
        (PATH_STEREO_ITERATIONS, info.stereo_ransac_iters as f64),
        (PATH_STEREO_VALID, info.stereo_status.valid as f64),
        (PATH_TIMING_DETECTION_MS, ms(info.feature_detection_time)),
        (PATH_TIMING_TRACKING_MS, ms(info.feature_tracking_time)),
        (PATH_TIMING_MONO_MS, ms(info.mono_ransac_time)),
        (PATH_TIMING_STEREO_MS, ms(info.stereo_ransac_time)),
    ]
}
