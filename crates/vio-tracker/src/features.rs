//! Capabilities supplied by an external vision library.

use image::GrayImage;

use crate::config::DetectorParams;
use crate::{Keypoint, LandmarkId, ScoredKeypoint};

/// Salient-point detection restricted to a mask.
pub trait FeatureDetector: Send {
    /// Returns at most `max_corners` points, strongest first. Mask pixels equal
    /// to zero are excluded.
    fn detect(
        &mut self,
        image: &GrayImage,
        mask: &GrayImage,
        params: &DetectorParams,
        max_corners: usize,
    ) -> Vec<ScoredKeypoint>;
}

/// Local search refining predicted correspondences (e.g. pyramidal optical flow).
pub trait FlowRefiner: Send {
    /// Output is index-aligned with `previous`; `None` marks a lost point.
    fn refine(
        &mut self,
        previous_image: &GrayImage,
        current_image: &GrayImage,
        previous: &[Keypoint],
        predicted: &[Keypoint],
    ) -> Vec<Option<Keypoint>>;
}

/// Newly detected keypoint with its freshly minted identity.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectedFeature {
    pub landmark: LandmarkId,
    pub keypoint: ScoredKeypoint,
}
