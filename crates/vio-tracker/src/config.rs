//! Tracker configuration: serde-loadable parameter sets with validation and
//! `VIO_TRACKER_*` environment overrides.

use std::num::NonZeroUsize;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::predictor::PredictorKind;
use crate::ransac::RansacOptions;

pub const ENV_MAX_FEATURES: &str = "VIO_TRACKER_MAX_FEATURES";
pub const ENV_MIN_DISTANCE_PX: &str = "VIO_TRACKER_MIN_DISTANCE_PX";
pub const ENV_MAX_FEATURE_AGE: &str = "VIO_TRACKER_MAX_FEATURE_AGE";
pub const ENV_RANSAC_SEED: &str = "VIO_TRACKER_RANSAC_SEED";
pub const ENV_VISUALIZE: &str = "VIO_TRACKER_VISUALIZE";

const DEFAULT_SEED: u64 = 0x5EED;

#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("{field} must lie in [0, 1], got {value}")]
    OutOfUnitRange { field: &'static str, value: f64 },
    #[error("{field} must lie in (0, 1), got {value}")]
    OutOfOpenUnitRange { field: &'static str, value: f64 },
    #[error("{field} must be positive and finite, got {value}")]
    NonPositive { field: &'static str, value: f64 },
    #[error("{field} must be non-zero")]
    Zero { field: &'static str },
    #[error("failed to parse tracker params: {0}")]
    Json(#[from] serde_json::Error),
}

/// Sample-consensus settings for one estimation family.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct RansacParams {
    pub max_iterations: NonZeroUsize,
    /// Desired probability of drawing at least one all-inlier sample.
    pub probability: f64,
    pub threshold: f64,
    pub seed: u64,
}

impl RansacParams {
    /// Sampson error threshold on the normalized image plane.
    pub fn mono_default() -> Self {
        Self {
            max_iterations: non_zero(100),
            probability: 0.995,
            threshold: 1e-5,
            seed: DEFAULT_SEED,
        }
    }

    /// Point-to-point distance threshold in metres.
    pub fn stereo_default() -> Self {
        Self {
            max_iterations: non_zero(100),
            probability: 0.995,
            threshold: 0.3,
            seed: DEFAULT_SEED,
        }
    }

    fn validate(&self, prefix: &'static str) -> Result<(), ParamsError> {
        if !(self.probability > 0.0 && self.probability < 1.0) {
            return Err(ParamsError::OutOfOpenUnitRange {
                field: prefix,
                value: self.probability,
            });
        }
        ensure_positive(prefix, self.threshold)
    }

    pub(crate) fn options(&self) -> RansacOptions {
        self.options_with_threshold(self.threshold)
    }

    pub(crate) fn options_with_threshold(&self, threshold: f64) -> RansacOptions {
        RansacOptions {
            max_iters: self.max_iterations.get(),
            thresh: threshold,
            confidence: self.probability,
            seed: self.seed,
            refit_on_inliers: true,
        }
    }
}

impl Default for RansacParams {
    fn default() -> Self {
        Self::mono_default()
    }
}

/// Inputs forwarded to the external salient-point detector.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct DetectorParams {
    /// Upper bound on corners requested in a single detection call.
    pub max_corners: usize,
    pub quality_level: f64,
    /// Exclusion radius around live keypoints, in pixels.
    pub min_distance_px: f64,
    pub block_size: u32,
    pub use_harris: bool,
    pub harris_k: f64,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            max_corners: 300,
            quality_level: 0.001,
            min_distance_px: 10.0,
            block_size: 3,
            use_harris: false,
            harris_k: 0.04,
        }
    }
}

/// Acceptance rules for left/right correspondences of a rectified pair.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct StereoParams {
    pub max_epipolar_error_px: f64,
    pub min_disparity_px: f64,
    pub max_depth_m: f64,
    /// Isotropic pixel noise of a stereo measurement `(u_left, u_right, v)`.
    pub pixel_sigma_px: f64,
}

impl Default for StereoParams {
    fn default() -> Self {
        Self {
            max_epipolar_error_px: 1.0,
            min_disparity_px: 0.5,
            max_depth_m: 40.0,
            pixel_sigma_px: 1.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct TrackerParams {
    pub enable_outlier_rejection: bool,
    pub min_matches_mono: NonZeroUsize,
    pub min_matches_stereo: NonZeroUsize,
    pub min_inlier_ratio: f64,
    pub ransac_mono: RansacParams,
    #[serde(
        default = "RansacParams::stereo_default",
        deserialize_with = "deserialize_stereo_ransac"
    )]
    pub ransac_stereo: RansacParams,
    /// Chi-square gate on the Mahalanobis distance between translation votes.
    pub stereo_rotation_chi2_threshold: f64,
    pub detector: DetectorParams,
    pub stereo: StereoParams,
    pub max_features_per_frame: usize,
    /// Landmarks tracked for this many frames are retired.
    pub max_feature_age: u32,
    /// Median pixel displacement below which motion is degenerate.
    pub disparity_threshold_px: f64,
    pub predictor: PredictorKind,
    pub visualize: bool,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            enable_outlier_rejection: true,
            min_matches_mono: non_zero(8),
            min_matches_stereo: non_zero(5),
            min_inlier_ratio: 0.5,
            ransac_mono: RansacParams::mono_default(),
            ransac_stereo: RansacParams::stereo_default(),
            stereo_rotation_chi2_threshold: 7.8147,
            detector: DetectorParams::default(),
            stereo: StereoParams::default(),
            max_features_per_frame: 300,
            max_feature_age: 25,
            disparity_threshold_px: 0.5,
            predictor: PredictorKind::Rotational,
            visualize: false,
        }
    }
}

impl TrackerParams {
    pub fn from_json_str(json: &str) -> Result<Self, ParamsError> {
        let params: TrackerParams = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), ParamsError> {
        if !(0.0..=1.0).contains(&self.min_inlier_ratio) {
            return Err(ParamsError::OutOfUnitRange {
                field: "min_inlier_ratio",
                value: self.min_inlier_ratio,
            });
        }
        self.ransac_mono.validate("ransac_mono")?;
        self.ransac_stereo.validate("ransac_stereo")?;
        ensure_positive(
            "stereo_rotation_chi2_threshold",
            self.stereo_rotation_chi2_threshold,
        )?;
        ensure_positive("detector.min_distance_px", self.detector.min_distance_px)?;
        if self.detector.max_corners == 0 {
            return Err(ParamsError::Zero {
                field: "detector.max_corners",
            });
        }
        if self.max_feature_age == 0 {
            return Err(ParamsError::Zero {
                field: "max_feature_age",
            });
        }
        ensure_positive("stereo.max_epipolar_error_px", self.stereo.max_epipolar_error_px)?;
        ensure_positive("stereo.max_depth_m", self.stereo.max_depth_m)?;
        ensure_positive("stereo.pixel_sigma_px", self.stereo.pixel_sigma_px)?;
        if !self.stereo.min_disparity_px.is_finite() || self.stereo.min_disparity_px < 0.0 {
            return Err(ParamsError::NonPositive {
                field: "stereo.min_disparity_px",
                value: self.stereo.min_disparity_px,
            });
        }
        if !self.disparity_threshold_px.is_finite() || self.disparity_threshold_px < 0.0 {
            return Err(ParamsError::NonPositive {
                field: "disparity_threshold_px",
                value: self.disparity_threshold_px,
            });
        }
        Ok(())
    }

    /// Applies `VIO_TRACKER_*` variables from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = parse_override::<usize>(&lookup, ENV_MAX_FEATURES) {
            self.max_features_per_frame = value;
        }
        if let Some(value) = parse_override::<f64>(&lookup, ENV_MIN_DISTANCE_PX) {
            self.detector.min_distance_px = value;
        }
        if let Some(value) = parse_override::<u32>(&lookup, ENV_MAX_FEATURE_AGE) {
            self.max_feature_age = value;
        }
        if let Some(seed) = parse_override::<u64>(&lookup, ENV_RANSAC_SEED) {
            self.ransac_mono.seed = seed;
            self.ransac_stereo.seed = seed;
        }
        if let Some(value) = parse_bool_override(&lookup, ENV_VISUALIZE) {
            self.visualize = value;
        }
        self
    }
}

/// Fields given for one estimation family; the rest come from that family's defaults.
#[derive(Deserialize)]
struct RansacOverlay {
    max_iterations: Option<NonZeroUsize>,
    probability: Option<f64>,
    threshold: Option<f64>,
    seed: Option<u64>,
}

impl RansacOverlay {
    fn over(self, base: RansacParams) -> RansacParams {
        RansacParams {
            max_iterations: self.max_iterations.unwrap_or(base.max_iterations),
            probability: self.probability.unwrap_or(base.probability),
            threshold: self.threshold.unwrap_or(base.threshold),
            seed: self.seed.unwrap_or(base.seed),
        }
    }
}

fn deserialize_stereo_ransac<'de, D>(deserializer: D) -> Result<RansacParams, D::Error>
where
    D: Deserializer<'de>,
{
    RansacOverlay::deserialize(deserializer).map(|o| o.over(RansacParams::stereo_default()))
}

fn parse_override<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: std::str::FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "invalid override, ignoring");
            None
        }
    }
}

fn parse_bool_override(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = lookup(key)?;
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(key, value = %raw, "invalid override, ignoring");
            None
        }
    }
}

fn ensure_positive(field: &'static str, value: f64) -> Result<(), ParamsError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ParamsError::NonPositive { field, value })
    }
}

fn non_zero(value: usize) -> NonZeroUsize {
    NonZeroUsize::new(value).unwrap_or(NonZeroUsize::MIN)
}
