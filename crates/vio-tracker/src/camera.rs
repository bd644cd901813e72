//! Pinhole and rectified-stereo camera models.

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::Deserialize;
use thiserror::Error;

use crate::Keypoint;

/// Raw calibration values as they appear in a configuration file.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Error, PartialEq)]
pub enum CameraError {
    #[error("focal lengths must be positive and finite: fx={fx}, fy={fy}")]
    NonPositiveFocal { fx: f64, fy: f64 },
    #[error("principal point must be finite: cx={cx}, cy={cy}")]
    NonFinitePrincipalPoint { cx: f64, cy: f64 },
    #[error("image size must be non-zero: {width}x{height}")]
    EmptyImage { width: u32, height: u32 },
    #[error("stereo baseline must be positive and finite, got {baseline_m}")]
    NonPositiveBaseline { baseline_m: f64 },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PinholeCamera {
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
    width: u32,
    height: u32,
}

impl TryFrom<&CameraIntrinsics> for PinholeCamera {
    type Error = CameraError;

    fn try_from(value: &CameraIntrinsics) -> Result<Self, Self::Error> {
        PinholeCamera::try_new(
            value.fx,
            value.fy,
            value.cx,
            value.cy,
            value.width,
            value.height,
        )
    }
}

impl PinholeCamera {
    pub fn try_new(
        fx: f64,
        fy: f64,
        cx: f64,
        cy: f64,
        width: u32,
        height: u32,
    ) -> Result<Self, CameraError> {
        if !(fx.is_finite() && fy.is_finite()) || fx <= 0.0 || fy <= 0.0 {
            return Err(CameraError::NonPositiveFocal { fx, fy });
        }
        if !(cx.is_finite() && cy.is_finite()) {
            return Err(CameraError::NonFinitePrincipalPoint { cx, cy });
        }
        if width == 0 || height == 0 {
            return Err(CameraError::EmptyImage { width, height });
        }
        Ok(Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
        })
    }

    pub fn fx(&self) -> f64 {
        self.fx
    }

    pub fn fy(&self) -> f64 {
        self.fy
    }

    pub fn cx(&self) -> f64 {
        self.cx
    }

    pub fn cy(&self) -> f64 {
        self.cy
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Coordinates on the `z = 1` plane.
    pub fn normalize(&self, keypoint: &Keypoint) -> Vector2<f64> {
        Vector2::new(
            (keypoint.x - self.cx) / self.fx,
            (keypoint.y - self.cy) / self.fy,
        )
    }

    /// Homogeneous normalized coordinate `(x, y, 1)`.
    pub fn ray(&self, keypoint: &Keypoint) -> Vector3<f64> {
        let n = self.normalize(keypoint);
        Vector3::new(n.x, n.y, 1.0)
    }

    /// Unit-norm bearing vector.
    pub fn bearing(&self, keypoint: &Keypoint) -> Vector3<f64> {
        self.ray(keypoint).normalize()
    }

    /// Projects a camera-frame point. Points at or behind the image plane yield `None`.
    pub fn project(&self, point: &Vector3<f64>) -> Option<Keypoint> {
        if point.z <= 1e-9 || !point.iter().all(|v| v.is_finite()) {
            return None;
        }
        Some(Keypoint {
            x: self.fx * point.x / point.z + self.cx,
            y: self.fy * point.y / point.z + self.cy,
        })
    }

    pub fn contains(&self, keypoint: &Keypoint) -> bool {
        keypoint.is_finite()
            && keypoint.x >= 0.0
            && keypoint.y >= 0.0
            && keypoint.x < f64::from(self.width)
            && keypoint.y < f64::from(self.height)
    }
}

/// Rectified stereo pair: both images share `left`'s intrinsics and the right
/// camera sits `baseline_m` along the left camera's +x axis.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StereoCamera {
    left: PinholeCamera,
    baseline_m: f64,
}

impl StereoCamera {
    pub fn try_new(left: PinholeCamera, baseline_m: f64) -> Result<Self, CameraError> {
        if !baseline_m.is_finite() || baseline_m <= 0.0 {
            return Err(CameraError::NonPositiveBaseline { baseline_m });
        }
        Ok(Self { left, baseline_m })
    }

    pub fn left(&self) -> &PinholeCamera {
        &self.left
    }

    pub fn baseline_m(&self) -> f64 {
        self.baseline_m
    }

    /// Projects a left-camera point into `(left, right)` pixels.
    pub fn project(&self, point: &Vector3<f64>) -> Option<(Keypoint, Keypoint)> {
        let left = self.left.project(point)?;
        let right = self
            .left
            .project(&Vector3::new(point.x - self.baseline_m, point.y, point.z))?;
        Some((left, right))
    }
}
