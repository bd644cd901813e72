//! Rectified stereo triangulation and first-order covariance propagation.

use nalgebra::{Matrix3, Rotation3, Vector3};
use thiserror::Error;

use crate::camera::StereoCamera;
use crate::frame::StereoFrame;
use crate::{Keypoint, KeypointStatus};

#[derive(Debug, Error, PartialEq)]
pub enum TriangulationError {
    #[error("stereo point {index} is {status:?}, expected Valid")]
    NotValid {
        index: usize,
        status: KeypointStatus,
    },
    #[error("stereo point {index} out of bounds for {len} keypoints")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("stereo point {index} has non-positive disparity")]
    Degenerate { index: usize },
}

/// Left-camera point from a rectified correspondence. `None` for
/// non-positive disparity.
pub fn triangulate_rectified(
    camera: &StereoCamera,
    left: &Keypoint,
    right: &Keypoint,
) -> Option<Vector3<f64>> {
    let cam = camera.left();
    let b = camera.baseline_m();
    let disparity = left.x - right.x;
    if !disparity.is_finite() || disparity <= 0.0 {
        return None;
    }
    let z = cam.fx() * b / disparity;
    let x = b * (left.x - cam.cx()) / disparity;
    let y = cam.fx() * b * (left.y - cam.cy()) / (cam.fy() * disparity);
    Some(Vector3::new(x, y, z))
}

/// Jacobian of [`triangulate_rectified`] with respect to `(u_left, u_right, v)`.
pub fn triangulation_jacobian(
    camera: &StereoCamera,
    left: &Keypoint,
    right: &Keypoint,
) -> Option<Matrix3<f64>> {
    let cam = camera.left();
    let b = camera.baseline_m();
    let d = left.x - right.x;
    if !d.is_finite() || d <= 0.0 {
        return None;
    }
    let d2 = d * d;
    let ul = left.x - cam.cx();
    let v = left.y - cam.cy();
    let fxb = cam.fx() * b;
    let fy = cam.fy();
    Some(Matrix3::new(
        b * (d - ul) / d2,
        b * ul / d2,
        0.0,
        -fxb * v / (fy * d2),
        fxb * v / (fy * d2),
        fxb / (fy * d),
        -fxb / d2,
        fxb / d2,
        0.0,
    ))
}

/// Triangulates stereo point `index` and maps the pixel covariance of
/// `(u_left, u_right, v)` to a 3D covariance, optionally rotated as
/// `R C R^T`.
pub fn get_point3_and_covariance(
    frame: &StereoFrame,
    camera: &StereoCamera,
    index: usize,
    measurement_covariance: &Matrix3<f64>,
    rotation: Option<&Rotation3<f64>>,
) -> Result<(Vector3<f64>, Matrix3<f64>), TriangulationError> {
    let status = *frame
        .status()
        .get(index)
        .ok_or(TriangulationError::IndexOutOfBounds {
            index,
            len: frame.len(),
        })?;
    if status != KeypointStatus::Valid {
        return Err(TriangulationError::NotValid { index, status });
    }
    let left = &frame.left().keypoints()[index];
    let right = frame.right_keypoints()[index]
        .as_ref()
        .ok_or(TriangulationError::NotValid { index, status })?;

    let point =
        triangulate_rectified(camera, left, right).ok_or(TriangulationError::Degenerate { index })?;
    let jacobian =
        triangulation_jacobian(camera, left, right).ok_or(TriangulationError::Degenerate { index })?;
    let mut covariance = jacobian * measurement_covariance * jacobian.transpose();
    if let Some(rotation) = rotation {
        covariance = rotation.matrix() * covariance * rotation.matrix().transpose();
    }
    Ok((point, covariance))
}
