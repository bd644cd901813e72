//! Correspondence prediction under a motion hypothesis.

use nalgebra::{Matrix3, Rotation3, Vector3};
use serde::Deserialize;

use crate::camera::PinholeCamera;
use crate::Keypoint;

/// Predicts where reference keypoints reappear in the current image, given
/// the rotation `ref_R_cur` between the two frames. Output is index-aligned
/// with the input.
pub trait CorrespondencePredictor: Send {
    fn predict(&self, keypoints: &[Keypoint], rotation: &Rotation3<f64>) -> Vec<Keypoint>;
}

/// Predictor selectable from configuration.
///
/// An [`ExternalFlowPredictor`] wraps a caller closure and cannot be described
/// in a config file; install it with `Tracker::with_predictor`, which replaces
/// the one built from this kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictorKind {
    NoMotion,
    Rotational,
}

impl PredictorKind {
    pub fn build(self, camera: PinholeCamera) -> Box<dyn CorrespondencePredictor> {
        match self {
            PredictorKind::NoMotion => Box::new(NoMotionPredictor),
            PredictorKind::Rotational => Box::new(RotationalPredictor::new(camera)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoMotionPredictor;

impl CorrespondencePredictor for NoMotionPredictor {
    fn predict(&self, keypoints: &[Keypoint], _rotation: &Rotation3<f64>) -> Vec<Keypoint> {
        keypoints.to_vec()
    }
}

/// Infinite homography `K R^T K^-1`. Points mapping behind the camera or out
/// of the image keep their previous location.
#[derive(Clone, Copy, Debug)]
pub struct RotationalPredictor {
    camera: PinholeCamera,
    k: Matrix3<f64>,
    k_inv: Matrix3<f64>,
}

impl RotationalPredictor {
    pub fn new(camera: PinholeCamera) -> Self {
        let k = camera.matrix();
        let k_inv = Matrix3::new(
            1.0 / camera.fx(),
            0.0,
            -camera.cx() / camera.fx(),
            0.0,
            1.0 / camera.fy(),
            -camera.cy() / camera.fy(),
            0.0,
            0.0,
            1.0,
        );
        Self { camera, k, k_inv }
    }
}

impl CorrespondencePredictor for RotationalPredictor {
    fn predict(&self, keypoints: &[Keypoint], rotation: &Rotation3<f64>) -> Vec<Keypoint> {
        let homography = self.k * rotation.matrix().transpose() * self.k_inv;
        keypoints
            .iter()
            .map(|kp| {
                let p = homography * Vector3::new(kp.x, kp.y, 1.0);
                if p.z <= 1e-9 {
                    return *kp;
                }
                let predicted = Keypoint::new(p.x / p.z, p.y / p.z);
                if self.camera.contains(&predicted) {
                    predicted
                } else {
                    *kp
                }
            })
            .collect()
    }
}

type PredictFn = dyn Fn(&[Keypoint], &Rotation3<f64>) -> Vec<Keypoint> + Send;

/// Delegates to a caller-provided flow capability. Outputs of the wrong length
/// fall back to the input locations.
pub struct ExternalFlowPredictor {
    predict: Box<PredictFn>,
}

impl ExternalFlowPredictor {
    pub fn new<F>(predict: F) -> Self
    where
        F: Fn(&[Keypoint], &Rotation3<f64>) -> Vec<Keypoint> + Send + 'static,
    {
        Self {
            predict: Box::new(predict),
        }
    }
}

impl std::fmt::Debug for ExternalFlowPredictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalFlowPredictor").finish_non_exhaustive()
    }
}

impl CorrespondencePredictor for ExternalFlowPredictor {
    fn predict(&self, keypoints: &[Keypoint], rotation: &Rotation3<f64>) -> Vec<Keypoint> {
        let predicted = (self.predict)(keypoints, rotation);
        if predicted.len() == keypoints.len() {
            predicted
        } else {
            tracing::warn!(
                expected = keypoints.len(),
                actual = predicted.len(),
                "external predictor returned wrong length, using previous locations"
            );
            keypoints.to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{axis_angle, make_camera};
    use approx::assert_abs_diff_eq;

    fn sample_points() -> Vec<Keypoint> {
        vec![
            Keypoint::new(320.0, 240.0),
            Keypoint::new(100.0, 50.0),
            Keypoint::new(600.0, 400.0),
        ]
    }

    #[test]
    fn no_motion_is_identity() {
        let points = sample_points();
        let predicted = NoMotionPredictor.predict(&points, &axis_angle([0.0, 0.3, 0.0]));
        assert_eq!(predicted, points);
    }

    #[test]
    fn rotational_with_identity_is_identity() {
        let predictor = RotationalPredictor::new(make_camera());
        let points = sample_points();
        let predicted = predictor.predict(&points, &Rotation3::identity());
        for (p, q) in points.iter().zip(&predicted) {
            assert_abs_diff_eq!(p.x, q.x, epsilon = 1e-9);
            assert_abs_diff_eq!(p.y, q.y, epsilon = 1e-9);
        }
    }

    #[test]
    fn rotational_matches_reprojection_of_rotated_ray() {
        let camera = make_camera();
        let predictor = RotationalPredictor::new(camera);
        let rotation = axis_angle([0.0, 0.05, 0.0]);
        let kp = Keypoint::new(320.0, 240.0);
        let predicted = predictor.predict(&[kp], &rotation)[0];
        let expected = camera
            .project(&(rotation.inverse() * camera.ray(&kp)))
            .expect("in front");
        assert_abs_diff_eq!(predicted.x, expected.x, epsilon = 1e-9);
        assert_abs_diff_eq!(predicted.y, expected.y, epsilon = 1e-9);
        assert!((predicted.x - kp.x).abs() > 10.0);
    }

    #[test]
    fn rotational_keeps_points_leaving_the_image() {
        let predictor = RotationalPredictor::new(make_camera());
        let edge = Keypoint::new(2.0, 240.0);
        let predicted = predictor.predict(&[edge], &axis_angle([0.0, 0.2, 0.0]));
        assert_eq!(predicted[0], edge);
    }

    #[test]
    fn external_flow_falls_back_on_length_mismatch() {
        let shifted = ExternalFlowPredictor::new(|kps: &[Keypoint], _: &Rotation3<f64>| {
            kps.iter().map(|k| Keypoint::new(k.x + 1.0, k.y)).collect()
        });
        let points = sample_points();
        assert_eq!(shifted.predict(&points, &Rotation3::identity())[1].x, 101.0);

        let broken = ExternalFlowPredictor::new(|_: &[Keypoint], _: &Rotation3<f64>| Vec::new());
        assert_eq!(broken.predict(&points, &Rotation3::identity()), points);
    }

    #[test]
    fn kind_builds_matching_variant() {
        let camera = make_camera();
        let points = sample_points();
        let rotation = axis_angle([0.0, 0.05, 0.0]);
        let still = PredictorKind::NoMotion.build(camera).predict(&points, &rotation);
        let rotated = PredictorKind::Rotational.build(camera).predict(&points, &rotation);
        assert_eq!(still, points);
        assert_ne!(rotated, points);
    }
}
