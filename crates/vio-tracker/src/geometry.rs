//! Minimal and least-squares solvers plugged into [`crate::ransac`].
//!
//! All relative poses use `p_ref = R * p_cur + t`. The epipolar constraint is
//! then `r^T [t]x R c = 0` for homogeneous normalized rays `r` (reference) and
//! `c` (current).

use nalgebra::{DMatrix, Isometry3, Matrix3, Rotation3, Translation3, UnitQuaternion, Vector3};

use crate::ransac::Estimator;

const EPS: f64 = 1e-12;

/// Homogeneous normalized rays `(x, y, 1)` of one temporal correspondence.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BearingPair {
    pub reference: Vector3<f64>,
    pub current: Vector3<f64>,
}

/// Triangulated stereo point seen in both frames.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointPair {
    pub reference: Vector3<f64>,
    pub current: Vector3<f64>,
}

/// Translation implied by one stereo correspondence under a fixed rotation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TranslationVote {
    pub translation: Vector3<f64>,
    pub covariance: Matrix3<f64>,
}

pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// First-order geometric error of `r^T E c = 0`, in squared normalized units.
pub fn sampson_error(essential: &Matrix3<f64>, pair: &BearingPair) -> f64 {
    let ec = essential * pair.current;
    let etr = essential.transpose() * pair.reference;
    let algebraic = pair.reference.dot(&ec);
    let denom = ec.x * ec.x + ec.y * ec.y + etr.x * etr.x + etr.y * etr.y;
    if denom <= EPS {
        return f64::INFINITY;
    }
    algebraic * algebraic / denom
}

/// SVD with singular values sorted in descending order. Returns `(U, s, V)`.
fn sorted_svd3(m: &Matrix3<f64>) -> Option<(Matrix3<f64>, Vector3<f64>, Matrix3<f64>)> {
    let svd = m.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return None;
    };
    let v = v_t.transpose();
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| svd.singular_values[b].total_cmp(&svd.singular_values[a]));
    let mut u_sorted = Matrix3::zeros();
    let mut v_sorted = Matrix3::zeros();
    let mut s_sorted = Vector3::zeros();
    for (dst, &src) in order.iter().enumerate() {
        u_sorted.set_column(dst, &u.column(src));
        v_sorted.set_column(dst, &v.column(src));
        s_sorted[dst] = svd.singular_values[src];
    }
    Some((u_sorted, s_sorted, v_sorted))
}

/// Eigenvector of the smallest eigenvalue of a symmetric matrix.
fn null_vector(m: DMatrix<f64>) -> Option<Vec<f64>> {
    let eig = m.symmetric_eigen();
    let (idx, _) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let v: Vec<f64> = eig.eigenvectors.column(idx).iter().copied().collect();
    v.iter().all(|x| x.is_finite()).then_some(v)
}

fn enforce_essential(e: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let (u, s, v) = sorted_svd3(e)?;
    let sigma = 0.5 * (s[0] + s[1]);
    if sigma <= EPS {
        return None;
    }
    Some(u * Matrix3::from_diagonal(&Vector3::new(sigma, sigma, 0.0)) * v.transpose())
}

/// Linear eight-point solve over `indices` (at least 8).
pub fn eight_point(data: &[BearingPair], indices: &[usize]) -> Option<Matrix3<f64>> {
    if indices.len() < 8 {
        return None;
    }
    let mut ata = DMatrix::<f64>::zeros(9, 9);
    for &i in indices {
        let BearingPair { reference: r, current: c } = data[i];
        let row = DMatrix::from_row_slice(
            1,
            9,
            &[
                r.x * c.x,
                r.x * c.y,
                r.x * c.z,
                r.y * c.x,
                r.y * c.y,
                r.y * c.z,
                r.z * c.x,
                r.z * c.y,
                r.z * c.z,
            ],
        );
        ata += row.transpose() * row;
    }
    let v = null_vector(ata)?;
    let e = Matrix3::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8]);
    enforce_essential(&e)
}

/// Depths `(lambda_ref, lambda_cur)` of the ray intersection, if the rays are not parallel.
fn ray_depths(
    rotation: &Matrix3<f64>,
    translation: &Vector3<f64>,
    pair: &BearingPair,
) -> Option<(f64, f64)> {
    let r = pair.reference;
    let rc = rotation * pair.current;
    let a = r.dot(&r);
    let b = r.dot(&rc);
    let c = rc.dot(&rc);
    let det = a * c - b * b;
    if det.abs() <= EPS {
        return None;
    }
    let d1 = r.dot(translation);
    let d2 = rc.dot(translation);
    Some(((d1 * c - b * d2) / det, (b * d1 - a * d2) / det))
}

/// Number of `indices` triangulating in front of both cameras.
pub fn count_in_front(
    rotation: &Matrix3<f64>,
    translation: &Vector3<f64>,
    data: &[BearingPair],
    indices: &[usize],
) -> usize {
    indices
        .iter()
        .filter_map(|&i| ray_depths(rotation, translation, &data[i]))
        .filter(|&(l_ref, l_cur)| l_ref > 0.0 && l_cur > 0.0)
        .count()
}

/// Splits an essential matrix into the `(R, t)` with most points in front
/// of both cameras. `t` has unit norm.
pub fn decompose_essential(
    essential: &Matrix3<f64>,
    data: &[BearingPair],
    indices: &[usize],
) -> Option<(Rotation3<f64>, Vector3<f64>)> {
    let (mut u, _, mut v) = sorted_svd3(essential)?;
    if u.determinant() < 0.0 {
        u = -u;
    }
    if v.determinant() < 0.0 {
        v = -v;
    }
    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let r1 = u * w * v.transpose();
    let r2 = u * w.transpose() * v.transpose();
    let t: Vector3<f64> = u.column(2).into_owned();

    let candidates = [(r1, t), (r1, -t), (r2, t), (r2, -t)];
    let (best_r, best_t, support) = candidates
        .iter()
        .map(|(r, t)| (*r, *t, count_in_front(r, t, data, indices)))
        .fold(None, |acc: Option<(Matrix3<f64>, Vector3<f64>, usize)>, cand| match acc {
            Some(best) if best.2 >= cand.2 => Some(best),
            _ => Some(cand),
        })?;
    if support == 0 {
        return None;
    }
    Some((Rotation3::from_matrix_unchecked(best_r), best_t.normalize()))
}

/// Relative pose from bearing correspondences, up to translation scale.
#[derive(Clone, Copy, Debug, Default)]
pub struct EssentialEstimator;

impl Estimator for EssentialEstimator {
    type Datum = BearingPair;
    type Model = Matrix3<f64>;

    const MIN_SAMPLES: usize = 8;

    fn fit(&self, data: &[BearingPair], sample: &[usize]) -> Option<Matrix3<f64>> {
        eight_point(data, sample)
    }

    fn residual(&self, model: &Matrix3<f64>, datum: &BearingPair) -> f64 {
        sampson_error(model, datum)
    }

    fn refit(&self, data: &[BearingPair], inliers: &[usize]) -> Option<Matrix3<f64>> {
        eight_point(data, inliers)
    }
}

/// Unit translation direction with the rotation held fixed.
#[derive(Clone, Copy, Debug)]
pub struct TranslationGivenRotation {
    rotation: Matrix3<f64>,
}

impl TranslationGivenRotation {
    pub fn new(rotation: &Rotation3<f64>) -> Self {
        Self {
            rotation: *rotation.matrix(),
        }
    }

    /// Normal of the epipolar plane; the translation is orthogonal to it.
    fn plane_normal(&self, pair: &BearingPair) -> Vector3<f64> {
        (self.rotation * pair.current).cross(&pair.reference)
    }

    /// Picks the sign of `t` that puts most `indices` in front of both cameras.
    pub fn resolve_sign(
        &self,
        translation: &Vector3<f64>,
        data: &[BearingPair],
        indices: &[usize],
    ) -> Vector3<f64> {
        let forward = count_in_front(&self.rotation, translation, data, indices);
        let backward = count_in_front(&self.rotation, &-translation, data, indices);
        if backward > forward {
            -translation
        } else {
            *translation
        }
    }
}

impl Estimator for TranslationGivenRotation {
    type Datum = BearingPair;
    type Model = Vector3<f64>;

    const MIN_SAMPLES: usize = 2;

    fn fit(&self, data: &[BearingPair], sample: &[usize]) -> Option<Vector3<f64>> {
        let t = self
            .plane_normal(&data[sample[0]])
            .cross(&self.plane_normal(&data[sample[1]]));
        let norm = t.norm();
        (norm > EPS).then(|| t / norm)
    }

    fn residual(&self, model: &Vector3<f64>, datum: &BearingPair) -> f64 {
        sampson_error(&(skew(model) * self.rotation), datum)
    }

    fn refit(&self, data: &[BearingPair], inliers: &[usize]) -> Option<Vector3<f64>> {
        if inliers.len() < Self::MIN_SAMPLES {
            return None;
        }
        let mut scatter = DMatrix::<f64>::zeros(3, 3);
        for &i in inliers {
            let n = self.plane_normal(&data[i]);
            let col = DMatrix::from_column_slice(3, 1, n.as_slice());
            scatter += &col * col.transpose();
        }
        let v = null_vector(scatter)?;
        let t = Vector3::new(v[0], v[1], v[2]);
        let norm = t.norm();
        (norm > EPS).then(|| t / norm)
    }
}

/// Closed-form rigid alignment `reference = R * current + t` (Arun/Kabsch).
pub fn arun(data: &[PointPair], indices: &[usize]) -> Option<Isometry3<f64>> {
    if indices.len() < 3 {
        return None;
    }
    let n = indices.len() as f64;
    let centroid_ref = indices
        .iter()
        .fold(Vector3::zeros(), |acc, &i| acc + data[i].reference)
        / n;
    let centroid_cur = indices
        .iter()
        .fold(Vector3::zeros(), |acc, &i| acc + data[i].current)
        / n;
    let h = indices.iter().fold(Matrix3::zeros(), |acc, &i| {
        acc + (data[i].current - centroid_cur) * (data[i].reference - centroid_ref).transpose()
    });
    let (u, _, mut v) = sorted_svd3(&h)?;
    let mut r = v * u.transpose();
    if r.determinant() < 0.0 {
        let flipped = -v.column(2);
        v.set_column(2, &flipped);
        r = v * u.transpose();
    }
    if !r.iter().all(|x| x.is_finite()) {
        return None;
    }
    let rotation = Rotation3::from_matrix_unchecked(r);
    let t = centroid_ref - rotation * centroid_cur;
    Some(Isometry3::from_parts(
        Translation3::from(t),
        UnitQuaternion::from_rotation_matrix(&rotation),
    ))
}

/// 3D-3D rigid transform between two sets of triangulated stereo points.
#[derive(Clone, Copy, Debug, Default)]
pub struct ArunEstimator;

impl Estimator for ArunEstimator {
    type Datum = PointPair;
    type Model = Isometry3<f64>;

    const MIN_SAMPLES: usize = 3;

    fn fit(&self, data: &[PointPair], sample: &[usize]) -> Option<Isometry3<f64>> {
        arun(data, sample)
    }

    /// Euclidean distance in the reference frame.
    fn residual(&self, model: &Isometry3<f64>, datum: &PointPair) -> f64 {
        (datum.reference - model.transform_vector(&datum.current) - model.translation.vector)
            .norm()
    }

    fn is_degenerate(&self, data: &[PointPair], sample: &[usize]) -> bool {
        let collinear = |a: Vector3<f64>, b: Vector3<f64>, c: Vector3<f64>| {
            (b - a).cross(&(c - a)).norm() <= 1e-9
        };
        let (p0, p1, p2) = (data[sample[0]], data[sample[1]], data[sample[2]]);
        collinear(p0.reference, p1.reference, p2.reference)
            || collinear(p0.current, p1.current, p2.current)
    }

    fn refit(&self, data: &[PointPair], inliers: &[usize]) -> Option<Isometry3<f64>> {
        arun(data, inliers)
    }
}

/// Translation hypothesis carrying its own uncertainty.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TranslationEstimate {
    pub translation: Vector3<f64>,
    pub covariance: Matrix3<f64>,
}

/// Information-weighted mean of the votes in `indices`.
pub fn fuse_translation_votes(
    data: &[TranslationVote],
    indices: &[usize],
) -> Option<TranslationEstimate> {
    if indices.is_empty() {
        return None;
    }
    let mut information = Matrix3::zeros();
    let mut weighted = Vector3::zeros();
    for &i in indices {
        let info = data[i].covariance.try_inverse()?;
        information += info;
        weighted += info * data[i].translation;
    }
    let covariance = information.try_inverse()?;
    Some(TranslationEstimate {
        translation: covariance * weighted,
        covariance,
    })
}

/// One-point translation voting under a known rotation; residual is the
/// squared Mahalanobis distance between vote and hypothesis.
#[derive(Clone, Copy, Debug, Default)]
pub struct TranslationVoting;

impl Estimator for TranslationVoting {
    type Datum = TranslationVote;
    type Model = TranslationEstimate;

    const MIN_SAMPLES: usize = 1;

    fn fit(&self, data: &[TranslationVote], sample: &[usize]) -> Option<TranslationEstimate> {
        let vote = data[sample[0]];
        Some(TranslationEstimate {
            translation: vote.translation,
            covariance: vote.covariance,
        })
    }

    fn residual(&self, model: &TranslationEstimate, datum: &TranslationVote) -> f64 {
        let diff = datum.translation - model.translation;
        match (datum.covariance + model.covariance).try_inverse() {
            Some(info) => diff.dot(&(info * diff)),
            None => f64::INFINITY,
        }
    }

    fn refit(&self, data: &[TranslationVote], inliers: &[usize]) -> Option<TranslationEstimate> {
        fuse_translation_votes(data, inliers)
    }
}
