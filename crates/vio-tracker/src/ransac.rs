//! Seeded, model-agnostic sample consensus.
//!
//! Implement [`Estimator`] for a model and call [`ransac`]. The sampler is a
//! `ChaCha8Rng` seeded from [`RansacOptions::seed`] on every call, so identical
//! inputs always give identical results.
//!
//! Among hypotheses with the same inlier count the one with the lowest inlier
//! RMS residual wins; remaining ties keep the hypothesis found first.

use rand::prelude::IndexedRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct RansacOptions {
    pub max_iters: usize,
    /// Inlier residual threshold, in the estimator's residual units.
    pub thresh: f64,
    /// Desired probability in `(0, 1)` of drawing an outlier-free sample.
    pub confidence: f64,
    pub seed: u64,
    /// Refit the model on its inliers before scoring.
    pub refit_on_inliers: bool,
}

#[derive(Debug, Clone)]
pub struct RansacResult<M> {
    pub model: Option<M>,
    /// Ascending indices into the input data.
    pub inliers: Vec<usize>,
    pub inlier_rms: f64,
    /// Sampling iterations performed.
    pub iterations: usize,
    /// Calls into [`Estimator::fit`] and [`Estimator::refit`].
    pub models_fitted: usize,
}

impl<M> RansacResult<M> {
    pub fn success(&self) -> bool {
        self.model.is_some()
    }
}

impl<M> Default for RansacResult<M> {
    fn default() -> Self {
        Self {
            model: None,
            inliers: Vec::new(),
            inlier_rms: f64::INFINITY,
            iterations: 0,
            models_fitted: 0,
        }
    }
}

pub trait Estimator {
    type Datum;
    type Model;

    const MIN_SAMPLES: usize;

    /// Fits a model to a minimal sample. `None` for degenerate samples.
    fn fit(&self, data: &[Self::Datum], sample: &[usize]) -> Option<Self::Model>;

    /// Non-negative residual in the same units as [`RansacOptions::thresh`].
    fn residual(&self, model: &Self::Model, datum: &Self::Datum) -> f64;

    fn is_degenerate(&self, _data: &[Self::Datum], _sample: &[usize]) -> bool {
        false
    }

    /// Least-squares fit over a consensus set. Default keeps the minimal model.
    fn refit(&self, _data: &[Self::Datum], _inliers: &[usize]) -> Option<Self::Model> {
        None
    }
}

fn rms(residuals: &[f64]) -> f64 {
    if residuals.is_empty() {
        return f64::INFINITY;
    }
    let ss: f64 = residuals.iter().map(|r| r * r).sum();
    (ss / residuals.len() as f64).sqrt()
}

fn adaptive_iterations(
    confidence: f64,
    inlier_ratio: f64,
    min_samples: usize,
    iters_so_far: usize,
    max_iters: usize,
) -> usize {
    if confidence <= 0.0 || inlier_ratio <= 0.0 {
        return max_iters;
    }
    let denom = (1.0 - inlier_ratio.powi(min_samples as i32)).max(1e-12).ln();
    if denom >= 0.0 {
        return max_iters;
    }
    let needed = ((1.0 - confidence).ln() / denom).ceil();
    if !needed.is_finite() {
        return max_iters;
    }
    (needed as usize).clamp(iters_so_far, max_iters)
}

fn is_better(
    has_best: bool,
    count: usize,
    rms: f64,
    best_count: usize,
    best_rms: f64,
) -> bool {
    !has_best || count > best_count || (count == best_count && rms < best_rms)
}

fn score<E: Estimator>(
    estimator: &E,
    model: &E::Model,
    data: &[E::Datum],
    thresh: f64,
    inliers: &mut Vec<usize>,
    residuals: &mut Vec<f64>,
) {
    inliers.clear();
    residuals.clear();
    for (i, datum) in data.iter().enumerate() {
        let r = estimator.residual(model, datum);
        if r.is_finite() && r <= thresh {
            inliers.push(i);
            residuals.push(r);
        }
    }
}

/// Runs sample consensus. Never panics on degenerate data: without consensus
/// the result carries `model == None`.
pub fn ransac<E: Estimator>(
    estimator: &E,
    data: &[E::Datum],
    opts: &RansacOptions,
) -> RansacResult<E::Model> {
    let mut best: RansacResult<E::Model> = RansacResult::default();
    if E::MIN_SAMPLES == 0 || data.len() < E::MIN_SAMPLES {
        return best;
    }

    let all_indices: Vec<usize> = (0..data.len()).collect();
    let mut sample = vec![0usize; E::MIN_SAMPLES];
    let mut rng = ChaCha8Rng::seed_from_u64(opts.seed);

    let mut inliers = Vec::with_capacity(data.len());
    let mut residuals = Vec::with_capacity(data.len());
    let mut refined_inliers = Vec::with_capacity(data.len());
    let mut refined_residuals = Vec::with_capacity(data.len());

    let mut dynamic_max_iters = opts.max_iters;
    let mut iterations = 0;
    let mut models_fitted = 0;
    while iterations < dynamic_max_iters {
        iterations += 1;
        all_indices
            .choose_multiple(&mut rng, E::MIN_SAMPLES)
            .enumerate()
            .for_each(|(k, &idx)| sample[k] = idx);
        // Sorted samples make fits independent of draw order.
        sample.sort_unstable();

        if estimator.is_degenerate(data, &sample) {
            continue;
        }
        models_fitted += 1;
        let Some(model) = estimator.fit(data, &sample) else {
            continue;
        };

        score(estimator, &model, data, opts.thresh, &mut inliers, &mut residuals);
        if inliers.len() < E::MIN_SAMPLES {
            continue;
        }

        let mut candidate = model;
        let (final_inliers, final_residuals) = if opts.refit_on_inliers {
            models_fitted += 1;
            match estimator.refit(data, &inliers) {
                Some(refined) => {
                    score(
                        estimator,
                        &refined,
                        data,
                        opts.thresh,
                        &mut refined_inliers,
                        &mut refined_residuals,
                    );
                    if refined_inliers.len() >= inliers.len() {
                        candidate = refined;
                        (&refined_inliers, &refined_residuals)
                    } else {
                        (&inliers, &residuals)
                    }
                }
                None => (&inliers, &residuals),
            }
        } else {
            (&inliers, &residuals)
        };

        let candidate_rms = rms(final_residuals);
        if is_better(
            best.model.is_some(),
            final_inliers.len(),
            candidate_rms,
            best.inliers.len(),
            best.inlier_rms,
        ) {
            best.model = Some(candidate);
            best.inliers.clone_from(final_inliers);
            best.inlier_rms = candidate_rms;

            let inlier_ratio = best.inliers.len() as f64 / data.len() as f64;
            dynamic_max_iters = adaptive_iterations(
                opts.confidence,
                inlier_ratio,
                E::MIN_SAMPLES,
                iterations,
                opts.max_iters,
            );
        }
    }

    best.iterations = iterations;
    best.models_fitted = models_fitted;
    best
}
