//! Identity-based correspondence between frames.

use std::collections::{HashMap, HashSet};

use crate::frame::{Frame, StereoFrame};
use crate::{Keypoint, KeypointMatch, KeypointStatus, LandmarkId};

/// Pairs keypoints sharing a landmark id, in the order of `current`'s landmarks.
pub fn match_mono(reference: &Frame, current: &Frame) -> Vec<KeypointMatch> {
    let ref_index: HashMap<LandmarkId, usize> = reference
        .landmarks()
        .iter()
        .enumerate()
        .map(|(i, &id)| (id, i))
        .collect();
    current
        .landmarks()
        .iter()
        .enumerate()
        .filter_map(|(cur_idx, id)| {
            ref_index
                .get(id)
                .map(|&ref_idx| KeypointMatch::new(ref_idx, cur_idx))
        })
        .collect()
}

/// Left-image identity matches whose stereo status is `Valid` in both frames.
/// With `restrict_to`, only pairs also present there are kept.
pub fn match_stereo(
    reference: &StereoFrame,
    current: &StereoFrame,
    restrict_to: Option<&[KeypointMatch]>,
) -> Vec<KeypointMatch> {
    let allowed: Option<HashSet<KeypointMatch>> =
        restrict_to.map(|matches| matches.iter().copied().collect());
    match_mono(reference.left(), current.left())
        .into_iter()
        .filter(|m| allowed.as_ref().map_or(true, |set| set.contains(m)))
        .filter(|m| {
            reference.status()[m.ref_idx] == KeypointStatus::Valid
                && current.status()[m.cur_idx] == KeypointStatus::Valid
        })
        .collect()
}

/// Median pixel displacement over `matches`; `None` when there are none.
///
/// Panics if a match indexes past either keypoint set.
pub fn compute_median_disparity(
    reference: &[Keypoint],
    current: &[Keypoint],
    matches: &[KeypointMatch],
) -> Option<f64> {
    if matches.is_empty() {
        return None;
    }
    let mut disparities: Vec<f64> = matches
        .iter()
        .map(|m| reference[m.ref_idx].distance(&current[m.cur_idx]))
        .collect();
    disparities.sort_by(f64::total_cmp);
    let mid = disparities.len() / 2;
    let median = if disparities.len() % 2 == 0 {
        0.5 * (disparities[mid - 1] + disparities[mid])
    } else {
        disparities[mid]
    };
    Some(median)
}

/// Positions in `matches` not listed in `inliers`, ascending.
pub fn find_outliers(matches: &[KeypointMatch], inliers: &[usize]) -> Vec<usize> {
    let inliers: HashSet<usize> = inliers.iter().copied().collect();
    (0..matches.len()).filter(|i| !inliers.contains(i)).collect()
}
