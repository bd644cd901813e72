use std::time::Duration;

use crate::KeypointStatus;

/// Per-status tally of a stereo frame's keypoints.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KeypointStatusCounts {
    pub valid: usize,
    pub no_left_rect: usize,
    pub no_right_rect: usize,
    pub no_depth: usize,
    pub failed_arun: usize,
}

impl KeypointStatusCounts {
    pub fn from_statuses(statuses: &[KeypointStatus]) -> Self {
        let mut counts = Self::default();
        for status in statuses {
            match status {
                KeypointStatus::Valid => counts.valid += 1,
                KeypointStatus::NoLeftRect => counts.no_left_rect += 1,
                KeypointStatus::NoRightRect => counts.no_right_rect += 1,
                KeypointStatus::NoDepth => counts.no_depth += 1,
                KeypointStatus::FailedArun => counts.failed_arun += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.valid + self.no_left_rect + self.no_right_rect + self.no_depth + self.failed_arun
    }
}

/// Counters and timings of the most recent tracker calls. Each stage
/// overwrites its own fields.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DebugTrackerInfo {
    pub nr_keypoints: usize,
    pub need_n_corners: usize,
    pub extracted_corners: usize,
    pub nr_tracked: usize,
    pub nr_dropped_age: usize,
    pub nr_dropped_flow: usize,

    pub nr_mono_putatives: usize,
    pub nr_mono_inliers: usize,
    pub mono_ransac_iters: usize,

    pub nr_stereo_putatives: usize,
    pub nr_stereo_inliers: usize,
    pub stereo_ransac_iters: usize,

    pub stereo_status: KeypointStatusCounts,

    pub feature_detection_time: Duration,
    pub feature_tracking_time: Duration,
    pub mono_ransac_time: Duration,
    pub stereo_ransac_time: Duration,
    pub feature_selection_time: Duration,
}

impl DebugTrackerInfo {
    pub fn log_summary(&self) {
        tracing::info!(
            keypoints = self.nr_keypoints,
            need_corners = self.need_n_corners,
            extracted = self.extracted_corners,
            tracked = self.nr_tracked,
            dropped_age = self.nr_dropped_age,
            dropped_flow = self.nr_dropped_flow,
            mono_putatives = self.nr_mono_putatives,
            mono_inliers = self.nr_mono_inliers,
            mono_iters = self.mono_ransac_iters,
            stereo_putatives = self.nr_stereo_putatives,
            stereo_inliers = self.nr_stereo_inliers,
            stereo_iters = self.stereo_ransac_iters,
            valid_rkp = self.stereo_status.valid,
            no_right_rect_rkp = self.stereo_status.no_right_rect,
            no_depth_rkp = self.stereo_status.no_depth,
            detection_ms = self.feature_detection_time.as_secs_f64() * 1e3,
            tracking_ms = self.feature_tracking_time.as_secs_f64() * 1e3,
            mono_ransac_ms = self.mono_ransac_time.as_secs_f64() * 1e3,
            stereo_ransac_ms = self.stereo_ransac_time.as_secs_f64() * 1e3,
            "tracker summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}

    #[test]
    fn default_info_is_zeroed() {
        let info = DebugTrackerInfo::default();
        assert_eq!(info.nr_tracked, 0);
        assert_eq!(info.stereo_status.total(), 0);
        assert_eq!(info.mono_ransac_time, Duration::ZERO);
    }

    #[test]
    fn status_counts_cover_every_category() {
        let statuses = [
            KeypointStatus::Valid,
            KeypointStatus::Valid,
            KeypointStatus::NoLeftRect,
            KeypointStatus::NoRightRect,
            KeypointStatus::NoDepth,
            KeypointStatus::NoDepth,
            KeypointStatus::FailedArun,
        ];
        let counts = KeypointStatusCounts::from_statuses(&statuses);
        assert_eq!(
            counts,
            KeypointStatusCounts {
                valid: 2,
                no_left_rect: 1,
                no_right_rect: 1,
                no_depth: 2,
                failed_arun: 1,
            }
        );
        assert_eq!(counts.total(), statuses.len());
    }

    #[test]
    fn debug_info_is_send() {
        assert_send::<DebugTrackerInfo>();
    }
}
