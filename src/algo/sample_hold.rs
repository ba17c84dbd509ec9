//! Sample-and-Hold scoring algorithm.

use tracing::info;

use crate::config::SampleHoldConfig;
use crate::model::{ChannelEntry, Sample};

use super::{argmax, threshold, ScoringAlgorithm};

pub struct SampleAndHold {
    config: SampleHoldConfig,
    num_full_scans: u32,
}

impl SampleAndHold {
    pub fn new(config: SampleHoldConfig) -> Self {
        SampleAndHold {
            config,
            num_full_scans: 0,
        }
    }
}

impl ScoringAlgorithm for SampleAndHold {
    fn process_measurement(&mut self, sample: &Sample, entry: &mut ChannelEntry) {
        entry.metric.accumulated_score = entry.metric.accumulated_score.saturating_add(sample.metric_raw as u32);
        entry.metric.samples_taken += 1;
    }

    fn evaluate_channels(
        &mut self,
        channel_set: &mut [ChannelEntry],
        scan_list: &[usize],
        current: usize,
    ) -> Option<usize> {
        self.num_full_scans += 1;
        let winner = argmax(channel_set, scan_list, current);
        channel_set[winner].metric.rounds_as_best += 1;

        if self.num_full_scans % self.config.rounds_for_eval != 0 {
            return None;
        }

        let current_total = channel_set[current].metric.accumulated_score;
        let bar = threshold(current_total, self.config.threshold_percentage);
        let winner_total = channel_set[winner].metric.accumulated_score;

        info!(
            target: "dcssrv::algo::sample_and_hold",
            winner, current, winner_total, bar, "evaluation boundary reached"
        );

        let result = if winner_total > bar { Some(winner) } else { None };

        for &idx in scan_list {
            channel_set[idx].metric.accumulated_score = 0;
        }

        result
    }

    fn post_switch(&mut self, _new_channel: usize) {
        // accumulated_score reset already happens at every evaluation
        // boundary; a switch always follows one, but reset again in case a
        // future caller invokes post_switch without an intervening
        // evaluation.
        self.num_full_scans = 0;
    }
}
