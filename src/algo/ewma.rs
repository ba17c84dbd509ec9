//! EWMA scoring algorithm.

use tracing::info;

use crate::config::EwmaConfig;
use crate::model::{ChannelEntry, Sample};

use super::{argmax, threshold, ScoringAlgorithm};

pub struct Ewma {
    config: EwmaConfig,
    rounds_with_better_channel: u32,
}

impl Ewma {
    pub fn new(config: EwmaConfig) -> Self {
        Ewma {
            config,
            rounds_with_better_channel: 0,
        }
    }
}

impl ScoringAlgorithm for Ewma {
    fn init_channels(&mut self, channel_set: &mut [ChannelEntry]) {
        for entry in channel_set.iter_mut() {
            entry.metric.accumulated_score = 100;
        }
    }

    fn process_measurement(&mut self, sample: &Sample, entry: &mut ChannelEntry) {
        let alpha = self.config.ewma_alpha as i64;
        let raw = sample.metric_raw as i64;
        let score = entry.metric.accumulated_score as i64;
        let updated = (alpha * raw + (100 - alpha) * score) / 100;
        entry.metric.accumulated_score = updated.clamp(0, u32::MAX as i64) as u32;
        entry.metric.samples_taken += 1;
    }

    fn evaluate_channels(
        &mut self,
        channel_set: &mut [ChannelEntry],
        scan_list: &[usize],
        current: usize,
    ) -> Option<usize> {
        let winner = argmax(channel_set, scan_list, current);

        if winner == current {
            self.rounds_with_better_channel = 0;
        } else {
            let current_score = channel_set[current].metric.accumulated_score;
            let pct = self.config.threshold_percentage;
            if channel_set[winner].metric.accumulated_score > threshold(current_score, pct) {
                self.rounds_with_better_channel += 1;
            }
        }
        channel_set[winner].metric.rounds_as_best += 1;

        info!(
            target: "dcssrv::algo::ewma",
            winner, current, rounds_with_better_channel = self.rounds_with_better_channel,
            "round evaluated"
        );

        if self.rounds_with_better_channel >= self.config.rounds_for_csa {
            Some(winner)
        } else {
            None
        }
    }

    fn post_switch(&mut self, _new_channel: usize) {
        self.rounds_with_better_channel = 0;
    }
}
