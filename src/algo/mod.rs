//! Pluggable scoring algorithms: a small capability set (`init_channels`,
//! `process_measurement`, `evaluate_channels`, `post_switch`, `deinit`) with
//! a tagged selector chosen at configuration time, dispatched through a
//! `Box<dyn Trait>`.

pub mod ewma;
pub mod sample_hold;

use crate::config::{AlgoType, DcsSection};
use crate::error::DcsError;
use crate::model::{ChannelEntry, Sample};

/// Common operations every scoring algorithm implements. All but
/// construction (which stands in for `init`) are optional.
pub trait ScoringAlgorithm: Send {
    /// Called once, immediately after the channel set is built at INIT,
    /// to let the algorithm seed its own initial per-channel state (EWMA's
    /// initial score of 100, for instance).
    fn init_channels(&mut self, _channel_set: &mut [ChannelEntry]) {}

    fn process_measurement(&mut self, _sample: &Sample, _entry: &mut ChannelEntry) {}

    /// Called exactly once per complete traversal of the scan list. Returns
    /// the candidate channel index to switch to, if any. Takes the channel
    /// set mutably so it can update `rounds_as_best` on the winner.
    fn evaluate_channels(
        &mut self,
        _channel_set: &mut [ChannelEntry],
        _scan_list: &[usize],
        _current: usize,
    ) -> Option<usize> {
        None
    }

    /// Called after a *confirmed* switch only — never on timeout/mismatch.
    fn post_switch(&mut self, _new_channel: usize) {}

    fn deinit(&mut self) {}
}

/// `score * (100 + pct) / 100`, computed in `i64` so a negative
/// `threshold_percentage` cannot underflow before the final clamp.
pub fn threshold(score: u32, pct: i64) -> u32 {
    let value = (score as i64) * (100 + pct) / 100;
    value.max(0) as u32
}

/// Select the scan-list entry with the greatest `accumulated_score`.
/// Ties are broken by picking the candidate whose centre frequency is
/// farthest from the current channel's; if the current channel is itself
/// among the tied entries, it wins (no switching for switching's sake).
pub fn argmax(channel_set: &[ChannelEntry], scan_list: &[usize], current: usize) -> usize {
    assert!(!scan_list.is_empty(), "argmax requires a non-empty scan list");
    let max_score = scan_list
        .iter()
        .map(|&i| channel_set[i].metric.accumulated_score)
        .max()
        .expect("scan list non-empty");
    let tied: Vec<usize> = scan_list
        .iter()
        .copied()
        .filter(|&i| channel_set[i].metric.accumulated_score == max_score)
        .collect();
    if tied.contains(&current) {
        return current;
    }
    let current_freq = channel_set[current].descriptor.centre_frequency_khz as i64;
    tied.into_iter()
        .max_by_key(|&i| (channel_set[i].descriptor.centre_frequency_khz as i64 - current_freq).abs())
        .expect("tied is non-empty")
}

/// Build the configured algorithm from its config section.
pub fn build(section: &DcsSection) -> Result<Box<dyn ScoringAlgorithm>, DcsError> {
    match section.algo_type {
        AlgoType::Ewma => {
            let cfg = section
                .ewma
                .clone()
                .ok_or_else(|| DcsError::Config("dcs.ewma missing".into()))?;
            Ok(Box::new(ewma::Ewma::new(cfg)))
        }
        AlgoType::SampleAndHold => {
            let cfg = section
                .sample_and_hold
                .clone()
                .ok_or_else(|| DcsError::Config("dcs.sample_and_hold missing".into()))?;
            Ok(Box::new(sample_hold::SampleAndHold::new(cfg)))
        }
    }
}
