//! Core data model. Channel descriptors are immutable once built;
//! channel entries own their metric and are the sole owners of that state —
//! the scan list (held by [`crate::dcs::Scheduler`]) only ever references
//! entries by index, never by a cloned/owned copy.

use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// An immutable, permitted operating channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub s1g_channel_number: u16,
    pub centre_frequency_khz: u32,
    pub bandwidth_mhz: u8,
}

/// Running score bookkeeping for one channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct Metric {
    pub accumulated_score: u32,
    pub samples_taken: u32,
    pub rounds_as_best: u32,
}

/// One permitted channel plus its accumulated metric and retry bookkeeping.
#[derive(Debug, Clone)]
pub struct ChannelEntry {
    pub descriptor: ChannelDescriptor,
    pub metric: Metric,
    /// Consecutive measurement failures on this channel under the 3-strike
    /// retry policy; reset on a successful measurement or on the current
    /// operating channel, which is never evicted.
    pub consecutive_failures: u32,
}

impl ChannelEntry {
    pub fn new(descriptor: ChannelDescriptor) -> Self {
        ChannelEntry {
            descriptor,
            metric: Metric::default(),
            consecutive_failures: 0,
        }
    }
}

/// A measurement produced by the vendor backend or synthesised by the replay
/// path.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub captured_at: std::time::SystemTime,
    pub metric_raw: u8,
    pub noise_rssi: i8,
    pub listen_time_us: u64,
    pub rx_time_us: u64,
}

/// Mutated exclusively by the scheduler after a confirmed channel switch.
#[derive(Debug, Clone, Copy)]
pub struct OperatingState {
    pub current_channel: usize,
    pub current_5g_freq: u32,
    pub primary_width_mhz: u8,
    pub primary_1mhz_index: u16,
    pub beacon_interval_tu: u32,
    pub dtim_period: u32,
}

/// Guards the single in-flight channel-switch rendezvous.
pub struct SwitchContext {
    pub mutex: Mutex<SwitchState>,
    pub done: Condvar,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SwitchState {
    pub in_progress: bool,
    pub confirmed_freq: u32,
}

impl Default for SwitchContext {
    fn default() -> Self {
        SwitchContext {
            mutex: Mutex::new(SwitchState::default()),
            done: Condvar::new(),
        }
    }
}

/// Guards the single-slot measurement rendezvous.
pub struct ScanContext {
    pub mutex: Mutex<ScanState>,
    pub done: Condvar,
}

pub struct ScanState {
    pub current_channel_under_measurement: Option<usize>,
    pub pending_result: Option<Sample>,
    /// Set by the scheduler before awaiting `done`; cleared by the
    /// handler that delivers a result, so a late vendor event arriving
    /// after the wait has already timed out is logged and dropped
    /// (pending_result is empty, nothing to deliver into).
    pub awaiting: bool,
}

impl Default for ScanState {
    fn default() -> Self {
        ScanState {
            current_channel_under_measurement: None,
            pending_result: None,
            awaiting: false,
        }
    }
}

impl Default for ScanContext {
    fn default() -> Self {
        ScanContext {
            mutex: Mutex::new(ScanState::default()),
            done: Condvar::new(),
        }
    }
}

/// Monotonic deadline helper shared by the scheduler's measurement wait and
/// the switch coordinator's completion wait.
pub fn deadline_from(now: Instant, secs: u64) -> Instant {
    now + std::time::Duration::from_secs(secs)
}
