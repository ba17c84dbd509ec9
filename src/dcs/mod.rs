//! DCS scheduler: the top-level state machine that owns the channel set,
//! drives measurement/evaluation/switch, and the channel-switch coordinator
//! it delegates to at round end.

pub mod status;
pub mod switch;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::algo::ScoringAlgorithm;
use crate::backend::hostapd::HostapdBackend;
use crate::backend::netlink::NetlinkBackend;
use crate::backend::vendor::{self, VendorBackend};
use crate::backend::Backend;
use crate::config::{AlgoType, DcsSection};
use crate::dataitem::ItemKey;
use crate::datalog::Datalog;
use crate::engine::EventEngine;
use crate::error::{BackendError, DcsError};
use crate::model::{ChannelDescriptor, ChannelEntry, OperatingState, Sample, ScanContext, SwitchContext};
use crate::replay::ReplaySource;

use switch::{SwitchCoordinator, SwitchOutcome};

const AP_ENABLED_MAX_ATTEMPTS: u32 = 10;
const AP_ENABLED_RETRY_SPACING: Duration = Duration::from_secs(10);
const INIT_FREQ_RETRY_ATTEMPTS: u32 = 3;
const INIT_FREQ_RETRY_SPACING: Duration = Duration::from_secs(1);
const MEASUREMENT_TIMEOUT: Duration = Duration::from_secs(10);
const CHANNEL_FAILURE_LIMIT: u32 = 3;

/// The source of per-channel measurements: either the live vendor backend
/// (rendezvousing through [`ScanContext`] with the async OCS_DONE monitor)
/// or the CSV replay path.
pub trait MeasurementSource: Send {
    fn measure(&self, channel: &ChannelDescriptor, operating: &OperatingState) -> Result<Sample, DcsError>;

    /// `true` once there is nothing left to measure (replay path only).
    fn drained(&self) -> bool {
        false
    }
}

/// Live measurement path: kicks off an OCS via the vendor backend, then
/// blocks on the scan rendezvous for the result delivered by the async
/// dispatcher's OCS_DONE monitor.
pub struct LiveMeasurement {
    vendor: Arc<VendorBackend>,
    scan_ctx: Arc<ScanContext>,
}

impl LiveMeasurement {
    pub fn new(vendor: Arc<VendorBackend>, scan_ctx: Arc<ScanContext>) -> Self {
        LiveMeasurement { vendor, scan_ctx }
    }
}

impl MeasurementSource for LiveMeasurement {
    fn measure(&self, channel: &ChannelDescriptor, operating: &OperatingState) -> Result<Sample, DcsError> {
        {
            let mut state = self.scan_ctx.mutex.lock();
            assert!(state.pending_result.is_none(), "at most one in-flight measurement");
            state.current_channel_under_measurement = Some(channel.s1g_channel_number as usize);
            state.awaiting = true;
        }

        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&(channel.centre_frequency_khz.saturating_mul(1000)).to_le_bytes());
        payload.push(channel.bandwidth_mhz);
        payload.push(operating.primary_width_mhz);
        payload.extend_from_slice(&operating.primary_1mhz_index.to_le_bytes());

        if let Err(e) = self.vendor.trigger_ocs(payload) {
            let mut state = self.scan_ctx.mutex.lock();
            state.awaiting = false;
            state.current_channel_under_measurement = None;
            return Err(DcsError::Backend(e));
        }

        let mut state = self.scan_ctx.mutex.lock();
        if state.pending_result.is_none() {
            let result = self.scan_ctx.done.wait_for(&mut state, MEASUREMENT_TIMEOUT);
            if result.timed_out() && state.pending_result.is_none() {
                state.awaiting = false;
                state.current_channel_under_measurement = None;
                return Err(DcsError::Backend(BackendError::Timeout));
            }
        }
        let sample = state.pending_result.take();
        state.awaiting = false;
        state.current_channel_under_measurement = None;
        sample.ok_or(DcsError::Backend(BackendError::EmptyResponse))
    }
}

/// Deliver an `OCS_DONE` event into the scan rendezvous. Registered as the
/// vendor backend's async monitor callback at INIT.
fn deliver_ocs_done(event: &crate::dataitem::DataItem, scan_ctx: &ScanContext) {
    let Some(sample) = vendor::decode_event_sample(event) else {
        warn!(target: "dcssrv::dcs", "OCS_DONE event failed to decode, dropping");
        return;
    };
    let mut state = scan_ctx.mutex.lock();
    if !state.awaiting {
        info!(target: "dcssrv::dcs", "OCS_DONE arrived with no measurement awaiting, dropping");
        return;
    }
    state.pending_result = Some(sample);
    drop(state);
    scan_ctx.done.notify_all();
}

/// A permitted channel is admissible to the scan list only if its bandwidth
/// matches the current operating bandwidth and its derived primary centre
/// matches some permitted channel.
fn build_scan_list(channel_set: &[ChannelEntry], operating: &OperatingState) -> Vec<usize> {
    let current_bw = channel_set[operating.current_channel].descriptor.bandwidth_mhz;
    channel_set
        .iter()
        .enumerate()
        .filter_map(|(i, entry)| {
            if entry.descriptor.bandwidth_mhz != current_bw {
                return None;
            }
            let centre = switch::primary_centre_khz(
                entry.descriptor.centre_frequency_khz,
                entry.descriptor.bandwidth_mhz,
                operating.primary_width_mhz,
                operating.primary_1mhz_index,
            );
            let admissible = channel_set
                .iter()
                .any(|e| e.descriptor.centre_frequency_khz == centre && e.descriptor.bandwidth_mhz == operating.primary_width_mhz);
            admissible.then_some(i)
        })
        .collect()
}

pub struct DcsScheduler {
    channel_set: Vec<ChannelEntry>,
    scan_list: Vec<usize>,
    scan_cursor: usize,
    operating: OperatingState,
    algo: Box<dyn ScoringAlgorithm>,
    config: DcsSection,
    hostapd: Arc<HostapdBackend>,
    measurement: Box<dyn MeasurementSource>,
    switch_coordinator: SwitchCoordinator,
    datalog: Datalog,
    cancel: Arc<AtomicBool>,
}

impl DcsScheduler {
    /// Live INIT path: wait for AP readiness, enumerate
    /// channels, read operating state, build the scan list.
    #[allow(clippy::too_many_arguments)]
    pub fn init_live(
        config: DcsSection,
        event_engine: &Arc<EventEngine>,
        hostapd: Arc<HostapdBackend>,
        netlink: Arc<NetlinkBackend>,
        vendor: Arc<VendorBackend>,
        algo: Box<dyn ScoringAlgorithm>,
        datalog: Datalog,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self, DcsError> {
        wait_for_ap_enabled(&hostapd)?;

        let mut ap_status = status::query(&hostapd)?;
        if ap_status.s1g_freq < 0 {
            ap_status = retry_for_valid_freq(&hostapd)?;
        }

        let descriptors = vendor.get_available_channels().map_err(DcsError::Backend)?;
        let mut channel_set: Vec<ChannelEntry> = descriptors.into_iter().map(ChannelEntry::new).collect();

        let current_channel = channel_set
            .iter()
            .position(|e| e.descriptor.centre_frequency_khz == ap_status.s1g_freq as u32 && e.descriptor.bandwidth_mhz == ap_status.s1g_bw)
            .ok_or(DcsError::NoMatchingChannel)?;

        let operating = OperatingState {
            current_channel,
            current_5g_freq: ap_status.freq,
            primary_width_mhz: ap_status.s1g_prim_chwidth,
            primary_1mhz_index: ap_status.s1g_prim_1mhz_chan_index,
            beacon_interval_tu: ap_status.beacon_int,
            dtim_period: ap_status.dtim_period,
        };

        let mut algo = algo;
        algo.init_channels(&mut channel_set);

        let scan_list = build_scan_list(&channel_set, &operating);
        if scan_list.is_empty() {
            return Err(DcsError::EmptyScanList);
        }

        let scan_ctx = Arc::new(ScanContext::default());
        let switch_ctx = Arc::new(SwitchContext::default());

        let scan_ctx_for_monitor = scan_ctx.clone();
        event_engine.register_monitor(
            vendor.clone() as Arc<dyn Backend>,
            ItemKey::Id(vendor::OCS_DONE as u32),
            Arc::new(move |event| deliver_ocs_done(event, &scan_ctx_for_monitor)),
        );

        let switch_ctx_for_monitor = switch_ctx.clone();
        let hostapd_for_monitor = hostapd.clone();
        event_engine.register_monitor(
            netlink as Arc<dyn Backend>,
            ItemKey::Id(crate::backend::netlink::NL80211_CMD_CH_SWITCH_NOTIFY),
            Arc::new(move |event| switch::handle_ch_switch_notify(event, &switch_ctx_for_monitor, &hostapd_for_monitor)),
        );

        let switch_coordinator = SwitchCoordinator::new(hostapd.clone(), switch_ctx);
        let measurement: Box<dyn MeasurementSource> = Box::new(LiveMeasurement::new(vendor, scan_ctx));

        Ok(DcsScheduler {
            channel_set,
            scan_list,
            scan_cursor: 0,
            operating,
            algo,
            config,
            hostapd,
            measurement,
            switch_coordinator,
            datalog,
            cancel,
        })
    }

    /// Replay INIT path: the channel set and initial operating
    /// channel come from the CSV file rather than a live AP.
    pub fn init_replay(
        config: DcsSection,
        replay: Arc<ReplaySource>,
        hostapd: Arc<HostapdBackend>,
        switch_ctx: Arc<SwitchContext>,
        mut algo: Box<dyn ScoringAlgorithm>,
        datalog: Datalog,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self, DcsError> {
        let mut channel_set: Vec<ChannelEntry> = replay
            .channel_descriptors()
            .iter()
            .copied()
            .map(ChannelEntry::new)
            .collect();
        algo.init_channels(&mut channel_set);

        let current_channel = replay.initial_channel_index();
        let operating = OperatingState {
            current_channel,
            current_5g_freq: channel_set[current_channel].descriptor.centre_frequency_khz,
            primary_width_mhz: 1,
            primary_1mhz_index: 0,
            beacon_interval_tu: 100,
            dtim_period: 2,
        };

        let scan_list = build_scan_list(&channel_set, &operating);
        if scan_list.is_empty() {
            return Err(DcsError::EmptyScanList);
        }

        let switch_coordinator = SwitchCoordinator::new(hostapd.clone(), switch_ctx);

        Ok(DcsScheduler {
            channel_set,
            scan_list,
            scan_cursor: 0,
            operating,
            algo,
            config,
            hostapd,
            measurement: replay,
            switch_coordinator,
            datalog,
            cancel,
        })
    }

    fn sec_per_scan(&self) -> u64 {
        match self.config.algo_type {
            AlgoType::Ewma => self.config.ewma.as_ref().map(|c| c.sec_per_scan).unwrap_or(1),
            AlgoType::SampleAndHold => self.config.sample_and_hold.as_ref().map(|c| c.sec_per_scan).unwrap_or(1),
        }
    }

    fn sec_per_round(&self) -> u64 {
        match self.config.algo_type {
            AlgoType::Ewma => self.config.ewma.as_ref().map(|c| c.sec_per_round).unwrap_or(5),
            AlgoType::SampleAndHold => self.config.sample_and_hold.as_ref().map(|c| c.sec_per_round).unwrap_or(5),
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// RUN loop. Returns when cancelled or the replay source is drained.
    /// Calls the algorithm's `deinit` before returning so a caller's
    /// shutdown sequence only needs to join this thread before tearing down
    /// the event engine.
    pub fn run(&mut self) {
        loop {
            if self.cancelled() {
                break;
            }
            std::thread::sleep(Duration::from_secs(self.sec_per_scan()));
            if self.cancelled() {
                break;
            }

            let idx = self.scan_list[self.scan_cursor];
            let descriptor = self.channel_set[idx].descriptor;
            match self.measurement.measure(&descriptor, &self.operating) {
                Ok(sample) => {
                    self.channel_set[idx].consecutive_failures = 0;
                    self.algo.process_measurement(&sample, &mut self.channel_set[idx]);
                    self.datalog.record(&self.channel_set, idx, &self.operating);
                }
                Err(e) => {
                    warn!(target: "dcssrv::dcs", channel = idx, error = %e, "measurement failed");
                    self.channel_set[idx].consecutive_failures += 1;
                    if idx != self.operating.current_channel && self.channel_set[idx].consecutive_failures >= CHANNEL_FAILURE_LIMIT {
                        info!(target: "dcssrv::dcs", channel = idx, "removing channel from scan list after repeated failures");
                        self.scan_list.retain(|&i| i != idx);
                        if self.scan_list.is_empty() {
                            crate::fatal!("scan list emptied by consecutive measurement failures");
                        }
                        if self.scan_cursor >= self.scan_list.len() {
                            self.scan_cursor = 0;
                        }
                        if self.measurement.drained() {
                            break;
                        }
                        continue;
                    } else if idx == self.operating.current_channel && self.channel_set[idx].consecutive_failures >= CHANNEL_FAILURE_LIMIT {
                        // Never evict the current operating channel; reset the strike
                        // counter instead so it keeps getting retried indefinitely.
                        self.channel_set[idx].consecutive_failures = 0;
                    }

                    if self.measurement.drained() {
                        info!(target: "dcssrv::dcs", "replay source drained, halting");
                        break;
                    }
                    std::thread::sleep(Duration::from_secs(self.sec_per_round()));
                    continue;
                }
            }

            if self.measurement.drained() {
                info!(target: "dcssrv::dcs", "replay source drained, halting");
                break;
            }

            self.scan_cursor += 1;
            if self.scan_cursor >= self.scan_list.len() {
                self.scan_cursor = 0;
                self.end_of_round();
            }

            std::thread::sleep(Duration::from_secs(self.sec_per_round()));
        }
        self.algo.deinit();
    }

    fn end_of_round(&mut self) {
        let current = self.operating.current_channel;
        let winner = self.algo.evaluate_channels(&mut self.channel_set, &self.scan_list, current);
        if let Some(winner) = winner {
            if winner != current {
                self.attempt_switch(winner);
            }
        }
    }

    fn attempt_switch(&mut self, candidate_idx: usize) {
        let candidate = self.channel_set[candidate_idx].descriptor;
        let outcome = self.switch_coordinator.switch_to(&candidate, &self.operating, &self.config);
        match outcome {
            SwitchOutcome::Ok => {
                self.operating.current_channel = candidate_idx;
                self.operating.current_5g_freq = candidate.centre_frequency_khz;
                self.algo.post_switch(candidate_idx);
                info!(target: "dcssrv::dcs", candidate = candidate_idx, "channel switch confirmed");
            }
            SwitchOutcome::Disabled => {
                info!(target: "dcssrv::dcs", candidate = candidate_idx, "CSA disabled, switch not executed");
            }
            SwitchOutcome::Rejected => {
                warn!(target: "dcssrv::dcs", candidate = candidate_idx, "CHAN_SWITCH rejected by AP");
            }
            SwitchOutcome::Timeout | SwitchOutcome::Mismatch => {
                warn!(target: "dcssrv::dcs", candidate = candidate_idx, ?outcome, "channel switch did not complete as expected");
                self.resync_operating_state();
            }
        }
    }

    fn resync_operating_state(&mut self) {
        let Ok(ap_status) = status::query(&self.hostapd) else {
            warn!(target: "dcssrv::dcs", "failed to resync operating state after a failed switch");
            return;
        };
        if let Some(idx) = self
            .channel_set
            .iter()
            .position(|e| e.descriptor.centre_frequency_khz == ap_status.s1g_freq as u32 && e.descriptor.bandwidth_mhz == ap_status.s1g_bw)
        {
            self.operating.current_channel = idx;
            self.operating.current_5g_freq = ap_status.freq;
        }
    }
}

fn wait_for_ap_enabled(hostapd: &HostapdBackend) -> Result<(), DcsError> {
    for attempt in 0..AP_ENABLED_MAX_ATTEMPTS {
        if let Ok(ap_status) = status::query(hostapd) {
            if ap_status.enabled {
                return Ok(());
            }
        }
        if attempt + 1 < AP_ENABLED_MAX_ATTEMPTS {
            std::thread::sleep(AP_ENABLED_RETRY_SPACING);
        }
    }
    Err(DcsError::ApNotReady)
}

fn retry_for_valid_freq(hostapd: &HostapdBackend) -> Result<status::ApStatus, DcsError> {
    for _ in 0..INIT_FREQ_RETRY_ATTEMPTS {
        std::thread::sleep(INIT_FREQ_RETRY_SPACING);
        if let Ok(ap_status) = status::query(hostapd) {
            if ap_status.s1g_freq >= 0 {
                return Ok(ap_status);
            }
        }
    }
    status::query(hostapd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Metric;

    fn entry(freq: u32, bw: u8) -> ChannelEntry {
        ChannelEntry {
            descriptor: ChannelDescriptor {
                s1g_channel_number: 1,
                centre_frequency_khz: freq,
                bandwidth_mhz: bw,
            },
            metric: Metric::default(),
            consecutive_failures: 0,
        }
    }

    #[test]
    fn scan_list_filters_by_bandwidth_and_primary_admissibility() {
        let op_centre = 915_000u32;
        let bw = 4u8;
        let primary_centre = switch::primary_centre_khz(op_centre, bw, 1, 0);
        let channel_set = vec![
            entry(op_centre, bw),       // current, bw matches
            entry(op_centre + 4000, bw), // bw matches, but its own derived primary won't matter: admissibility depends on *current*'s primary centre existing in the set
            entry(primary_centre, 1),   // the primary sub-channel itself, present in the set
            entry(op_centre + 4000, 1), // different bandwidth than current, excluded
        ];
        let operating = OperatingState {
            current_channel: 0,
            current_5g_freq: op_centre,
            primary_width_mhz: 1,
            primary_1mhz_index: 0,
            beacon_interval_tu: 100,
            dtim_period: 2,
        };
        let scan_list = build_scan_list(&channel_set, &operating);
        assert!(scan_list.contains(&0));
        assert!(scan_list.contains(&1));
        assert!(!scan_list.contains(&3));
    }

    struct NoOpAlgo;
    impl ScoringAlgorithm for NoOpAlgo {}

    struct FlakyMeasurement {
        fail_freq: u32,
    }
    impl MeasurementSource for FlakyMeasurement {
        fn measure(&self, channel: &ChannelDescriptor, _operating: &OperatingState) -> Result<Sample, DcsError> {
            if channel.centre_frequency_khz == self.fail_freq {
                Err(DcsError::Backend(BackendError::EmptyResponse))
            } else {
                Ok(Sample {
                    captured_at: std::time::UNIX_EPOCH,
                    metric_raw: 50,
                    noise_rssi: 0,
                    listen_time_us: 0,
                    rx_time_us: 0,
                })
            }
        }
    }

    #[test]
    fn repeated_failures_remove_a_channel_but_never_the_current_one() {
        let tmp = tempfile::tempdir().unwrap();
        let _listener = std::os::unix::net::UnixDatagram::bind(tmp.path().join("wlan0")).unwrap();
        let hostapd = Arc::new(HostapdBackend::connect(tmp.path(), "wlan0").unwrap());

        let operating = OperatingState {
            current_channel: 0,
            current_5g_freq: 915_000,
            primary_width_mhz: 1,
            primary_1mhz_index: 0,
            beacon_interval_tu: 100,
            dtim_period: 2,
        };
        let config = DcsSection {
            trigger_csa: false,
            dtims_for_csa: 1,
            algo_type: AlgoType::Ewma,
            ewma: Some(crate::config::EwmaConfig {
                ewma_alpha: 50,
                threshold_percentage: 0,
                rounds_for_csa: 1,
                sec_per_scan: 0,
                sec_per_round: 0,
            }),
            sample_and_hold: None,
            test: crate::config::TestConfig::default(),
        };

        let mut scheduler = DcsScheduler {
            channel_set: vec![entry(915_000, 4), entry(916_000, 4)],
            scan_list: vec![0, 1],
            scan_cursor: 0,
            operating,
            algo: Box::new(NoOpAlgo),
            config,
            hostapd: hostapd.clone(),
            measurement: Box::new(FlakyMeasurement { fail_freq: 916_000 }),
            switch_coordinator: SwitchCoordinator::new(hostapd, Arc::new(SwitchContext::default())),
            datalog: Datalog::disabled(),
            cancel: Arc::new(AtomicBool::new(false)),
        };

        let cancel = scheduler.cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            cancel.store(true, Ordering::SeqCst);
        });

        scheduler.run();

        assert_eq!(scheduler.scan_list, vec![0]);
        assert!(scheduler.channel_set[1].consecutive_failures >= CHANNEL_FAILURE_LIMIT);
    }
}
