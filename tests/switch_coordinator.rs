//! End-to-end exercises of the channel-switch coordinator against a fake
//! hostapd control socket standing in for a live AP, covering the CSA
//! outcomes described for a failed-channel removal and a CSA mismatch.

use std::os::unix::net::UnixDatagram;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use dcssrv::backend::hostapd::HostapdBackend;
use dcssrv::backend::netlink::NL80211_ATTR_WIPHY_FREQ;
use dcssrv::config::{AlgoType, DcsSection, TestConfig};
use dcssrv::dataitem::DataItem;
use dcssrv::dcs::switch::{handle_ch_switch_notify, SwitchCoordinator, SwitchOutcome};
use dcssrv::model::{ChannelDescriptor, OperatingState, SwitchContext};

/// A hostapd control socket that answers `STATUS` from a shared, mutable
/// frequency and `CHAN_SWITCH` with a fixed reply line. Runs until the test
/// process exits; the bound file is cleaned up by the OS temp dir drop.
struct FakeHostapd {
    _server: UnixDatagram,
}

fn spawn_fake_hostapd(dir: &std::path::Path, iface: &str, status_freq: Arc<Mutex<u32>>, chan_switch_reply: &'static str) -> FakeHostapd {
    let path = dir.join(iface);
    let server = UnixDatagram::bind(&path).expect("bind fake hostapd socket");
    let worker = server.try_clone().expect("clone fake hostapd socket");
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            let (n, peer) = match worker.recv_from(&mut buf) {
                Ok(v) => v,
                Err(_) => break,
            };
            let msg = String::from_utf8_lossy(&buf[..n]);
            let reply = if msg.starts_with("STATUS") {
                let freq = *status_freq.lock().unwrap();
                format!(
                    "state=ENABLED\ns1g_freq={freq}\ns1g_bw=4\ns1g_prim_chwidth=1\n\
                     s1g_prim_1mhz_chan_index=0\nbeacon_int=100\ndtim_period=2\nfreq={freq}\n"
                )
            } else if msg.starts_with("CHAN_SWITCH") {
                format!("{chan_switch_reply}\n")
            } else if msg == "ATTACH" {
                "OK\n".to_string()
            } else {
                "UNKNOWN\n".to_string()
            };
            let _ = worker.send_to(reply.as_bytes(), peer.as_pathname().unwrap());
        }
    });
    FakeHostapd { _server: server }
}

fn candidate() -> ChannelDescriptor {
    ChannelDescriptor {
        s1g_channel_number: 3,
        centre_frequency_khz: 917_000,
        bandwidth_mhz: 4,
    }
}

fn operating() -> OperatingState {
    OperatingState {
        current_channel: 0,
        current_5g_freq: 915_000,
        primary_width_mhz: 1,
        primary_1mhz_index: 0,
        beacon_interval_tu: 1,
        dtim_period: 1,
    }
}

fn dcs_section(trigger_csa: bool) -> DcsSection {
    DcsSection {
        trigger_csa,
        dtims_for_csa: 1,
        algo_type: AlgoType::Ewma,
        ewma: None,
        sample_and_hold: None,
        test: TestConfig::default(),
    }
}

#[test]
fn csa_disabled_by_configuration_never_touches_the_socket() {
    let tmp = tempfile::tempdir().unwrap();
    let _fake = spawn_fake_hostapd(tmp.path(), "wlan0", Arc::new(Mutex::new(915_000)), "OK");
    let hostapd = Arc::new(HostapdBackend::connect(tmp.path(), "wlan0").unwrap());
    let coordinator = SwitchCoordinator::new(hostapd, Arc::new(SwitchContext::default()));

    let outcome = coordinator.switch_to(&candidate(), &operating(), &dcs_section(false));
    assert_eq!(outcome, SwitchOutcome::Disabled);
}

#[test]
fn rejected_reply_short_circuits_before_waiting() {
    let tmp = tempfile::tempdir().unwrap();
    let _fake = spawn_fake_hostapd(tmp.path(), "wlan0", Arc::new(Mutex::new(915_000)), "FAIL");
    let hostapd = Arc::new(HostapdBackend::connect(tmp.path(), "wlan0").unwrap());
    let coordinator = SwitchCoordinator::new(hostapd, Arc::new(SwitchContext::default()));

    let outcome = coordinator.switch_to(&candidate(), &operating(), &dcs_section(true));
    assert_eq!(outcome, SwitchOutcome::Rejected);
}

#[test]
fn no_notification_before_the_deadline_times_out() {
    let tmp = tempfile::tempdir().unwrap();
    let _fake = spawn_fake_hostapd(tmp.path(), "wlan0", Arc::new(Mutex::new(915_000)), "OK");
    let hostapd = Arc::new(HostapdBackend::connect(tmp.path(), "wlan0").unwrap());
    let coordinator = SwitchCoordinator::new(hostapd, Arc::new(SwitchContext::default()));

    // beacon_interval_tu=1, dtim_period=1, dtims_for_csa=1 -> 5s grace floor.
    let outcome = coordinator.switch_to(&candidate(), &operating(), &dcs_section(true));
    assert_eq!(outcome, SwitchOutcome::Timeout);
}

#[test]
fn notification_matching_status_confirms_the_switch() {
    let tmp = tempfile::tempdir().unwrap();
    let status_freq = Arc::new(Mutex::new(915_000));
    let _fake = spawn_fake_hostapd(tmp.path(), "wlan0", status_freq.clone(), "OK");
    let hostapd = Arc::new(HostapdBackend::connect(tmp.path(), "wlan0").unwrap());
    let switch_ctx = Arc::new(SwitchContext::default());
    let coordinator = SwitchCoordinator::new(hostapd.clone(), switch_ctx.clone());

    thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        *status_freq.lock().unwrap() = candidate().centre_frequency_khz;
        let event = DataItem::node(
            "CH_SWITCH_NOTIFY",
            vec![DataItem::leaf(NL80211_ATTR_WIPHY_FREQ, candidate().centre_frequency_khz.to_ne_bytes().to_vec())],
        );
        handle_ch_switch_notify(&event, &switch_ctx, &hostapd);
    });

    let outcome = coordinator.switch_to(&candidate(), &operating(), &dcs_section(true));
    assert_eq!(outcome, SwitchOutcome::Ok);
}

#[test]
fn notification_disagreeing_with_status_is_a_mismatch() {
    let tmp = tempfile::tempdir().unwrap();
    // STATUS keeps reporting the old frequency even after the notify fires.
    let status_freq = Arc::new(Mutex::new(915_000));
    let _fake = spawn_fake_hostapd(tmp.path(), "wlan0", status_freq.clone(), "OK");
    let hostapd = Arc::new(HostapdBackend::connect(tmp.path(), "wlan0").unwrap());
    let switch_ctx = Arc::new(SwitchContext::default());
    let coordinator = SwitchCoordinator::new(hostapd.clone(), switch_ctx.clone());

    thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        let event = DataItem::node(
            "CH_SWITCH_NOTIFY",
            vec![DataItem::leaf(NL80211_ATTR_WIPHY_FREQ, candidate().centre_frequency_khz.to_ne_bytes().to_vec())],
        );
        handle_ch_switch_notify(&event, &switch_ctx, &hostapd);
    });

    let outcome = coordinator.switch_to(&candidate(), &operating(), &dcs_section(true));
    assert_eq!(outcome, SwitchOutcome::Mismatch);
}
