//! End-to-end exercise of `DcsScheduler` itself (as opposed to
//! `tests/switch_coordinator.rs`, which only drives the switch handshake):
//! built via `init_replay` from a CSV fixture and a throwaway fake hostapd
//! socket, then run to completion against real measurement delivery,
//! scan-list retry/eviction, and datalog output.

use std::io::Write;
use std::os::unix::net::UnixDatagram;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dcssrv::algo;
use dcssrv::backend::hostapd::HostapdBackend;
use dcssrv::config::{AlgoType, DatalogConfig, DatalogSinkConfig, DcsSection, EwmaConfig, TestConfig};
use dcssrv::datalog::Datalog;
use dcssrv::dcs::DcsScheduler;
use dcssrv::model::SwitchContext;
use dcssrv::replay::ReplaySource;

fn write_fixture(rows: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        f,
        "time,frequency_khz,bandwidth_mhz,channel_s1g,metric,accumulated_score,rounds_as_best_for_channel,current_channel"
    )
    .unwrap();
    f.write_all(rows.as_bytes()).unwrap();
    f
}

fn dcs_section() -> DcsSection {
    DcsSection {
        trigger_csa: false,
        dtims_for_csa: 1,
        algo_type: AlgoType::Ewma,
        ewma: Some(EwmaConfig {
            ewma_alpha: 50,
            threshold_percentage: 0,
            rounds_for_csa: 1,
            sec_per_scan: 0,
            sec_per_round: 0,
        }),
        sample_and_hold: None,
        test: TestConfig::default(),
    }
}

/// Two measurable channels (915000/916000 kHz, 4 MHz) plus the two 1 MHz
/// "primary sub-channel" rows each needs to be admissible into the scan
/// list. Channel 0 (current) gets 30 samples; channel 1 gets exactly one,
/// so it succeeds once and then fails every subsequent measurement until
/// the 3-strike limit evicts it.
fn fixture_rows() -> String {
    let mut rows = String::new();
    for t in 0..30 {
        rows.push_str(&format!("{t},915000,4,1,80,0,0,0\n"));
    }
    rows.push_str("0,916000,4,2,70,0,0,0\n");
    rows.push_str("0,913500,1,0,0,0,0,0\n");
    rows.push_str("0,914500,1,0,0,0,0,0\n");
    rows
}

#[test]
fn scheduler_built_via_init_replay_runs_and_logs_measurements() {
    let tmp = tempfile::tempdir().unwrap();
    let _listener = UnixDatagram::bind(tmp.path().join("wlan0")).unwrap();
    let hostapd = Arc::new(HostapdBackend::connect(tmp.path(), "wlan0").unwrap());

    let csv = write_fixture(&fixture_rows());
    let replay = Arc::new(ReplaySource::load(csv.path()).unwrap());

    let datalog_root = tempfile::tempdir().unwrap();
    let datalog = Datalog::open(&DatalogConfig {
        root_dir: Some(datalog_root.path().to_path_buf()),
        dcs: DatalogSinkConfig { enabled: true },
    })
    .unwrap();

    let cancel = Arc::new(AtomicBool::new(false));
    let mut scheduler = DcsScheduler::init_replay(
        dcs_section(),
        replay,
        hostapd,
        Arc::new(SwitchContext::default()),
        algo::build(&dcs_section()).unwrap(),
        datalog,
        cancel.clone(),
    )
    .unwrap();

    let canceller = cancel.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        canceller.store(true, Ordering::SeqCst);
    });

    // Must return (not hang, not fatal!-exit the test binary) even though
    // channel 1 gets evicted from the scan list partway through.
    scheduler.run();

    let run_dir = std::fs::read_dir(datalog_root.path())
        .unwrap()
        .next()
        .expect("datalog run directory created")
        .unwrap()
        .path();
    let contents = std::fs::read_to_string(run_dir.join("dcs.log")).unwrap();
    let mut lines = contents.lines();
    assert_eq!(lines.next(), Some(dcssrv::datalog::header().trim_end()));
    assert!(lines.count() >= 1, "expected at least one recorded measurement row");
}
