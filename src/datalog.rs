//! Datalog sink: persists the per-round measurement CSV. A single append-only
//! sink, matching the configuration's `datalog.dcs.enabled` switch.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use parking_lot::Mutex;
use tracing::warn;

use crate::config::DatalogConfig;
use crate::model::{ChannelEntry, OperatingState};

const HEADER: &str = "time,frequency_khz,bandwidth_mhz,channel_s1g,metric,accumulated_score,rounds_as_best_for_channel,current_channel\n";

enum Sink {
    Disabled,
    File { handle: Mutex<File> },
}

/// Appends one CSV row per processed measurement when enabled; a no-op
/// writer otherwise so the scheduler never branches on whether logging is
/// on.
pub struct Datalog {
    sink: Sink,
}

impl Datalog {
    pub fn open(config: &DatalogConfig) -> std::io::Result<Self> {
        if !config.dcs.enabled {
            return Ok(Datalog { sink: Sink::Disabled });
        }
        let root = config
            .root_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("/var/log/dcssrv"));
        let run_dir = root.join(Local::now().format("%Y_%m_%d_%H_%M_%S").to_string());
        fs::create_dir_all(&run_dir)?;
        let path = run_dir.join("dcs.log");
        let mut handle = File::create(&path)?;
        handle.write_all(HEADER.as_bytes())?;
        Ok(Datalog {
            sink: Sink::File { handle: Mutex::new(handle) },
        })
    }

    /// No-op sink, used when the datalog is disabled or a caller needs a
    /// placeholder (e.g. in tests).
    pub fn disabled() -> Self {
        Datalog { sink: Sink::Disabled }
    }

    pub fn record(&self, channel_set: &[ChannelEntry], channel_idx: usize, operating: &OperatingState) {
        let Sink::File { handle } = &self.sink else {
            return;
        };
        let entry = &channel_set[channel_idx];
        let row = format!(
            "{},{},{},{},{},{},{},{}\n",
            unix_timestamp(),
            entry.descriptor.centre_frequency_khz,
            entry.descriptor.bandwidth_mhz,
            entry.descriptor.s1g_channel_number,
            entry.metric.samples_taken,
            entry.metric.accumulated_score,
            entry.metric.rounds_as_best,
            operating.current_channel,
        );
        let mut f = handle.lock();
        if let Err(e) = f.write_all(row.as_bytes()) {
            warn!(target: "dcssrv::datalog", error = %e, "failed to append datalog row");
        }
    }
}

fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Exposed for callers that already have a concrete directory (tests, or a
/// caller that wants deterministic paths).
pub fn header() -> &'static str {
    HEADER
}

pub fn run_dir_for(root: &Path, timestamp: chrono::DateTime<Local>) -> PathBuf {
    root.join(timestamp.format("%Y_%m_%d_%H_%M_%S").to_string())
}
