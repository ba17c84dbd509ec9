//! CSV-based test/replay path: substitutes recorded measurements for live
//! vendor-backend scans.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;

use crate::dcs::MeasurementSource;
use crate::error::{BackendError, DcsError};
use crate::model::{ChannelDescriptor, OperatingState, Sample};

#[derive(Debug, Deserialize)]
struct Row {
    time: i64,
    frequency_khz: u32,
    bandwidth_mhz: u8,
    channel_s1g: u16,
    metric: u8,
    #[allow(dead_code)]
    accumulated_score: u32,
    #[allow(dead_code)]
    rounds_as_best_for_channel: u32,
    current_channel: usize,
}

/// Owns one FIFO sample queue per permitted channel, parsed once from a
/// recorded CSV file.
pub struct ReplaySource {
    channels: Vec<ChannelDescriptor>,
    queues: Mutex<HashMap<u32, VecDeque<Sample>>>,
    initial_channel_index: usize,
}

impl ReplaySource {
    /// Parse every row of `path`. The header must be exactly
    /// `time,frequency_khz,bandwidth_mhz,channel_s1g,metric,accumulated_score,rounds_as_best_for_channel,current_channel`;
    /// `csv`/`serde` enforce column presence, not order beyond what `serde`
    /// derives from field names via header matching.
    pub fn load(path: &Path) -> Result<Self, DcsError> {
        let mut reader =
            csv::Reader::from_path(path).map_err(|e| DcsError::Config(format!("replay csv {}: {e}", path.display())))?;

        let mut channels: Vec<ChannelDescriptor> = Vec::new();
        let mut queues: HashMap<u32, VecDeque<Sample>> = HashMap::new();
        let mut initial_channel_index = None;

        for (n, record) in reader.deserialize::<Row>().enumerate() {
            let row = record.map_err(|e| DcsError::Config(format!("replay csv row {n}: {e}")))?;

            if !channels.iter().any(|c| c.centre_frequency_khz == row.frequency_khz) {
                channels.push(ChannelDescriptor {
                    s1g_channel_number: row.channel_s1g,
                    centre_frequency_khz: row.frequency_khz,
                    bandwidth_mhz: row.bandwidth_mhz,
                });
            }
            if initial_channel_index.is_none() {
                initial_channel_index = Some(row.current_channel);
            }

            queues.entry(row.frequency_khz).or_default().push_back(Sample {
                captured_at: std::time::UNIX_EPOCH + Duration::from_secs(row.time.max(0) as u64),
                metric_raw: row.metric,
                noise_rssi: 0,
                listen_time_us: 0,
                rx_time_us: 0,
            });
        }

        let initial_channel_index =
            initial_channel_index.ok_or_else(|| DcsError::Config("replay csv has no rows".into()))?;
        if channels.is_empty() {
            return Err(DcsError::EmptyScanList);
        }
        if initial_channel_index >= channels.len() {
            return Err(DcsError::Config("replay csv current_channel out of range".into()));
        }

        Ok(ReplaySource {
            channels,
            queues: Mutex::new(queues),
            initial_channel_index,
        })
    }

    pub fn channel_descriptors(&self) -> &[ChannelDescriptor] {
        &self.channels
    }

    pub fn initial_channel_index(&self) -> usize {
        self.initial_channel_index
    }

    pub fn is_drained(&self) -> bool {
        self.queues.lock().values().all(VecDeque::is_empty)
    }
}

impl MeasurementSource for ReplaySource {
    fn measure(&self, channel: &ChannelDescriptor, _operating: &OperatingState) -> Result<Sample, DcsError> {
        self.queues
            .lock()
            .get_mut(&channel.centre_frequency_khz)
            .and_then(VecDeque::pop_front)
            .ok_or(DcsError::Backend(BackendError::EmptyResponse))
    }

    fn drained(&self) -> bool {
        self.is_drained()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(rows: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "time,frequency_khz,bandwidth_mhz,channel_s1g,metric,accumulated_score,rounds_as_best_for_channel,current_channel"
        )
        .unwrap();
        f.write_all(rows.as_bytes()).unwrap();
        f
    }

    #[test]
    fn builds_channel_set_and_initial_index() {
        let f = write_csv(
            "0,915000,4,1,80,0,0,0\n\
             5,916000,4,2,70,0,0,0\n",
        );
        let source = ReplaySource::load(f.path()).unwrap();
        assert_eq!(source.channel_descriptors().len(), 2);
        assert_eq!(source.initial_channel_index(), 0);
    }

    #[test]
    fn pops_samples_in_fifo_order_per_frequency() {
        let f = write_csv(
            "0,915000,4,1,10,0,0,0\n\
             1,915000,4,1,20,0,0,0\n",
        );
        let source = ReplaySource::load(f.path()).unwrap();
        let descriptor = source.channel_descriptors()[0];
        let operating = OperatingState {
            current_channel: 0,
            current_5g_freq: 915_000,
            primary_width_mhz: 1,
            primary_1mhz_index: 0,
            beacon_interval_tu: 100,
            dtim_period: 2,
        };
        let first = source.measure(&descriptor, &operating).unwrap();
        assert_eq!(first.metric_raw, 10);
        let second = source.measure(&descriptor, &operating).unwrap();
        assert_eq!(second.metric_raw, 20);
        assert!(source.is_drained());
        assert!(source.measure(&descriptor, &operating).is_err());
    }

    #[test]
    fn rejects_empty_file() {
        let f = write_csv("");
        assert!(ReplaySource::load(f.path()).is_err());
    }
}
