//! Vendor-command backend: layered on [`super::netlink`] to carry
//! OUI-scoped vendor subcommands and to filter vendor events down to the
//! ones the DCS core actually consumes.

use std::time::Duration;

use tracing::trace;

use crate::dataitem::DataItem;
use crate::error::BackendError;
use crate::model::Sample;

use super::netlink::NetlinkBackend;
use super::{Backend, NetlinkRequest, Request, VendorRecord};

pub const VENDOR_FLAG_REQUEST: u16 = 0x0001;
const VENDOR_OUI: u32 = 0x0CBF74;
pub const OCS_DONE: u16 = 1;
/// Vendor subcommand `message_id` for the off-channel-scan trigger.
pub const OCS_DRIVER_SUBCMD: u16 = 1;
pub const GET_AVAILABLE_CHANNELS_SUBCMD: u16 = 2;

const NL80211_CMD_VENDOR: u8 = 0xa3; // placeholder matching kernel's published value
const NL80211_ATTR_IFINDEX: u16 = 3;
const NL80211_ATTR_VENDOR_ID: u16 = 194;
const NL80211_ATTR_VENDOR_SUBCMD: u16 = 195;
const NL80211_ATTR_VENDOR_DATA: u16 = 196;

/// Wraps a generic-netlink backend to speak OUI-scoped vendor commands.
pub struct VendorBackend {
    netlink: NetlinkBackend,
    ifindex: u32,
}

fn encode_record(record: &VendorRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + record.payload.len());
    out.extend_from_slice(&record.message_id.to_le_bytes());
    out.extend_from_slice(&(record.payload.len() as u16).to_le_bytes());
    out.extend_from_slice(&record.flags.to_le_bytes());
    out.extend_from_slice(&record.payload);
    out
}

struct DecodedVendorData {
    message_id: u16,
    status: i16,
    data: Vec<u8>,
}

fn decode_vendor_data(buf: &[u8]) -> Option<DecodedVendorData> {
    if buf.len() < 8 {
        return None;
    }
    let message_id = u16::from_le_bytes([buf[0], buf[1]]);
    let length = u16::from_le_bytes([buf[2], buf[3]]) as usize;
    let _flags = u16::from_le_bytes([buf[4], buf[5]]);
    let status = i16::from_le_bytes([buf[6], buf[7]]);
    let data = buf.get(8..8 + length)?.to_vec();
    Some(DecodedVendorData { message_id, status, data })
}

impl VendorBackend {
    pub fn new(netlink: NetlinkBackend, ifindex: u32) -> Self {
        VendorBackend { netlink, ifindex }
    }

    /// `GET_AVAILABLE_CHANNELS`: the permitted-channel enumeration consumed
    /// once at scheduler INIT.
    pub fn get_available_channels(&self) -> Result<Vec<crate::model::ChannelDescriptor>, BackendError> {
        let record = VendorRecord {
            message_id: GET_AVAILABLE_CHANNELS_SUBCMD,
            flags: VENDOR_FLAG_REQUEST,
            payload: Vec::new(),
        };
        let item = self.submit_one(&record)?;
        let data = item
            .children
            .iter()
            .find(|c| c.key == crate::dataitem::ItemKey::str("data"))
            .and_then(|c| c.value.as_deref())
            .ok_or(BackendError::EmptyResponse)?;
        Ok(decode_available_channels(data))
    }

    /// Kick off an off-channel scan on `channel` via the `OCS_DRIVER`
    /// subcommand. Fire-and-forget: the result arrives later as an
    /// `OCS_DONE` event on [`Backend::pump_async`].
    pub fn trigger_ocs(&self, payload: Vec<u8>) -> Result<(), BackendError> {
        let record = VendorRecord {
            message_id: OCS_DRIVER_SUBCMD,
            flags: VENDOR_FLAG_REQUEST,
            payload,
        };
        self.submit_one(&record).map(|_| ())
    }

    fn submit_one(&self, record: &VendorRecord) -> Result<DataItem, BackendError> {
        let req = NetlinkRequest {
            command: NL80211_CMD_VENDOR,
            flags: 0,
            attrs: vec![
                (NL80211_ATTR_IFINDEX, self.ifindex.to_ne_bytes().to_vec()),
                (NL80211_ATTR_VENDOR_ID, VENDOR_OUI.to_ne_bytes().to_vec()),
                (NL80211_ATTR_VENDOR_SUBCMD, 0u32.to_ne_bytes().to_vec()),
                (NL80211_ATTR_VENDOR_DATA, encode_record(record)),
            ],
        };
        let response = self.netlink.submit_blocking(&Request::Netlink(req))?;
        let raw = response
            .find_child_chain(&[NL80211_ATTR_VENDOR_DATA as u32])
            .and_then(|item| item.value.as_ref())
            .ok_or(BackendError::EmptyResponse)?;
        let decoded = decode_vendor_data(raw).ok_or_else(|| BackendError::Malformed("vendor_data".into()))?;

        let mut item = DataItem::empty(decoded.message_id as u32);
        item.push(DataItem::leaf("status", decoded.status.to_le_bytes().to_vec()));
        item.push(DataItem::leaf("data", decoded.data));
        if decoded.status != 0 {
            return Err(BackendError::RequestFailed(format!(
                "vendor subcommand {} failed with status {}",
                decoded.message_id, decoded.status
            )));
        }
        Ok(item)
    }
}

impl Backend for VendorBackend {
    fn submit_blocking(&self, request: &Request) -> Result<DataItem, BackendError> {
        let Request::Vendor(records) = request else {
            return Err(BackendError::Unsupported);
        };
        let mut root = DataItem::empty("vendor_batch");
        let mut last_err = None;
        for record in records {
            match self.submit_one(record) {
                Ok(item) => root.push(item),
                Err(e) => {
                    // A failed record does not abort the batch; subsequent
                    // records still run.
                    last_err = Some(e);
                }
            }
        }
        if root.children.is_empty() {
            if let Some(e) = last_err {
                return Err(e);
            }
        }
        trace!(target: "dcssrv::backend::vendor", records = records.len(), "submit_blocking batch complete");
        Ok(root)
    }

    fn pump_async(&self, timeout: Duration) -> Result<Option<DataItem>, BackendError> {
        let Some(event) = self.netlink.pump_async(timeout)? else {
            return Ok(None);
        };
        let vendor_id = event
            .find_child_chain(&[NL80211_ATTR_VENDOR_ID as u32])
            .and_then(|i| i.value.as_deref())
            .and_then(|v| v.try_into().ok())
            .map(u32::from_ne_bytes);
        let subcmd = event
            .find_child_chain(&[NL80211_ATTR_VENDOR_SUBCMD as u32])
            .and_then(|i| i.value.as_deref())
            .and_then(|v| v.try_into().ok())
            .map(u32::from_ne_bytes);

        if vendor_id != Some(VENDOR_OUI) || subcmd != Some(OCS_DONE as u32) {
            return Ok(None);
        }
        Ok(Some(event))
    }

    fn name(&self) -> &str {
        "vendor"
    }
}

/// Decode an `OCS_DONE` event payload into a measurement sample.
pub fn decode_ocs_done(payload: &[u8]) -> Option<Sample> {
    if payload.len() < 1 + 1 + 8 + 8 {
        return None;
    }
    let metric_raw = payload[0];
    let noise_rssi = payload[1] as i8;
    let listen_time_us = u64::from_le_bytes(payload[2..10].try_into().ok()?);
    let rx_time_us = u64::from_le_bytes(payload[10..18].try_into().ok()?);
    Some(Sample {
        captured_at: std::time::SystemTime::now(),
        metric_raw,
        noise_rssi,
        listen_time_us,
        rx_time_us,
    })
}

/// Decode an `OCS_DONE` event already filtered and returned by
/// [`VendorBackend::pump_async`] into a measurement [`Sample`].
pub fn decode_event_sample(event: &DataItem) -> Option<Sample> {
    let raw = event
        .find_child_chain(&[NL80211_ATTR_VENDOR_DATA as u32])
        .and_then(|item| item.value.as_deref())?;
    let decoded = decode_vendor_data(raw)?;
    decode_ocs_done(&decoded.data)
}

/// Parse the response of `GET_AVAILABLE_CHANNELS`:
/// `{ num_channels, channels[] }`, each channel encoded as
/// `{ s1g_channel_number: u16 LE, centre_frequency_khz: u32 LE, bandwidth_mhz: u8 }`.
pub fn decode_available_channels(data: &[u8]) -> Vec<crate::model::ChannelDescriptor> {
    let mut out = Vec::new();
    if data.len() < 2 {
        return out;
    }
    let num_channels = u16::from_le_bytes([data[0], data[1]]) as usize;
    let mut offset = 2usize;
    for _ in 0..num_channels {
        if offset + 7 > data.len() {
            break;
        }
        let s1g_channel_number = u16::from_le_bytes([data[offset], data[offset + 1]]);
        let centre_frequency_khz = u32::from_le_bytes(data[offset + 2..offset + 6].try_into().unwrap());
        let bandwidth_mhz = data[offset + 6];
        out.push(crate::model::ChannelDescriptor {
            s1g_channel_number,
            centre_frequency_khz,
            bandwidth_mhz,
        });
        offset += 7;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_ocs_done_roundtrip() {
        let mut payload = Vec::new();
        payload.push(77u8); // metric
        payload.push((-10i8) as u8); // noise
        payload.extend_from_slice(&1234u64.to_le_bytes());
        payload.extend_from_slice(&5678u64.to_le_bytes());
        let sample = decode_ocs_done(&payload).unwrap();
        assert_eq!(sample.metric_raw, 77);
        assert_eq!(sample.noise_rssi, -10);
        assert_eq!(sample.listen_time_us, 1234);
        assert_eq!(sample.rx_time_us, 5678);
    }

    #[test]
    fn decode_available_channels_list() {
        let mut data = Vec::new();
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&915000u32.to_le_bytes());
        data.push(4);
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&916000u32.to_le_bytes());
        data.push(4);
        let channels = decode_available_channels(&data);
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[1].centre_frequency_khz, 916000);
    }

    #[test]
    fn encode_record_layout() {
        let rec = VendorRecord {
            message_id: 1,
            flags: VENDOR_FLAG_REQUEST,
            payload: vec![9, 9],
        };
        let bytes = encode_record(&rec);
        assert_eq!(&bytes[0..2], &1u16.to_le_bytes());
        assert_eq!(&bytes[2..4], &2u16.to_le_bytes());
        assert_eq!(&bytes[6..], &[9, 9]);
    }
}
