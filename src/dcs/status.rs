//! AP `STATUS` parsing, shared by scheduler INIT, the switch coordinator's
//! post-wakeup re-read, and the channel-switch-notify handler's internal
//! retry.

use crate::backend::hostapd::HostapdBackend;
use crate::backend::{Backend, Request};
use crate::dataitem::DataItem;
use crate::error::DcsError;

/// The subset of AP `STATUS` fields the DCS core consumes.
#[derive(Debug, Clone, Copy)]
pub struct ApStatus {
    pub enabled: bool,
    pub s1g_freq: i64,
    pub s1g_bw: u8,
    pub s1g_prim_chwidth: u8,
    pub s1g_prim_1mhz_chan_index: u16,
    pub beacon_int: u32,
    pub dtim_period: u32,
    pub freq: u32,
}

fn field<'a>(tree: &'a DataItem, key: &str) -> Option<&'a str> {
    DataItem::find_sibling(&tree.children, &key.into()).and_then(|item| item.value_str())
}

fn parse_field<T: std::str::FromStr>(tree: &DataItem, key: &str) -> Result<T, DcsError> {
    field(tree, key)
        .ok_or_else(|| DcsError::Config(format!("STATUS response missing `{key}`")))?
        .parse()
        .map_err(|_| DcsError::Config(format!("STATUS response has malformed `{key}`")))
}

/// Issue `STATUS` and parse the fields the core needs.
pub fn query(hostapd: &HostapdBackend) -> Result<ApStatus, DcsError> {
    let response = hostapd
        .submit_blocking(&Request::Hostapd("STATUS".into()))
        .map_err(DcsError::Backend)?;

    Ok(ApStatus {
        enabled: field(&response, "state").map(|s| s == "ENABLED").unwrap_or(false),
        s1g_freq: parse_field(&response, "s1g_freq")?,
        s1g_bw: parse_field(&response, "s1g_bw")?,
        s1g_prim_chwidth: parse_field(&response, "s1g_prim_chwidth")?,
        s1g_prim_1mhz_chan_index: parse_field(&response, "s1g_prim_1mhz_chan_index")?,
        beacon_int: parse_field(&response, "beacon_int")?,
        dtim_period: parse_field(&response, "dtim_period")?,
        freq: parse_field(&response, "freq")?,
    })
}
