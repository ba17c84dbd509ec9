//! Generic-netlink backend: commands and notifications to the kernel 802.11
//! config layer (`nl80211`) over a `neli` generic-netlink socket.

use std::time::Duration;

use neli::consts::genl::{CtrlAttr, CtrlCmd};
use neli::consts::nl::{NlmF, NlmFFlags};
use neli::consts::socket::NlFamily;
use neli::genl::{Genlmsghdr, Nlattr};
use neli::nl::{NlPayload, Nlmsghdr};
use neli::socket::NlSocketHandle;
use neli::types::GenlBuffer;
use tracing::{debug, trace, warn};

use crate::dataitem::DataItem;
use crate::error::BackendError;

use super::{Backend, NetlinkRequest, Request};

const NL80211_FAMILY_NAME: &str = "nl80211";
const NL80211_MCGRP_MLME: &str = "mlme";
const NL80211_MCGRP_VENDOR: &str = "vendor";

/// Command id of the channel-switch-complete notification, placeholder
/// matching the kernel's published value.
pub const NL80211_CMD_CH_SWITCH_NOTIFY: u32 = 0x8b;
/// Attribute carrying the post-switch operating frequency in kHz.
pub const NL80211_ATTR_WIPHY_FREQ: u32 = 38;

/// Generic-netlink family socket, resolved to the `nl80211` family id on
/// connect, subscribed to the `mlme` and `vendor` multicast groups for
/// asynchronous event delivery.
pub struct NetlinkBackend {
    socket: parking_lot::Mutex<NlSocketHandle>,
    family_id: u16,
}

impl NetlinkBackend {
    pub fn connect() -> Result<Self, BackendError> {
        let mut socket = NlSocketHandle::connect(NlFamily::Generic, None, &[])
            .map_err(|e| BackendError::Io(format!("netlink connect: {e}")))?;
        let family_id = resolve_family_id(&mut socket, NL80211_FAMILY_NAME)?;

        for group in [NL80211_MCGRP_MLME, NL80211_MCGRP_VENDOR] {
            if let Ok(group_id) = resolve_mcast_group(&mut socket, family_id, group) {
                if let Err(e) = socket.add_mcast_membership(&[group_id]) {
                    warn!(target: "dcssrv::backend::netlink", group, error = %e, "failed to join multicast group");
                }
            }
        }
        socket.set_seq_check(false);

        Ok(NetlinkBackend {
            socket: parking_lot::Mutex::new(socket),
            family_id,
        })
    }

    fn send_request(&self, request: &NetlinkRequest) -> Result<Genlmsghdr<u8, u16>, BackendError> {
        let mut attrs = GenlBuffer::new();
        for (attr_type, value) in &request.attrs {
            attrs.push(
                Nlattr::new(false, false, *attr_type, value.clone())
                    .map_err(|e| BackendError::Malformed(e.to_string()))?,
            );
        }
        let genl = Genlmsghdr::new(request.command, 1, attrs);
        let flags = NlmFFlags::new(&[NlmF::Request, NlmF::Ack]);
        let msg = Nlmsghdr::new(None, self.family_id, flags, None, None, NlPayload::Payload(genl));

        let mut socket = self.socket.lock();
        socket
            .send(msg)
            .map_err(|e| BackendError::Io(format!("netlink send: {e}")))?;
        let response: Nlmsghdr<u16, Genlmsghdr<u8, u16>> = socket
            .recv()
            .map_err(|e| BackendError::Io(format!("netlink recv: {e}")))?
            .ok_or(BackendError::EmptyResponse)?;
        match response.nl_payload {
            NlPayload::Payload(p) => Ok(p),
            _ => Err(BackendError::EmptyResponse),
        }
    }
}

fn resolve_family_id(socket: &mut NlSocketHandle, name: &str) -> Result<u16, BackendError> {
    let mut attrs = GenlBuffer::new();
    attrs.push(
        Nlattr::new(false, false, CtrlAttr::FamilyName, name)
            .map_err(|e| BackendError::Malformed(e.to_string()))?,
    );
    let genl = Genlmsghdr::new(CtrlCmd::Getfamily, 1, attrs);
    let flags = NlmFFlags::new(&[NlmF::Request, NlmF::Ack]);
    let msg = Nlmsghdr::new(
        None,
        neli::consts::nl::GenlId::Ctrl,
        flags,
        None,
        None,
        NlPayload::Payload(genl),
    );
    socket
        .send(msg)
        .map_err(|e| BackendError::Io(format!("resolve family: {e}")))?;
    let response: Nlmsghdr<u16, Genlmsghdr<u8, u16>> = socket
        .recv()
        .map_err(|e| BackendError::Io(format!("resolve family recv: {e}")))?
        .ok_or(BackendError::EmptyResponse)?;
    match response.nl_payload {
        NlPayload::Payload(p) => p
            .get_attr_handle()
            .get_attr_payload_as::<u16>(CtrlAttr::FamilyId)
            .map_err(|e| BackendError::Malformed(e.to_string())),
        _ => Err(BackendError::Malformed(format!("family {name} not found"))),
    }
}

/// `CTRL_ATTR_MCAST_GROUPS` (7) nests one entry per multicast group, each
/// carrying a `CTRL_ATTR_MCAST_GRP_NAME` (1) and `CTRL_ATTR_MCAST_GRP_ID` (2)
/// pair (`linux/genetlink.h`).
const CTRL_ATTR_MCAST_GROUPS: u16 = 7;
const CTRL_ATTR_MCAST_GRP_NAME: u16 = 1;
const CTRL_ATTR_MCAST_GRP_ID: u16 = 2;

fn resolve_mcast_group(socket: &mut NlSocketHandle, family_id: u16, group: &str) -> Result<u32, BackendError> {
    let flags = NlmFFlags::new(&[NlmF::Request, NlmF::Ack]);
    let mut attrs = GenlBuffer::new();
    attrs.push(
        Nlattr::new(false, false, CtrlAttr::FamilyId, family_id)
            .map_err(|e| BackendError::Malformed(e.to_string()))?,
    );
    let genl = Genlmsghdr::new(CtrlCmd::Getfamily, 1, attrs);
    let msg = Nlmsghdr::new(
        None,
        neli::consts::nl::GenlId::Ctrl,
        flags,
        None,
        None,
        NlPayload::Payload(genl),
    );
    socket
        .send(msg)
        .map_err(|e| BackendError::Io(e.to_string()))?;
    let response: Nlmsghdr<u16, Genlmsghdr<u8, u16>> = socket
        .recv()
        .map_err(|e| BackendError::Io(e.to_string()))?
        .ok_or(BackendError::EmptyResponse)?;

    let NlPayload::Payload(genl) = response.nl_payload else {
        return Err(BackendError::Malformed(format!("family lookup for group {group} returned no payload")));
    };

    let mut groups_raw = None;
    for attr in genl.get_attr_handle().iter() {
        if attr.nla_type.nla_type == CTRL_ATTR_MCAST_GROUPS {
            groups_raw = Some(attr.payload().to_vec());
            break;
        }
    }
    let groups_raw =
        groups_raw.ok_or_else(|| BackendError::Malformed(format!("family advertises no multicast groups (looking for {group})")))?;

    find_mcast_group_id(&groups_raw, group).ok_or_else(|| BackendError::Malformed(format!("multicast group {group} not found")))
}

/// Search a `CTRL_ATTR_MCAST_GROUPS` payload for `group`'s id. Split out
/// from [`resolve_mcast_group`] so the TLV-walking logic is unit-testable
/// without a live socket.
fn find_mcast_group_id(groups_raw: &[u8], group: &str) -> Option<u32> {
    let entries = parse_tlv_sequence(groups_raw)?;
    for (_, entry) in entries {
        let Some(fields) = parse_tlv_sequence(&entry) else {
            continue;
        };
        let name = fields.iter().find(|(t, _)| *t == CTRL_ATTR_MCAST_GRP_NAME).map(|(_, v)| v);
        let id = fields.iter().find(|(t, _)| *t == CTRL_ATTR_MCAST_GRP_ID).map(|(_, v)| v);
        let (Some(name), Some(id)) = (name, id) else {
            continue;
        };
        if String::from_utf8_lossy(name).trim_end_matches('\0') == group && id.len() >= 4 {
            return Some(u32::from_ne_bytes(id[..4].try_into().unwrap()));
        }
    }
    None
}

/// Recursively turn a raw attribute payload into a data-item tree: if the
/// bytes parse exactly as a sequence of TLV records with no trailing slack,
/// treat it as a nested attribute list; otherwise it's an opaque leaf (spec
/// §4.D).
pub fn attrs_to_tree(outer_key: impl Into<crate::dataitem::ItemKey>, raw: &[u8]) -> DataItem {
    let mut node = DataItem::empty(outer_key);
    if let Some(children) = parse_tlv_sequence(raw) {
        for (attr_type, payload) in children {
            node.push(attr_payload_to_item(attr_type, &payload));
        }
    } else {
        node.value = Some(raw.to_vec());
    }
    node
}

fn attr_payload_to_item(attr_type: u16, payload: &[u8]) -> DataItem {
    if let Some(children) = parse_tlv_sequence(payload) {
        let mut node = DataItem::empty(attr_type as u32);
        for (child_type, child_payload) in children {
            node.push(attr_payload_to_item(child_type, &child_payload));
        }
        node
    } else {
        DataItem::leaf(attr_type as u32, payload.to_vec())
    }
}

/// netlink attribute TLV: `u16 len` (header-inclusive), `u16 type`, payload
/// padded to 4-byte alignment. Returns `None` if the buffer does not parse
/// exactly to its end.
fn parse_tlv_sequence(buf: &[u8]) -> Option<Vec<(u16, Vec<u8>)>> {
    if buf.is_empty() {
        return None;
    }
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset < buf.len() {
        if offset + 4 > buf.len() {
            return None;
        }
        let len = u16::from_ne_bytes([buf[offset], buf[offset + 1]]) as usize;
        let attr_type = u16::from_ne_bytes([buf[offset + 2], buf[offset + 3]]);
        if len < 4 || offset + len > buf.len() {
            return None;
        }
        let payload = buf[offset + 4..offset + len].to_vec();
        out.push((attr_type, payload));
        offset += (len + 3) & !3;
    }
    if offset != buf.len() || out.is_empty() {
        return None;
    }
    Some(out)
}

impl Backend for NetlinkBackend {
    fn submit_blocking(&self, request: &Request) -> Result<DataItem, BackendError> {
        let Request::Netlink(req) = request else {
            return Err(BackendError::Unsupported);
        };
        let response = self.send_request(req)?;
        let mut root = DataItem::empty(req.command as u32);
        for attr in response.get_attr_handle().iter() {
            root.push(attr_payload_to_item(attr.nla_type.nla_type, attr.payload()));
        }
        trace!(target: "dcssrv::backend::netlink", command = req.command, "submit_blocking");
        Ok(root)
    }

    fn pump_async(&self, timeout: Duration) -> Result<Option<DataItem>, BackendError> {
        let mut socket = self.socket.lock();
        socket
            .set_recv_timeout(Some(timeout))
            .map_err(|e| BackendError::Io(e.to_string()))?;
        let received: Option<Nlmsghdr<u16, Genlmsghdr<u8, u16>>> = match socket.recv() {
            Ok(r) => r,
            Err(e) if e.to_string().contains("would block") || e.to_string().contains("timed out") => None,
            Err(e) => return Err(BackendError::Io(e.to_string())),
        };
        let Some(msg) = received else {
            return Ok(None);
        };
        let NlPayload::Payload(genl) = msg.nl_payload else {
            return Ok(None);
        };
        let mut root = DataItem::empty(genl.cmd as u32);
        for attr in genl.get_attr_handle().iter() {
            root.push(attr_payload_to_item(attr.nla_type.nla_type, attr.payload()));
        }
        debug!(target: "dcssrv::backend::netlink", command = genl.cmd, "pump_async delivered event");
        Ok(Some(root))
    }

    fn name(&self) -> &str {
        "netlink"
    }
}
