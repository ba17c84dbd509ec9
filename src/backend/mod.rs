//! Backend abstraction: the contract every concrete transport (hostapd
//! control socket, generic netlink, vendor-command wrapper) must implement,
//! and the typed request builders used in place of a variadic
//! `parse_request_args`-style helper.

pub mod hostapd;
pub mod netlink;
pub mod vendor;

use std::time::Duration;

use crate::dataitem::DataItem;
use crate::error::BackendError;

/// A pre-parsed request, produced by one of the per-backend request
/// builders below and consumed by exactly the backend it was built for.
#[derive(Debug, Clone)]
pub enum Request {
    /// A single hostapd control-socket command line, e.g. `"STATUS"`.
    Hostapd(String),
    Netlink(NetlinkRequest),
    Vendor(Vec<VendorRecord>),
}

#[derive(Debug, Clone)]
pub struct NetlinkRequest {
    pub command: u8,
    pub flags: u16,
    pub attrs: Vec<(u16, Vec<u8>)>,
}

/// One vendor subcommand record.
#[derive(Debug, Clone)]
pub struct VendorRecord {
    pub message_id: u16,
    pub flags: u16,
    pub payload: Vec<u8>,
}

/// Builder for [`Request::Hostapd`] — the typed replacement for variadic
/// control-socket command construction.
pub struct HostapdRequestBuilder {
    line: String,
}

impl HostapdRequestBuilder {
    pub fn new(command: impl Into<String>) -> Self {
        HostapdRequestBuilder { line: command.into() }
    }

    pub fn arg(mut self, value: impl std::fmt::Display) -> Self {
        self.line.push(' ');
        self.line.push_str(&value.to_string());
        self
    }

    pub fn kv(mut self, key: &str, value: impl std::fmt::Display) -> Self {
        self.line.push(' ');
        self.line.push_str(key);
        self.line.push('=');
        self.line.push_str(&value.to_string());
        self
    }

    pub fn build(self) -> Request {
        Request::Hostapd(self.line)
    }
}

/// Builder for [`Request::Netlink`].
pub struct NetlinkRequestBuilder {
    command: u8,
    flags: u16,
    attrs: Vec<(u16, Vec<u8>)>,
}

impl NetlinkRequestBuilder {
    pub fn new(command: u8, flags: u16) -> Self {
        NetlinkRequestBuilder {
            command,
            flags,
            attrs: Vec::new(),
        }
    }

    pub fn attr_u32(mut self, attr: u16, value: u32) -> Self {
        self.attrs.push((attr, value.to_ne_bytes().to_vec()));
        self
    }

    pub fn attr_bytes(mut self, attr: u16, value: impl Into<Vec<u8>>) -> Self {
        self.attrs.push((attr, value.into()));
        self
    }

    pub fn build(self) -> Request {
        Request::Netlink(NetlinkRequest {
            command: self.command,
            flags: self.flags,
            attrs: self.attrs,
        })
    }
}

/// Builder for [`Request::Vendor`] — a batch of OUI-scoped subcommands.
pub struct VendorRequestBuilder {
    records: Vec<VendorRecord>,
}

impl VendorRequestBuilder {
    pub fn new() -> Self {
        VendorRequestBuilder { records: Vec::new() }
    }

    pub fn subcommand(mut self, message_id: u16, payload: impl Into<Vec<u8>>) -> Self {
        self.records.push(VendorRecord {
            message_id,
            flags: vendor::VENDOR_FLAG_REQUEST,
            payload: payload.into(),
        });
        self
    }

    pub fn build(self) -> Request {
        Request::Vendor(self.records)
    }
}

impl Default for VendorRequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability set every concrete transport implements. A backend that
/// overrides neither `submit_blocking` nor `pump_async` is not
/// a valid implementation; the default bodies both return
/// [`BackendError::Unsupported`] so that an accidental no-op backend fails
/// loudly rather than silently.
pub trait Backend: Send + Sync {
    fn submit_blocking(&self, _request: &Request) -> Result<DataItem, BackendError> {
        Err(BackendError::Unsupported)
    }

    fn pump_async(&self, _timeout: Duration) -> Result<Option<DataItem>, BackendError> {
        Err(BackendError::Unsupported)
    }

    /// Human-readable name used in logs.
    fn name(&self) -> &str;
}
