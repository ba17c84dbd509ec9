//! Control-socket backend: text request/response to a hostapd-style AP
//! control socket, plus a lazily-opened notification socket for unsolicited
//! events.

use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::dataitem::DataItem;
use crate::error::BackendError;

use super::{Backend, Request};

/// Persistent datagram socket to a named local endpoint.
pub struct HostapdBackend {
    remote_path: PathBuf,
    command_sock: Mutex<UnixDatagram>,
    /// `None` until the first `pump_async` call opens it.
    event_sock: Mutex<Option<UnixDatagram>>,
    /// Serialises socket-open operations; the underlying bind/connect
    /// helper is not re-entrant.
    open_guard: Mutex<()>,
}

impl HostapdBackend {
    /// `control_dir` is the directory named in `backends.hostapd.control_path`;
    /// `interface_name` picks the per-radio socket inside it.
    pub fn connect(control_dir: &Path, interface_name: &str) -> Result<Self, BackendError> {
        let remote_path = control_dir.join(interface_name);
        let command_sock = bind_local_socket()?;
        command_sock
            .connect(&remote_path)
            .map_err(|e| BackendError::Io(format!("connect {}: {e}", remote_path.display())))?;
        Ok(HostapdBackend {
            remote_path,
            command_sock: Mutex::new(command_sock),
            event_sock: Mutex::new(None),
            open_guard: Mutex::new(()),
        })
    }

    fn ensure_event_socket(&self) -> Result<(), BackendError> {
        let mut slot = self.event_sock.lock();
        if slot.is_some() {
            return Ok(());
        }
        let _serialize = self.open_guard.lock();
        let sock = bind_local_socket()?;
        sock.connect(&self.remote_path)
            .map_err(|e| BackendError::Io(format!("connect {}: {e}", self.remote_path.display())))?;
        sock.send(b"ATTACH")
            .map_err(|e| BackendError::Io(format!("ATTACH: {e}")))?;
        let mut buf = [0u8; 64];
        let _ = sock.recv(&mut buf);
        *slot = Some(sock);
        Ok(())
    }
}

fn bind_local_socket() -> Result<UnixDatagram, BackendError> {
    let local_path = std::env::temp_dir().join(format!("dcssrv-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&local_path);
    let sock = UnixDatagram::bind(&local_path).map_err(|e| BackendError::Io(e.to_string()))?;
    Ok(sock)
}

/// Parse `key=value\n`-separated response text into a data-item tree whose
/// children are one leaf per line.
fn parse_kv_response(text: &str) -> DataItem {
    let mut root = DataItem::empty("response");
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) => root.push(DataItem::leaf(key, value.as_bytes().to_vec())),
            // Bare-token replies (e.g. CHAN_SWITCH's "OK"/"FAIL") carry no '='.
            None => root.push(DataItem::leaf(line, Vec::new())),
        }
    }
    root
}

/// Parse an unsolicited event line, stripping an optional `<level>` prefix
/// before the event name.
fn parse_event(line: &str) -> DataItem {
    let stripped = if let Some(rest) = line.strip_prefix('<') {
        rest.split_once('>').map(|(_, r)| r).unwrap_or(line)
    } else {
        line
    };
    let mut parts = stripped.splitn(2, ' ');
    let name = parts.next().unwrap_or("").to_string();
    let rest = parts.next().unwrap_or("");
    DataItem::node(name, vec![DataItem::leaf("params", rest.as_bytes().to_vec())])
}

impl Backend for HostapdBackend {
    fn submit_blocking(&self, request: &Request) -> Result<DataItem, BackendError> {
        let Request::Hostapd(line) = request else {
            return Err(BackendError::Unsupported);
        };
        let sock = self.command_sock.lock();
        sock.send(line.as_bytes())
            .map_err(|e| BackendError::Io(format!("send {line:?}: {e}")))?;
        let mut buf = vec![0u8; 8192];
        let n = sock.recv(&mut buf).map_err(|e| BackendError::Io(format!("recv: {e}")))?;
        if n == 0 {
            return Err(BackendError::EmptyResponse);
        }
        let text = String::from_utf8_lossy(&buf[..n]);
        trace!(target: "dcssrv::backend::hostapd", command = %line, response = %text, "submit_blocking");
        Ok(parse_kv_response(&text))
    }

    fn pump_async(&self, timeout: Duration) -> Result<Option<DataItem>, BackendError> {
        self.ensure_event_socket()?;
        let guard = self.event_sock.lock();
        let sock = guard.as_ref().expect("event socket just ensured");
        sock.set_read_timeout(Some(timeout))
            .map_err(|e| BackendError::Io(e.to_string()))?;
        let mut buf = vec![0u8; 4096];
        match sock.recv(&mut buf) {
            Ok(0) => Ok(None),
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]).to_string();
                debug!(target: "dcssrv::backend::hostapd", event = %text, "pump_async");
                Ok(Some(parse_event(&text)))
            }
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => {
                warn!(target: "dcssrv::backend::hostapd", error = %e, "pump_async failed");
                Err(BackendError::Io(e.to_string()))
            }
        }
    }

    fn name(&self) -> &str {
        "hostapd"
    }
}
