//! Asynchronous dispatcher: one thread per backend that hosts pattern
//! monitors, pumping frames and routing matching events to every monitor
//! whose registered key matches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::backend::Backend;
use crate::dataitem::{DataItem, ItemKey};

struct Monitor {
    key: ItemKey,
    callback: Arc<dyn Fn(&DataItem) + Send + Sync>,
}

pub struct AsyncDispatcher {
    backend: Arc<dyn Backend>,
    monitors: Mutex<Vec<Monitor>>,
    running: AtomicBool,
}

impl AsyncDispatcher {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        AsyncDispatcher {
            backend,
            monitors: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
        }
    }

    pub fn register(&self, key: ItemKey, callback: Arc<dyn Fn(&DataItem) + Send + Sync>) {
        self.monitors.lock().push(Monitor { key, callback });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Main loop, run on its own thread: `pump_async(1s)`, and for each
    /// registered monitor whose key appears anywhere in the event's
    /// top-level siblings, invoke the callback. Multiple monitors may match
    /// a single event.
    pub fn run(&self) {
        while self.running.load(Ordering::SeqCst) {
            match self.backend.pump_async(Duration::from_secs(1)) {
                Ok(Some(event)) => {
                    let monitors = self.monitors.lock();
                    let mut matched = 0;
                    for monitor in monitors.iter() {
                        if event.matches(&monitor.key) {
                            matched += 1;
                            (monitor.callback)(&event);
                        }
                    }
                    trace!(
                        target: "dcssrv::engine::dispatch",
                        backend = self.backend.name(),
                        matched,
                        "dispatched event"
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(target: "dcssrv::engine::dispatch", backend = self.backend.name(), error = %e, "pump_async error");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Request;
    use crate::error::BackendError;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    struct OneShotBackend {
        event: StdMutex<Option<DataItem>>,
    }

    impl Backend for OneShotBackend {
        fn pump_async(&self, _timeout: Duration) -> Result<Option<DataItem>, BackendError> {
            Ok(self.event.lock().unwrap().take())
        }
        fn name(&self) -> &str {
            "oneshot"
        }
    }
    // Unused but keeps Backend::submit_blocking's default Unsupported path exercised implicitly.
    #[allow(dead_code)]
    fn _unused(b: &OneShotBackend) {
        let _ = b.submit_blocking(&Request::Hostapd("x".into()));
    }

    #[test]
    fn routes_matching_event_to_multiple_monitors() {
        let event = DataItem::node("CH_SWITCH_NOTIFY", vec![DataItem::leaf("freq", b"915000".to_vec())]);
        let backend = Arc::new(OneShotBackend {
            event: StdMutex::new(Some(event)),
        });
        let dispatcher = Arc::new(AsyncDispatcher::new(backend));
        let hits = Arc::new(AtomicUsize::new(0));

        let h1 = hits.clone();
        dispatcher.register(
            "CH_SWITCH_NOTIFY".into(),
            Arc::new(move |_| {
                h1.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let h2 = hits.clone();
        dispatcher.register(
            "freq".into(),
            Arc::new(move |_| {
                h2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let d = dispatcher.clone();
        let handle = std::thread::spawn(move || d.run());
        std::thread::sleep(Duration::from_millis(50));
        dispatcher.stop();
        handle.join().unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
