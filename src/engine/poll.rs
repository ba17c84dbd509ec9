//! Polling worker: a single cooperative thread that fires blocking requests
//! on a timer and invokes the registered callback.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::backend::{Backend, Request};
use crate::dataitem::DataItem;
use crate::error::BackendError;

/// One registered periodic request.
pub struct PollEntry {
    pub backend: Arc<dyn Backend>,
    pub period: Duration,
    pub request: Request,
    pub callback: Arc<dyn Fn(Result<DataItem, BackendError>) + Send + Sync>,
    next_fire: Instant,
}

impl PollEntry {
    pub fn new(
        backend: Arc<dyn Backend>,
        period: Duration,
        request: Request,
        callback: Arc<dyn Fn(Result<DataItem, BackendError>) + Send + Sync>,
    ) -> Self {
        PollEntry {
            backend,
            period,
            request,
            callback,
            next_fire: Instant::now(),
        }
    }
}

struct PollState {
    entries: Vec<PollEntry>,
    running: bool,
}

pub struct PollWorker {
    state: Mutex<PollState>,
    wake: Condvar,
}

impl PollWorker {
    pub fn new() -> Self {
        PollWorker {
            state: Mutex::new(PollState {
                entries: Vec::new(),
                running: true,
            }),
            wake: Condvar::new(),
        }
    }

    /// Registering a new monitor wakes the worker immediately.
    pub fn register(&self, entry: PollEntry) {
        let mut state = self.state.lock();
        state.entries.push(entry);
        drop(state);
        self.wake.notify_all();
    }

    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.running = false;
        drop(state);
        self.wake.notify_all();
    }

    /// Main loop, run on its own thread. Exits when `running` becomes false.
    pub fn run(&self) {
        loop {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            if state.entries.is_empty() {
                self.wake.wait(&mut state);
                continue;
            }

            let now = Instant::now();
            let earliest = state
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.next_fire)
                .map(|(i, _)| i)
                .expect("entries non-empty");

            if state.entries[earliest].next_fire > now {
                let wait_for = state.entries[earliest].next_fire - now;
                self.wake.wait_for(&mut state, wait_for);
                continue;
            }

            state.entries[earliest].next_fire += state.entries[earliest].period;
            let backend = state.entries[earliest].backend.clone();
            let request = state.entries[earliest].request.clone();
            let callback = state.entries[earliest].callback.clone();
            drop(state);

            let result = backend.submit_blocking(&request);
            if let Err(ref e) = result {
                warn!(target: "dcssrv::engine::poll", backend = backend.name(), error = %e, "poll request failed");
            } else {
                trace!(target: "dcssrv::engine::poll", backend = backend.name(), "poll request completed");
            }
            callback(result);
        }
    }
}

impl Default for PollWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingBackend;
    impl Backend for CountingBackend {
        fn submit_blocking(&self, _request: &Request) -> Result<DataItem, BackendError> {
            Ok(DataItem::empty("ok"))
        }
        fn name(&self) -> &str {
            "counting"
        }
    }

    #[test]
    fn fires_periodically_and_stops_on_signal() {
        let worker = Arc::new(PollWorker::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();

        let w = worker.clone();
        let handle = std::thread::spawn(move || w.run());

        worker.register(PollEntry::new(
            Arc::new(CountingBackend),
            Duration::from_millis(10),
            Request::Hostapd("STATUS".into()),
            Arc::new(move |_result| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
        ));

        std::thread::sleep(Duration::from_millis(100));
        worker.stop();
        handle.join().unwrap();

        assert!(count.load(Ordering::SeqCst) >= 3);
    }
}
