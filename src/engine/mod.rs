//! Generic event engine: a polling-request scheduler and a per-backend
//! asynchronous dispatcher, both built on `std::thread` plus
//! `parking_lot::{Mutex, Condvar}` rather than an async runtime.

mod dispatch;
mod poll;

pub use dispatch::AsyncDispatcher;
pub use poll::{PollEntry, PollWorker};

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::backend::Backend;
use crate::dataitem::{DataItem, ItemKey};

/// Owns the single poll worker and lazily-created per-backend async
/// dispatcher threads. Created once per process, stopped and joined on
/// shutdown.
pub struct EventEngine {
    poll: Arc<PollWorker>,
    poll_thread: Mutex<Option<JoinHandle<()>>>,
    dispatchers: Mutex<HashMap<String, (Arc<AsyncDispatcher>, JoinHandle<()>)>>,
}

impl EventEngine {
    pub fn new() -> Arc<Self> {
        let engine = Arc::new(EventEngine {
            poll: Arc::new(PollWorker::new()),
            poll_thread: Mutex::new(None),
            dispatchers: Mutex::new(HashMap::new()),
        });
        let worker = engine.poll.clone();
        let handle = std::thread::Builder::new()
            .name("dcs-poll".into())
            .spawn(move || worker.run())
            .expect("spawn poll worker thread");
        *engine.poll_thread.lock() = Some(handle);
        engine
    }

    /// Register a periodic blocking request on the polling worker.
    pub fn register_poll(&self, entry: PollEntry) {
        self.poll.register(entry);
    }

    /// Register a pattern monitor on `backend`, creating that backend's
    /// dispatcher thread lazily on first registration.
    pub fn register_monitor(
        &self,
        backend: Arc<dyn Backend>,
        key: ItemKey,
        callback: Arc<dyn Fn(&DataItem) + Send + Sync>,
    ) {
        let name = backend.name().to_string();
        let mut dispatchers = self.dispatchers.lock();
        let (dispatcher, _) = dispatchers.entry(name.clone()).or_insert_with(|| {
            let dispatcher = Arc::new(AsyncDispatcher::new(backend));
            let d = dispatcher.clone();
            let handle = std::thread::Builder::new()
                .name(format!("dcs-async-{name}"))
                .spawn(move || d.run())
                .expect("spawn async dispatcher thread");
            (dispatcher, handle)
        });
        dispatcher.register(key, callback);
    }

    /// Stop both workers and join every thread. Both worker kinds exit at
    /// their next timeout boundary.
    pub fn shutdown(&self) {
        self.poll.stop();
        if let Some(handle) = self.poll_thread.lock().take() {
            let _ = handle.join();
        }
        let mut dispatchers = self.dispatchers.lock();
        for (_, (dispatcher, _)) in dispatchers.iter() {
            dispatcher.stop();
        }
        for (_, (_, handle)) in dispatchers.drain() {
            let _ = handle.join();
        }
    }
}
