//! Process-wide halt condition: the host's main thread blocks on this until
//! any module signals it (ctrl-C, SIGTERM, or a fatal configuration/invariant
//! error detected after startup).

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
pub struct Halt {
    signalled: Mutex<bool>,
    condition: Condvar,
}

impl Halt {
    pub fn new() -> Arc<Self> {
        Arc::new(Halt::default())
    }

    /// Signal the halt condition. Idempotent.
    pub fn signal(&self) {
        *self.signalled.lock() = true;
        self.condition.notify_all();
    }

    /// Block the calling thread until [`Halt::signal`] is called.
    pub fn wait(&self) {
        let mut signalled = self.signalled.lock();
        while !*signalled {
            self.condition.wait(&mut signalled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn wait_returns_after_signal() {
        let halt = Halt::new();
        let h = halt.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            h.signal();
        });
        halt.wait();
        handle.join().unwrap();
    }
}
