use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A counting barrier in the shape of a wait group, with an optional
/// deadline on the waiting side. Connections use it to keep their socket
/// open while a write is in flight; the client uses it to drain pending
/// requests on shutdown.
pub struct Wait {
    count: Mutex<i64>,
    cond: Condvar,
}

impl Wait {
    pub fn new() -> Wait {
        Wait {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn add(&self, delta: i64) {
        let mut count = self.count.lock();
        *count += delta;
        if *count <= 0 {
            self.cond.notify_all();
        }
    }

    pub fn done(&self) {
        self.add(-1);
    }

    /// Blocks until the counter returns to zero.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.cond.wait(&mut count);
        }
    }

    /// Blocks until the counter returns to zero or the timeout elapses.
    /// Returns true if it gave up waiting.
    pub fn wait_with_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.cond.wait_until(&mut count, deadline).timed_out() {
                return *count > 0;
            }
        }
        false
    }
}

impl Default for Wait {
    fn default() -> Wait {
        Wait::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn wait_returns_when_counter_drains() {
        let w = Arc::new(Wait::new());
        w.add(2);
        let w2 = w.clone();
        let t = thread::spawn(move || {
            w2.done();
            w2.done();
        });
        w.wait();
        t.join().unwrap();
    }

    #[test]
    fn wait_with_timeout_reports_expiry() {
        let w = Wait::new();
        w.add(1);
        assert!(w.wait_with_timeout(Duration::from_millis(20)));
        w.done();
        assert!(!w.wait_with_timeout(Duration::from_millis(20)));
    }
}
