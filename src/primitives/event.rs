//! A simple auto-reset event used to wake one thread up when something happened. An
//! additional guard is provided to signal the event when the last of its clones drops,
//! which is handy to wait for a group of threads to complete work.
use std::sync::{Arc, Condvar, Mutex};

struct Inner {
    set: Mutex<bool>,
    cv: Condvar,
}

/// Trivial auto-reset event: wait() blocks until signal() is invoked and consumes
/// the signal on the way out.
pub struct Event {
    inner: Arc<Inner>,
}

/// Shallow guard sharing the event internals and signaling them upon dropping. Clone
/// the guard into each thread of a group: the last drop wakes whoever is waiting.
pub struct Guard(Arc<Inner>);

impl Inner {
    fn signal(&self) -> () {
        let mut set = self.set.lock().unwrap();
        *set = true;
        self.cv.notify_one();
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Event {
    pub fn new() -> Self {
        Event {
            inner: Arc::new(Inner {
                set: Mutex::new(false),
                cv: Condvar::new(),
            }),
        }
    }

    pub fn signal(&self) -> () {
        self.inner.signal();
    }

    pub fn wait(&self) -> () {
        let mut set = self.inner.set.lock().unwrap();
        while !*set {
            set = self.inner.cv.wait(set).unwrap();
        }

        //
        // - consume the signal (auto-reset semantics, e.g the next wait()
        //   will block again)
        //
        *set = false;
    }

    pub fn guard(&self) -> Arc<Guard> {
        Arc::new(Guard(self.inner.clone()))
    }
}

impl Drop for Guard {
    fn drop(&mut self) -> () {
        self.0.signal();
    }
}
