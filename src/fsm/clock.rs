//! Fixed-period clock posting a command to one automaton. The backing thread is not
//! guarded: it exits on its own as soon as the automaton is gone or stops accepting,
//! which is at most one period after the drain.
use crate::fsm::automaton::Automaton;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

pub struct Clock;

impl Clock {
    /// Spawn the ticking thread. The `tick` closure mints a fresh command for
    /// each period.
    pub fn spawn<T, F>(to: &Arc<Automaton<T>>, every: Duration, tick: F) -> ()
    where
        T: Send + 'static,
        F: 'static + Send + Fn() -> T,
    {
        let to: Weak<Automaton<T>> = Arc::downgrade(to);
        let _ = thread::spawn(move || {

            //
            // - lock a private mutex and sleep on the condition variable, one
            //   period at a time (nobody ever notifies it)
            // - the weak reference avoids keeping the automaton alive just to
            //   tick it
            //
            let cv = Condvar::new();
            let mtx = Mutex::new(());
            loop {
                {
                    let lock = mtx.lock().unwrap();
                    let _ = cv.wait_timeout(lock, every).unwrap();
                }
                match to.upgrade() {
                    Some(fsm) => {
                        if fsm.post(tick()).is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        });
    }
}
