//! Minimalistic automaton (e.g finite state machine) backed by an event loop running on a
//! dedicated thread. Producers post commands into the inbox; the loop dequeues them one at
//! a time and hands them to a user defined handler together with the current state.
use crate::primitives::event::Guard;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Mode {
    RUNNING,
    DRAINING,
    DEAD,
}

#[derive(Debug)]
pub enum Errors {
    InvalidMode(Mode),
}

#[derive(Debug)]
pub enum Opcode<T, U>
where
    U: PartialEq,
{
    START,
    INPUT(T),
    TRANSITION(U),
    DRAIN,
    EXIT,
}

use self::Errors::*;
use self::Mode::*;
use self::Opcode::*;

/// User defined handler specifying the current state and opcode to process.
/// The state will be updated to whatever value is returned.
pub trait Recv<T, U>: Send
where
    T: Send,
    U: PartialEq,
{
    fn recv(&mut self, this: &Arc<Automaton<T>>, state: U, opcode: Opcode<T, U>) -> U;
}

struct Inbox<T> {
    queue: VecDeque<T>,
    mode: Mode,
}

/// Automaton maintaining an incoming queue of commands to process plus a mode (e.g
/// running, draining, dead). The underlying thread runs the event loop: dequeue from
/// the inbox, invoke the user handler, emit a TRANSITION whenever the returned state
/// differs from the current one. Draining lets the queue run empty, then the handler
/// receives a final EXIT and the thread terminates.
pub struct Automaton<T>
where
    T: Send + 'static,
{
    inbox: Mutex<Inbox<T>>,
    cv: Condvar,
}

impl<T> Automaton<T>
where
    T: Send + 'static,
{
    pub fn spawn<U>(guard: Arc<Guard>, mut body: Box<dyn Recv<T, U>>) -> Arc<Automaton<T>>
    where
        U: Send + Copy + Default + PartialEq + 'static,
    {
        let fsm = Arc::new(Automaton {
            inbox: Mutex::new(Inbox {
                queue: VecDeque::new(),
                mode: RUNNING,
            }),
            cv: Condvar::new(),
        });

        {
            let fsm = fsm.clone();
            let _ = thread::spawn(move || {

                //
                // - recv on START and assign the initial state
                //
                let mut state = U::default();
                let _ = body.recv(&fsm, state, START);
                let mut draining = false;
                loop {

                    let mut inbox = fsm.inbox.lock().unwrap();
                    while inbox.queue.is_empty() && inbox.mode == RUNNING {
                        inbox = fsm.cv.wait(inbox).unwrap();
                    }

                    //
                    // - drain() was invoked: recv once on DRAIN, then keep
                    //   consuming whatever is left in the queue
                    //
                    if inbox.mode == DRAINING && !draining {
                        drop(inbox);
                        draining = true;
                        let _ = body.recv(&fsm, state, DRAIN);
                        continue;
                    }

                    match inbox.queue.pop_front() {
                        Some(msg) => {
                            drop(inbox);

                            //
                            // - recv on INPUT and optionally on TRANSITION if the
                            //   returned state is deemed different
                            //
                            let next = body.recv(&fsm, state, INPUT(msg));
                            if next != state {
                                let _ = body.recv(&fsm, next, TRANSITION(state));
                            }
                            state = next;
                        }
                        None => {

                            //
                            // - we are draining and the queue is now empty
                            // - recv a last time on EXIT and exit the thread
                            //
                            inbox.mode = DEAD;
                            drop(inbox);
                            let _ = body.recv(&fsm, state, EXIT);
                            break;
                        }
                    }
                }

                //
                // - the automaton is now dead
                // - release the handler first, then the guard so that whoever
                //   waits on the termination event observes a fully torn down
                //   automaton
                //
                drop(body);
                drop(guard);
            });
        }
        fsm
    }

    /// Enqueue a command. Fails once the automaton is draining or dead.
    pub fn post(&self, msg: T) -> Result<(), Errors> {
        let mut inbox = self.inbox.lock().unwrap();
        match inbox.mode {
            RUNNING => {
                inbox.queue.push_back(msg);
                self.cv.notify_one();
                Ok(())
            }
            mode => Err(InvalidMode(mode)),
        }
    }

    /// Switch to draining: pending commands are still processed, then the
    /// automaton receives EXIT and its thread terminates.
    pub fn drain(&self) -> () {
        let mut inbox = self.inbox.lock().unwrap();
        if inbox.mode == RUNNING {
            inbox.mode = DRAINING;
            self.cv.notify_one();
        }
    }

    pub fn mode(&self) -> Mode {
        self.inbox.lock().unwrap().mode
    }
}
