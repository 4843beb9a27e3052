//! Reliable broadcast state machine with view-synchronous membership.
//!
//! One peer (the coordinator) is the membership oracle: it admits joiners, evicts
//! peers that stop heartbeating and installs new views. Everybody runs the same
//! acknowledgement-based broadcast: a message is delivered once every member of the
//! current view acknowledged it, and a view change flushes whatever is still in
//! flight before the next view is installed.
//!
//! The basic state diagram, identical on both roles:
//!
//! ```ignore
//!              JOIN (coordinator) / VIEW_CHANGE (follower)
//!    STEADY  ----------------------------------------------> VIEW-CHANGE
//!       ^                                                        |
//!       +--------------------------------------------------------+
//!              all members FLUSHed (coordinator) / INSTALL_VIEW (follower)
//! ```
//!
//! # Capacity
//!
//! Peer ids live in [0, 64) so that acknowledgement and flush sets fit one u64
//! bitmask each.
//!
//! # Implementation notes
//!
//!  * All network I/O is fire-and-forget: the automaton never awaits a response.
//!    Lost packets are recovered by the flush round of the next view change, lost
//!    peers by the TTL sweep.
//!  * The coordinator unicasts to itself like to anybody else; its own FLUSH loops
//!    back and is counted, its own VIEW_CHANGE/INSTALL_VIEW loop back and are
//!    ignored by role.
use crate::bcast::sink::{Notification, Sink};
use crate::bcast::wire::{Member, Packet, BROADCAST};
use crate::fsm::automaton::{Automaton, Opcode, Recv};
use self::Command::*;
use self::State::*;
use slog::Logger;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

macro_rules! pretty {
    ($self:ident, $fmt:expr $(, $arg:expr)*) => {
        debug!(&$self.logger, $fmt, $($arg),* ;
            "seq" => $self.seq,
            "view" => $self.view.len(),
            "pending" => $self.pending.len());
    };
}

/// Volatile information maintained while on a given state.
mod context {

    #[derive(Copy, Clone, Default, PartialEq)]
    pub struct STDY {}

    impl super::fmt::Debug for STDY {
        fn fmt(&self, f: &mut super::fmt::Formatter<'_>) -> super::fmt::Result {
            write!(f, "STEADY      |")
        }
    }

    /// A view change is in flight. The flush confirmations are tracked as one
    /// bit per peer id.
    #[derive(Copy, Clone, Default, PartialEq)]
    pub struct SYNC {
        pub flushed: u64,
    }

    impl super::fmt::Debug for SYNC {
        fn fmt(&self, f: &mut super::fmt::Formatter<'_>) -> super::fmt::Result {
            write!(f, "VIEW-CHANGE |")
        }
    }
}

pub enum Command {
    INCOMING(Packet),
    SUBMIT(u8, String),
    TICK,
}

#[derive(Copy, Clone)]
pub(crate) enum State {
    STDY(context::STDY),
    SYNC(context::SYNC),
}

#[cfg_attr(rustfmt, rustfmt_skip)]
impl PartialEq for State {
    fn eq(&self, other: &State) -> bool {

        //
        // - since we embed a context we need to override PartialEq
        //   to do simple state comparisons
        //
        match (*self, *other) {
            (STDY(_), STDY(_)) => true,
            (SYNC(_), SYNC(_)) => true,
            _ =>                  false,
        }
    }
}

impl Default for State {
    fn default() -> State {
        State::STDY(Default::default())
    }
}

/// A message observed but not yet fully acknowledged.
struct Entry {
    seq: u64,
    sender: u8,
    content: String,
}

pub(super) struct FSM<T>
where
    T: 'static + Send + Fn(&str, String) -> (),
{
    /// Local peer id in [0, 64).
    id: u8,
    /// Id of the peer holding the coordinating role.
    coordinator: u8,
    /// Local IPv4 address, as advertised to the other peers.
    ip: String,
    /// Outgoing sequence counter, bumped once per local broadcast.
    seq: u64,
    /// Current view. Empty until admitted, afterwards it always contains self.
    view: Vec<Member>,
    /// Proposed next view while a change is in flight.
    next_view: Vec<Member>,
    /// Messages awaiting full acknowledgement, in observation order.
    pending: Vec<Entry>,
    /// Sequence number <-> bitmask of the peer ids that acknowledged it.
    acked: HashMap<u64, u64>,
    /// (sender, seq) pairs delivered in the current view. A flush may re-forward
    /// a message we already delivered: without this we would record it anew and
    /// potentially deliver it twice in the same view.
    delivered: HashSet<(u8, u64)>,
    /// Heartbeat countdown per admitted non-coordinator peer (coordinator only).
    ttl: HashMap<u8, u8>,
    /// Crash-on-receive fault injection armed.
    crashing: bool,
    /// Fault injection tripped: the automaton went inert.
    halted: bool,
    write: T,
    sink: Arc<Sink>,
    logger: Logger,
}

impl<T> FSM<T>
where
    T: 'static + Send + Fn(&str, String) -> (),
{
    /// Quiet ticks before a peer is evicted.
    const TTL_CEILING: u8 = 3;

    pub(super) fn new(config: super::Config, write: T, sink: Arc<Sink>, logger: Logger) -> Self {
        FSM {
            id: config.id,
            coordinator: config.coordinator,
            ip: config.ip,
            seq: 0,
            view: Vec::new(),
            next_view: Vec::new(),
            pending: Vec::new(),
            acked: HashMap::new(),
            delivered: HashSet::new(),
            ttl: HashMap::new(),
            crashing: false,
            halted: false,
            write,
            sink,
            logger,
        }
    }

    #[inline]
    fn is_coordinator(&self) -> bool {
        self.id == self.coordinator
    }

    fn unicast(&self, ip: &str, packet: &Packet) -> () {
        (self.write)(ip, packet.encode());
    }

    fn send_to_view(&self, packet: &Packet) -> () {
        for member in &self.view {
            self.unicast(&member.ip, packet);
        }
    }

    /// Re-forward everything pending to each member of the current view, then
    /// confirm with a FLUSH. Whoever drives the view change counts those.
    fn flush_round(&self) -> () {
        for member in &self.view {
            for entry in &self.pending {
                self.unicast(
                    &member.ip,
                    &Packet::Msg {
                        seq: entry.seq,
                        sender: entry.sender,
                        content: entry.content.clone(),
                    },
                );
            }
            self.unicast(&member.ip, &Packet::Flush { sender: self.id });
        }
    }

    /// Deliver-and-remove, in observation order, every pending message whose
    /// acknowledgement set covers the whole view.
    fn try_deliver(&mut self) -> () {
        let full = self.view.len() as u32;
        if full == 0 {
            return;
        }
        let mut n = 0;
        while n < self.pending.len() {
            let seq = self.pending[n].seq;
            let confirmed = self.acked.get(&seq).map_or(0, |mask| mask.count_ones());
            if confirmed == full {
                let entry = self.pending.remove(n);
                self.acked.remove(&seq);
                self.delivered.insert((entry.sender, entry.seq));
                pretty!(self, "delivering #{} from peer #{}", entry.seq, entry.sender);
                self.sink
                    .push(Notification::DELIVERED(entry.sender, entry.content));
            } else {
                n += 1;
            }
        }
    }

    /// Install the proposed view: drop whatever did not get flushed through,
    /// adopt, notify.
    fn install(&mut self) -> () {
        self.pending.clear();
        self.acked.clear();
        self.delivered.clear();
        self.view = self.next_view.clone();
        debug_assert!(self.view.iter().any(|member| member.id == self.id));
        info!(&self.logger, "view installed ({} members)", self.view.len());
        self.sink.push(Notification::INSTALLED(self.view.clone()));
    }

    /// Coordinator only: admit one joiner and start the flush round against the
    /// current view. The joiner itself only receives the proposal.
    fn admit(&mut self, state: State, id: u8, ip: String) -> State {
        if let SYNC(_) = state {
            warn!(
                &self.logger,
                "view change in progress, dropping join from peer #{}", id
            );
            return state;
        }
        if id == self.id || self.view.iter().any(|member| member.id == id) {
            warn!(&self.logger, "dropping join with unusable id #{}", id);
            return state;
        }
        pretty!(self, "peer #{} joining from {}", id, ip);
        self.next_view = self.view.clone();
        self.next_view.push(Member { ip: ip.clone(), id });
        self.ttl.insert(id, Self::TTL_CEILING);
        let packet = Packet::ViewChange {
            origin: self.id,
            members: self.next_view.clone(),
        };
        self.send_to_view(&packet);
        self.unicast(&ip, &packet);
        self.flush_round();
        SYNC(Default::default())
    }

    /// Coordinator only: one heartbeat lapse went by. Decrement every countdown
    /// and run the leave path for whoever reached zero: prune the proposed view,
    /// promote it right away and drive a single collapsed flush sweep.
    fn scan_ttl(&mut self, state: State) -> State {
        let ids: Vec<u8> = self
            .view
            .iter()
            .filter(|member| member.id != self.coordinator)
            .map(|member| member.id)
            .collect();
        let mut gone = Vec::new();
        for id in ids {
            let ttl = self.ttl.entry(id).or_insert(Self::TTL_CEILING);
            *ttl = ttl.saturating_sub(1);
            if *ttl == 0 {
                gone.push(id);
            }
        }
        if gone.is_empty() {
            return state;
        }
        for id in &gone {
            self.ttl.remove(id);
            warn!(
                &self.logger,
                "peer #{} left (missed {} heartbeats)", id, Self::TTL_CEILING
            );
        }

        //
        // - seed the proposal from the change already in flight if any
        // - prune the dead peers and promote immediately: the flush round that
        //   follows completes against the new view, e.g nobody waits on a FLUSH
        //   from a peer that will never send one
        //
        let mut next = match state {
            SYNC(_) => self.next_view.clone(),
            STDY(_) => self.view.clone(),
        };
        next.retain(|member| !gone.contains(&member.id));
        self.next_view = next;
        self.view = self.next_view.clone();
        self.send_to_view(&Packet::ViewChange {
            origin: self.id,
            members: self.next_view.clone(),
        });
        self.flush_round();
        SYNC(Default::default())
    }
}

impl<T> Recv<Command, State> for FSM<T>
where
    T: 'static + Send + Fn(&str, String) -> (),
{
    fn recv(
        &mut self,
        _this: &Arc<Automaton<Command>>,
        state: State,
        opcode: Opcode<Command, State>,
    ) -> State {
        match opcode {
            Opcode::START => {
                if self.is_coordinator() {

                    //
                    // - the coordinator bootstraps the cluster: its first view
                    //   is just itself
                    //
                    self.view = vec![Member {
                        ip: self.ip.clone(),
                        id: self.id,
                    }];
                    pretty!(self, "starting as coordinator on {}", self.ip);
                } else {

                    //
                    // - everybody else asks the subnet for admission and waits
                    //   for the coordinator to propose a view
                    //
                    pretty!(self, "starting on {}, requesting admission", self.ip);
                    self.unicast(
                        BROADCAST,
                        &Packet::Join {
                            id: self.id,
                            ip: self.ip.clone(),
                        },
                    );
                }
            }
            Opcode::INPUT(_) if self.halted => {

                //
                // - a fault injection command tripped: the automaton plays dead
                //   until the embedding process terminates it
                //
            }
            Opcode::INPUT(TICK) => {
                if self.is_coordinator() {
                    return self.scan_ttl(state);
                } else if self.view.is_empty() {

                    //
                    // - still not admitted: our JOIN (or the answer to it) may
                    //   have been lost, ask again
                    //
                    self.unicast(
                        BROADCAST,
                        &Packet::Join {
                            id: self.id,
                            ip: self.ip.clone(),
                        },
                    );
                } else {
                    self.unicast(
                        BROADCAST,
                        &Packet::HeartBeat {
                            sender: self.id,
                            ip: self.ip.clone(),
                        },
                    );
                }
            }
            Opcode::INPUT(SUBMIT(command, text)) => {
                if command == 1 {

                    //
                    // - send-and-crash: emit one MSG to the first view member
                    //   only, then go inert and ask the process to die
                    //
                    let seq = self.seq;
                    self.seq += 1;
                    if let Some(member) = self.view.first() {
                        let ip = member.ip.clone();
                        self.unicast(
                            &ip,
                            &Packet::Msg {
                                seq,
                                sender: self.id,
                                content: text,
                            },
                        );
                    }
                    crit!(&self.logger, "fault injection: crashing after one send");
                    self.halted = true;
                    self.sink.push(Notification::HALTED);
                    return state;
                }
                if command == 2 {

                    //
                    // - crash-on-receive: arm the trigger, the submit itself
                    //   goes out normally
                    //
                    warn!(
                        &self.logger,
                        "fault injection: armed, crashing on the next foreign message"
                    );
                    self.crashing = true;
                }
                if self.view.is_empty() {
                    warn!(&self.logger, "not in a view yet, dropping submit");
                    return state;
                }
                let seq = self.seq;
                self.seq += 1;
                pretty!(self, "broadcasting #{}", seq);
                self.pending.push(Entry {
                    seq,
                    sender: self.id,
                    content: text.clone(),
                });
                *self.acked.entry(seq).or_insert(0) |= 1u64 << self.id;
                self.send_to_view(&Packet::Msg {
                    seq,
                    sender: self.id,
                    content: text,
                });

                //
                // - the loopback MSG is ignored and we never acknowledge our own
                //   broadcast, so the delivery condition can already hold here
                //   (trivially so in a view of one)
                //
                self.try_deliver();
            }
            Opcode::INPUT(INCOMING(packet)) => {

                //
                // - ids outside the bitmask capacity cannot be tracked, drop the
                //   packet before any bit arithmetic
                //
                let id = match &packet {
                    Packet::Msg { sender, .. }
                    | Packet::Ack { sender, .. }
                    | Packet::Flush { sender }
                    | Packet::HeartBeat { sender, .. } => Some(*sender),
                    Packet::Join { id, .. } => Some(*id),
                    _ => None,
                };
                if let Some(id) = id {
                    if id >= super::MAX_PEERS {
                        warn!(&self.logger, "dropping packet from out-of-range peer #{}", id);
                        return state;
                    }
                }

                match packet {
                    Packet::Msg {
                        seq,
                        sender,
                        content,
                    } => {
                        if self.crashing && sender != self.id {

                            //
                            // - crash-on-receive fires on the first foreign MSG
                            //
                            crit!(
                                &self.logger,
                                "fault injection: crashing on message from peer #{}",
                                sender
                            );
                            self.halted = true;
                            self.sink.push(Notification::HALTED);
                        } else if sender == self.id {

                            //
                            // - loopback of our own broadcast, already recorded
                            //   at submit time
                            //
                        } else if self.view.is_empty() {
                            trace!(&self.logger, "no view yet, ignoring #{}", seq);
                        } else {
                            let known = self.delivered.contains(&(sender, seq))
                                || self
                                    .pending
                                    .iter()
                                    .any(|entry| entry.seq == seq && entry.sender == sender);
                            *self.acked.entry(seq).or_insert(0) |= 1u64 << sender;
                            if !known {

                                //
                                // - first sighting: record it and acknowledge to
                                //   the whole view, ourselves included
                                // - duplicates only grow the acknowledgement set
                                //
                                pretty!(self, "recording #{} from peer #{}", seq, sender);
                                self.pending.push(Entry {
                                    seq,
                                    sender,
                                    content,
                                });
                                self.send_to_view(&Packet::Ack {
                                    seq,
                                    sender: self.id,
                                });
                            }
                            self.try_deliver();
                        }
                    }
                    Packet::Ack { seq, sender } => {
                        if self.view.is_empty() {
                            trace!(&self.logger, "no view yet, ignoring ack #{}", seq);
                        } else {
                            *self.acked.entry(seq).or_insert(0) |= 1u64 << sender;
                            self.try_deliver();
                        }
                    }
                    Packet::Join { id, ip } => {
                        if self.is_coordinator() {
                            return self.admit(state, id, ip);
                        }

                        //
                        // - JOIN is broadcast, every follower sees it (its own
                        //   included): only the membership oracle reacts
                        //
                    }
                    Packet::ViewChange { origin, members } => {
                        if self.is_coordinator() {

                            //
                            // - loopback of our own dissemination
                            //
                            return state;
                        }
                        pretty!(
                            self,
                            "view change from #{} ({} members)",
                            origin,
                            members.len()
                        );
                        self.next_view = members;
                        if self.view.is_empty() {

                            //
                            // - first view at a joiner: nothing was ever pending
                            //   here, adopt right away without flushing
                            //
                            self.install();
                            return STDY(Default::default());
                        }

                        //
                        // - re-forward whatever is pending to the old view, then
                        //   confirm, and hold on for the INSTALL_VIEW
                        //
                        self.flush_round();
                        return SYNC(Default::default());
                    }
                    Packet::Flush { sender } => {
                        if let (true, SYNC(mut ctx)) = (self.is_coordinator(), state) {

                            //
                            // - one more member done flushing
                            // - note the id is admitted into the set even if it is
                            //   not (or no longer) part of the current view
                            //
                            ctx.flushed |= 1u64 << sender;
                            let confirmed = ctx.flushed.count_ones() as usize;
                            pretty!(
                                self,
                                "flush confirmed by peer #{} ({}/{})",
                                sender,
                                confirmed,
                                self.view.len()
                            );
                            if confirmed == self.view.len() {

                                //
                                // - everybody flushed: commit the proposal and
                                //   tell the new view
                                //
                                self.install();
                                self.send_to_view(&Packet::InstallView { origin: self.id });
                                return STDY(Default::default());
                            }
                            return SYNC(ctx);
                        }
                        trace!(&self.logger, "ignoring stray flush from peer #{}", sender);
                    }
                    Packet::InstallView { origin } => {
                        if let (false, SYNC(_)) = (self.is_coordinator(), state) {
                            pretty!(self, "install from #{}", origin);
                            self.install();
                            return STDY(Default::default());
                        }
                        trace!(&self.logger, "ignoring stray install from #{}", origin);
                    }
                    Packet::HeartBeat { sender, .. } => {
                        if self.is_coordinator() && sender != self.id {
                            match self.ttl.get_mut(&sender) {
                                Some(ttl) => *ttl = Self::TTL_CEILING,
                                None => {
                                    trace!(
                                        &self.logger,
                                        "heartbeat from unknown peer #{}",
                                        sender
                                    );
                                }
                            }
                        }
                    }
                }
            }
            Opcode::TRANSITION(prv) => {
                debug_assert!(state != prv);
                match (prv, state) {
                    (STDY(_), SYNC(ref ctx)) => {
                        pretty!(self, "{:?} flushing towards the next view", ctx);
                    }
                    (SYNC(_), STDY(ref ctx)) => {
                        pretty!(self, "{:?} back to steady state", ctx);
                    }
                    _ => {
                        debug_assert!(false, "invalid state transition");
                    }
                }
            }
            Opcode::DRAIN => {
                warn!(&self.logger, "draining");
            }
            Opcode::EXIT => {

                //
                // - send a last notification and close the sink, which will
                //   force the consuming thread to pop whatever is left and
                //   then move on
                //
                self.sink.push(Notification::EXIT);
                self.sink.close();
            }
        };
        state
    }
}

/// Wrapper around the automaton. Public operations are exposed via a few methods.
pub struct Engine {
    pub(super) fsm: Arc<Automaton<Command>>,
}

impl Engine {
    /// Originate a broadcast. `command` 0 sends normally; 1 (send-and-crash) and
    /// 2 (crash-on-receive) are the fault injection hooks.
    pub fn submit(&self, command: u8, text: String) -> () {
        let _ = self.fsm.post(SUBMIT(command, text));
    }

    /// Hand one decoded packet to the automaton. False once the engine is
    /// shutting down.
    pub fn feed(&self, packet: Packet) -> bool {
        self.fsm.post(INCOMING(packet)).is_ok()
    }

    /// Gracefully drain the automaton; queued commands are still processed.
    pub fn stop(&self) -> () {
        self.fsm.drain();
    }
}

impl Clone for Engine {
    fn clone(&self) -> Self {
        Engine {
            fsm: self.fsm.clone(),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) -> () {
        self.fsm.drain();
    }
}
