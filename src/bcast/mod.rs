//! Reliable broadcast with view-synchronous group membership over one UDP socket.
//!
//! The engine is an automaton fed by three producers: the receive loop, a periodic
//! clock and the submit API. Deliveries and membership changes come back through a
//! blocking notification sink.
pub mod endpoint;
pub mod protocol;
pub mod sink;
pub mod wire;

use crate::fsm::automaton::Automaton;
use crate::fsm::clock::Clock;
use crate::primitives::event::Guard;
use self::protocol::{Command, Engine, FSM};
use self::sink::Sink;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;

/// Peer ids live in [0, 64) so acknowledgement and flush sets fit one u64 mask.
pub const MAX_PEERS: u8 = 64;

/// Heartbeat/TTL period.
pub const TICK_EVERY: Duration = Duration::from_secs(3);

/// Static per-peer settings.
pub struct Config {
    /// Local peer id, unique across the cluster.
    pub id: u8,
    /// Id of the peer holding the coordinating role. There is no election: if
    /// that peer dies the membership freezes (accepted limitation).
    pub coordinator: u8,
    /// Local IPv4 address advertised to the other peers.
    pub ip: String,
    /// Heartbeat/TTL period, one TICK per lapse.
    pub tick: Duration,
}

/// Constructor method to spawn a new broadcast engine for one peer. Outbound
/// packets are handed to the `write` closure as (destination ipv4, encoded line)
/// pairs; it is up to the user to transmit them (socket, in-memory routing, etc).
/// Returns the engine handle plus the notification sink.
pub fn spawn<T>(
    guard: &Arc<Guard>,
    config: Config,
    write: T,
    logger: Logger,
) -> (Engine, Arc<Sink>)
where
    T: 'static + Send + Fn(&str, String) -> (),
{
    assert!(
        config.id < MAX_PEERS && config.coordinator < MAX_PEERS,
        "only {} peers max are supported",
        MAX_PEERS
    );

    let tick = config.tick;
    let sink = Arc::new(Sink::new());
    let fsm = Automaton::spawn(
        guard.clone(),
        Box::new(FSM::new(config, write, sink.clone(), logger)),
    );
    Clock::spawn(&fsm, tick, || Command::TICK);
    (Engine { fsm }, sink)
}

#[cfg(test)]
mod tests {

    use crate::bcast::protocol::{Command, Engine};
    use crate::bcast::sink::{Notification, Sink};
    use crate::bcast::wire::{Packet, BROADCAST};
    use crate::bcast::{spawn, Config};
    use crate::primitives::event::{Event, Guard};
    use slog::{Discard, Logger};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    type Router = Arc<Mutex<HashMap<String, Engine>>>;

    /// In-memory fabric: each outbound packet is decoded and fed to whoever is
    /// registered under the destination address, the broadcast pseudo-address
    /// fans out to everybody. A not-yet-registered unicast destination is
    /// retried for a while (peers register right after spawning).
    fn fabric(router: &Router) -> impl Fn(&str, String) + Send + 'static {
        let router = router.clone();
        move |ip: &str, raw: String| {
            let packet = Packet::decode(&raw).expect("outbound packets must scan");
            for _ in 0..500 {
                {
                    let peers = router.lock().unwrap();
                    if ip == BROADCAST {
                        for engine in peers.values() {
                            let _ = engine.feed(packet.clone());
                        }
                        return;
                    }
                    if let Some(engine) = peers.get(ip) {
                        let _ = engine.feed(packet.clone());
                        return;
                    }
                }
                thread::sleep(Duration::from_millis(10));
            }
        }
    }

    fn join(
        router: &Router,
        guard: &Arc<Guard>,
        id: u8,
        ip: &str,
    ) -> (Engine, Arc<Sink>) {
        let (engine, sink) = spawn(
            guard,
            Config {
                id,
                coordinator: 0,
                ip: ip.to_string(),
                tick: Duration::from_secs(600),
            },
            fabric(router),
            Logger::root(Discard, o!()),
        );
        router.lock().unwrap().insert(ip.to_string(), engine.clone());
        (engine, sink)
    }

    fn await_install(sink: &Arc<Sink>, size: usize) {
        loop {
            match sink.next() {
                Some(Notification::INSTALLED(members)) if members.len() == size => return,
                Some(Notification::INSTALLED(_)) => {}
                Some(Notification::DELIVERED(..)) => {}
                other => panic!("unexpected notification {:?}", other),
            }
        }
    }

    fn await_delivery(sink: &Arc<Sink>) -> (u8, String) {
        loop {
            match sink.next() {
                Some(Notification::DELIVERED(sender, content)) => return (sender, content),
                Some(Notification::INSTALLED(_)) => {}
                other => panic!("unexpected notification {:?}", other),
            }
        }
    }

    #[test]
    fn cluster_grows_delivers_and_shrinks() {
        let event = Arc::new(Event::new());
        let guard = event.guard();
        let router: Router = Arc::new(Mutex::new(HashMap::new()));

        //
        // - bring the coordinator up, then one joiner, and wait for the
        //   two-member view on both sides
        //
        let (p0, s0) = join(&router, &guard, 0, "10.0.0.1");
        let (p1, s1) = join(&router, &guard, 1, "10.0.0.2");
        await_install(&s0, 2);
        await_install(&s1, 2);

        //
        // - a second joiner: the flush round runs through peer #1 and the
        //   three-member view lands everywhere, including at the newcomer
        //
        let (p2, s2) = join(&router, &guard, 2, "10.0.0.3");
        await_install(&s0, 3);
        await_install(&s1, 3);
        await_install(&s2, 3);

        //
        // - agreement: a broadcast from the newcomer reaches all three
        //
        p2.submit(0, "C".to_string());
        assert_eq!(await_delivery(&s0), (2, "C".to_string()));
        assert_eq!(await_delivery(&s1), (2, "C".to_string()));
        assert_eq!(await_delivery(&s2), (2, "C".to_string()));

        //
        // - per-sender FIFO: two quick broadcasts from peer #1 come out in
        //   submission order everywhere
        //
        p1.submit(0, "one".to_string());
        p1.submit(0, "two".to_string());
        for sink in vec![&s0, &s1, &s2] {
            assert_eq!(await_delivery(sink), (1, "one".to_string()));
            assert_eq!(await_delivery(sink), (1, "two".to_string()));
        }

        //
        // - silent departure of peer #2: drive the coordinator clock by hand,
        //   keeping peer #1 alive with heartbeats, until the eviction sweep
        //   collapses the view back to two members
        //
        p2.stop();
        for _ in 0..3 {
            p0.fsm.post(Command::TICK).unwrap();
            p0.feed(Packet::HeartBeat {
                sender: 1,
                ip: "10.0.0.2".to_string(),
            });
        }
        await_install(&s0, 2);
        await_install(&s1, 2);

        //
        // - the survivors still agree
        //
        p1.submit(0, "after".to_string());
        assert_eq!(await_delivery(&s0), (1, "after".to_string()));
        assert_eq!(await_delivery(&s1), (1, "after".to_string()));

        //
        // - graceful shutdown: drain everybody and wait on the termination
        //   event (the guard clones drop as the automata exit)
        //
        router.lock().unwrap().clear();
        p0.stop();
        p1.stop();
        drop(guard);
        event.wait();

        //
        // - the sinks drain with a final EXIT and then always fail
        //
        match s0.next() {
            Some(Notification::EXIT) => {}
            other => panic!("unexpected notification {:?}", other),
        }
        assert!(s0.next().is_none());
    }
}
