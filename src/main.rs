//! Reliable broadcast node with view-synchronous membership.
//!
//! The node binds the shared UDP port, discovers its local IPv4 address and joins the
//! cluster (the peer whose id matches `--coordinator`, 0 by default, bootstraps it
//! instead). Each line read from stdin is broadcast to the current view; delivered
//! messages are printed on stdout with a local timestamp. A leading integer token on a
//! stdin line selects a fault injection command: `1 <text>` sends one MSG then
//! crashes, `2 <text>` sends normally and crashes on the next foreign message, any
//! other line is broadcast verbatim.
#[macro_use]
extern crate clap;
#[macro_use]
extern crate slog;

use chrono::Local;
use groupcast::bcast::endpoint::{self, Endpoint};
use groupcast::bcast::sink::Notification;
use groupcast::bcast::{self, Config};
use groupcast::primitives::event::Event;
use slog::{Drain, Logger};
use slog_async::Async;
use slog_term::{FullFormat, PlainSyncDecorator};
use std::io::{stderr, stdin, BufRead};
use std::process;
use std::sync::Arc;
use std::thread;

fn main() {

    //
    // - init slog to dump on stderr
    //
    let decorator = PlainSyncDecorator::new(stderr());
    let formatted = FullFormat::new(decorator).build().fuse();
    let drain = Async::new(formatted).build().fuse();
    let root = Logger::root(drain, o!());
    let log = root.new(o!("sys" => "main"));
    info!(&log, "starting (version={})", env!("CARGO_PKG_VERSION"));

    //
    // - parse the CLI line
    //
    let args = clap_app!(groupcast =>
        (version: env!("CARGO_PKG_VERSION"))
        (about: "reliable broadcast with view-synchronous membership")
        (@arg ID: +required "process id, unique across the cluster")
        (@arg PORT: -p --port +takes_value "UDP port shared by all peers")
        (@arg COORDINATOR: --coordinator +takes_value "process id holding the coordinating role")
    ).get_matches();

    let id = value_t!(args, "ID", u8).unwrap_or_else(|e| e.exit());
    let port = value_t!(args, "PORT", u16).unwrap_or(49588);
    let coordinator = value_t!(args, "COORDINATOR", u8).unwrap_or(0);

    //
    // - bind the shared datagram socket and discover our address
    // - either failing is fatal
    //
    let endpoint = match Endpoint::bind(port, root.new(o!("sys" => "net", "id" => id))) {
        Ok(endpoint) => Arc::new(endpoint),
        Err(e) => {
            crit!(&log, "unable to bind udp port {}: {}", port, e);
            process::exit(2);
        }
    };
    let ip = match endpoint::local_ipv4(&log) {
        Ok(ip) => ip,
        Err(e) => {
            crit!(&log, "unable to enumerate interfaces: {}", e);
            process::exit(2);
        }
    };
    info!(&log, "peer #{} at {} on udp port {}", id, ip, endpoint.port());

    //
    // - use a termination event
    // - the broadcast automaton will signal it when shutting down
    //
    let event = Arc::new(Event::new());
    let guard = event.guard();

    let (engine, sink) = bcast::spawn(
        &guard,
        Config {
            id,
            coordinator,
            ip,
            tick: bcast::TICK_EVERY,
        },
        {
            let endpoint = endpoint.clone();
            move |ip: &str, raw: String| endpoint.send(ip, raw)
        },
        root.new(o!("sys" => "bcast", "id" => id)),
    );

    //
    // - the receive loop feeds decoded packets straight into the automaton
    //
    {
        let engine = engine.clone();
        if let Err(e) = endpoint.listen(move |packet| engine.feed(packet)) {
            crit!(&log, "unable to start the receive loop: {}", e);
            process::exit(2);
        }
    }

    //
    // - trap SIGINT/SIGTERM and drain the engine
    // - the automaton will signal the termination event upon going down
    //
    {
        let engine = engine.clone();
        let endpoint = endpoint.clone();
        ctrlc::set_handler(move || {
            endpoint.stop();
            engine.stop();
        }).unwrap();
    }

    //
    // - bulletin board: read stdin on a dedicated thread, each non-empty line
    //   is one submit
    //
    {
        let engine = engine.clone();
        let _ = thread::spawn(move || {
            let stdin = stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) => {
                        if !line.is_empty() {
                            let (command, text) = split_command(&line);
                            engine.submit(command, text);
                        }
                    }
                    _ => break,
                }
            }
        });
    }

    //
    // - consume notifications until the engine goes down
    // - deliveries go to stdout, membership changes to the log
    //
    loop {
        match sink.next() {
            Some(Notification::DELIVERED(sender, content)) => {
                println!(
                    "[{}] Delivered message from {}: {}",
                    Local::now().format("%H:%M:%S"),
                    sender,
                    content
                );
            }
            Some(Notification::INSTALLED(members)) => {
                let view: Vec<String> = members.iter().map(|member| member.to_string()).collect();
                info!(&log, "view is now [{}]", view.join(", "));
            }
            Some(Notification::HALTED) => {

                //
                // - a fault injection command tripped
                // - stop the loops and die with a non-zero code
                //
                endpoint.stop();
                engine.stop();
                process::exit(1);
            }
            Some(Notification::EXIT) | None => break,
        }
    }

    //
    // - block on the termination event
    //
    endpoint.stop();
    drop(guard);
    event.wait();
    info!(&log, "exiting");
}

/// Split the optional fault injection prefix off one stdin line.
fn split_command(line: &str) -> (u8, String) {
    let mut split = line.splitn(2, ' ');
    if let (Some(head), Some(rest)) = (split.next(), split.next()) {
        if let Ok(command) = head.parse::<u8>() {
            if command <= 2 {
                return (command, rest.to_string());
            }
        }
    }
    (0, line.to_string())
}

#[cfg(test)]
mod tests {

    use super::split_command;

    #[test]
    fn command_prefixes() {
        assert_eq!(split_command("hello there"), (0, "hello there".to_string()));
        assert_eq!(split_command("0 hello"), (0, "hello".to_string()));
        assert_eq!(split_command("1 Z"), (1, "Z".to_string()));
        assert_eq!(split_command("2 ping"), (2, "ping".to_string()));
        assert_eq!(split_command("2024 results"), (0, "2024 results".to_string()));
        assert_eq!(split_command("1"), (0, "1".to_string()));
    }
}
