//! UDP endpoint: one datagram socket shared by unicast sends, subnet broadcasts and
//! the receive loop. Sends are fire-and-forget; kernel errors are logged and swallowed
//! so the protocol never stalls on I/O. The receive loop polls with a short timeout so
//! it can observe shutdown without anybody having to poke the socket.
use crate::bcast::wire::Packet;
use slog::Logger;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Matches the datagram buffer of the original protocol peers.
const MAX_DATAGRAM: usize = 1024;

const POLL_EVERY: Duration = Duration::from_millis(250);

pub struct Endpoint {
    socket: UdpSocket,
    port: u16,
    running: Arc<AtomicBool>,
    logger: Logger,
}

impl Endpoint {
    /// Bind the shared datagram socket on all interfaces and enable subnet
    /// broadcasts. Port 0 picks an ephemeral port, which is handy for tests.
    pub fn bind(port: u16, logger: Logger) -> io::Result<Endpoint> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(POLL_EVERY))?;
        let port = socket.local_addr()?.port();
        Ok(Endpoint {
            socket,
            port,
            running: Arc::new(AtomicBool::new(true)),
            logger,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Best-effort send of one encoded packet to `ip` on the shared port.
    pub fn send(&self, ip: &str, raw: String) -> () {
        match ip.parse::<Ipv4Addr>() {
            Ok(addr) => {
                let addr = SocketAddrV4::new(addr, self.port);
                if let Err(e) = self.socket.send_to(raw.as_bytes(), addr) {
                    warn!(&self.logger, "send to {} failed: {}", addr, e);
                }
            }
            Err(_) => {
                warn!(&self.logger, "unroutable destination {}", ip);
            }
        }
    }

    /// Spawn the receive loop. Each datagram is decoded and handed to `deliver`;
    /// malformed packets are dropped. The loop stops once `deliver` returns false
    /// or stop() is invoked.
    pub fn listen<F>(&self, deliver: F) -> io::Result<()>
    where
        F: 'static + Send + Fn(Packet) -> bool,
    {
        let socket = self.socket.try_clone()?;
        let running = self.running.clone();
        let logger = self.logger.clone();
        let _ = thread::spawn(move || {
            let mut buf = [0u8; MAX_DATAGRAM];
            while running.load(Ordering::Relaxed) {
                match socket.recv_from(&mut buf) {
                    Ok((n, src)) => {
                        let raw = String::from_utf8_lossy(&buf[..n]);
                        trace!(&logger, "<- {}B from {} ({})", n, src, raw);
                        match Packet::decode(&raw) {
                            Ok(packet) => {
                                if !deliver(packet) {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(&logger, "dropping malformed packet from {}: {}", src, e);
                            }
                        }
                    }
                    Err(ref e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        warn!(&logger, "receive failed: {}", e);
                    }
                }
            }
            debug!(&logger, "receive loop done");
        });
        Ok(())
    }

    /// Stop the receive loop at its next poll.
    pub fn stop(&self) -> () {
        self.running.store(false, Ordering::Release);
    }
}

/// First non-loopback IPv4 interface address, as a dotted string. Falls back to
/// loopback so a single-host cluster still works.
pub fn local_ipv4(logger: &Logger) -> io::Result<String> {
    for iface in if_addrs::get_if_addrs()? {
        if iface.addr.is_loopback() {
            continue;
        }
        if let IpAddr::V4(ip) = iface.addr.ip() {
            return Ok(ip.to_string());
        }
    }
    warn!(logger, "no non-loopback ipv4 interface, using {}", Ipv4Addr::LOCALHOST);
    Ok(Ipv4Addr::LOCALHOST.to_string())
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::primitives::event::Event;
    use slog::{Discard, Logger};
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    #[test]
    fn loopback_roundtrip_drops_garbage() {
        let logger = Logger::root(Discard, o!());
        let endpoint = Endpoint::bind(0, logger).unwrap();
        let seen: Arc<Mutex<Vec<Packet>>> = Arc::new(Mutex::new(Vec::new()));
        let event = Arc::new(Event::new());
        {
            let seen = seen.clone();
            let event = event.clone();
            endpoint
                .listen(move |packet| {
                    seen.lock().unwrap().push(packet);
                    event.signal();
                    true
                })
                .unwrap();
        }

        endpoint.send("127.0.0.1", "BOGUS not a packet".to_string());
        endpoint.send("127.0.0.1", Packet::Flush { sender: 3 }.encode());
        event.wait();
        endpoint.stop();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![Packet::Flush { sender: 3 }]);
    }

    #[test]
    fn local_ipv4_is_well_formed() {
        let logger = Logger::root(Discard, o!());
        let ip = local_ipv4(&logger).unwrap();
        assert!(ip.parse::<Ipv4Addr>().is_ok());
    }
}
