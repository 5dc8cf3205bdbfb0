//! The relay context and its single-threaded reactor.
//!
//! One `Poll` instance drives everything: the ingress UDP socket, the egress
//! UDP socket (armed only while flushes are queued), every host's probe
//! watcher, the signal source, and a waker for cross-thread shutdown. The
//! flush and health periodics are poll-timeout deadlines rather than timer
//! fds, fired after each event batch. All mutation happens on the reactor
//! thread; the only cross-thread traffic is the resolver's single-slot
//! address handoff.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use signal_hook::consts::{SIGHUP, SIGINT};
use signal_hook_mio::v1_0::Signals;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::downstream::HostSet;
use crate::egress::{Aggregator, EgressSocket, DOWNSTREAM_BUF_SIZE};
use crate::slot::MAX_COUNTER_LENGTH;

const INGRESS: Token = Token(0);
const EGRESS: Token = Token(1);
const WAKER: Token = Token(2);
const SIGNALS: Token = Token(3);
// Probe tokens are allocated upward from here, one per host for its
// lifetime.
const FIRST_PROBE_TOKEN: usize = 16;

// Scratch buffer for one ingress datagram; one byte is reserved for the
// newline appended to unterminated packets.
const DATA_BUF_SIZE: usize = 4096;

/// Errors that can occur while bringing the relay up.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The ingress socket could not be bound.
    #[error("failed to bind ingress socket on port {port}: {source}")]
    BindIngress {
        /// The configured data port.
        port: u16,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The configured downstream hostname did not resolve at startup.
    #[error("failed to resolve downstream host \"{host}\": {source}")]
    ResolveDownstream {
        /// The configured hostname.
        host: String,
        /// Underlying resolution error.
        source: io::Error,
    },

    /// Reactor plumbing (poll, waker, registrations, egress socket) failed.
    #[error("event loop setup failed: {0}")]
    Setup(#[from] io::Error),
}

/// Cross-thread control for a running relay.
#[derive(Clone)]
pub struct Handle {
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
    addr_tx: Sender<Vec<Ipv4Addr>>,
}

impl Handle {
    /// Asks the reactor to stop; `Relay::run` returns after the current
    /// event batch.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }

    /// Publishes a fresh downstream address set through the same single-slot
    /// handoff the resolver ticker uses. Returns `false` when the previous
    /// set has not been consumed yet.
    pub fn update_downstreams(&self, addrs: Vec<Ipv4Addr>) -> bool {
        self.addr_tx.try_send(addrs).is_ok()
    }
}

/// The aggregating relay: all state owned by the reactor thread.
pub struct Relay {
    poll: Poll,
    registry: Registry,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    signals: Option<Signals>,

    ingress: UdpSocket,
    egress: EgressSocket,
    egress_armed: bool,
    aggregator: Aggregator,
    hosts: HostSet,

    addr_tx: Sender<Vec<Ipv4Addr>>,
    addr_rx: Receiver<Vec<Ipv4Addr>>,
    _resolver: Option<JoinHandle<()>>,

    flush_interval: Duration,
    health_interval: Duration,
}

impl Relay {
    /// Binds the sockets, resolves the downstream once, and spawns the
    /// refresh ticker when the downstream is a hostname rather than a
    /// literal address.
    pub fn new(config: &Config) -> Result<Relay, RelayError> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let mut ingress =
            UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.data_port)))
                .map_err(|source| RelayError::BindIngress { port: config.data_port, source })?;
        registry.register(&mut ingress, INGRESS, Interest::READABLE)?;

        let egress = EgressSocket::open()?;

        let (addr_tx, addr_rx) = bounded(1);
        let resolver = match config.downstream.host.parse::<Ipv4Addr>() {
            Ok(addr) => {
                // Literal downstream address: seed the host set once, no
                // refresh thread.
                let _ = addr_tx.try_send(vec![addr]);
                None
            }
            Err(_) => {
                let initial = crate::resolver::resolve_ipv4(&config.downstream.host).map_err(
                    |source| RelayError::ResolveDownstream {
                        host: config.downstream.host.clone(),
                        source,
                    },
                )?;
                let _ = addr_tx.try_send(initial);
                Some(crate::resolver::spawn(
                    config.downstream.host.clone(),
                    config.dns_refresh_interval,
                    addr_tx.clone(),
                )?)
            }
        };

        Ok(Relay {
            poll,
            registry,
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
            signals: None,
            ingress,
            egress,
            egress_armed: false,
            aggregator: Aggregator::new(),
            hosts: HostSet::new(
                config.downstream.data_port,
                config.downstream.health_port,
                FIRST_PROBE_TOKEN,
            ),
            addr_tx,
            addr_rx,
            _resolver: resolver,
            flush_interval: config.flush_interval,
            health_interval: config.health_check_interval,
        })
    }

    /// The bound ingress address, useful when the configured port was 0.
    pub fn ingress_addr(&self) -> io::Result<SocketAddr> {
        self.ingress.local_addr()
    }

    /// A control handle for this relay.
    pub fn handle(&self) -> Handle {
        Handle {
            shutdown: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
            addr_tx: self.addr_tx.clone(),
        }
    }

    /// Routes SIGHUP and SIGINT through the reactor. SIGHUP is logged and
    /// ignored; SIGINT makes `run` return.
    pub fn watch_signals(&mut self) -> io::Result<()> {
        let mut signals = Signals::new([SIGHUP, SIGINT])?;
        self.registry.register(&mut signals, SIGNALS, Interest::READABLE)?;
        self.signals = Some(signals);
        Ok(())
    }

    /// Runs the reactor until shutdown is requested or SIGINT arrives.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(256);
        let mut next_flush = Instant::now() + self.flush_interval;
        let mut next_health = Instant::now() + self.health_interval;

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                info!("shutdown requested");
                return Ok(());
            }

            let timeout = next_flush
                .min(next_health)
                .saturating_duration_since(Instant::now());
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    INGRESS => self.drain_ingress(),
                    EGRESS => self.drain_egress(),
                    WAKER => {}
                    SIGNALS => {
                        if self.handle_signals() {
                            return Ok(());
                        }
                    }
                    token => {
                        if let Some(host) = self.hosts.by_token(token) {
                            host.on_probe_ready(
                                &self.registry,
                                event.is_readable(),
                                event.is_writable(),
                            );
                        }
                    }
                }
            }

            let now = Instant::now();
            if now >= next_flush {
                if self.aggregator.active_len() > 0 {
                    self.rotate_window();
                }
                next_flush = now + self.flush_interval;
            }
            if now >= next_health {
                self.health_tick();
                next_health = now + self.health_interval;
            }
        }
    }

    // Reads every queued ingress datagram; mio readiness is edge-triggered.
    fn drain_ingress(&mut self) {
        let mut buf = [0u8; DATA_BUF_SIZE];
        loop {
            match self.ingress.recv_from(&mut buf[..DATA_BUF_SIZE - 1]) {
                Ok((0, _)) => {}
                Ok((len, _)) => {
                    let len = if buf[len - 1] == b'\n' {
                        len
                    } else {
                        buf[len] = b'\n';
                        len + 1
                    };
                    trace!(packet = %String::from_utf8_lossy(&buf[..len]), "received packet");
                    self.ingest(&buf[..len]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "ingress read failed");
                    break;
                }
            }
        }
    }

    fn ingest(&mut self, data: &[u8]) {
        for line in data.split_inclusive(|&b| b == b'\n') {
            let len = line.len();
            // The lower bound rejects anything shorter than a minimal
            // metric; the upper bound keeps headroom for a counter that
            // re-serializes longer than it was sampled.
            if len > 6 && len < DOWNSTREAM_BUF_SIZE - MAX_COUNTER_LENGTH {
                self.aggregator.ingest_line(line);
            } else {
                error!(
                    line = %String::from_utf8_lossy(line.strip_suffix(b"\n").unwrap_or(line)),
                    length = len.saturating_sub(1),
                    "invalid metric line length"
                );
            }
        }
        self.sync_egress();
    }

    // Flush periodic: rotate the window if it holds anything.
    fn rotate_window(&mut self) {
        self.aggregator.flush_window();
        self.sync_egress();
    }

    // Arms the egress socket whenever flushes are queued and the watcher is
    // not already up.
    fn sync_egress(&mut self) {
        if self.aggregator.has_pending() && !self.egress_armed {
            self.arm_egress();
        }
    }

    fn arm_egress(&mut self) {
        if self.egress.needs_rotation() {
            // Bound the lifetime of any single ephemeral source port.
            match EgressSocket::open() {
                Ok(fresh) => {
                    self.egress = fresh;
                    trace!("rotated egress socket");
                }
                Err(e) => error!(error = %e, "failed to replace egress socket"),
            }
        }
        match self.registry.register(self.egress.source_mut(), EGRESS, Interest::WRITABLE) {
            Ok(()) => self.egress_armed = true,
            Err(e) => error!(error = %e, "failed to arm egress socket"),
        }
    }

    fn disarm_egress(&mut self) {
        if !self.egress_armed {
            return;
        }
        if let Err(e) = self.registry.deregister(self.egress.source_mut()) {
            error!(error = %e, "failed to disarm egress socket");
        }
        self.egress_armed = false;
    }

    // Writable egress socket: send every queued flush, selecting the
    // downstream anew for each datagram. Sends are best effort; an error
    // consumes the buffer and is not retried.
    fn drain_egress(&mut self) {
        while self.aggregator.has_pending() {
            let Some(target) = self.hosts.select_next_alive() else {
                error!("no healthy downstream hosts");
                self.disarm_egress();
                return;
            };
            debug!(host = %target.ip(), "flushing");
            let result = match self.aggregator.pending_datagram() {
                Some(datagram) => self.egress.send_to(datagram, target),
                None => break,
            };
            match result {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(error = %e, "sendto failed");
                    self.aggregator.consume_datagram();
                }
                Ok(_) => self.aggregator.consume_datagram(),
            }
        }
        self.disarm_egress();
    }

    // Health periodic: fold in any freshly resolved address set, then kick
    // every host's probe.
    fn health_tick(&mut self) {
        if let Ok(addrs) = self.addr_rx.try_recv() {
            self.hosts.reconcile(&self.registry, &addrs);
        }
        trace!(hosts = self.hosts.len(), "probing downstream health");
        for host in self.hosts.iter_mut() {
            host.start_probe(&self.registry);
        }
    }

    // Returns true when the process should exit.
    fn handle_signals(&mut self) -> bool {
        let Some(signals) = self.signals.as_mut() else {
            return false;
        };
        for signal in signals.pending() {
            match signal {
                SIGHUP => info!("sighup received"),
                SIGINT => {
                    info!("sigint received");
                    return true;
                }
                _ => {}
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::config::{Config, DownstreamSpec, LogLevel};

    use super::*;

    fn config() -> Config {
        Config {
            data_port: 0,
            flush_interval: Duration::from_millis(100),
            log_level: LogLevel::Error,
            dns_refresh_interval: Duration::from_secs(60),
            health_check_interval: Duration::from_millis(50),
            downstream: DownstreamSpec {
                host: "127.0.0.1".to_string(),
                data_port: 9,
                health_port: 9,
            },
        }
    }

    #[test]
    fn literal_downstreams_do_not_spawn_a_resolver() {
        let relay = Relay::new(&config()).unwrap();
        assert!(relay._resolver.is_none());
        assert_eq!(relay.addr_rx.len(), 1);
    }

    #[test]
    fn ingress_binds_an_ephemeral_port_for_port_zero() {
        let relay = Relay::new(&config()).unwrap();
        assert_ne!(relay.ingress_addr().unwrap().port(), 0);
    }

    #[test]
    fn shutdown_handle_stops_the_reactor() {
        let mut relay = Relay::new(&config()).unwrap();
        let handle = relay.handle();
        let runner = std::thread::spawn(move || relay.run());
        std::thread::sleep(Duration::from_millis(150));
        handle.shutdown();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn handle_reports_handoff_backpressure() {
        let relay = Relay::new(&config()).unwrap();
        let handle = relay.handle();
        // The startup seed still occupies the slot.
        assert!(!handle.update_downstreams(vec![Ipv4Addr::LOCALHOST]));
    }
}
