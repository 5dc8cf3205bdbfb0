//! The per-host health probe state machine.
//!
//! Every health tick each host runs one probe: non-blocking TCP connect,
//! write the probe request, read the verdict, close. A probe still in
//! flight when the next tick arrives is overdue and gets force-aborted, so
//! a host can never hold more than one file descriptor.

use std::io::{Read, Write};

use mio::net::TcpStream;
use mio::{Interest, Registry};
use tracing::{debug, warn};

use crate::downstream::DownstreamHost;

pub(crate) const HEALTH_CHECK_REQUEST: &[u8] = b"health";
pub(crate) const HEALTH_CHECK_UP_RESPONSE: &[u8] = b"health: up\n";

const RESPONSE_BUF_SIZE: usize = 32;

/// Probe progress. Every non-idle state owns the probe socket, so dropping
/// the state closes the descriptor.
pub(crate) enum ProbeState {
    Idle,
    /// Non-blocking connect outstanding, watching for writability.
    Connecting(TcpStream),
    /// Connected, watching for writability to send the request.
    Sending(TcpStream),
    /// Request sent, watching for readability of the response.
    Reading(TcpStream),
}

impl ProbeState {
    pub fn is_idle(&self) -> bool {
        matches!(self, ProbeState::Idle)
    }

    fn take(&mut self) -> ProbeState {
        std::mem::replace(self, ProbeState::Idle)
    }
}

/// Whether a response buffer carries the exact up verdict. Prefix match: the
/// peer may append detail after the newline.
pub(crate) fn response_is_up(buf: &[u8]) -> bool {
    buf.len() >= HEALTH_CHECK_UP_RESPONSE.len()
        && &buf[..HEALTH_CHECK_UP_RESPONSE.len()] == HEALTH_CHECK_UP_RESPONSE
}

impl DownstreamHost {
    /// Health tick entry point: abort an overdue probe, then start a new
    /// one from idle.
    pub(crate) fn start_probe(&mut self, registry: &Registry) {
        if !self.probe.is_idle() {
            warn!(host = %self.addr, "previous health probe was not completed");
            self.cancel_probe(registry);
            self.mark_down();
        }
        let mut stream = match TcpStream::connect(self.health_addr) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(host = %self.addr, error = %e, "health connect failed");
                self.mark_down();
                return;
            }
        };
        if let Err(e) = registry.register(&mut stream, self.token, Interest::WRITABLE) {
            warn!(host = %self.addr, error = %e, "failed to watch health probe");
            self.mark_down();
            return;
        }
        self.probe = ProbeState::Connecting(stream);
    }

    /// Stops the probe watcher and closes its socket without touching the
    /// alive bit. Used when the host is removed from the set.
    pub(crate) fn cancel_probe(&mut self, registry: &Registry) {
        match self.probe.take() {
            ProbeState::Idle => {}
            ProbeState::Connecting(mut stream)
            | ProbeState::Sending(mut stream)
            | ProbeState::Reading(mut stream) => {
                let _ = registry.deregister(&mut stream);
            }
        }
    }

    fn fail_probe(&mut self, registry: &Registry, mut stream: TcpStream) {
        let _ = registry.deregister(&mut stream);
        drop(stream);
        self.mark_down();
    }

    fn mark_down(&mut self) {
        if self.alive {
            self.alive = false;
            debug!(host = %self.addr, "downstream is down");
        }
    }

    /// Drives the probe one transition forward on a readiness event for this
    /// host's token. Events that do not match what the current state waits
    /// for are ignored.
    pub(crate) fn on_probe_ready(&mut self, registry: &Registry, readable: bool, writable: bool) {
        let wanted = match &self.probe {
            ProbeState::Idle => false,
            ProbeState::Connecting(_) | ProbeState::Sending(_) => writable,
            ProbeState::Reading(_) => readable,
        };
        if !wanted {
            return;
        }
        match self.probe.take() {
            ProbeState::Idle => {}
            ProbeState::Connecting(mut stream) => match stream.take_error() {
                Ok(None) => match registry.reregister(&mut stream, self.token, Interest::WRITABLE) {
                    Ok(()) => self.probe = ProbeState::Sending(stream),
                    Err(e) => {
                        warn!(host = %self.addr, error = %e, "failed to rearm health probe");
                        self.fail_probe(registry, stream);
                    }
                },
                Ok(Some(e)) => {
                    warn!(host = %self.addr, error = %e, "health connect failed");
                    self.fail_probe(registry, stream);
                }
                Err(e) => {
                    warn!(host = %self.addr, error = %e, "health connect failed");
                    self.fail_probe(registry, stream);
                }
            },
            ProbeState::Sending(mut stream) => match stream.write(HEALTH_CHECK_REQUEST) {
                Ok(n) if n == HEALTH_CHECK_REQUEST.len() => {
                    match registry.reregister(&mut stream, self.token, Interest::READABLE) {
                        Ok(()) => self.probe = ProbeState::Reading(stream),
                        Err(e) => {
                            warn!(host = %self.addr, error = %e, "failed to rearm health probe");
                            self.fail_probe(registry, stream);
                        }
                    }
                }
                Ok(_) => {
                    warn!(host = %self.addr, "short health request write");
                    self.fail_probe(registry, stream);
                }
                Err(e) => {
                    warn!(host = %self.addr, error = %e, "health request write failed");
                    self.fail_probe(registry, stream);
                }
            },
            ProbeState::Reading(mut stream) => {
                let mut buf = [0u8; RESPONSE_BUF_SIZE];
                let result = stream.read(&mut buf);
                let _ = registry.deregister(&mut stream);
                drop(stream);
                match result {
                    Ok(n) if response_is_up(&buf[..n]) => {
                        if !self.alive {
                            self.alive = true;
                            debug!(host = %self.addr, "downstream is up");
                        }
                    }
                    Ok(_) => self.mark_down(),
                    Err(e) => {
                        warn!(host = %self.addr, error = %e, "health response read failed");
                        self.mark_down();
                    }
                }
            }
        }
    }
}
