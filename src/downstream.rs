//! The live downstream host set: reconciliation against fresh resolution
//! results and round-robin selection at send time.

use std::net::{Ipv4Addr, SocketAddr};

use mio::{Registry, Token};
use tracing::{debug, trace};

use crate::health::ProbeState;

/// Upper bound on the resolved address set carried by one refresh.
pub(crate) const MAX_DOWNSTREAM_NUM: usize = 32;

/// One downstream collector: a data-plane UDP address, a health-plane TCP
/// address, and the probe state that feeds its `alive` verdict.
pub(crate) struct DownstreamHost {
    pub(crate) addr: Ipv4Addr,
    pub(crate) data_addr: SocketAddr,
    pub(crate) health_addr: SocketAddr,
    /// Registration identity for this host's probe watcher.
    pub(crate) token: Token,
    pub(crate) alive: bool,
    pub(crate) probe: ProbeState,
}

impl DownstreamHost {
    fn new(addr: Ipv4Addr, data_port: u16, health_port: u16, token: Token) -> Self {
        DownstreamHost {
            addr,
            data_addr: SocketAddr::from((addr, data_port)),
            health_addr: SocketAddr::from((addr, health_port)),
            token,
            alive: false,
            probe: ProbeState::Idle,
        }
    }
}

/// The host set plus the round-robin cursor.
pub(crate) struct HostSet {
    hosts: Vec<DownstreamHost>,
    cursor: usize,
    data_port: u16,
    health_port: u16,
    next_token: usize,
}

impl HostSet {
    pub fn new(data_port: u16, health_port: u16, first_token: usize) -> Self {
        HostSet { hosts: Vec::new(), cursor: 0, data_port, health_port, next_token: first_token }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DownstreamHost> {
        self.hosts.iter_mut()
    }

    pub fn by_token(&mut self, token: Token) -> Option<&mut DownstreamHost> {
        self.hosts.iter_mut().find(|host| host.token == token)
    }

    /// Advances the cursor to the next alive host, wrapping, and returns its
    /// data address. Checks each host at most once; `None` means the whole
    /// fleet is down (the cursor is left in place).
    pub fn select_next_alive(&mut self) -> Option<SocketAddr> {
        if self.hosts.is_empty() {
            return None;
        }
        let mut idx = self.cursor;
        for _ in 0..self.hosts.len() {
            idx = (idx + 1) % self.hosts.len();
            if self.hosts[idx].alive {
                self.cursor = idx;
                return Some(self.hosts[idx].data_addr);
            }
        }
        None
    }

    /// Merges a freshly resolved address set into the live host set.
    ///
    /// Hosts whose address still resolves survive untouched, keeping their
    /// `alive` bit and any in-flight probe. Hosts whose address vanished are
    /// dropped along with their probe watcher. Remaining new addresses are
    /// added as hosts that start dead until their first probe completes.
    pub fn reconcile(&mut self, registry: &Registry, fresh: &[Ipv4Addr]) {
        let mut consumed = vec![false; fresh.len()];
        let mut removed = false;
        self.hosts.retain_mut(|host| {
            match fresh.iter().position(|addr| *addr == host.addr) {
                Some(i) => {
                    consumed[i] = true;
                    trace!(host = %host.addr, "downstream address still resolves");
                    true
                }
                None => {
                    debug!(host = %host.addr, "removing downstream");
                    host.cancel_probe(registry);
                    removed = true;
                    false
                }
            }
        });
        if removed {
            self.cursor = 0;
        }
        for (i, addr) in fresh.iter().enumerate() {
            if consumed[i] || self.hosts.iter().any(|host| host.addr == *addr) {
                continue;
            }
            let token = Token(self.next_token);
            self.next_token += 1;
            debug!(host = %addr, "adding downstream");
            self.hosts.push(DownstreamHost::new(*addr, self.data_port, self.health_port, token));
        }
    }
}
