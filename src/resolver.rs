//! Downstream name resolution and the background refresh ticker.

use std::io;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Sender, TrySendError};
use tracing::{debug, error};

use crate::downstream::MAX_DOWNSTREAM_NUM;

/// Resolves a hostname to its IPv4 addresses, deduplicated and truncated to
/// `MAX_DOWNSTREAM_NUM`. Resolving to no IPv4 address at all is an error.
pub(crate) fn resolve_ipv4(host: &str) -> io::Result<Vec<Ipv4Addr>> {
    let mut addrs: Vec<Ipv4Addr> = Vec::new();
    for resolved in (host, 0u16).to_socket_addrs()? {
        let IpAddr::V4(addr) = resolved.ip() else {
            continue;
        };
        if addrs.contains(&addr) {
            continue;
        }
        addrs.push(addr);
        if addrs.len() == MAX_DOWNSTREAM_NUM {
            break;
        }
    }
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no IPv4 addresses resolved",
        ));
    }
    for addr in &addrs {
        debug!(host = %host, addr = %addr, "resolved downstream address");
    }
    Ok(addrs)
}

/// Spawns the refresh ticker: sleep, resolve, publish. The single-slot
/// channel provides the handoff backpressure; while the consumer has not
/// picked up the previous set, the cycle is skipped entirely.
pub(crate) fn spawn(
    host: String,
    interval: Duration,
    tx: Sender<Vec<Ipv4Addr>>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("statsd-relay-resolver".to_string())
        .spawn(move || loop {
            thread::sleep(interval);
            if tx.is_full() {
                continue;
            }
            match resolve_ipv4(&host) {
                Ok(addrs) => {
                    if let Err(TrySendError::Disconnected(_)) = tx.try_send(addrs) {
                        return;
                    }
                }
                Err(e) => error!(host = %host, error = %e, "downstream resolution failed"),
            }
        })
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::bounded;

    use super::*;

    #[test]
    fn literal_addresses_resolve_to_themselves() {
        assert_eq!(resolve_ipv4("127.0.0.1").unwrap(), vec![Ipv4Addr::LOCALHOST]);
    }

    #[test]
    fn unresolvable_hosts_error() {
        assert!(resolve_ipv4("host.invalid.example.").is_err());
    }

    #[test]
    fn ticker_publishes_and_respects_backpressure() {
        let (tx, rx) = bounded(1);
        let _handle = spawn("127.0.0.1".to_string(), Duration::from_millis(10), tx).unwrap();

        // First set arrives; while it sits unconsumed the producer skips
        // cycles rather than queueing behind it.
        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first, vec![Ipv4Addr::LOCALHOST]);
        std::thread::sleep(Duration::from_millis(50));
        assert!(rx.len() <= 1);
    }
}
