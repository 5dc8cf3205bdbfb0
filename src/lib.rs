//! A local aggregating relay for StatsD text metrics.
//!
//! The relay listens for StatsD datagrams on a UDP ingress socket, coalesces
//! repeated counter samples per metric name within a flush window, appends
//! every other sample type verbatim, and periodically forwards packed
//! datagrams (at most one MTU each) to a healthy downstream collector chosen
//! round-robin.
//!
//! Downstreams come from a single `host:dataPort:healthPort` specifier. The
//! hostname is re-resolved in the background and the live host set is
//! reconciled against each fresh address set; every host is probed over TCP
//! on the health port (`"health"` → `"health: up\n"`) to maintain its
//! `alive` bit.
//!
//! Everything runs on one reactor thread; the only other thread is the
//! resolver ticker, which publishes address sets through a single-slot
//! handoff. Forwarding is best effort: a failed send is logged and dropped,
//! never retried, and a saturated flush queue discards the current window.

#![deny(clippy::all)]

pub mod config;

mod downstream;
mod egress;
mod health;
mod relay;
mod resolver;
mod slot;
mod util;

pub use self::config::{Config, ConfigError, DownstreamSpec, LogLevel};
pub use self::relay::{Handle, Relay, RelayError};
