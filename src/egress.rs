//! Egress packing: the fixed-MTU buffer ring, the per-window aggregation
//! driver, and the rotating UDP egress socket.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use mio::net::UdpSocket;
use tracing::{error, trace};

use crate::slot::{self, SlotKind, SlotTable, MAX_COUNTER_LENGTH};

/// Capacity of one egress datagram. Kept below a conservative path MTU so a
/// packed buffer is never fragmented.
pub(crate) const DOWNSTREAM_BUF_SIZE: usize = 1450;

/// Depth of the flush queue.
pub(crate) const DOWNSTREAM_BUF_NUM: usize = 16;

/// Flushes sent through one ephemeral source port before the egress socket
/// is replaced.
pub(crate) const MAX_PACKETS_PER_SOCKET: u32 = 1000;

/// Ring of fixed-capacity egress buffers.
///
/// `active` is where the next window will be packed; buffers in
/// `[flush, active)` (modular) are full and awaiting send. The two indices
/// being equal means nothing is in flight.
pub(crate) struct BufferRing {
    bufs: Vec<Vec<u8>>,
    active: usize,
    flush: usize,
}

impl BufferRing {
    pub fn new() -> Self {
        BufferRing {
            bufs: (0..DOWNSTREAM_BUF_NUM)
                .map(|_| Vec::with_capacity(DOWNSTREAM_BUF_SIZE))
                .collect(),
            active: 0,
            flush: 0,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.active != self.flush
    }

    /// Packs the used slots into the active buffer and rotates. When the
    /// next buffer is still awaiting send the ring is saturated; the window
    /// is discarded instead.
    pub fn rotate(&mut self, table: &mut SlotTable) -> bool {
        let next = (self.active + 1) % DOWNSTREAM_BUF_NUM;
        if !self.bufs[next].is_empty() {
            error!("previous flush is not completed, losing data");
            table.clear();
            return false;
        }
        let buf = &mut self.bufs[self.active];
        for slot in table.slots() {
            if !slot.has_samples() {
                continue;
            }
            let bytes = slot.bytes();
            buf.extend_from_slice(&bytes[..bytes.len() - 1]);
            buf.push(b'\n');
        }
        trace!(slots = table.len(), buffer = %String::from_utf8_lossy(buf), "packed window");
        table.clear();
        self.active = next;
        trace!(active = next, "rotated active buffer");
        true
    }

    /// The oldest full buffer, if any flush is in flight.
    pub fn pending(&self) -> Option<&[u8]> {
        self.has_pending().then(|| self.bufs[self.flush].as_slice())
    }

    /// Releases the oldest full buffer and advances the flush index.
    pub fn consume(&mut self) {
        let idx = self.flush;
        self.bufs[idx].clear();
        self.flush = (idx + 1) % DOWNSTREAM_BUF_NUM;
        trace!(flushed = idx, "flushed buffer");
    }
}

/// Drives samples from parsed lines into the slot table, rotating the ring
/// whenever the window would outgrow one egress buffer.
pub(crate) struct Aggregator {
    table: SlotTable,
    ring: BufferRing,
}

impl Aggregator {
    pub fn new() -> Self {
        Aggregator { table: SlotTable::new(), ring: BufferRing::new() }
    }

    pub fn active_len(&self) -> usize {
        self.table.active_len()
    }

    pub fn has_pending(&self) -> bool {
        self.ring.has_pending()
    }

    pub fn pending_datagram(&self) -> Option<&[u8]> {
        self.ring.pending()
    }

    pub fn consume_datagram(&mut self) {
        self.ring.consume();
    }

    /// Packs and rotates the current window.
    pub fn flush_window(&mut self) -> bool {
        self.ring.rotate(&mut self.table)
    }

    /// Folds one validated-length line into the window. Samples that cannot
    /// be applied are logged and skipped; the line's remaining groups still
    /// proceed.
    pub fn ingest_line(&mut self, line: &[u8]) {
        let Some((name, values)) = slot::split_line(line) else {
            error!(
                line = %String::from_utf8_lossy(&line[..line.len() - 1]),
                "invalid metric line"
            );
            return;
        };

        let mut idx = match self.table.lookup(name) {
            Some(idx) => idx,
            None => {
                if self.table.is_full() || self.table.would_exceed(name.len()) {
                    trace!(active_len = self.table.active_len(), "window full before new slot");
                    self.ring.rotate(&mut self.table);
                }
                self.table.add(name)
            }
        };

        for group in slot::groups(values) {
            let Some((pipe, kind)) = slot::group_kind(group) else {
                error!(
                    group = %String::from_utf8_lossy(group),
                    "invalid metric data"
                );
                continue;
            };

            match self.table.kind(idx) {
                SlotKind::Unknown => self.table.set_kind(idx, kind),
                current if current != kind => {
                    error!(
                        name = %String::from_utf8_lossy(name),
                        "conflicting metric type, sample skipped"
                    );
                    continue;
                }
                _ => {}
            }

            // Counters may grow to their full re-serialized length, so the
            // overflow check uses the worst case rather than the sampled
            // token's length.
            let predicted = if kind == SlotKind::Counter { MAX_COUNTER_LENGTH } else { group.len() };
            if self.table.would_exceed(predicted) {
                self.ring.rotate(&mut self.table);
                idx = self.table.add(name);
                self.table.set_kind(idx, kind);
            }

            if kind == SlotKind::Counter {
                match slot::counter_increment(group, pipe) {
                    Some(increment) => self.table.fold_counter(idx, increment),
                    None => error!(
                        group = %String::from_utf8_lossy(&group[..group.len() - 1]),
                        "invalid counter value"
                    ),
                }
            } else {
                self.table.append_other(idx, group);
            }
        }
    }
}

/// The egress UDP socket plus the flush tally that drives source-port
/// rotation.
pub(crate) struct EgressSocket {
    socket: UdpSocket,
    packets_sent: u32,
}

impl EgressSocket {
    pub fn open() -> io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
        Ok(EgressSocket { socket, packets_sent: 0 })
    }

    /// Whether enough flushes have left this socket that the next arming
    /// should replace it.
    pub fn needs_rotation(&self) -> bool {
        self.packets_sent > MAX_PACKETS_PER_SOCKET
    }

    pub fn send_to(&mut self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let result = self.socket.send_to(buf, target);
        if !matches!(&result, Err(e) if e.kind() == io::ErrorKind::WouldBlock) {
            self.packets_sent += 1;
        }
        result
    }

    pub fn source_mut(&mut self) -> &mut UdpSocket {
        &mut self.socket
    }
}
