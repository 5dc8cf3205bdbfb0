//! Per-name accumulation slots and the StatsD line parser.
//!
//! A slot holds one metric name for the lifetime of the current flush window,
//! together with its serialized payload. Counter samples are folded into a
//! running accumulator and re-serialized in place; every other sample type is
//! appended verbatim. The table keeps a running byte count of what the window
//! would occupy once packed, which is what gates premature flushes.

use std::str;

use tracing::trace;

use crate::egress::DOWNSTREAM_BUF_SIZE;
use crate::util::format_compact;

// Worst scenario: a lot of metrics with unique short names. The smallest
// valid metric looks like `aa:1|c\n`, seven bytes, so this many slots can
// never be outgrown within one egress buffer.
pub(crate) const NUM_OF_SLOTS: usize = DOWNSTREAM_BUF_SIZE / 7;

/// Headroom reserved for a counter re-serialized with fifteen significant
/// digits plus its `|c\n` trailer.
pub(crate) const MAX_COUNTER_LENGTH: usize = 18;

/// The category a slot settles into after its first accepted sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SlotKind {
    Unknown,
    Counter,
    Other,
}

/// Accumulation state for one metric name within the current flush window.
pub(crate) struct Slot {
    // Name (including the trailing ':') followed by the serialized payload.
    // The final byte is the pending separator, rewritten to '\n' at pack time.
    buf: Vec<u8>,
    name_len: usize,
    kind: SlotKind,
    counter: f64,
}

impl Slot {
    fn new(name: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(name.len() + MAX_COUNTER_LENGTH);
        buf.extend_from_slice(name);
        Slot { buf, name_len: name.len(), kind: SlotKind::Unknown, counter: 0.0 }
    }

    pub fn name(&self) -> &[u8] {
        &self.buf[..self.name_len]
    }

    /// Name plus payload, ready for packing.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Whether any sample was accepted; sample-less slots are omitted from
    /// the packed datagram.
    pub fn has_samples(&self) -> bool {
        self.buf.len() > self.name_len
    }
}

/// The ordered slot table for the current flush window.
pub(crate) struct SlotTable {
    slots: Vec<Slot>,
    // Invariant: equals the sum of `bytes().len()` over all slots.
    active_len: usize,
}

impl SlotTable {
    pub fn new() -> Self {
        SlotTable { slots: Vec::with_capacity(NUM_OF_SLOTS), active_len: 0 }
    }

    /// Linear lookup by name length, then byte comparison.
    pub fn lookup(&self, name: &[u8]) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.name_len == name.len() && slot.name() == name)
    }

    pub fn add(&mut self, name: &[u8]) -> usize {
        self.active_len += name.len();
        self.slots.push(Slot::new(name));
        let idx = self.slots.len() - 1;
        trace!(name = %String::from_utf8_lossy(name), slot = idx, "created slot");
        idx
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() == NUM_OF_SLOTS
    }

    /// Whether packing the window after `extra` more bytes would overflow
    /// the egress buffer.
    pub fn would_exceed(&self, extra: usize) -> bool {
        self.active_len + extra > DOWNSTREAM_BUF_SIZE
    }

    pub fn kind(&self, idx: usize) -> SlotKind {
        self.slots[idx].kind
    }

    pub fn set_kind(&mut self, idx: usize, kind: SlotKind) {
        self.slots[idx].kind = kind;
    }

    /// Adds `increment` to the slot's accumulator and rewrites the payload in
    /// place as `<accumulator>|c\n`, adjusting the window accounting by the
    /// payload length delta.
    pub fn fold_counter(&mut self, idx: usize, increment: f64) {
        let slot = &mut self.slots[idx];
        slot.counter += increment;
        self.active_len -= slot.buf.len();
        slot.buf.truncate(slot.name_len);
        slot.buf.extend_from_slice(format_compact(slot.counter).as_bytes());
        slot.buf.extend_from_slice(b"|c\n");
        self.active_len += slot.buf.len();
        trace!(delta = increment, total = slot.counter, "folded counter sample");
    }

    /// Appends a non-counter value group verbatim. The group's trailing byte
    /// is stored as ':'; the packer rewrites the slot's final separator to a
    /// newline.
    pub fn append_other(&mut self, idx: usize, group: &[u8]) {
        let slot = &mut self.slots[idx];
        slot.buf.extend_from_slice(group);
        let last = slot.buf.len() - 1;
        slot.buf[last] = b':';
        self.active_len += group.len();
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.active_len = 0;
    }

    pub fn active_len(&self) -> usize {
        self.active_len
    }

    pub fn slots(&self) -> std::slice::Iter<'_, Slot> {
        self.slots.iter()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Splits a line into its name (everything up to and including the first
/// `:`) and the remaining value groups. Returns `None` for lines without a
/// colon, which are not valid StatsD metrics.
pub(crate) fn split_line(line: &[u8]) -> Option<(&[u8], &[u8])> {
    let colon = line.iter().position(|&b| b == b':')?;
    Some((&line[..=colon], &line[colon + 1..]))
}

/// Iterator over `:`-separated value groups. Each yielded group keeps its
/// trailing separator (`:` between groups, `\n` for the last one).
pub(crate) struct Groups<'a> {
    rest: &'a [u8],
}

pub(crate) fn groups(values: &[u8]) -> Groups<'_> {
    Groups { rest: values }
}

impl<'a> Iterator for Groups<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.rest.is_empty() {
            return None;
        }
        let group = match self.rest.iter().position(|&b| b == b':') {
            Some(i) => {
                let (group, rest) = self.rest.split_at(i + 1);
                self.rest = rest;
                group
            }
            None => std::mem::take(&mut self.rest),
        };
        Some(group)
    }
}

/// Locates the `|` type tag of a value group and classifies it. Only `c`
/// marks a counter; everything else is forwarded verbatim. Returns `None`
/// for groups without a type tag.
pub(crate) fn group_kind(group: &[u8]) -> Option<(usize, SlotKind)> {
    let pipe = group.iter().position(|&b| b == b'|')?;
    let kind = if group.get(pipe + 1) == Some(&b'c') {
        SlotKind::Counter
    } else {
        SlotKind::Other
    };
    Some((pipe, kind))
}

/// Parses a counter group into its effective increment, `value / rate`.
/// Returns `None` when the value does not parse as a float.
pub(crate) fn counter_increment(group: &[u8], pipe: usize) -> Option<f64> {
    let value = str::from_utf8(&group[..pipe]).ok()?.parse::<f64>().ok()?;
    Some(value / sample_rate(group, pipe))
}

// A sample rate rides after a second '|' as `|@rate` and must consume the
// rest of the group; anything else falls back to 1.0.
fn sample_rate(group: &[u8], pipe: usize) -> f64 {
    let tail = &group[pipe + 1..];
    let Some(second) = tail.iter().position(|&b| b == b'|') else {
        return 1.0;
    };
    let at = pipe + 1 + second + 1;
    if group.get(at) != Some(&b'@') {
        return 1.0;
    }
    let Some(rate_str) = group.get(at + 1..group.len() - 1) else {
        return 1.0;
    };
    match str::from_utf8(rate_str).ok().and_then(|s| s.parse::<f64>().ok()) {
        Some(rate) if rate.is_finite() => rate,
        _ => {
            trace!(
                group = %String::from_utf8_lossy(&group[..group.len() - 1]),
                "invalid sample rate, assuming 1"
            );
            1.0
        }
    }
}
