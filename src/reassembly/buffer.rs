use super::types::FlowEvent;
use bytes::Bytes;
use std::collections::BTreeMap;

/// Result of pushing one segment into a [`ReassemblyBuffer`].
#[derive(Debug, PartialEq, Eq)]
pub enum Push {
    /// Bytes that became contiguous, in stream order.
    Released(Vec<Bytes>),
    /// Held until the gap in front of it closes.
    Buffered,
    /// Nothing new, every byte was already released or held.
    Duplicate,
    /// Rejected: before the stream start or over the pending limit.
    Dropped,
}

/// Ordered byte stream of one flow direction.
///
/// Sequence numbers are mapped onto a 64-bit stream offset relative to the first expected
/// byte, so the 32-bit wrap-around is invisible past this point. Bytes leave the buffer
/// strictly contiguous and in increasing offset order; anything already released is cut off
/// incoming segments.
///
/// A buffer created without the SYN doesn't know where the stream starts. It holds every
/// segment until the SYN shows up, the held bytes run from the lowest sequence number up to
/// a FIN without a hole, the pending limit is reached, or the flow is flushed. In the last
/// three cases the stream starts at the lowest held sequence number.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    base_seq: u32,
    anchored: bool,
    /// Segments received before the stream start was known.
    held: Vec<(u32, Bytes)>,
    /// End of the FIN seen before the stream start was known.
    held_fin: Option<u32>,
    next_offset: u64,
    pending: BTreeMap<u64, Bytes>,
    pending_bytes: usize,
    max_pending_bytes: usize,
    fin_offset: Option<u64>,
}

impl ReassemblyBuffer {
    /// `initial_seq` is the sequence number of the first byte to release.
    pub fn new(initial_seq: u32, max_pending_bytes: usize) -> Self {
        Self {
            base_seq: initial_seq,
            anchored: true,
            held: Vec::new(),
            held_fin: None,
            next_offset: 0,
            pending: BTreeMap::new(),
            pending_bytes: 0,
            max_pending_bytes,
            fin_offset: None,
        }
    }

    /// A buffer for a flow whose SYN hasn't been seen.
    pub fn unanchored(max_pending_bytes: usize) -> Self {
        Self {
            anchored: false,
            ..Self::new(0, max_pending_bytes)
        }
    }

    pub fn is_anchored(&self) -> bool {
        self.anchored
    }

    /// Starts the stream right after the SYN at `seq`. Returns the held bytes this releases;
    /// a SYN on an anchored stream changes nothing.
    pub fn syn(&mut self, seq: u32) -> Vec<Bytes> {
        if self.anchored {
            return Vec::new();
        }
        self.anchor(seq.wrapping_add(1))
    }

    /// Starts the stream at the lowest held sequence number, if it isn't anchored yet.
    pub fn settle(&mut self) -> Vec<Bytes> {
        match self.lowest_held() {
            Some(lowest) if !self.anchored => self.anchor(lowest),
            _ => Vec::new(),
        }
    }

    fn anchor(&mut self, base_seq: u32) -> Vec<Bytes> {
        self.base_seq = base_seq;
        self.anchored = true;
        self.pending_bytes = 0;

        let mut released = Vec::new();
        for (seq, payload) in std::mem::take(&mut self.held) {
            if let Push::Released(chunks) = self.push(seq, payload) {
                released.extend(chunks);
            }
        }
        if let Some(fin_seq) = self.held_fin.take() {
            self.mark_fin(fin_seq, 0);
        }
        released
    }

    /// Lowest held sequence number, ordered relative to the first held segment.
    fn lowest_held(&self) -> Option<u32> {
        let first = self.held.first()?.0;
        self.held
            .iter()
            .map(|(seq, _)| *seq)
            .min_by_key(|seq| seq.wrapping_sub(first) as i32)
    }

    /// Whether the held bytes cover everything from the lowest one up to the FIN.
    fn held_is_complete(&self) -> bool {
        let (Some(fin), Some(lowest)) = (self.held_fin, self.lowest_held()) else {
            return false;
        };
        let mut spans: Vec<(i64, i64)> = self
            .held
            .iter()
            .map(|(seq, payload)| {
                let start = seq.wrapping_sub(lowest) as i32 as i64;
                (start, start + payload.len() as i64)
            })
            .collect();
        spans.sort_unstable();
        let mut covered = 0;
        for (start, end) in spans {
            if start > covered {
                return false;
            }
            covered = covered.max(end);
        }
        covered >= fin.wrapping_sub(lowest) as i32 as i64
    }

    fn hold(&mut self, seq: u32, payload: Bytes) -> Push {
        if let Some(i) = self.held.iter().position(|(s, _)| *s == seq) {
            if self.held[i].1.len() >= payload.len() {
                return Push::Duplicate;
            }
            let (_, shorter) = self.held.swap_remove(i);
            self.pending_bytes -= shorter.len();
        }

        if self.pending_bytes + payload.len() > self.max_pending_bytes {
            // No room left to wait for the SYN.
            self.held.push((seq, payload));
            let lowest = self.lowest_held().unwrap_or(seq);
            let released = self.anchor(lowest);
            return if released.is_empty() {
                Push::Dropped
            } else {
                Push::Released(released)
            };
        }

        self.pending_bytes += payload.len();
        self.held.push((seq, payload));
        if self.held_is_complete() {
            let lowest = self.lowest_held().unwrap_or(seq);
            return Push::Released(self.anchor(lowest));
        }
        Push::Buffered
    }

    /// Signed stream offset of `seq`, resolved against the next expected byte.
    fn offset_of(&self, seq: u32) -> i64 {
        let expected_seq = self.base_seq.wrapping_add(self.next_offset as u32);
        let delta = seq.wrapping_sub(expected_seq) as i32 as i64;
        self.next_offset as i64 + delta
    }

    pub fn push(&mut self, seq: u32, payload: Bytes) -> Push {
        if payload.is_empty() {
            return Push::Duplicate;
        }
        if !self.anchored {
            return self.hold(seq, payload);
        }
        let start = self.offset_of(seq);
        let end = start + payload.len() as i64;
        let next = self.next_offset as i64;

        if end <= next {
            return Push::Duplicate;
        }

        if start <= next {
            let mut released = vec![payload.slice((next - start) as usize..)];
            self.next_offset = end as u64;
            self.drain_pending(&mut released);
            return Push::Released(released);
        }

        let start = start as u64;
        let held = self.pending.get(&start).map_or(0, Bytes::len);
        if held >= payload.len() {
            return Push::Duplicate;
        }
        if self.pending_bytes - held + payload.len() > self.max_pending_bytes {
            return Push::Dropped;
        }
        self.pending_bytes = self.pending_bytes - held + payload.len();
        self.pending.insert(start, payload);
        Push::Buffered
    }

    fn drain_pending(&mut self, out: &mut Vec<Bytes>) {
        while let Some(entry) = self.pending.first_entry() {
            let start = *entry.key();
            if start > self.next_offset {
                break;
            }
            let chunk = entry.remove();
            self.pending_bytes -= chunk.len();
            let end = start + chunk.len() as u64;
            if end <= self.next_offset {
                continue;
            }
            out.push(chunk.slice((self.next_offset - start) as usize..));
            self.next_offset = end;
        }
    }

    /// Releases every held byte, marking the holes between them.
    ///
    /// Used when the flow is retired before its gaps closed.
    pub fn flush(&mut self) -> Vec<FlowEvent> {
        let mut out: Vec<FlowEvent> = self.settle().into_iter().map(FlowEvent::Data).collect();
        while let Some((start, chunk)) = self.pending.pop_first() {
            self.pending_bytes -= chunk.len();
            let end = start + chunk.len() as u64;
            if end <= self.next_offset {
                continue;
            }
            if start > self.next_offset {
                out.push(FlowEvent::Gap {
                    missing: start - self.next_offset,
                });
                out.push(FlowEvent::Data(chunk));
            } else {
                out.push(FlowEvent::Data(
                    chunk.slice((self.next_offset - start) as usize..),
                ));
            }
            self.next_offset = end;
        }
        out
    }

    /// Records the FIN carried by a segment starting at `seq` with `payload_len` bytes.
    ///
    /// Returns the bytes released if the FIN completes a stream that wasn't anchored yet.
    pub fn mark_fin(&mut self, seq: u32, payload_len: usize) -> Vec<Bytes> {
        let fin_seq = seq.wrapping_add(payload_len as u32);
        if !self.anchored {
            if self.held_fin.is_none() {
                self.held_fin = Some(fin_seq);
            }
            if self.held_is_complete() {
                return self.settle();
            }
            return Vec::new();
        }
        let end = self.offset_of(fin_seq);
        if end >= 0 && self.fin_offset.is_none() {
            self.fin_offset = Some(end as u64);
        }
        Vec::new()
    }

    /// Nothing held back and, if a FIN was seen, every byte before it released.
    pub fn is_drained(&self) -> bool {
        self.anchored
            && self.pending.is_empty()
            && self.fin_offset.map_or(true, |fin| self.next_offset >= fin)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || !self.held.is_empty()
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Total bytes released so far.
    pub fn released(&self) -> u64 {
        self.next_offset
    }
}
