//! # Assembler
//!
//! Keyed state machine turning captured TCP segments into one ordered byte stream per flow.
//!
//! ```text
//! Segment ──▶ Assembler ──┬─ flow A: ReassemblyBuffer ──▶ mpsc ──▶ reader A
//!                         ├─ flow B: ReassemblyBuffer ──▶ mpsc ──▶ reader B
//!                         └─ ...
//! ```
//!
//! The assembler is the only owner of flow state. It is driven from a single task (the
//! controller loop), which also runs the idle sweep, so it needs no locking. Each new flow
//! asks the [`StreamFactory`] for the channel feeding that flow's consumer; dropping the
//! sender is how a retired flow tears its consumer down.

use super::buffer::{Push, ReassemblyBuffer};
use super::types::{AssemblerStats, FlowEvent, FlowState, RetireReason};
use crate::configuration::types::AssemblerSettings;
use crate::network::types::{FlowKey, Segment};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, trace, warn};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use uuid::Uuid;

/// Creates the consumer of a newly seen flow.
pub trait StreamFactory {
    /// Called exactly once per flow. Events sent on the returned channel are the flow's
    /// ordered bytes; the channel closes when the flow is retired.
    fn new_stream(&mut self, key: FlowKey, flow_id: Uuid) -> Sender<FlowEvent>;
}

struct Flow {
    id: Uuid,
    key: FlowKey,
    state: FlowState,
    buffer: ReassemblyBuffer,
    last_seen: DateTime<Utc>,
    /// `None` once the consumer stopped; bytes are then discarded until retirement.
    sink: Option<Sender<FlowEvent>>,
}

impl Flow {
    /// Hands `event` to the consumer. Returns `true` if the flow became detached.
    fn deliver(&mut self, event: FlowEvent) -> bool {
        let Some(sink) = &self.sink else {
            return false;
        };
        if let FlowEvent::Data(bytes) = &event {
            let preview = &bytes[..std::cmp::min(bytes.len(), 64)];
            trace!(
                "[{}] released {} bytes: {}{}",
                self.id,
                bytes.len(),
                String::from_utf8_lossy(preview),
                if bytes.len() > 64 { " ..." } else { "" }
            );
        }
        match sink.try_send(event) {
            Ok(()) => false,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "[{}] reader of {} fell behind, discarding the rest of the flow",
                    self.id, self.key
                );
                self.sink = None;
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    "[{}] reader of {} stopped, discarding the rest of the flow",
                    self.id, self.key
                );
                self.sink = None;
                true
            }
        }
    }

    fn release(&mut self, chunks: Vec<Bytes>, stats: &mut AssemblerStats) {
        for chunk in chunks {
            stats.released_bytes += chunk.len() as u64;
            if self.deliver(FlowEvent::Data(chunk)) {
                stats.flows_detached += 1;
            }
        }
    }
}

/// Reassembles every captured flow and feeds its consumer.
pub struct Assembler<F: StreamFactory> {
    flows: HashMap<FlowKey, Flow>,
    /// Flows ordered by last activity, oldest first.
    lru: BTreeSet<(DateTime<Utc>, FlowKey)>,
    factory: F,
    settings: AssemblerSettings,
    stats: AssemblerStats,
}

impl<F: StreamFactory> Assembler<F> {
    pub fn new(settings: AssemblerSettings, factory: F) -> Self {
        Self {
            flows: HashMap::new(),
            lru: BTreeSet::new(),
            factory,
            settings,
            stats: AssemblerStats::default(),
        }
    }

    /// Routes one segment to its flow, creating the flow if the key is unseen.
    ///
    /// Segments that carry neither payload nor SYN never create a flow: a bare ACK or a
    /// late FIN/RST after retirement is not the start of a connection.
    ///
    /// A flow first seen without its SYN releases nothing until its start is known: the
    /// SYN arrives late, a FIN completes the held bytes, or the flow is flushed.
    pub fn assemble(&mut self, segment: Segment) {
        let Segment {
            key,
            seq,
            flags,
            payload,
            timestamp,
        } = segment;

        if !self.flows.contains_key(&key) {
            if flags.rst || (!flags.syn && payload.is_empty()) {
                return;
            }
            if self.flows.len() >= self.settings.max_flows {
                self.evict_oldest();
            }
            let id = Uuid::new_v4();
            let max_pending = self.settings.max_pending_bytes;
            let buffer = if flags.syn {
                ReassemblyBuffer::new(seq.wrapping_add(1), max_pending)
            } else {
                ReassemblyBuffer::unanchored(max_pending)
            };
            let sink = self.factory.new_stream(key, id);
            debug!("[{}] new flow {}", id, key);
            self.flows.insert(
                key,
                Flow {
                    id,
                    key,
                    state: FlowState::Active,
                    buffer,
                    last_seen: timestamp,
                    sink: Some(sink),
                },
            );
            self.lru.insert((timestamp, key));
            self.stats.flows_created += 1;
        }

        let Some(flow) = self.flows.get_mut(&key) else {
            return;
        };
        if timestamp > flow.last_seen {
            self.lru.remove(&(flow.last_seen, key));
            self.lru.insert((timestamp, key));
            flow.last_seen = timestamp;
        }

        if flags.syn {
            let chunks = flow.buffer.syn(seq);
            flow.release(chunks, &mut self.stats);
        }

        // SYN occupies one sequence number ahead of any data it carries.
        let data_seq = if flags.syn { seq.wrapping_add(1) } else { seq };
        let payload_len = payload.len();
        if payload_len > 0 {
            match flow.buffer.push(data_seq, payload) {
                Push::Released(chunks) => flow.release(chunks, &mut self.stats),
                Push::Buffered => {}
                Push::Duplicate => self.stats.duplicate_segments += 1,
                Push::Dropped => self.stats.dropped_segments += 1,
            }
        }

        if flags.fin || flags.rst {
            let chunks = if flags.fin {
                flow.buffer.mark_fin(data_seq, payload_len)
            } else {
                // Nothing earlier is coming after a reset.
                flow.buffer.settle()
            };
            flow.release(chunks, &mut self.stats);
            if flow.state == FlowState::Active {
                debug!(
                    "[{}] {} seen on {}, closing",
                    flow.id,
                    if flags.rst { "RST" } else { "FIN" },
                    key
                );
                flow.state = FlowState::Closing;
            }
        }

        let closed = match flow.state {
            FlowState::Closing if flags.rst => !flow.buffer.has_pending(),
            FlowState::Closing => flow.buffer.is_drained(),
            _ => false,
        };
        if closed {
            self.retire(&key, RetireReason::Closed);
        }
    }

    /// Retires every flow whose last segment is older than `cutoff`, flushing whatever it
    /// still holds. Returns the number of flows evicted.
    pub fn flush_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let stale: Vec<FlowKey> = self
            .lru
            .iter()
            .take_while(|(last_seen, _)| *last_seen < cutoff)
            .map(|(_, key)| *key)
            .collect();
        for key in &stale {
            self.retire(key, RetireReason::Idle);
        }
        stale.len()
    }

    /// Retires every flow. Used at shutdown.
    pub fn close_all(&mut self) -> usize {
        let keys: Vec<FlowKey> = self.flows.keys().copied().collect();
        for key in &keys {
            self.retire(key, RetireReason::Shutdown);
        }
        keys.len()
    }

    fn evict_oldest(&mut self) {
        if let Some(&(_, key)) = self.lru.first() {
            self.retire(&key, RetireReason::Capacity);
        }
    }

    fn retire(&mut self, key: &FlowKey, reason: RetireReason) {
        let Some(mut flow) = self.flows.remove(key) else {
            return;
        };
        self.lru.remove(&(flow.last_seen, *key));
        for event in flow.buffer.flush() {
            if let FlowEvent::Data(bytes) = &event {
                self.stats.released_bytes += bytes.len() as u64;
            }
            if flow.deliver(event) {
                self.stats.flows_detached += 1;
            }
        }
        flow.state = FlowState::Retired;
        // Dropping the sender ends the consumer's stream.
        flow.sink = None;

        match reason {
            RetireReason::Closed => self.stats.flows_closed += 1,
            _ => self.stats.flows_evicted += 1,
        }
        debug!(
            "[{}] flow {} retired ({}, {} bytes released)",
            flow.id,
            flow.key,
            reason,
            flow.buffer.released()
        );
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// State of the flow currently tracked under `key`, `None` if there is none.
    pub fn state_of(&self, key: &FlowKey) -> Option<FlowState> {
        self.flows.get(key).map(|flow| flow.state)
    }

    pub fn flow_id(&self, key: &FlowKey) -> Option<Uuid> {
        self.flows.get(key).map(|flow| flow.id)
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    pub fn factory_mut(&mut self) -> &mut F {
        &mut self.factory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::types::TcpFlags;
    use bytes::Bytes;
    use chrono::Duration;
    use tokio::sync::mpsc::{self, error::TryRecvError, Receiver};

    struct Collect {
        capacity: usize,
        streams: Vec<(FlowKey, Uuid, Receiver<FlowEvent>)>,
    }

    impl Collect {
        fn new(capacity: usize) -> Self {
            Self {
                capacity,
                streams: Vec::new(),
            }
        }
    }

    impl StreamFactory for Collect {
        fn new_stream(&mut self, key: FlowKey, flow_id: Uuid) -> Sender<FlowEvent> {
            let (tx, rx) = mpsc::channel(self.capacity);
            self.streams.push((key, flow_id, rx));
            tx
        }
    }

    fn key(client_port: u16) -> FlowKey {
        FlowKey {
            src_ip: "10.0.0.1".parse().unwrap(),
            src_port: client_port,
            dst_ip: "10.0.0.5".parse().unwrap(),
            dst_port: 8080,
        }
    }

    fn seg(key: FlowKey, seq: u32, payload: &'static [u8], at: DateTime<Utc>) -> Segment {
        Segment {
            key,
            seq,
            flags: TcpFlags::default(),
            payload: Bytes::from_static(payload),
            timestamp: at,
        }
    }

    fn with_flags(mut segment: Segment, syn: bool, fin: bool, rst: bool) -> Segment {
        segment.flags = TcpFlags { syn, fin, rst };
        segment
    }

    fn settings() -> AssemblerSettings {
        AssemblerSettings {
            max_flows: 16,
            max_pending_bytes: 1024,
            flow_channel_capacity: 64,
            ..Default::default()
        }
    }

    /// Everything currently queued for a reader, and whether the flow's channel is closed.
    fn drain(rx: &mut Receiver<FlowEvent>) -> (Vec<FlowEvent>, bool) {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) => return (events, false),
                Err(TryRecvError::Disconnected) => return (events, true),
            }
        }
    }

    fn bytes_of(events: &[FlowEvent]) -> Vec<u8> {
        let mut out = Vec::new();
        for event in events {
            match event {
                FlowEvent::Data(bytes) => out.extend_from_slice(bytes),
                FlowEvent::Gap { .. } => panic!("unexpected gap"),
            }
        }
        out
    }

    #[test]
    fn test_any_delivery_order_yields_sender_stream() {
        let stream: &'static [u8] = b"POST /a HTTP/1.1\r\nContent-Length: 4\r\n\r\nbody";
        let chunks: Vec<(u32, &'static [u8])> = vec![
            (500, &stream[0..10]),
            (510, &stream[10..25]),
            (525, &stream[25..38]),
            (538, &stream[38..]),
        ];
        let orders: Vec<Vec<usize>> = vec![
            vec![0, 1, 2, 3],
            vec![3, 2, 1, 0],
            vec![1, 3, 0, 2],
            vec![0, 0, 2, 1, 1, 3, 2],
        ];

        for order in orders {
            let now = Utc::now();
            let mut assembler = Assembler::new(settings(), Collect::new(64));
            let k = key(40000);
            assembler.assemble(with_flags(seg(k, 499, b"", now), true, false, false));
            for i in &order {
                let (seq, payload) = chunks[*i];
                assembler.assemble(seg(k, seq, payload, now));
            }
            // Overlapping retransmission spanning two chunks
            assembler.assemble(seg(k, 505, &stream[5..20], now));

            let (events, closed) = drain(&mut assembler.factory_mut().streams[0].2);
            assert_eq!(bytes_of(&events), stream, "order {:?}", order);
            assert!(!closed);
        }
    }

    #[test]
    fn test_flows_are_demultiplexed() {
        let now = Utc::now();
        let mut assembler = Assembler::new(settings(), Collect::new(64));
        assembler.assemble(with_flags(seg(key(1), 99, b"", now), true, false, false));
        assembler.assemble(with_flags(seg(key(2), 899, b"", now), true, false, false));
        assembler.assemble(seg(key(1), 100, b"one", now));
        assembler.assemble(seg(key(2), 900, b"two", now));
        assembler.assemble(seg(key(1), 103, b"-more", now));

        assert_eq!(assembler.flow_count(), 2);
        let streams = &mut assembler.factory_mut().streams;
        assert_eq!(streams[0].0, key(1));
        assert_eq!(bytes_of(&drain(&mut streams[0].2).0), b"one-more");
        assert_eq!(bytes_of(&drain(&mut streams[1].2).0), b"two");
    }

    #[test]
    fn test_fin_retires_flow_and_closes_stream() {
        let now = Utc::now();
        let mut assembler = Assembler::new(settings(), Collect::new(64));
        let k = key(40000);
        assembler.assemble(seg(k, 1, b"abc", now));
        assert_eq!(assembler.state_of(&k), Some(FlowState::Active));

        assembler.assemble(with_flags(seg(k, 4, b"def", now), false, true, false));
        assert_eq!(assembler.state_of(&k), None);
        assert_eq!(assembler.flow_count(), 0);
        assert_eq!(assembler.stats().flows_closed, 1);

        let (events, closed) = drain(&mut assembler.factory_mut().streams[0].2);
        assert_eq!(bytes_of(&events), b"abcdef");
        assert!(closed);
    }

    #[test]
    fn test_early_fin_waits_for_missing_bytes() {
        let now = Utc::now();
        let mut assembler = Assembler::new(settings(), Collect::new(64));
        let k = key(40000);
        assembler.assemble(seg(k, 1, b"abc", now));
        assembler.assemble(with_flags(seg(k, 7, b"", now), false, true, false));
        assert_eq!(assembler.state_of(&k), Some(FlowState::Closing));

        assembler.assemble(seg(k, 4, b"def", now));
        assert_eq!(assembler.state_of(&k), None);
        let (events, closed) = drain(&mut assembler.factory_mut().streams[0].2);
        assert_eq!(bytes_of(&events), b"abcdef");
        assert!(closed);
    }

    #[test]
    fn test_rst_retires_once_nothing_is_pending() {
        let now = Utc::now();
        let mut assembler = Assembler::new(settings(), Collect::new(64));
        let k = key(40000);
        assembler.assemble(seg(k, 1, b"abc", now));
        assembler.assemble(with_flags(seg(k, 4, b"", now), false, false, true));
        assert_eq!(assembler.flow_count(), 0);
        assert!(drain(&mut assembler.factory_mut().streams[0].2).1);
    }

    #[test]
    fn test_idle_flow_is_evicted_once_and_key_reused() {
        let start = Utc::now();
        let mut assembler = Assembler::new(settings(), Collect::new(64));
        let k = key(40000);
        assembler.assemble(seg(k, 1, b"GET / HT", start));
        let first_id = assembler.flow_id(&k).unwrap();

        assert_eq!(assembler.flush_older_than(start + Duration::seconds(61)), 1);
        assert_eq!(assembler.flush_older_than(start + Duration::seconds(120)), 0);
        assert_eq!(assembler.stats().flows_evicted, 1);

        // Same key, later segment: a new flow with a new consumer
        assembler.assemble(seg(k, 9, b"TP/1.1\r\n", start + Duration::seconds(130)));
        let second_id = assembler.flow_id(&k).unwrap();
        assert_ne!(first_id, second_id);
        assembler.close_all();

        let streams = &mut assembler.factory_mut().streams;
        assert_eq!(streams.len(), 2);
        let (old_events, old_closed) = drain(&mut streams[0].2);
        assert_eq!(bytes_of(&old_events), b"GET / HT");
        assert!(old_closed);
        assert_eq!(bytes_of(&drain(&mut streams[1].2).0), b"TP/1.1\r\n");
    }

    #[test]
    fn test_recent_flows_survive_sweep() {
        let start = Utc::now();
        let mut assembler = Assembler::new(settings(), Collect::new(64));
        assembler.assemble(seg(key(1), 1, b"a", start));
        assembler.assemble(seg(key(2), 1, b"b", start + Duration::seconds(50)));

        assert_eq!(assembler.flush_older_than(start + Duration::seconds(30)), 1);
        assert_eq!(assembler.state_of(&key(2)), Some(FlowState::Active));
    }

    #[test]
    fn test_eviction_flushes_gapped_bytes_behind_gap_marker() {
        let start = Utc::now();
        let mut assembler = Assembler::new(settings(), Collect::new(64));
        let k = key(40000);
        assembler.assemble(seg(k, 1, b"abc", start));
        assembler.assemble(seg(k, 10, b"xyz", start));

        assembler.flush_older_than(start + Duration::seconds(61));
        let (events, closed) = drain(&mut assembler.factory_mut().streams[0].2);
        assert_eq!(
            events,
            vec![
                FlowEvent::Data(Bytes::from_static(b"abc")),
                FlowEvent::Gap { missing: 6 },
                FlowEvent::Data(Bytes::from_static(b"xyz")),
            ]
        );
        assert!(closed);
    }

    #[test]
    fn test_bare_segments_do_not_create_flows() {
        let now = Utc::now();
        let mut assembler = Assembler::new(settings(), Collect::new(64));
        assembler.assemble(seg(key(1), 1, b"", now));
        assembler.assemble(with_flags(seg(key(2), 1, b"", now), false, true, false));
        assembler.assemble(with_flags(seg(key(3), 1, b"", now), false, false, true));
        assert_eq!(assembler.flow_count(), 0);
        assert!(assembler.factory_mut().streams.is_empty());

        assembler.assemble(with_flags(seg(key(4), 1, b"", now), true, false, false));
        assert_eq!(assembler.flow_count(), 1);
    }

    #[test]
    fn test_flow_limit_evicts_least_recent() {
        let start = Utc::now();
        let mut settings = settings();
        settings.max_flows = 2;
        let mut assembler = Assembler::new(settings, Collect::new(64));
        assembler.assemble(seg(key(1), 1, b"a", start));
        assembler.assemble(seg(key(2), 1, b"b", start + Duration::seconds(1)));
        assembler.assemble(seg(key(3), 1, b"c", start + Duration::seconds(2)));

        assert_eq!(assembler.flow_count(), 2);
        assert_eq!(assembler.state_of(&key(1)), None);
        assert!(drain(&mut assembler.factory_mut().streams[0].2).1);
    }

    #[test]
    fn test_stopped_reader_detaches_without_new_flow() {
        let now = Utc::now();
        let mut assembler = Assembler::new(settings(), Collect::new(64));
        let k = key(40000);
        assembler.assemble(with_flags(seg(k, 0, b"", now), true, false, false));
        assembler.assemble(seg(k, 1, b"garbage", now));

        // Reader gives up on the flow
        let (_, _, rx) = assembler.factory_mut().streams.remove(0);
        drop(rx);

        assembler.assemble(seg(k, 8, b"more", now));
        assembler.assemble(seg(k, 12, b"still", now));
        assert_eq!(assembler.stats().flows_detached, 1);
        assert_eq!(assembler.state_of(&k), Some(FlowState::Active));
        assert!(assembler.factory_mut().streams.is_empty());
    }

    #[test]
    fn test_slow_reader_is_detached() {
        let now = Utc::now();
        let mut assembler = Assembler::new(settings(), Collect::new(1));
        let k = key(40000);
        assembler.assemble(with_flags(seg(k, 0, b"", now), true, false, false));
        assembler.assemble(seg(k, 1, b"a", now));
        assembler.assemble(seg(k, 2, b"b", now));
        assembler.assemble(seg(k, 3, b"c", now));

        assert_eq!(assembler.stats().flows_detached, 1);
        let (events, _) = drain(&mut assembler.factory_mut().streams[0].2);
        assert_eq!(bytes_of(&events), b"a");
    }

    #[test]
    fn test_late_syn_keeps_stream_start() {
        let now = Utc::now();
        let mut assembler = Assembler::new(settings(), Collect::new(64));
        let k = key(40000);
        assembler.assemble(seg(k, 510, b"/1.1\r\n\r\n", now));
        assembler.assemble(with_flags(seg(k, 499, b"", now), true, false, false));
        assembler.assemble(seg(k, 500, b"GET / HTTP", now));
        assembler.close_all();

        let (events, closed) = drain(&mut assembler.factory_mut().streams[0].2);
        assert_eq!(bytes_of(&events), b"GET / HTTP/1.1\r\n\r\n");
        assert!(closed);
        assert_eq!(assembler.stats().duplicate_segments, 0);
    }

    #[test]
    fn test_flow_without_syn_waits_for_earlier_bytes() {
        let now = Utc::now();
        let mut assembler = Assembler::new(settings(), Collect::new(64));
        let k = key(40000);
        assembler.assemble(seg(k, 510, b"/1.1\r\n\r\n", now));
        assembler.assemble(seg(k, 500, b"GET / HTTP", now));
        assert!(drain(&mut assembler.factory_mut().streams[0].2).0.is_empty());

        assert_eq!(assembler.flush_older_than(now + Duration::seconds(1)), 1);
        let (events, closed) = drain(&mut assembler.factory_mut().streams[0].2);
        assert_eq!(bytes_of(&events), b"GET / HTTP/1.1\r\n\r\n");
        assert!(closed);
    }

    #[test]
    fn test_recent_activity_protects_flow_from_limit() {
        let start = Utc::now();
        let mut settings = settings();
        settings.max_flows = 2;
        let mut assembler = Assembler::new(settings, Collect::new(64));
        assembler.assemble(seg(key(1), 1, b"a", start));
        assembler.assemble(seg(key(2), 1, b"b", start + Duration::seconds(1)));
        assembler.assemble(seg(key(1), 2, b"c", start + Duration::seconds(2)));
        assembler.assemble(seg(key(3), 1, b"d", start + Duration::seconds(3)));

        assert_eq!(assembler.state_of(&key(2)), None);
        assert_eq!(assembler.state_of(&key(1)), Some(FlowState::Active));
        assert_eq!(assembler.flush_older_than(start + Duration::seconds(3)), 1);
        assert_eq!(assembler.state_of(&key(3)), Some(FlowState::Active));
    }

    #[test]
    fn test_close_all_retires_everything() {
        let now = Utc::now();
        let mut assembler = Assembler::new(settings(), Collect::new(64));
        assembler.assemble(seg(key(1), 1, b"a", now));
        assembler.assemble(seg(key(2), 1, b"b", now));

        assert_eq!(assembler.close_all(), 2);
        assert_eq!(assembler.flow_count(), 0);
        for (_, _, rx) in assembler.factory_mut().streams.iter_mut() {
            assert!(drain(rx).1);
        }
    }
}
