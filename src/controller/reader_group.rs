//! Supervised set of per-flow reader tasks.

use crate::configuration::types::FramingLimits;
use crate::http_framing::stream_reader::{RequestSink, StreamReader};
use crate::http_framing::types::ReaderOutcome;
use crate::network::types::FlowKey;
use crate::reassembly::assembler::StreamFactory;
use crate::reassembly::types::FlowEvent;
use log::{debug, error};
use std::sync::Arc;
use tokio::sync::mpsc::{self, Sender};
use tokio::task::{JoinError, JoinSet};
use uuid::Uuid;

/// How the readers finished so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReaderTally {
    pub spawned: u64,
    pub closed: u64,
    pub truncated: u64,
    pub malformed: u64,
    pub panicked: u64,
}

/// Spawns one [`StreamReader`] per new flow and keeps track of it until it finishes.
pub struct ReaderGroup {
    limits: FramingLimits,
    channel_capacity: usize,
    sink: Arc<dyn RequestSink>,
    readers: JoinSet<(Uuid, ReaderOutcome)>,
    tally: ReaderTally,
}

impl ReaderGroup {
    pub fn new(limits: FramingLimits, channel_capacity: usize, sink: Arc<dyn RequestSink>) -> Self {
        Self {
            limits,
            channel_capacity,
            sink,
            readers: JoinSet::new(),
            tally: ReaderTally::default(),
        }
    }

    /// Collects readers that already finished. Returns how many were collected.
    pub fn reap(&mut self) -> usize {
        let mut reaped = 0;
        while let Some(result) = self.readers.try_join_next() {
            self.record(result);
            reaped += 1;
        }
        reaped
    }

    /// Waits for every reader. Their flows must have been retired first.
    pub async fn join_all(&mut self) {
        while let Some(result) = self.readers.join_next().await {
            self.record(result);
        }
    }

    pub fn running(&self) -> usize {
        self.readers.len()
    }

    pub fn tally(&self) -> ReaderTally {
        self.tally
    }

    fn record(&mut self, result: Result<(Uuid, ReaderOutcome), JoinError>) {
        match result {
            Ok((id, outcome)) => {
                debug!("[{}] reader finished: {:?}", id, outcome);
                match outcome {
                    ReaderOutcome::Closed => self.tally.closed += 1,
                    ReaderOutcome::Truncated { .. } => self.tally.truncated += 1,
                    ReaderOutcome::Malformed(_) => self.tally.malformed += 1,
                }
            }
            Err(e) => {
                error!("Reader task failed: {}", e);
                self.tally.panicked += 1;
            }
        }
    }
}

impl StreamFactory for ReaderGroup {
    fn new_stream(&mut self, key: FlowKey, flow_id: Uuid) -> Sender<FlowEvent> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let reader = StreamReader::new(key, flow_id, rx, self.limits, Arc::clone(&self.sink));
        self.readers.spawn(async move { (flow_id, reader.run().await) });
        self.tally.spawned += 1;
        tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_framing::types::HttpRequest;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Count(AtomicUsize);

    impl RequestSink for Count {
        fn submit(&self, _request: HttpRequest) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn key(port: u16) -> FlowKey {
        FlowKey {
            src_ip: "10.0.0.1".parse().unwrap(),
            src_port: port,
            dst_ip: "10.0.0.5".parse().unwrap(),
            dst_port: 8080,
        }
    }

    #[tokio::test]
    async fn test_readers_are_supervised() {
        let sink = Arc::new(Count::default());
        let mut group = ReaderGroup::new(FramingLimits::default(), 8, sink.clone());

        let ok = group.new_stream(key(1), Uuid::new_v4());
        let bad = group.new_stream(key(2), Uuid::new_v4());
        assert_eq!(group.running(), 2);

        ok.send(FlowEvent::Data(Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n")))
            .await
            .unwrap();
        bad.send(FlowEvent::Data(Bytes::from_static(b"\x00\x01\x02\r\n\r\n")))
            .await
            .unwrap();
        drop(ok);
        drop(bad);

        group.join_all().await;
        assert_eq!(group.running(), 0);
        assert_eq!(
            group.tally(),
            ReaderTally {
                spawned: 2,
                closed: 1,
                truncated: 0,
                malformed: 1,
                panicked: 0
            }
        );
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
        assert_eq!(group.reap(), 0);
    }
}
