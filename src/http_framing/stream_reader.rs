//! # Stream Reader
//!
//! One reader task per flow. It pulls the flow's ordered bytes from the assembler, frames
//! requests out of them and submits each complete request to a [`RequestSink`] without
//! waiting on the outcome.

use super::framer::RequestFramer;
use super::types::{HttpRequest, ReaderOutcome};
use crate::configuration::types::FramingLimits;
use crate::error_handling::types::FramingError;
use crate::network::types::FlowKey;
use crate::reassembly::types::FlowEvent;
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use uuid::Uuid;

/// Receives every request a reader extracts.
///
/// `submit` must not block: the reader continues with the next request immediately.
pub trait RequestSink: Send + Sync + 'static {
    fn submit(&self, request: HttpRequest);
}

pub struct StreamReader {
    key: FlowKey,
    flow_id: Uuid,
    events: Receiver<FlowEvent>,
    framer: RequestFramer,
    sink: Arc<dyn RequestSink>,
    requests: u64,
}

impl StreamReader {
    pub fn new(
        key: FlowKey,
        flow_id: Uuid,
        events: Receiver<FlowEvent>,
        limits: FramingLimits,
        sink: Arc<dyn RequestSink>,
    ) -> Self {
        Self {
            key,
            flow_id,
            events,
            framer: RequestFramer::new(key, flow_id, limits),
            sink,
            requests: 0,
        }
    }

    /// Reads until the flow's stream closes or its bytes stop being HTTP.
    ///
    /// Dropping the receiver on a framing error tells the assembler to stop delivering to
    /// this flow.
    pub async fn run(mut self) -> ReaderOutcome {
        while let Some(event) = self.events.recv().await {
            match event {
                FlowEvent::Data(bytes) => {
                    self.framer.push(&bytes);
                    if let Err(e) = self.drain_requests() {
                        warn!(
                            "[{}] malformed HTTP on {} after {} requests: {} (data: {:?})",
                            self.flow_id,
                            self.key,
                            self.requests,
                            e,
                            self.framer.preview()
                        );
                        return ReaderOutcome::Malformed(e);
                    }
                }
                FlowEvent::Gap { missing } => {
                    let discarded = self.framer.buffered_len() + self.discard_rest().await;
                    warn!(
                        "[{}] {} bytes missing from {}, discarding {} bytes",
                        self.flow_id, missing, self.key, discarded
                    );
                    return ReaderOutcome::Truncated { discarded };
                }
            }
        }

        if self.framer.has_partial() {
            let discarded = self.framer.buffered_len();
            warn!(
                "[{}] {} closed with an incomplete request, discarding {} bytes",
                self.flow_id, self.key, discarded
            );
            return ReaderOutcome::Truncated { discarded };
        }
        debug!(
            "[{}] {} closed after {} requests",
            self.flow_id, self.key, self.requests
        );
        ReaderOutcome::Closed
    }

    fn drain_requests(&mut self) -> Result<(), FramingError> {
        while let Some(request) = self.framer.next_request()? {
            self.requests += 1;
            debug!(
                "[{}] request #{}: {} {}",
                self.flow_id, self.requests, request.method, request.uri
            );
            self.sink.submit(request);
        }
        Ok(())
    }

    /// Consumes the flow's remaining events without framing them.
    async fn discard_rest(&mut self) -> usize {
        let mut discarded = 0;
        while let Some(event) = self.events.recv().await {
            if let FlowEvent::Data(bytes) = event {
                discarded += bytes.len();
            }
        }
        discarded
    }
}
