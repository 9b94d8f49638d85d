//! # Controller
//!
//! Wires the pipeline together and owns the single writer loop over the flow table.
//!
//! ```text
//! ┌──────────────┐ frames ┌─────────────────────────────┐ FlowEvents ┌──────────────┐
//! │ PacketSource │───────▶│ Controller loop             │───────────▶│ StreamReader │ x flows
//! └──────────────┘        │ decode → direction → Assembler          └──────┬───────┘
//!                         │ sweep tick / Ctrl-C         │                   │ submit
//!                         └─────────────────────────────┘            ┌──────▼───────┐
//!                                                                    │  Forwarder   │
//!                                                                    └──────────────┘
//! ```
//!
//! Frame decoding, direction selection, assembly and the idle sweep all happen on this one
//! task, so no other component ever touches flow state.

use super::reader_group::{ReaderGroup, ReaderTally};
use crate::configuration::types::Config;
use crate::error_handling::types::{ControllerError, FrameError};
use crate::forwarding::forwarder::Forwarder;
use crate::http_framing::stream_reader::RequestSink;
use crate::network::frame::decode_segment;
use crate::network::packet_source::{CaptureFilter, PacketSource};
use crate::network::types::{LinkLayer, RawFrame};
use crate::reassembly::assembler::Assembler;
use crate::reassembly::types::AssemblerStats;
use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Frame-level counters of the controller loop.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames: u64,
    /// Segments fed to the assembler.
    pub request_segments: u64,
    /// Segments travelling from the server back to clients, ignored.
    pub reply_segments: u64,
    pub frame_errors: HashMap<FrameError, u64>,
}

/// What one run of the pipeline did.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSummary {
    pub capture: CaptureStats,
    pub assembler: AssemblerStats,
    pub readers: ReaderTally,
}

pub struct Controller {
    config: Config,
}

impl Controller {
    pub fn new(config: Config) -> Result<Self, ControllerError> {
        // Mirrored requests would be captured again and mirrored forever.
        let mirrored = SocketAddr::new(config.source_ip, config.source_port);
        if let Ok(ip) = config.destination.host.parse::<IpAddr>() {
            if SocketAddr::new(ip, config.destination.port) == mirrored {
                return Err(ControllerError::InitializationFailed(format!(
                    "mirror destination {} is the captured service",
                    config.destination
                )));
            }
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Opens the capture and runs the pipeline until the capture ends or Ctrl-C.
    ///
    /// # Errors
    /// Only capture setup is fatal; every later failure stays inside its frame, flow or
    /// request.
    pub async fn run(&mut self) -> Result<PipelineSummary, ControllerError> {
        let filter = CaptureFilter::new(self.config.source_ip, self.config.source_port);
        let source = PacketSource::open(&self.config.capture, &filter)?;
        let forwarder = Forwarder::new(self.config.destination.clone(), &self.config.forwarder);
        info!(
            "Mirroring {} to http://{}",
            SocketAddr::new(self.config.source_ip, self.config.source_port),
            forwarder.target()
        );

        let sink: Arc<dyn RequestSink> = Arc::new(forwarder.clone());
        let summary = self.run_with(source, sink).await;

        if forwarder.in_flight() > 0 {
            info!("Waiting for {} forwards in flight", forwarder.in_flight());
            if tokio::time::timeout(self.config.forwarder.timeout, forwarder.wait_idle())
                .await
                .is_err()
            {
                warn!("{} forwards still pending at exit", forwarder.in_flight());
            }
        }
        let stats = forwarder.stats();
        info!(
            "Forwarded {} requests, {} failed, {} dropped",
            stats.sent, stats.failed, stats.dropped
        );
        Ok(summary)
    }

    /// Runs the pipeline over `source`, handing every request to `sink`.
    pub async fn run_with(
        &self,
        mut source: PacketSource,
        sink: Arc<dyn RequestSink>,
    ) -> PipelineSummary {
        let settings = &self.config.assembler;
        let readers = ReaderGroup::new(self.config.framing, settings.flow_channel_capacity, sink);
        let mut assembler = Assembler::new(settings.clone(), readers);
        let mut capture = CaptureStats::default();
        let link = source.link();
        // Replayed captures run on their own clock.
        let replay = self.config.capture.pcap_file.is_some();
        let mut capture_clock: Option<DateTime<Utc>> = None;

        let mut sweep = tokio::time::interval(settings.sweep_interval);
        sweep.tick().await;
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                frame = source.next_frame() => match frame {
                    Some(frame) => {
                        capture_clock = capture_clock.max(Some(frame.timestamp));
                        self.ingest(link, frame, &mut assembler, &mut capture);
                    }
                    None => {
                        info!("Capture source closed");
                        break;
                    }
                },
                _ = sweep.tick() => {
                    let now = match capture_clock {
                        Some(clock) if replay => clock,
                        _ => Utc::now(),
                    };
                    self.sweep(now, &mut assembler, &capture);
                }
                _ = &mut shutdown => {
                    info!("Interrupt received, shutting down");
                    break;
                }
            }
        }

        let retired = assembler.close_all();
        let readers = assembler.factory_mut();
        info!(
            "Retired {} flows, waiting for {} readers",
            retired,
            readers.running()
        );
        readers.join_all().await;

        let summary = PipelineSummary {
            capture,
            assembler: assembler.stats(),
            readers: assembler.factory_mut().tally(),
        };
        info!("Pipeline finished: {:?}", summary);
        summary
    }

    fn ingest(
        &self,
        link: LinkLayer,
        frame: RawFrame,
        assembler: &mut Assembler<ReaderGroup>,
        capture: &mut CaptureStats,
    ) {
        capture.frames += 1;
        let segment = match decode_segment(link, &frame) {
            Ok(segment) => segment,
            Err(e) => {
                let seen = capture.frame_errors.entry(e).or_insert(0);
                *seen += 1;
                if *seen == 1 {
                    debug!("Skipping frame: {}", e);
                }
                return;
            }
        };

        // The filter admits both directions, only client-to-server bytes carry requests.
        if segment.key.dst_ip != self.config.source_ip
            || segment.key.dst_port != self.config.source_port
        {
            capture.reply_segments += 1;
            return;
        }
        capture.request_segments += 1;
        assembler.assemble(segment);
    }

    fn sweep(
        &self,
        now: DateTime<Utc>,
        assembler: &mut Assembler<ReaderGroup>,
        capture: &CaptureStats,
    ) {
        let retention = TimeDelta::from_std(self.config.assembler.flow_timeout)
            .unwrap_or_else(|_| TimeDelta::days(365));
        let cutoff = now
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let evicted = assembler.flush_older_than(cutoff);
        let reaped = assembler.factory_mut().reap();
        let stats = assembler.stats();
        info!(
            "Sweep: {} flows tracked, {} evicted idle, {} readers finished, {} running; \
             {} frames, {} request segments, {} bytes released",
            assembler.flow_count(),
            evicted,
            reaped,
            assembler.factory_mut().running(),
            capture.frames,
            capture.request_segments,
            stats.released_bytes
        );
        if stats.dropped_segments > 0 || stats.flows_detached > 0 {
            warn!(
                "{} segments dropped, {} flows detached so far",
                stats.dropped_segments, stats.flows_detached
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::types::{
        AssemblerSettings, CaptureSettings, ForwarderSettings, FramingLimits, MirrorTarget,
    };

    fn config(destination: &str, port: u16) -> Config {
        Config {
            source_ip: "10.0.0.5".parse().unwrap(),
            source_port: 8080,
            destination: MirrorTarget {
                host: destination.to_string(),
                port,
            },
            capture: CaptureSettings::default(),
            assembler: AssemblerSettings::default(),
            framing: FramingLimits::default(),
            forwarder: ForwarderSettings::default(),
        }
    }

    #[test]
    fn test_new_rejects_mirror_loop() {
        assert!(matches!(
            Controller::new(config("10.0.0.5", 8080)),
            Err(ControllerError::InitializationFailed(_))
        ));
        assert!(Controller::new(config("10.0.0.5", 9090)).is_ok());
        assert!(Controller::new(config("shadow.internal", 8080)).is_ok());
    }

    #[tokio::test]
    async fn test_missing_capture_file_is_fatal() {
        let mut cfg = config("10.0.0.9", 8080);
        cfg.capture.pcap_file = Some("/nonexistent/capture.pcap".into());
        let mut controller = Controller::new(cfg).unwrap();
        assert!(matches!(
            controller.run().await,
            Err(ControllerError::CaptureError(_))
        ));
    }
}
