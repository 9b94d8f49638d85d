//! # Packet Source Module
//!
//! Opens a libpcap handle (live interface or capture file), installs the capture filter and
//! hands timestamped frames to the async side through a bounded channel.
//!
//! ```text
//! ┌──────────────┐ blocking reads ┌────────────────┐  mpsc   ┌─────────────┐
//! │ libpcap      │───────────────▶│ capture thread │────────▶│ PacketSource│
//! │ (filtered)   │                └────────────────┘         │ next_frame()│
//! └──────────────┘                                           └─────────────┘
//! ```
//!
//! libpcap reads block, so they run on a dedicated OS thread. The thread stops when the
//! capture ends, fails, or the [`PacketSource`] is dropped.

use super::types::{LinkLayer, RawFrame};
use crate::configuration::types::CaptureSettings;
use crate::error_handling::types::CaptureError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use pcap::{Activated, Capture};
use std::fmt;
use std::net::IpAddr;
use std::thread::JoinHandle;
use tokio::sync::mpsc::{self, Receiver, Sender};

/// The conjunction `host <ip> and tcp and port <port>` every captured frame must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFilter {
    pub host: IpAddr,
    pub port: u16,
}

impl CaptureFilter {
    pub fn new(host: IpAddr, port: u16) -> Self {
        Self { host, port }
    }

    /// BPF expression handed to libpcap.
    pub fn expression(&self) -> String {
        format!("host {} and tcp and port {}", self.host, self.port)
    }
}

impl fmt::Display for CaptureFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expression())
    }
}

/// A lazy, endless sequence of captured frames.
pub struct PacketSource {
    link: LinkLayer,
    frames: Receiver<RawFrame>,
    worker: Option<JoinHandle<()>>,
}

impl PacketSource {
    /// Opens the capture described by `settings` and starts reading frames matching `filter`.
    ///
    /// # Errors
    /// - [`CaptureError::OpenFailed`] if the interface or file can't be opened, or its link
    ///   type can't be decoded
    /// - [`CaptureError::FilterRejected`] if libpcap refuses the filter expression
    /// - [`CaptureError::ThreadSpawn`] if the reader thread can't be started
    pub fn open(settings: &CaptureSettings, filter: &CaptureFilter) -> Result<Self, CaptureError> {
        let expression = filter.expression();

        match &settings.pcap_file {
            Some(path) => {
                info!("Replaying capture file {}", path.display());
                let mut capture = Capture::from_file(path)
                    .map_err(|e| CaptureError::OpenFailed(format!("{}: {}", path.display(), e)))?;
                apply_filter(&mut capture, &expression)?;
                Self::spawn(capture, settings.channel_capacity)
            }
            None => {
                info!("Starting capture on interface {}", settings.interface);
                let mut capture = Capture::from_device(settings.interface.as_str())
                    .and_then(|c| {
                        c.promisc(settings.promiscuous)
                            .snaplen(settings.snaplen)
                            .timeout(settings.read_timeout_ms)
                            .immediate_mode(true)
                            .open()
                    })
                    .map_err(|e| {
                        CaptureError::OpenFailed(format!("{}: {}", settings.interface, e))
                    })?;
                apply_filter(&mut capture, &expression)?;
                Self::spawn(capture, settings.channel_capacity)
            }
        }
    }

    /// Wraps an already-filled channel, e.g. frames produced by another reader.
    pub fn from_channel(link: LinkLayer, frames: Receiver<RawFrame>) -> Self {
        Self {
            link,
            frames,
            worker: None,
        }
    }

    fn spawn<T>(capture: Capture<T>, capacity: usize) -> Result<Self, CaptureError>
    where
        T: Activated + Send + 'static,
    {
        let dlt = capture.get_datalink().0;
        let link = LinkLayer::from_dlt(dlt).map_err(|e| CaptureError::OpenFailed(e.to_string()))?;
        debug!("Capture link type {} ({:?})", dlt, link);

        let (tx, rx) = mpsc::channel(capacity);
        let worker = std::thread::Builder::new()
            .name("pcap-capture".to_string())
            .spawn(move || read_frames(capture, tx))
            .map_err(CaptureError::ThreadSpawn)?;

        Ok(Self {
            link,
            frames: rx,
            worker: Some(worker),
        })
    }

    pub fn link(&self) -> LinkLayer {
        self.link
    }

    /// Waits for the next frame. `None` once the capture is over.
    ///
    /// Cancel-safe, so it can sit in a `tokio::select!` arm.
    pub async fn next_frame(&mut self) -> Option<RawFrame> {
        self.frames.recv().await
    }
}

impl Drop for PacketSource {
    fn drop(&mut self) {
        // Closing the receiver makes the capture thread exit on its next timeout.
        self.frames.close();
        if let Some(worker) = self.worker.take() {
            if worker.is_finished() {
                let _ = worker.join();
            }
        }
    }
}

fn apply_filter<T: Activated + ?Sized>(
    capture: &mut Capture<T>,
    expression: &str,
) -> Result<(), CaptureError> {
    capture
        .filter(expression, true)
        .map_err(|e| CaptureError::FilterRejected {
            filter: expression.to_string(),
            reason: e.to_string(),
        })?;
    info!("Capture filter installed: {}", expression);
    Ok(())
}

fn read_frames<T: Activated + ?Sized>(mut capture: Capture<T>, tx: Sender<RawFrame>) {
    let mut frames: u64 = 0;
    loop {
        match capture.next_packet() {
            Ok(packet) => {
                let ts = packet.header.ts;
                let frame = RawFrame {
                    data: Bytes::copy_from_slice(packet.data),
                    timestamp: timestamp_of(ts.tv_sec as i64, ts.tv_usec as i64),
                };
                frames += 1;
                if tx.blocking_send(frame).is_err() {
                    debug!("Frame receiver dropped, stopping capture");
                    break;
                }
            }
            Err(pcap::Error::TimeoutExpired) => {
                if tx.is_closed() {
                    break;
                }
            }
            Err(pcap::Error::NoMorePackets) => {
                info!("Capture exhausted after {} frames", frames);
                break;
            }
            Err(e) => {
                error!("Capture read failed after {} frames: {}", frames, e);
                break;
            }
        }
    }
    if let Ok(stats) = capture.stats() {
        if stats.dropped > 0 || stats.if_dropped > 0 {
            warn!(
                "libpcap dropped {} frames ({} at the interface)",
                stats.dropped, stats.if_dropped
            );
        }
    }
}

/// Converts a pcap `timeval` into UTC, falling back to the wall clock on nonsense values.
fn timestamp_of(secs: i64, micros: i64) -> DateTime<Utc> {
    if !(0..1_000_000).contains(&micros) {
        return Utc::now();
    }
    DateTime::from_timestamp(secs, (micros * 1000) as u32).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_filter_expression() {
        let filter = CaptureFilter::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), 8080);
        assert_eq!(filter.expression(), "host 10.0.0.5 and tcp and port 8080");

        let filter = CaptureFilter::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 80);
        assert_eq!(filter.to_string(), "host ::1 and tcp and port 80");
    }

    #[test]
    fn test_timestamp_conversion() {
        let ts = timestamp_of(1_700_000_000, 250_000);
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_micros(), 250_000);
    }

    #[tokio::test]
    async fn test_from_channel_ends_when_sender_drops() {
        let (tx, rx) = mpsc::channel(4);
        let mut source = PacketSource::from_channel(LinkLayer::Ethernet, rx);

        tx.send(RawFrame {
            data: Bytes::from_static(b"frame"),
            timestamp: Utc::now(),
        })
        .await
        .unwrap();
        drop(tx);

        let frame = source.next_frame().await.unwrap();
        assert_eq!(&frame.data[..], b"frame");
        assert!(source.next_frame().await.is_none());
        assert_eq!(source.link(), LinkLayer::Ethernet);
    }

    #[test]
    fn test_missing_capture_file_fails_to_open() {
        let settings = CaptureSettings {
            pcap_file: Some("/nonexistent/trace.pcap".into()),
            ..Default::default()
        };
        let filter = CaptureFilter::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 80);
        assert!(matches!(
            PacketSource::open(&settings, &filter),
            Err(CaptureError::OpenFailed(_))
        ));
    }
}
