pub mod frame;
pub mod packet_source;
pub mod types;

pub use frame::decode_segment;
pub use packet_source::{CaptureFilter, PacketSource};
pub use types::{FlowKey, LinkLayer, RawFrame, Segment, TcpFlags};
