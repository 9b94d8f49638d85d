pub mod forwarder;
pub mod types;

pub use forwarder::{mirror_request, Forwarder};
pub use types::{ForwardStats, MirrorRequest};
