pub mod configuration;
pub mod controller;
pub mod error_handling;
pub mod forwarding;
pub mod http_framing;
pub mod network;
pub mod reassembly;

pub use configuration::{Args, Config};
pub use controller::Controller;
