pub mod types;

pub use types::{
    CaptureError, ConfigError, ControllerError, ForwardError, FrameError, FramingError,
};
