pub mod framer;
pub mod stream_reader;
pub mod types;

pub use framer::RequestFramer;
pub use stream_reader::{RequestSink, StreamReader};
pub use types::{HttpRequest, ReaderOutcome};
