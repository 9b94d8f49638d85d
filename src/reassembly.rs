pub mod assembler;
pub mod buffer;
pub mod types;

pub use assembler::{Assembler, StreamFactory};
pub use buffer::{Push, ReassemblyBuffer};
pub use types::{AssemblerStats, FlowEvent, FlowState, RetireReason};
