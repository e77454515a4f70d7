//! Token streaming with a deferred, conflict-checked commit.

pub mod frames;
pub mod pipeline;

pub use frames::{FinalPayload, StreamFrame};
pub use pipeline::{FrameReceiver, StreamKind, StreamRequest, StreamingPipeline};
