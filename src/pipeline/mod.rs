//! Page rendering pipeline
//!
//! A worker renders pages of one document into a named shared memory region
//! and announces each frame over a control channel; the consumer copies the
//! frame out, acknowledges it and steers the render order with focus hints.

pub mod buffer;
pub mod channel;
pub mod engine;
pub mod error;
pub mod focus;
pub mod launcher;
#[cfg(feature = "pdf")]
pub mod mupdf_engine;
pub mod pending;
pub mod producer;
pub mod protocol;
pub mod region;
pub mod worker;

pub use buffer::SharedFrameBuffer;
pub use channel::{AwaitingReply, ChannelEvent, ConsumerChannel, WorkerChannel};
pub use engine::{DocumentEngine, PageSource, RenderOutcome};
pub use error::{DocumentOpenError, FailureKind, PipelineError, RenderError};
pub use focus::{FocusHint, ScrollFocusChannel};
pub use launcher::{
    ProcessLauncher, ThreadLauncher, WorkerHandle, WorkerLauncher, WorkerLink, WorkerSpec,
};
#[cfg(feature = "pdf")]
pub use mupdf_engine::MupdfEngine;
pub use pending::PendingPages;
pub use producer::{Frame, PageProducer, PollOutcome, ProducerSession, SessionOutcome, SessionReport};
pub use protocol::{AckOrAbort, FrameNotice};
pub use region::{ExitRecord, SessionStatus, SharedRegion, cleanup_all_regions};
pub use worker::{ProducerState, RenderWorker, run_worker};
