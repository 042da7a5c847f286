#[cfg(not(unix))]
compile_error!("pagestream requires POSIX shared memory and only builds on unix targets");

pub mod canvas;
pub mod catalog;
pub mod panic_handler;
pub mod pipeline;
pub mod settings;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use canvas::{PageCanvas, PageLayout, PlacedPage};
pub use pipeline::{
    Frame, PageProducer, PipelineError, PollOutcome, SessionOutcome, SessionReport,
};
pub use settings::{PipelineSettings, RenderFailurePolicy};
