//! Document engine capability consumed by the worker

use std::path::Path;

use super::error::{DocumentOpenError, RenderError};

/// Result of rasterizing one page: encoded image bytes or a render failure.
pub type RenderOutcome = Result<Vec<u8>, RenderError>;

/// An opened document the worker can render page by page.
pub trait PageSource {
    fn page_count(&self) -> usize;

    /// Rasterizes `page_index` and returns the encoded image.
    fn render(&mut self, page_index: usize) -> RenderOutcome;
}

/// Opens documents. Shared between the consumer, which only needs the page
/// count, and the worker.
pub trait DocumentEngine: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn PageSource>, DocumentOpenError>;
}
