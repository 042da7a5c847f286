//! Scroll focus hint shared between the viewer and the worker

use std::sync::Arc;
use std::sync::atomic::Ordering;

use super::region::SharedRegion;

const DIRTY: u64 = 1 << 63;
const PAGE_MASK: u64 = u32::MAX as u64;

/// The page the viewport currently prefers.
///
/// A hint, not a command: the worker only jumps to it if the page is still
/// pending.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FocusHint {
    pub page_index: u32,
    pub dirty: bool,
}

impl FocusHint {
    const fn unpack(word: u64) -> Self {
        Self {
            page_index: (word & PAGE_MASK) as u32,
            dirty: word & DIRTY != 0,
        }
    }
}

/// Both fields live in one atomic word in the region header, so a writer
/// never publishes a page without its dirty flag and the worker reads and
/// clears them in a single step.
#[derive(Clone)]
pub struct ScrollFocusChannel {
    region: Arc<SharedRegion>,
}

impl ScrollFocusChannel {
    #[must_use]
    pub fn new(region: Arc<SharedRegion>) -> Self {
        Self { region }
    }

    /// Consumer side: prefer `page` next. Later requests replace earlier ones.
    pub fn request(&self, page: usize) {
        // Pages beyond u32 can never be pending, so saturating keeps them inert
        let page = u32::try_from(page).unwrap_or(u32::MAX);
        self.region
            .header()
            .focus
            .store(DIRTY | u64::from(page), Ordering::Release);
    }

    /// Worker side: returns the requested page if a new request arrived since
    /// the last call, clearing the dirty flag.
    pub fn take(&self) -> Option<usize> {
        let previous = self
            .region
            .header()
            .focus
            .fetch_and(!DIRTY, Ordering::AcqRel);
        let hint = FocusHint::unpack(previous);
        hint.dirty.then_some(hint.page_index as usize)
    }

    /// Current hint without consuming it.
    #[must_use]
    pub fn peek(&self) -> FocusHint {
        FocusHint::unpack(self.region.header().focus.load(Ordering::Acquire))
    }
}

impl std::fmt::Debug for ScrollFocusChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScrollFocusChannel")
            .field("hint", &self.peek())
            .finish()
    }
}
