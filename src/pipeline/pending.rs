//! Pages not yet rendered in the current session, and the render order rules

use std::collections::BTreeSet;

/// The pending set. Only ever shrinks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PendingPages {
    pages: BTreeSet<usize>,
}

impl PendingPages {
    #[must_use]
    pub fn new(page_count: usize) -> Self {
        Self {
            pages: (0..page_count).collect(),
        }
    }

    #[must_use]
    pub fn contains(&self, page: usize) -> bool {
        self.pages.contains(&page)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Removes a page for good. Returns false if it was not pending.
    pub fn remove(&mut self, page: usize) -> bool {
        self.pages.remove(&page)
    }

    /// First page of a session: the focus page if one was requested and is
    /// pending, otherwise the lowest pending page.
    #[must_use]
    pub fn first(&self, focus: Option<usize>) -> Option<usize> {
        self.focused(focus).or_else(|| self.lowest())
    }

    /// Page to render after `current`: a pending focus page wins, then
    /// `current + 1`, then the lowest pending page. Every pending page is
    /// reached no matter how often focus jumps.
    #[must_use]
    pub fn next_after(&self, current: usize, focus: Option<usize>) -> Option<usize> {
        self.focused(focus)
            .or_else(|| current.checked_add(1).filter(|next| self.contains(*next)))
            .or_else(|| self.lowest())
    }

    fn focused(&self, focus: Option<usize>) -> Option<usize> {
        focus.filter(|page| self.contains(*page))
    }

    fn lowest(&self) -> Option<usize> {
        self.pages.first().copied()
    }
}
