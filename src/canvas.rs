//! Consumer-side placement of delivered frames on a vertical page scene
//!
//! Pages are stacked top to bottom in fixed-size slots separated by a margin.
//! A decoded page is scaled to cover its slot, keeping aspect ratio, and
//! centred horizontally.

use std::collections::BTreeMap;

use image::imageops::{self, FilterType};
use image::{ImageError, RgbaImage};
use log::debug;

use crate::pipeline::Frame;
use crate::settings::PipelineSettings;

#[derive(Debug, thiserror::Error)]
pub enum CanvasError {
    #[error("page {page} could not be decoded: {source}")]
    Decode {
        page: usize,
        #[source]
        source: ImageError,
    },

    #[error("page {page} is outside a {page_count}-page scene")]
    PageOutOfRange { page: usize, page_count: usize },
}

/// Slot geometry of the page scene
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageLayout {
    pub page_width: u32,
    pub page_height: u32,
    pub margin: u32,
}

impl Default for PageLayout {
    fn default() -> Self {
        Self {
            page_width: 1190,
            page_height: 1684,
            margin: 5,
        }
    }
}

impl PageLayout {
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            page_width: settings.page_width.max(1),
            page_height: settings.page_height.max(1),
            margin: settings.page_margin,
        }
    }

    fn stride(&self) -> u64 {
        u64::from(self.page_height) + u64::from(self.margin)
    }

    /// Top edge of `page`
    pub fn page_offset(&self, page: usize) -> u64 {
        page as u64 * self.stride()
    }

    /// Page whose slot contains scene offset `y`, clamped to the last page.
    /// `None` for an empty scene.
    pub fn page_at_offset(&self, y: u64, page_count: usize) -> Option<usize> {
        let last = page_count.checked_sub(1)?;
        Some(((y / self.stride()) as usize).min(last))
    }

    pub fn scene_height(&self, page_count: usize) -> u64 {
        match page_count {
            0 => 0,
            n => self.page_offset(n - 1) + u64::from(self.page_height),
        }
    }

    /// Size of a `width` x `height` image scaled to cover one slot.
    pub fn scaled_size(&self, width: u32, height: u32) -> (u32, u32) {
        let scale = f64::max(
            f64::from(self.page_width) / f64::from(width.max(1)),
            f64::from(self.page_height) / f64::from(height.max(1)),
        );
        let scaled = |v: u32, min: u32| ((f64::from(v) * scale).round() as u32).max(min);
        (
            scaled(width, self.page_width),
            scaled(height, self.page_height),
        )
    }

    /// Decodes `frame` and positions it in its slot.
    pub fn place(&self, frame: &Frame) -> Result<PlacedPage, CanvasError> {
        let decoded = image::load_from_memory(&frame.bytes).map_err(|source| CanvasError::Decode {
            page: frame.page_index,
            source,
        })?;

        let (width, height) = self.scaled_size(decoded.width(), decoded.height());
        let image = imageops::resize(&decoded.to_rgba8(), width, height, FilterType::Triangle);
        let x = -((i64::from(width) - i64::from(self.page_width)) / 2);

        Ok(PlacedPage {
            page_index: frame.page_index,
            x,
            y: self.page_offset(frame.page_index),
            image,
        })
    }
}

/// A decoded page at its scene position
#[derive(Clone, Debug)]
pub struct PlacedPage {
    pub page_index: usize,
    /// Horizontal offset of the image's left edge; negative when the scaled
    /// page is wider than the slot
    pub x: i64,
    pub y: u64,
    pub image: RgbaImage,
}

/// Placed pages of the current document
#[derive(Debug, Default)]
pub struct PageCanvas {
    layout: PageLayout,
    page_count: usize,
    pages: BTreeMap<usize, PlacedPage>,
}

impl PageCanvas {
    pub fn new(layout: PageLayout) -> Self {
        Self {
            layout,
            page_count: 0,
            pages: BTreeMap::new(),
        }
    }

    pub fn layout(&self) -> PageLayout {
        self.layout
    }

    /// Drops every placed page and resizes the scene for a new document.
    pub fn clear(&mut self, page_count: usize) {
        self.pages.clear();
        self.page_count = page_count;
    }

    pub fn insert(&mut self, frame: &Frame) -> Result<&PlacedPage, CanvasError> {
        if frame.page_index >= self.page_count {
            return Err(CanvasError::PageOutOfRange {
                page: frame.page_index,
                page_count: self.page_count,
            });
        }

        let placed = self.layout.place(frame)?;
        debug!(
            "placed page {} at ({}, {}) as {}x{}",
            placed.page_index,
            placed.x,
            placed.y,
            placed.image.width(),
            placed.image.height()
        );
        Ok(self.pages.entry(frame.page_index).or_insert(placed))
    }

    pub fn get(&self, page: usize) -> Option<&PlacedPage> {
        self.pages.get(&page)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn scene_height(&self) -> u64 {
        self.layout.scene_height(self.page_count)
    }

    /// Page to prioritise when the viewport top is at `scroll_y`.
    pub fn focus_for_scroll(&self, scroll_y: u64) -> Option<usize> {
        self.layout.page_at_offset(scroll_y, self.page_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::page_png;

    fn layout() -> PageLayout {
        PageLayout {
            page_width: 40,
            page_height: 60,
            margin: 5,
        }
    }

    #[test]
    fn offsets_follow_slot_stride() {
        let layout = PageLayout::default();

        assert_eq!(layout.page_offset(0), 0);
        assert_eq!(layout.page_offset(3), 3 * 1689);
        assert_eq!(layout.scene_height(2), 1689 + 1684);
        assert_eq!(layout.scene_height(0), 0);
    }

    #[test]
    fn offset_maps_back_to_page_and_clamps() {
        let layout = layout();

        assert_eq!(layout.page_at_offset(0, 10), Some(0));
        assert_eq!(layout.page_at_offset(64, 10), Some(0));
        assert_eq!(layout.page_at_offset(65, 10), Some(1));
        assert_eq!(layout.page_at_offset(10_000, 10), Some(9));
        assert_eq!(layout.page_at_offset(0, 0), None);
    }

    #[test]
    fn wide_page_covers_slot_and_is_centred() {
        let layout = layout();

        assert_eq!(layout.scaled_size(4, 6), (40, 60));
        assert_eq!(layout.scaled_size(6, 6), (60, 60));

        let frame = Frame {
            page_index: 2,
            bytes: {
                let square = image::RgbImage::from_pixel(6, 6, image::Rgb([1, 2, 3]));
                let mut out = std::io::Cursor::new(Vec::new());
                square.write_to(&mut out, image::ImageFormat::Png).unwrap();
                out.into_inner()
            },
        };
        let placed = layout.place(&frame).unwrap();

        assert_eq!(placed.x, -10);
        assert_eq!(placed.y, 130);
        assert_eq!(placed.image.dimensions(), (60, 60));
    }

    #[test]
    fn canvas_rejects_garbage_and_out_of_range_pages() {
        let mut canvas = PageCanvas::new(layout());
        canvas.clear(2);

        let garbage = Frame {
            page_index: 0,
            bytes: vec![1, 2, 3],
        };
        assert!(matches!(
            canvas.insert(&garbage),
            Err(CanvasError::Decode { page: 0, .. })
        ));

        let stray = Frame {
            page_index: 5,
            bytes: page_png(5),
        };
        assert!(matches!(
            canvas.insert(&stray),
            Err(CanvasError::PageOutOfRange { page: 5, .. })
        ));
        assert!(canvas.is_empty());
    }

    #[test]
    fn clear_resets_for_next_document() {
        let mut canvas = PageCanvas::new(layout());
        canvas.clear(3);
        canvas
            .insert(&Frame {
                page_index: 1,
                bytes: page_png(1),
            })
            .unwrap();

        assert_eq!(canvas.get(1).map(|p| p.y), Some(65));
        assert_eq!(canvas.focus_for_scroll(140), Some(2));

        canvas.clear(1);
        assert!(canvas.get(1).is_none());
        assert_eq!(canvas.scene_height(), 60);
    }
}
