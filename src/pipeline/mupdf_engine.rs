//! MuPDF-backed document engine

use std::path::Path;

use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use log::debug;
use mupdf::{Colorspace, Document, Matrix, Pixmap};

use super::engine::{DocumentEngine, PageSource, RenderOutcome};
use super::error::{DocumentOpenError, RenderError};

/// Default raster scale: 2x of 72 dpi
pub const DEFAULT_RENDER_SCALE: f32 = 2.0;

/// Renders pages to PNG at a fixed scale factor.
#[derive(Clone, Copy, Debug)]
pub struct MupdfEngine {
    scale: f32,
}

impl MupdfEngine {
    #[must_use]
    pub fn new(scale: f32) -> Self {
        Self {
            scale: scale.max(0.1),
        }
    }
}

impl Default for MupdfEngine {
    fn default() -> Self {
        Self::new(DEFAULT_RENDER_SCALE)
    }
}

impl DocumentEngine for MupdfEngine {
    fn open(&self, path: &Path) -> Result<Box<dyn PageSource>, DocumentOpenError> {
        let doc = Document::open(path.to_string_lossy().as_ref())
            .map_err(|e| DocumentOpenError::new(path, e.to_string()))?;
        let count = doc
            .page_count()
            .map_err(|e| DocumentOpenError::new(path, e.to_string()))?;
        let page_count = usize::try_from(count)
            .map_err(|_| DocumentOpenError::new(path, format!("invalid page count {count}")))?;

        debug!("opened {path:?}: {page_count} pages");

        Ok(Box::new(MupdfDocument {
            doc,
            page_count,
            transform: Matrix::new_scale(self.scale, self.scale),
        }))
    }
}

struct MupdfDocument {
    doc: Document,
    page_count: usize,
    transform: Matrix,
}

impl PageSource for MupdfDocument {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn render(&mut self, page_index: usize) -> RenderOutcome {
        let fail = |reason: String| RenderError::new(page_index, reason);

        let index = i32::try_from(page_index).map_err(|_| fail("page index out of range".into()))?;
        let page = self.doc.load_page(index).map_err(|e| fail(e.to_string()))?;
        let pixmap = page
            .to_pixmap(&self.transform, &Colorspace::device_rgb(), false, false)
            .map_err(|e| fail(e.to_string()))?;

        let pixels = pixmap_to_rgb(&pixmap).map_err(fail)?;
        encode_png(&pixels, pixmap.width(), pixmap.height()).map_err(fail)
    }
}

fn pixmap_to_rgb(pixmap: &Pixmap) -> Result<Vec<u8>, String> {
    let n = pixmap.n() as usize;
    if n < 3 {
        return Err(format!("unsupported pixmap format: {n} channels"));
    }

    let width = pixmap.width() as usize;
    let height = pixmap.height() as usize;
    let stride = pixmap.stride() as usize;
    let samples = pixmap.samples();
    let row_bytes = width * n;
    if samples.len() < stride.saturating_mul(height) || row_bytes > stride {
        return Err("pixmap buffer size mismatch".to_string());
    }

    let mut out = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        let row_start = y * stride;
        let row = &samples[row_start..row_start + row_bytes];
        if n == 3 {
            out.extend_from_slice(row);
        } else {
            for px in row.chunks_exact(n) {
                out.extend_from_slice(&px[..3]);
            }
        }
    }

    Ok(out)
}

fn encode_png(rgb: &[u8], width: u32, height: u32) -> Result<Vec<u8>, String> {
    let mut out = Vec::new();
    PngEncoder::new(&mut out)
        .write_image(rgb, width, height, ExtendedColorType::Rgb8)
        .map_err(|e| format!("png encode: {e}"))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_an_open_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing.pdf");

        let err = MupdfEngine::default()
            .open(&path)
            .err()
            .expect("open must fail");

        assert_eq!(err.path, path);
    }

    #[test]
    fn png_encoding_produces_signature() {
        let png = encode_png(&[255u8; 2 * 2 * 3], 2, 2).expect("encode");

        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }
}
