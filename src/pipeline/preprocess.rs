//! `preprocess`: convert accepted files into page images, apply
//! deskew/denoise/enhance transforms, and compute image fingerprints.
//!
//! PDF-to-page-image rasterization and the deskew/denoise/enhance
//! transforms are injected as a `PageRenderer` collaborator: OCR-free
//! image optimisation is treated as a pure external transform out of
//! this core's scope, so `preprocess` itself stays a pure orchestration
//! function over whatever renderer is wired in.

use image::DynamicImage;

use crate::error::{Error, Result};
use crate::fingerprint::image_fingerprint;

use super::{FileKind, PageImage, UploadedFile};

/// Decodes one uploaded file into zero or more raw page images, before
/// enhancement and fingerprinting. A single-page image file yields one
/// page; a PDF yields one page per rendered page.
pub trait PageRenderer {
    fn render_pages(&self, file: &UploadedFile) -> Result<Vec<DynamicImage>>;
}

/// Deskew/denoise/enhance transform, applied per page after rendering.
pub trait PageEnhancer {
    fn enhance(&self, image: DynamicImage) -> DynamicImage;
}

pub struct IdentityEnhancer;

impl PageEnhancer for IdentityEnhancer {
    fn enhance(&self, image: DynamicImage) -> DynamicImage {
        image
    }
}

/// Render a single already-decoded raster image file (JPEG/PNG/WEBP) via
/// the `image` crate; PDFs are rejected here and left to a PDF-capable
/// `PageRenderer` collaborator.
pub struct RasterFileRenderer;

impl PageRenderer for RasterFileRenderer {
    fn render_pages(&self, file: &UploadedFile) -> Result<Vec<DynamicImage>> {
        if file.kind == FileKind::Pdf {
            return Err(Error::internal(
                "RasterFileRenderer cannot rasterize a PDF; use a PDF-capable renderer",
            ));
        }
        let decoded = image::load_from_memory(&file.bytes)
            .map_err(|e| Error::validation(format!("failed to decode {}: {e}", file.name)))?;
        Ok(vec![decoded])
    }
}

pub fn preprocess(
    files: &[UploadedFile],
    renderer: &dyn PageRenderer,
    enhancer: &dyn PageEnhancer,
) -> Result<Vec<PageImage>> {
    let mut pages = Vec::new();
    let mut next_index = 0u32;

    for file in files {
        let rendered = renderer.render_pages(file).map_err(|e| {
            Error::validation(format!("intake_failed: page render error for {}: {e}", file.name))
        })?;
        for raw in rendered {
            let enhanced = enhancer.enhance(raw);
            let fingerprint = image_fingerprint(&enhanced);
            pages.push(PageImage {
                page_index: next_index,
                image: enhanced,
                fingerprint,
            });
            next_index += 1;
        }
    }

    Ok(pages)
}
