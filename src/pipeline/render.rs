//! Document rasterisation: PDF or DOCX bytes → ordered `DynamicImage`s.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async contexts.
//! `tokio::task::spawn_blocking` moves the work onto a dedicated thread pool
//! thread designed for blocking operations, preventing the Tokio worker
//! threads from stalling during CPU-heavy rendering.
//!
//! ## DOCX uploads
//!
//! Word documents go through [`super::docx::prevent_table_split`] and then
//! LibreOffice ([`super::office`]) inside a per-call [`ScratchDir`]. The
//! scratch directory is released on every exit path before the result is
//! returned. PDFs are loaded straight from memory and never touch the disk.

use super::docx::prevent_table_split;
use super::office::convert_to_pdf;
use super::scratch::ScratchDir;
use crate::config::IntakeConfig;
use crate::document::{DocumentFormat, UploadedDocument};
use crate::error::IntakeError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const PDF_MAGIC: &[u8] = b"%PDF";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Why the renderer gave up on a PDF byte buffer.
#[derive(Debug)]
enum RenderFailure {
    Bind(String),
    Load(String),
    NoPages,
    Page { page: usize, detail: String },
}

/// Rasterise every page of the uploaded document, in page order.
pub async fn rasterize(
    document: &UploadedDocument,
    config: &IntakeConfig,
) -> Result<Vec<DynamicImage>, IntakeError> {
    let pages = match document.format()? {
        DocumentFormat::Pdf => rasterize_pdf(document, config).await?,
        DocumentFormat::Docx => rasterize_docx(document, config).await?,
    };
    info!("{}: rasterised {} pages", document.name, pages.len());
    Ok(pages)
}

async fn rasterize_pdf(
    document: &UploadedDocument,
    config: &IntakeConfig,
) -> Result<Vec<DynamicImage>, IntakeError> {
    if !document.bytes.starts_with(PDF_MAGIC) {
        return Err(IntakeError::CorruptInput {
            name: document.name.clone(),
            detail: "missing %PDF header".into(),
        });
    }

    render_in_background(document.bytes.clone(), config)
        .await?
        .map_err(|failure| match failure {
            RenderFailure::Bind(detail) => IntakeError::PdfiumBindingFailed(detail),
            RenderFailure::Load(detail) => IntakeError::CorruptInput {
                name: document.name.clone(),
                detail,
            },
            RenderFailure::NoPages => IntakeError::CorruptInput {
                name: document.name.clone(),
                detail: "renderer reported zero pages".into(),
            },
            RenderFailure::Page { page, detail } => IntakeError::CorruptInput {
                name: document.name.clone(),
                detail: format!("page {page}: {detail}"),
            },
        })
}

async fn rasterize_docx(
    document: &UploadedDocument,
    config: &IntakeConfig,
) -> Result<Vec<DynamicImage>, IntakeError> {
    if !document.bytes.starts_with(ZIP_MAGIC) {
        return Err(IntakeError::CorruptInput {
            name: document.name.clone(),
            detail: "not a zip archive".into(),
        });
    }

    let bytes = document.bytes.clone();
    let fixed = tokio::task::spawn_blocking(move || prevent_table_split(&bytes))
        .await
        .map_err(|e| IntakeError::Internal(format!("Table fix-up task panicked: {}", e)))?
        .map_err(|e| IntakeError::CorruptInput {
            name: document.name.clone(),
            detail: e.to_string(),
        })?;

    let scratch = ScratchDir::new()?;
    let result = convert_and_render(&scratch, fixed, document, config).await;
    scratch.release(config.cleanup_backoff()).await;
    result
}

async fn convert_and_render(
    scratch: &ScratchDir,
    fixed_docx: Vec<u8>,
    document: &UploadedDocument,
    config: &IntakeConfig,
) -> Result<Vec<DynamicImage>, IntakeError> {
    let conversion_failure = |detail: String| IntakeError::ConversionFailure {
        name: document.name.clone(),
        detail,
    };

    let input = scratch.join("application.docx");
    tokio::fs::write(&input, &fixed_docx)
        .await
        .map_err(|e| IntakeError::Internal(format!("writing {}: {e}", input.display())))?;
    debug!("Fixed DOCX written to {}", input.display());

    let pdf_path = convert_to_pdf(
        &config.soffice_path,
        &input,
        scratch.path(),
        config.conversion_timeout_secs,
        &document.name,
    )
    .await?;

    let pdf = tokio::fs::read(&pdf_path)
        .await
        .map_err(|e| conversion_failure(format!("cannot read converted PDF: {e}")))?;

    render_in_background(pdf, config)
        .await?
        .map_err(|failure| match failure {
            RenderFailure::Bind(detail) => IntakeError::PdfiumBindingFailed(detail),
            RenderFailure::Load(detail) => conversion_failure(format!("converted PDF: {detail}")),
            RenderFailure::NoPages => conversion_failure("converted PDF has no pages".into()),
            RenderFailure::Page { page, detail } => {
                conversion_failure(format!("converted PDF page {page}: {detail}"))
            }
        })
}

async fn render_in_background(
    pdf: Vec<u8>,
    config: &IntakeConfig,
) -> Result<Result<Vec<DynamicImage>, RenderFailure>, IntakeError> {
    let dpi = config.dpi;
    let max_pixels = config.max_rendered_pixels;
    let lib_path = config.pdfium_lib_path.clone();

    tokio::task::spawn_blocking(move || render_blocking(&pdf, dpi, max_pixels, lib_path.as_deref()))
        .await
        .map_err(|e| IntakeError::Internal(format!("Render task panicked: {}", e)))
}

/// Blocking implementation of page rendering.
fn render_blocking(
    pdf: &[u8],
    dpi: u32,
    max_pixels: u32,
    lib_path: Option<&Path>,
) -> Result<Vec<DynamicImage>, RenderFailure> {
    let pdfium = bind_pdfium(lib_path).map_err(RenderFailure::Bind)?;

    let document = pdfium
        .load_pdf_from_byte_slice(pdf, None)
        .map_err(|e| RenderFailure::Load(format!("{:?}", e)))?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    if total_pages == 0 {
        return Err(RenderFailure::NoPages);
    }
    debug!("PDF loaded: {} pages", total_pages);

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(dpi as f32 / 72.0)
        .set_maximum_width(pixel_limit(max_pixels))
        .set_maximum_height(pixel_limit(max_pixels));

    let mut images = Vec::with_capacity(total_pages);
    for (idx, page) in pages.iter().enumerate() {
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| RenderFailure::Page {
                page: idx + 1,
                detail: format!("{:?}", e),
            })?;

        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );
        images.push(image);
    }

    Ok(images)
}

/// pdfium takes signed pixel bounds; anything past `i32::MAX` means "no cap".
fn pixel_limit(max_pixels: u32) -> i32 {
    i32::try_from(max_pixels).unwrap_or(i32::MAX)
}

/// Bind pdfium from, in order: the configured path, `PDFIUM_LIB_PATH`,
/// then the system library search path. A path may name the library file
/// itself or the directory holding it.
fn bind_pdfium(lib_path: Option<&Path>) -> Result<Pdfium, String> {
    let explicit = lib_path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from));

    let bindings = match explicit {
        Some(path) => {
            let library = if path.is_dir() {
                Pdfium::pdfium_platform_library_name_at_path(&path)
            } else {
                path
            };
            debug!("Binding pdfium from {}", library.display());
            Pdfium::bind_to_library(&library)
                .map_err(|e| format!("{}: {}", library.display(), e))?
        }
        None => Pdfium::bind_to_system_library().map_err(|e| e.to_string())?,
    };
    Ok(Pdfium::new(bindings))
}
