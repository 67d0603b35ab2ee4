//! Uploaded inputs: the loan application and the two supporting images.
//!
//! Uploads are held in memory (byte buffer + declared filename). They are
//! consumed once by the pipeline and never written anywhere except the
//! scratch directory used for office conversion.

use crate::error::IntakeError;
use std::fmt;
use std::path::Path;

/// Page-described formats the rasteriser accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Docx,
}

impl DocumentFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Docx => "docx",
        }
    }
}

/// The primary document: a loan-application form.
#[derive(Clone)]
pub struct UploadedDocument {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl UploadedDocument {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    /// Read a document from disk, using its file name as the declared name.
    pub async fn read(path: impl AsRef<Path>) -> Result<Self, IntakeError> {
        let (name, bytes) = read_named(path.as_ref()).await?;
        Ok(Self { name, bytes })
    }

    /// Lower-cased extension of the declared name, without the dot.
    pub fn extension(&self) -> Option<String> {
        extension_of(&self.name)
    }

    /// Detect the format from the declared extension.
    pub fn format(&self) -> Result<DocumentFormat, IntakeError> {
        match self.extension().as_deref() {
            Some("pdf") => Ok(DocumentFormat::Pdf),
            Some("docx") => Ok(DocumentFormat::Docx),
            _ => Err(IntakeError::UnsupportedFormat {
                name: self.name.clone(),
            }),
        }
    }
}

impl fmt::Debug for UploadedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadedDocument")
            .field("name", &self.name)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

/// A raster image upload: the industry license or the commercial registration.
#[derive(Clone)]
pub struct SupportingImage {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl SupportingImage {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    pub async fn read(path: impl AsRef<Path>) -> Result<Self, IntakeError> {
        let (name, bytes) = read_named(path.as_ref()).await?;
        Ok(Self { name, bytes })
    }

    /// MIME type guessed from the declared name.
    pub fn media_type(&self) -> &'static str {
        extension_of(&self.name)
            .and_then(|ext| image::ImageFormat::from_extension(ext))
            .map(|f| f.to_mime_type())
            .unwrap_or("application/octet-stream")
    }
}

impl fmt::Debug for SupportingImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupportingImage")
            .field("name", &self.name)
            .field("media_type", &self.media_type())
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

async fn read_named(path: &Path) -> Result<(String, Vec<u8>), IntakeError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| IntakeError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok((name, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_from_extension() {
        let pdf = UploadedDocument::new("Loan Application.PDF", vec![]);
        assert_eq!(pdf.format().unwrap(), DocumentFormat::Pdf);
        let docx = UploadedDocument::new("form.docx", vec![]);
        assert_eq!(docx.format().unwrap(), DocumentFormat::Docx);
    }

    #[test]
    fn unknown_extension_is_unsupported() {
        for name in ["form.doc", "form.xlsx", "form"] {
            let doc = UploadedDocument::new(name, vec![]);
            assert!(
                matches!(doc.format(), Err(IntakeError::UnsupportedFormat { .. })),
                "{name}"
            );
        }
    }

    #[test]
    fn supporting_media_type() {
        assert_eq!(SupportingImage::new("il.JPG", vec![]).media_type(), "image/jpeg");
        assert_eq!(SupportingImage::new("cr.png", vec![]).media_type(), "image/png");
        assert_eq!(
            SupportingImage::new("cr.bin", vec![]).media_type(),
            "application/octet-stream"
        );
    }

    #[tokio::test]
    async fn read_uses_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("application.pdf");
        std::fs::write(&path, b"%PDF-1.7").unwrap();
        let doc = UploadedDocument::read(&path).await.unwrap();
        assert_eq!(doc.name, "application.pdf");
        assert_eq!(doc.bytes, b"%PDF-1.7");
    }

    #[tokio::test]
    async fn read_missing_file_fails() {
        let err = SupportingImage::read("/definitely/not/here.png").await.unwrap_err();
        assert!(matches!(err, IntakeError::FileRead { .. }));
    }
}
