//! Content sniffing: decide what a byte buffer is without trusting its name.
//!
//! Uploads come with a filename and a mime-type hint, both chosen by the
//! client. Neither is used to pick a decoder; only the leading bytes are.

use crate::error::PerceptionError;
use image::ImageFormat;
use tracing::warn;

/// PDF readers accept the header anywhere in the first KiB.
const PDF_HEADER_WINDOW: usize = 1024;

/// A document type the loaders can decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Image(ImageFormat),
}

impl DocumentKind {
    pub fn mime_type(&self) -> &'static str {
        match self {
            DocumentKind::Pdf => "application/pdf",
            DocumentKind::Image(ImageFormat::Png) => "image/png",
            DocumentKind::Image(ImageFormat::Jpeg) => "image/jpeg",
            DocumentKind::Image(ImageFormat::Tiff) => "image/tiff",
            DocumentKind::Image(ImageFormat::Bmp) => "image/bmp",
            DocumentKind::Image(ImageFormat::WebP) => "image/webp",
            DocumentKind::Image(_) => "application/octet-stream",
        }
    }
}

fn supported_image(format: ImageFormat) -> bool {
    matches!(
        format,
        ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::Tiff | ImageFormat::Bmp | ImageFormat::WebP
    )
}

/// Sniff the document type from its leading bytes.
///
/// # Errors
/// [`PerceptionError::UnsupportedDocument`] for empty input and for anything
/// that is neither a PDF nor a supported raster format.
pub fn detect_kind(bytes: &[u8]) -> Result<DocumentKind, PerceptionError> {
    if bytes.is_empty() {
        return Err(PerceptionError::UnsupportedDocument {
            detail: "empty input".into(),
        });
    }

    let window = &bytes[..bytes.len().min(PDF_HEADER_WINDOW)];
    if window.windows(5).any(|w| w == b"%PDF-") {
        return Ok(DocumentKind::Pdf);
    }

    match image::guess_format(bytes) {
        Ok(format) if supported_image(format) => Ok(DocumentKind::Image(format)),
        Ok(format) => Err(PerceptionError::UnsupportedDocument {
            detail: format!("image format {format:?} is not supported"),
        }),
        Err(_) => {
            let head: Vec<u8> = bytes.iter().take(4).copied().collect();
            Err(PerceptionError::UnsupportedDocument {
                detail: format!("unrecognised content (first bytes {head:?})"),
            })
        }
    }
}

/// Compare a client-supplied mime hint with the sniffed type.
///
/// The sniffed type always wins; a disagreement is logged and returned as a
/// note for the document's provenance.
pub fn reconcile_mime_hint(hint: Option<&str>, detected: &str) -> Option<String> {
    let h = hint.map(str::trim).filter(|h| !h.is_empty())?;
    if h.eq_ignore_ascii_case(detected) {
        return None;
    }
    warn!("mime hint '{}' ignored; content sniffed as {}", h, detected);
    Some(format!("mime hint '{h}' ignored; content is {detected}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use std::io::Cursor;

    fn png_bytes() -> Vec<u8> {
        let img = GrayImage::from_pixel(4, 4, Luma([255]));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn detects_pdf_magic_even_after_junk() {
        assert_eq!(detect_kind(b"%PDF-1.7\n...").unwrap(), DocumentKind::Pdf);
        let mut junk = vec![b' '; 100];
        junk.extend_from_slice(b"%PDF-1.4");
        assert_eq!(detect_kind(&junk).unwrap(), DocumentKind::Pdf);
    }

    #[test]
    fn detects_png() {
        let kind = detect_kind(&png_bytes()).unwrap();
        assert_eq!(kind, DocumentKind::Image(ImageFormat::Png));
        assert_eq!(kind.mime_type(), "image/png");
    }

    #[test]
    fn rejects_text_and_empty() {
        assert!(matches!(
            detect_kind(b"hello world"),
            Err(PerceptionError::UnsupportedDocument { .. })
        ));
        assert!(matches!(
            detect_kind(b""),
            Err(PerceptionError::UnsupportedDocument { .. })
        ));
    }

    #[test]
    fn sniffed_type_beats_hint() {
        let note = reconcile_mime_hint(Some("application/pdf"), "image/png").unwrap();
        assert!(note.contains("image/png"));
        assert_eq!(reconcile_mime_hint(Some("IMAGE/PNG"), "image/png"), None);
        assert_eq!(reconcile_mime_hint(None, "application/pdf"), None);
    }
}
