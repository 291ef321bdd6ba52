//! Input resolution: turn a path or an in-memory buffer into a
//! [`SourceDocument`].
//!
//! Existence and read permission are checked up front so callers get a
//! specific error instead of a decoder failure. PDF magic bytes (`%PDF`) are
//! verified whenever the declared type is PDF.

use crate::error::ExtractError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Declared kind of the input document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Pdf,
    Image,
}

impl MediaType {
    /// Detect the type from the leading bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"%PDF") {
            Some(MediaType::Pdf)
        } else if image::guess_format(bytes).is_ok() {
            Some(MediaType::Image)
        } else {
            None
        }
    }

    /// Map a file extension to a media type.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(MediaType::Pdf),
            "png" | "jpg" | "jpeg" | "gif" | "bmp" | "tif" | "tiff" => Some(MediaType::Image),
            _ => None,
        }
    }
}

/// The submitted document: bytes plus declared type. Job-scoped.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    bytes: Vec<u8>,
    media_type: MediaType,
    origin: Option<PathBuf>,
}

impl SourceDocument {
    /// Read a local file.
    ///
    /// When `media_type` is `None` it is taken from the extension, then from
    /// the file's magic bytes.
    pub fn from_path(
        path: impl AsRef<Path>,
        media_type: Option<MediaType>,
    ) -> Result<Self, ExtractError> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            return Err(ExtractError::FileNotFound { path });
        }

        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(ExtractError::PermissionDenied { path });
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ExtractError::FileNotFound { path });
            }
            Err(e) => {
                return Err(ExtractError::unsupported(format!(
                    "cannot read '{}': {e}",
                    path.display()
                )));
            }
        };

        let media_type = media_type
            .or_else(|| MediaType::from_path(&path))
            .or_else(|| MediaType::sniff(&bytes))
            .ok_or_else(|| {
                ExtractError::unsupported(format!(
                    "cannot determine document type of '{}'",
                    path.display()
                ))
            })?;

        debug!(
            "Resolved local {:?}: {} ({} bytes)",
            media_type,
            path.display(),
            bytes.len()
        );

        let mut doc = Self::from_bytes(bytes, Some(media_type))?;
        doc.origin = Some(path);
        Ok(doc)
    }

    /// Wrap an in-memory buffer. `None` sniffs the type from the bytes.
    pub fn from_bytes(bytes: Vec<u8>, media_type: Option<MediaType>) -> Result<Self, ExtractError> {
        if bytes.is_empty() {
            return Err(ExtractError::unsupported("empty document"));
        }
        let media_type = match media_type {
            Some(t) => t,
            None => MediaType::sniff(&bytes).ok_or_else(|| {
                ExtractError::unsupported("bytes are neither a PDF nor a known image format")
            })?,
        };
        if media_type == MediaType::Pdf && !bytes.starts_with(b"%PDF") {
            let magic: Vec<u8> = bytes.iter().take(4).copied().collect();
            return Err(ExtractError::unsupported(format!(
                "declared PDF but magic bytes are {magic:02x?}"
            )));
        }
        Ok(Self {
            bytes,
            media_type,
            origin: None,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    /// Path the document was read from, if any.
    pub fn origin(&self) -> Option<&Path> {
        self.origin.as_deref()
    }
}
