use crate::models::item::{ImageAsset, ImageMime};

/// Upper bound for a source photo (50 MiB).
pub const MAX_SOURCE_BYTES: usize = 50 * 1024 * 1024;

/// Upper bound for a background reference (10 MiB).
pub const MAX_REFERENCE_BYTES: usize = 10 * 1024 * 1024;

/// Lower bound for a background reference (10 KiB). Anything smaller is a
/// thumbnail or a broken upload.
pub const MIN_REFERENCE_BYTES: usize = 10 * 1024;

/// Validate a source photo before it becomes a work item.
///
/// Checks, in order:
/// - the upload is not empty
/// - the size is within [`MAX_SOURCE_BYTES`]
/// - the magic bytes identify a JPEG, PNG, GIF or WebP image
pub fn validate_source(bytes: Vec<u8>) -> Result<ImageAsset, ValidationError> {
    if bytes.is_empty() {
        return Err(ValidationError::Empty);
    }
    if bytes.len() > MAX_SOURCE_BYTES {
        return Err(ValidationError::TooLarge {
            size: bytes.len(),
            limit: MAX_SOURCE_BYTES,
        });
    }
    let mime = sniff_mime(&bytes)?;
    Ok(ImageAsset::new(bytes, mime))
}

/// Validate the shared background reference for a batch.
pub fn validate_reference(bytes: Vec<u8>) -> Result<ImageAsset, ValidationError> {
    if bytes.is_empty() {
        return Err(ValidationError::Empty);
    }
    if bytes.len() > MAX_REFERENCE_BYTES {
        return Err(ValidationError::TooLarge {
            size: bytes.len(),
            limit: MAX_REFERENCE_BYTES,
        });
    }
    if bytes.len() < MIN_REFERENCE_BYTES {
        return Err(ValidationError::TooSmall {
            size: bytes.len(),
            minimum: MIN_REFERENCE_BYTES,
        });
    }
    let mime = sniff_mime(&bytes)?;
    Ok(ImageAsset::new(bytes, mime))
}

fn sniff_mime(bytes: &[u8]) -> Result<ImageMime, ValidationError> {
    let format = image::guess_format(bytes).map_err(|_| ValidationError::Unrecognized)?;
    ImageMime::from_format(format)
        .ok_or_else(|| ValidationError::UnsupportedFormat(format!("{format:?}").to_lowercase()))
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Image is empty (0 bytes)")]
    Empty,

    #[error("Image is too large ({size} bytes, limit {limit} bytes)")]
    TooLarge { size: usize, limit: usize },

    #[error("Reference image is too small ({size} bytes, minimum {minimum} bytes)")]
    TooSmall { size: usize, minimum: usize },

    #[error("Unsupported image format '{0}' (expected JPEG, PNG, GIF or WebP)")]
    UnsupportedFormat(String),

    #[error("File is not a recognizable image")]
    Unrecognized,
}
