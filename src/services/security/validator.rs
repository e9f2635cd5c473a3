//! Checks applied to an upload before any byte is stored.

use thiserror::Error;

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;
const MAX_FILE_NAME_LEN: usize = 255;

const ALLOWED_MIME_PREFIXES: [&str; 3] = ["image/", "video/", "audio/"];
const ALLOWED_MIME_EXACT: [&str; 4] = [
    "application/pdf",
    "application/zip",
    "application/x-zip-compressed",
    "text/plain",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("file name contains unsafe characters or patterns")]
    UnsafeFileName,
    #[error("unsupported file type: {0}")]
    UnsupportedMimeType(String),
    #[error("file appears to be empty")]
    Empty,
    #[error("file is too large (max {max_mib}MB)")]
    TooLarge { max_mib: u64 },
}

#[derive(Debug, Clone, Copy)]
pub struct UploadLimits {
    pub max_size_bytes: u64,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

pub fn is_safe_file_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_FILE_NAME_LEN {
        return false;
    }
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ' '))
}

pub fn is_allowed_mime_type(mime_type: &str) -> bool {
    if mime_type.is_empty() {
        return false;
    }
    ALLOWED_MIME_EXACT.contains(&mime_type)
        || ALLOWED_MIME_PREFIXES
            .iter()
            .any(|prefix| mime_type.starts_with(prefix))
}

/// Validate name, type and size. `size_bytes` is `None` for streamed uploads
/// whose length is not known up front; those are capped while streaming.
pub fn validate_upload(
    file_name: &str,
    mime_type: &str,
    size_bytes: Option<u64>,
    limits: UploadLimits,
) -> Result<(), ValidationError> {
    if !is_safe_file_name(file_name) {
        return Err(ValidationError::UnsafeFileName);
    }
    if !is_allowed_mime_type(mime_type) {
        return Err(ValidationError::UnsupportedMimeType(mime_type.to_string()));
    }
    match size_bytes {
        Some(0) => Err(ValidationError::Empty),
        Some(size) if size > limits.max_size_bytes => Err(limits.too_large()),
        _ => Ok(()),
    }
}

impl UploadLimits {
    pub fn too_large(&self) -> ValidationError {
        ValidationError::TooLarge {
            max_mib: self.max_size_bytes / (1024 * 1024),
        }
    }
}
