use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::warn;

/// Largest screenshot accepted for upload (inclusive).
pub const MAX_IMAGE_BYTES: u64 = 20 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum PrepareError {
    #[error("Empty file: {}", .0.display())]
    Empty(PathBuf),
    #[error("File too large ({size} bytes): {}", .path.display())]
    TooLarge { path: PathBuf, size: u64 },
    #[error("Cannot read {}: {source}", .path.display())]
    Io { path: PathBuf, source: std::io::Error },
}

/// An image inlined for transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageContent {
    /// Base64 payload.
    pub data: String,
    pub mime_type: &'static str,
}

impl ImageContent {
    pub fn png(bytes: &[u8]) -> Self {
        Self {
            data: STANDARD.encode(bytes),
            mime_type: "image/png",
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

pub fn mime_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase);
    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}

/// Validate and base64-encode one screenshot. Never touches the source file.
pub fn prepare(path: &Path) -> Result<ImageContent, PrepareError> {
    let io_err = |source| PrepareError::Io {
        path: path.to_path_buf(),
        source,
    };

    let size = fs::metadata(path).map_err(io_err)?.len();
    if size == 0 {
        return Err(PrepareError::Empty(path.to_path_buf()));
    }
    if size > MAX_IMAGE_BYTES {
        return Err(PrepareError::TooLarge {
            path: path.to_path_buf(),
            size,
        });
    }

    let bytes = fs::read(path).map_err(io_err)?;
    Ok(ImageContent {
        data: STANDARD.encode(bytes),
        mime_type: mime_type_for(path),
    })
}

/// Prepare every path, dropping (and logging) the ones that fail.
pub fn prepare_batch(paths: &[PathBuf]) -> Vec<ImageContent> {
    paths
        .iter()
        .filter_map(|path| match prepare(path) {
            Ok(image) => Some(image),
            Err(e) => {
                warn!("Skipping screenshot: {e}");
                None
            }
        })
        .collect()
}
