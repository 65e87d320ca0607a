use super::IngestError;
use std::path::Path;
use tokio::fs;

/// Container extensions accepted for ingestion, compared case-insensitively
pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["mp4", "webm", "ogg"];

/// Reject anything that is not a readable regular file
pub(crate) async fn validate_regular_file(path: &Path) -> Result<(), IngestError> {
    let invalid = |reason: String| IngestError::InvalidFile {
        path: path.to_path_buf(),
        reason,
    };

    let metadata = fs::metadata(path)
        .await
        .map_err(|e| invalid(e.to_string()))?;
    if !metadata.is_file() {
        return Err(invalid("not a regular file".to_string()));
    }

    // Metadata alone does not prove read permission
    fs::File::open(path)
        .await
        .map_err(|e| invalid(e.to_string()))?;
    Ok(())
}

/// Gate on the extension allow-list before any probing happens
pub fn check_supported_format(path: &Path) -> Result<(), IngestError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    match extension {
        Some(ext) if SUPPORTED_EXTENSIONS.contains(&ext.as_str()) => Ok(()),
        other => Err(IngestError::UnsupportedFormat {
            path: path.to_path_buf(),
            extension: other,
        }),
    }
}
