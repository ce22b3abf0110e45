//! App archive extraction.

use std::io::Cursor;
use std::path::Path;

use zip::ZipArchive;

use crate::error::Result;

/// Extract a zip archive into `dest`, creating it if needed.
///
/// Entries whose paths would escape `dest` are rejected by the zip reader.
///
/// # Errors
///
/// Returns `ControlError::Archive` if the bytes are not a valid archive and
/// `ControlError::Io` if files cannot be written.
pub fn extract(bytes: &[u8], dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    archive.extract(dest)?;

    tracing::debug!(dest = %dest.display(), entries = archive.len(), "Extracted archive");

    Ok(())
}

/// Extract on the blocking pool.
///
/// # Errors
///
/// See [`extract`].
pub async fn extract_async(bytes: Vec<u8>, dest: &Path) -> Result<()> {
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || extract(&bytes, &dest))
        .await
        .map_err(|e| crate::ControlError::Internal(format!("extract task failed: {e}")))?
}
