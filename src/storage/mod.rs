//! Output file locations
//!
//! Temporary capture paths, timestamped default names and the auto-save
//! copy into a library directory.

use crate::utils::error::{CaptureError, CaptureResult};
use std::path::{Path, PathBuf};

/// Path in the system temp directory, with any stale file of that name
/// removed so the writer starts from nothing.
pub fn temporary_path(file_name: &str) -> CaptureResult<PathBuf> {
    if file_name.is_empty() || Path::new(file_name).components().count() != 1 {
        return Err(CaptureError::Config(format!(
            "invalid temporary file name: {:?}",
            file_name
        )));
    }

    let path = std::env::temp_dir().join(file_name);
    match std::fs::remove_file(&path) {
        Ok(()) => tracing::debug!("Removed stale {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(path)
}

/// `capture-YYYYmmdd-HHMMSS.mp4` in `dir`, with a counter on collision
pub fn default_output_path(dir: &Path) -> PathBuf {
    unique_path(dir, "capture", "mp4")
}

fn unique_path(dir: &Path, prefix: &str, extension: &str) -> PathBuf {
    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let path = dir.join(format!("{}-{}.{}", prefix, timestamp, extension));

    if path.exists() {
        for i in 1..1000 {
            let alt_path = dir.join(format!("{}-{}-{}.{}", prefix, timestamp, i, extension));
            if !alt_path.exists() {
                return alt_path;
            }
        }
    }

    path
}

/// Default library directory for auto-saved captures
///
/// The platform video folder (XDG `VIDEOS`, `~/Movies`, `{FOLDERID_Videos}`),
/// else the home directory, else the temp directory.
pub fn default_library_dir() -> PathBuf {
    dirs::video_dir()
        .or_else(dirs::home_dir)
        .map(|dir| dir.join("camera-engine"))
        .unwrap_or_else(|| std::env::temp_dir().join("camera-engine-library"))
}

/// Copy a finished capture into `library_dir`, keeping its file name
/// unless that name is taken.
pub fn save_to_library(path: &Path, library_dir: &Path) -> CaptureResult<PathBuf> {
    std::fs::create_dir_all(library_dir)?;

    let file_name = path
        .file_name()
        .ok_or_else(|| CaptureError::Config(format!("{} has no file name", path.display())))?;
    let mut target = library_dir.join(file_name);

    if target.exists() {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "capture".to_string());
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_else(|| "mp4".to_string());
        target = unique_path(library_dir, &stem, &extension);
    }

    std::fs::copy(path, &target)?;
    tracing::info!("Saved capture to library: {}", target.display());
    Ok(target)
}
