//! Calls directory scanner
//!
//! Lists audio recordings sitting directly inside the calls directory.
//! Subdirectories are not descended into.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Extensions accepted as call recordings (compared case-insensitively)
pub const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "mp4", "mpeg", "mpga", "m4a", "wav", "webm", "aac", "flac", "ogg",
];

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("I/O error reading {path}: {message}")]
    Io { path: PathBuf, message: String },
}

/// One audio file found by [`list_audio_files`]
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFile {
    /// File name only; this is the artifact id
    pub filename: String,
    pub path: PathBuf,
    pub mod_time: DateTime<Utc>,
    pub size_bytes: u64,
}

pub fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            AUDIO_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Audio files directly inside `dir`, sorted by file name
///
/// Entries that vanish or cannot be stat'ed mid-scan are skipped; only a
/// failure to read `dir` itself is an error.
pub fn list_audio_files(dir: &Path) -> Result<Vec<AudioFile>, ScanError> {
    if !dir.exists() {
        return Err(ScanError::PathNotFound(dir.to_path_buf()));
    }
    if !dir.is_dir() {
        return Err(ScanError::NotADirectory(dir.to_path_buf()));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                if e.depth() == 0 {
                    return Err(ScanError::Io {
                        path: dir.to_path_buf(),
                        message: e.to_string(),
                    });
                }
                tracing::debug!(error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if !entry.file_type().is_file() || !is_audio_file(entry.path()) {
            continue;
        }

        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let Some(filename) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let mod_time = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        files.push(AudioFile {
            filename,
            path: entry.path().to_path_buf(),
            mod_time,
            size_bytes: metadata.len(),
        });
    }

    files.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(files)
}
