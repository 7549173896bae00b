//! Local storage for finished transcripts and saved session descriptors
//!
//! Transcripts go to `Documents/InterviewClient/transcripts` unless a custom
//! directory is configured.

use crate::config::Config;
use crate::session::SessionDescriptor;
use chrono::Local;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Resolve the transcripts directory: the configured one, else the default under Documents
pub(crate) fn transcripts_dir(config: &Config) -> Option<PathBuf> {
    if let Some(custom) = &config.transcript.directory {
        return Some(custom.clone());
    }
    default_transcripts_dir()
}

pub(crate) fn default_transcripts_dir() -> Option<PathBuf> {
    dirs::document_dir().map(|d| d.join("InterviewClient").join("transcripts"))
}

fn ensure_dir(dir: &Path) -> Result<(), StorageError> {
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| StorageError::CreateDirectory {
            path: dir.to_path_buf(),
            source: e,
        })?;
        info!("Created directory: {:?}", dir);
    }
    Ok(())
}

/// Write a rendered transcript into `dir`, returning the path of the new file
pub(crate) fn save_transcript(
    dir: &Path,
    session_id: &str,
    transcript: &str,
) -> Result<PathBuf, StorageError> {
    if transcript.trim().is_empty() {
        return Err(StorageError::EmptyTranscript);
    }
    ensure_dir(dir)?;

    let timestamp = Local::now().format("%Y-%m-%d-%H-%M-%S");
    let filepath = dir.join(format!("interview-{}-{}.txt", session_id, timestamp));

    let mut file = fs::File::create(&filepath).map_err(|e| StorageError::CreateFile {
        path: filepath.clone(),
        source: e,
    })?;
    file.write_all(transcript.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| StorageError::WriteFile {
            path: filepath.clone(),
            source: e,
        })?;

    info!("Saved transcript to: {:?}", filepath);
    Ok(filepath)
}

/// Save a session creation response so the session can be joined later
pub(crate) fn save_descriptor(
    path: &Path,
    descriptor: &SessionDescriptor,
) -> Result<(), StorageError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_dir(parent)?;
    }
    let json = serde_json::to_string_pretty(descriptor)?;
    fs::write(path, json).map_err(|e| StorageError::WriteFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    info!(session_id = %descriptor.session_id, "Saved session descriptor to: {:?}", path);
    Ok(())
}

pub(crate) fn load_descriptor(path: &Path) -> Result<SessionDescriptor, StorageError> {
    let contents = fs::read_to_string(path).map_err(|e| StorageError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(serde_json::from_str(&contents)?)
}

/// Storage errors with contextual information
#[derive(Debug, thiserror::Error)]
pub(crate) enum StorageError {
    #[error("Transcript is empty")]
    EmptyTranscript,

    #[error("Failed to create directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create file {path}: {source}")]
    CreateFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write to file {path}: {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid session descriptor: {0}")]
    Descriptor(#[from] serde_json::Error),
}
