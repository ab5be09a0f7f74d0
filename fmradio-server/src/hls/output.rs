//! Segment directory housekeeping and readiness.

use std::fs;
use std::io;
use std::path::Path;

use log::debug;

use crate::pipeline::MANIFEST_FILE;

/// A manifest shorter than this has no segment entries yet.
const MIN_MANIFEST_BYTES: u64 = 20;

/// Why segmented output cannot be played yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotReady {
    NotSegmented,
    ManifestMissing,
    ManifestEmpty,
}

impl NotReady {
    pub fn reason(self) -> &'static str {
        match self {
            NotReady::NotSegmented => "delivery is not hls",
            NotReady::ManifestMissing => "playlist not created yet",
            NotReady::ManifestEmpty => "playlist is empty",
        }
    }
}

/// Check whether the manifest in `dir` exists and lists something.
pub fn manifest_readiness(dir: &Path) -> Result<(), NotReady> {
    match fs::metadata(dir.join(MANIFEST_FILE)) {
        Ok(meta) if meta.len() >= MIN_MANIFEST_BYTES => Ok(()),
        Ok(_) => Err(NotReady::ManifestEmpty),
        Err(_) => Err(NotReady::ManifestMissing),
    }
}

/// Remove every file in `dir`, creating the directory when missing.
///
/// Individual failures are skipped; the encoder may still hold a file open.
pub fn clear_segment_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            if let Err(e) = fs::remove_file(&path) {
                debug!("[Hls] could not remove {:?}: {}", path, e);
            }
        }
    }
    Ok(())
}
