//! Persistent station presets.
//!
//! Presets live in a small JSON file. Every mutation rewrites the whole file
//! through a temporary file and a rename; persistence is best effort and a
//! failed save only produces a warning.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use fmradio_protocol::{
    format_mhz, mhz_to_hz, quantize_hz, PresetEntry, PresetList, FREQUENCY_QUANTUM_HZ,
    MAX_BAND_MHZ, MIN_BAND_MHZ,
};
use log::{debug, info, warn};
use parking_lot::Mutex;

/// Environment override for the preset file location.
pub const PRESETS_PATH_ENV: &str = "FMRADIO_PRESETS_PATH";

const DEFAULT_FILE_NAME: &str = "presets.json";

/// Name given to presets created without one.
pub const PLACEHOLDER_NAME: &str = "-";

const MAX_NAME_CHARS: usize = 64;
const MAX_FILL_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Preset {
    freq_hz: i64,
    name: String,
}

/// Trim, flatten newlines and cap the length; empty becomes the placeholder.
pub fn normalize_name(name: Option<&str>) -> String {
    let trimmed = name.unwrap_or_default().trim();
    if trimmed.is_empty() {
        return PLACEHOLDER_NAME.to_string();
    }
    trimmed
        .chars()
        .take(MAX_NAME_CHARS)
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect()
}

fn preset_hz(mhz: f64) -> i64 {
    quantize_hz(mhz_to_hz(mhz))
}

fn parse_stored_mhz(text: &str) -> Option<i64> {
    let mhz: f64 = text.trim().parse().ok()?;
    if !mhz.is_finite() || !(MIN_BAND_MHZ..=MAX_BAND_MHZ).contains(&mhz) {
        return None;
    }
    Some(preset_hz(mhz))
}

/// Choose the preset file: explicit path, then the environment, then the default.
///
/// A directory gets `presets.json` appended.
pub fn resolve_path(explicit: Option<PathBuf>) -> PathBuf {
    let chosen = explicit
        .or_else(|| {
            env::var_os(PRESETS_PATH_ENV)
                .map(PathBuf::from)
                .filter(|p| !p.as_os_str().is_empty())
        })
        .unwrap_or_else(|| PathBuf::from(DEFAULT_FILE_NAME));
    if chosen.is_dir() {
        chosen.join(DEFAULT_FILE_NAME)
    } else {
        chosen
    }
}

/// Ordered, de-duplicated preset list backed by a JSON file.
pub struct PresetStore {
    path: PathBuf,
    legacy_paths: Vec<PathBuf>,
    presets: Mutex<Vec<Preset>>,
}

impl PresetStore {
    /// Store saving to `path`, reading `legacy_paths` when `path` is absent.
    pub fn new(path: PathBuf, legacy_paths: Vec<PathBuf>) -> Self {
        Self {
            path,
            legacy_paths,
            presets: Mutex::new(Vec::new()),
        }
    }

    /// Open and load in one step.
    pub fn open(path: PathBuf, legacy_paths: Vec<PathBuf>) -> Self {
        let store = Self::new(path, legacy_paths);
        store.load();
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load from the primary file or the first readable legacy file.
    ///
    /// A list found at a legacy location is migrated to the primary path.
    /// Returns whether any file was loaded.
    pub fn load(&self) -> bool {
        let candidates = std::iter::once(self.path.clone())
            .chain(self.legacy_paths.iter().filter(|p| **p != self.path).cloned());
        for candidate in candidates {
            match read_file(&candidate) {
                Ok(Some(presets)) => {
                    info!(
                        "[Presets] loaded {} presets from {}",
                        presets.len(),
                        candidate.display()
                    );
                    *self.presets.lock() = presets;
                    if candidate != self.path {
                        self.save();
                    }
                    return true;
                }
                Ok(None) => {}
                Err(e) => warn!("[Presets] ignoring {}: {}", candidate.display(), e),
            }
        }
        false
    }

    /// Write the list to disk; failures are logged.
    pub fn save(&self) {
        let list = self.list();
        if let Err(e) = write_atomic(&self.path, &list) {
            warn!("[Presets] failed to save {}: {}", self.path.display(), e);
        } else {
            debug!("[Presets] saved {} presets", list.presets.len());
        }
    }

    pub fn list(&self) -> PresetList {
        let presets: Vec<PresetEntry> = self
            .presets
            .lock()
            .iter()
            .map(|p| PresetEntry {
                freq_mhz: format_mhz(p.freq_hz),
                name: p.name.clone(),
            })
            .collect();
        let presets_mhz = presets.iter().map(|p| p.freq_mhz.clone()).collect();
        PresetList {
            presets,
            presets_mhz,
        }
    }

    /// Add a preset. An existing placeholder name may be upgraded; a real
    /// name is never overwritten here.
    pub fn add(&self, mhz: f64, name: Option<&str>) {
        let freq_hz = preset_hz(mhz);
        let name = normalize_name(name);
        let changed = {
            let mut presets = self.presets.lock();
            match presets.iter_mut().find(|p| p.freq_hz == freq_hz) {
                Some(existing) => {
                    if existing.name == PLACEHOLDER_NAME && name != PLACEHOLDER_NAME {
                        existing.name = name;
                        true
                    } else {
                        false
                    }
                }
                None => {
                    insert_sorted(&mut presets, Preset { freq_hz, name });
                    true
                }
            }
        };
        if changed {
            self.save();
        }
    }

    /// Rename a preset, creating it when absent.
    pub fn update_name(&self, mhz: f64, name: &str) {
        let freq_hz = preset_hz(mhz);
        let name = normalize_name(Some(name));
        let changed = {
            let mut presets = self.presets.lock();
            match presets.iter_mut().find(|p| p.freq_hz == freq_hz) {
                Some(existing) if existing.name == name => false,
                Some(existing) => {
                    existing.name = name;
                    true
                }
                None => {
                    insert_sorted(&mut presets, Preset { freq_hz, name });
                    true
                }
            }
        };
        if changed {
            self.save();
        }
    }

    pub fn remove(&self, mhz: f64) {
        let freq_hz = preset_hz(mhz);
        let changed = {
            let mut presets = self.presets.lock();
            let before = presets.len();
            presets.retain(|p| p.freq_hz != freq_hz);
            presets.len() != before
        };
        if changed {
            self.save();
        }
    }

    /// Add every in-band, finite frequency with the placeholder name.
    ///
    /// Returns how many inputs were accepted, including ones already present.
    pub fn add_many(&self, list: &[f64]) -> usize {
        let mut added = 0;
        for &mhz in list {
            if !mhz.is_finite() || !(MIN_BAND_MHZ..=MAX_BAND_MHZ).contains(&mhz) {
                continue;
            }
            self.add(mhz, Some(PLACEHOLDER_NAME));
            added += 1;
        }
        added
    }

    /// Replace the list with a regular grid over `[start, end]`.
    pub fn fill_range(&self, start_mhz: f64, end_mhz: f64, step_mhz: f64) {
        let start = preset_hz(start_mhz);
        let end = preset_hz(end_mhz);
        let mut step = preset_hz(step_mhz);
        if step <= 0 {
            step = FREQUENCY_QUANTUM_HZ;
        }
        let presets: Vec<Preset> = (0i64..)
            .map(|i| start + i * step)
            .take_while(|hz| *hz <= end)
            .take(MAX_FILL_ENTRIES)
            .map(|freq_hz| Preset {
                freq_hz,
                name: PLACEHOLDER_NAME.to_string(),
            })
            .collect();
        info!("[Presets] filled {} presets", presets.len());
        *self.presets.lock() = presets;
        self.save();
    }
}

fn insert_sorted(presets: &mut Vec<Preset>, preset: Preset) {
    let idx = presets.partition_point(|p| p.freq_hz < preset.freq_hz);
    presets.insert(idx, preset);
}

/// `Ok(None)` when the file does not exist.
fn read_file(path: &Path) -> io::Result<Option<Vec<Preset>>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let file: PresetList =
        serde_json::from_str(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(from_wire(&file)))
}

/// Decode a stored list, dropping invalid entries and merging duplicates.
fn from_wire(file: &PresetList) -> Vec<Preset> {
    let decoded: Vec<Preset> = if file.presets.is_empty() {
        file.presets_mhz
            .iter()
            .filter_map(|mhz| parse_stored_mhz(mhz))
            .map(|freq_hz| Preset {
                freq_hz,
                name: PLACEHOLDER_NAME.to_string(),
            })
            .collect()
    } else {
        file.presets
            .iter()
            .filter_map(|entry| {
                parse_stored_mhz(&entry.freq_mhz).map(|freq_hz| Preset {
                    freq_hz,
                    name: normalize_name(Some(entry.name.as_str())),
                })
            })
            .collect()
    };

    let mut merged: Vec<Preset> = Vec::with_capacity(decoded.len());
    for preset in decoded {
        match merged.iter_mut().find(|p| p.freq_hz == preset.freq_hz) {
            Some(existing) => {
                if existing.name == PLACEHOLDER_NAME && preset.name != PLACEHOLDER_NAME {
                    existing.name = preset.name;
                }
            }
            None => merged.push(preset),
        }
    }
    merged.sort_by_key(|p| p.freq_hz);
    merged
}

fn write_atomic(path: &Path, list: &PresetList) -> io::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(list)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn freqs(store: &PresetStore) -> Vec<String> {
        store.list().presets_mhz
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name(None), "-");
        assert_eq!(normalize_name(Some("   ")), "-");
        assert_eq!(normalize_name(Some(" NHK FM ")), "NHK FM");
        assert_eq!(normalize_name(Some("a\nb")), "a b");
        assert_eq!(normalize_name(Some("x".repeat(100).as_str())).len(), 64);
    }

    #[test]
    fn test_add_sorts_quantizes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presets.json");
        let store = PresetStore::open(path.clone(), Vec::new());

        store.add(90.04, Some("B"));
        store.add(80.0, None);
        store.add(80.0, Some("A"));
        store.add(90.0, Some("ignored"));
        assert_eq!(freqs(&store), vec!["80.0", "90.0"]);
        assert_eq!(store.list().presets[0].name, "A");
        assert_eq!(store.list().presets[1].name, "B");

        let reopened = PresetStore::open(path, Vec::new());
        assert_eq!(reopened.list(), store.list());
    }

    #[test]
    fn test_update_remove_and_add_many() {
        let dir = tempfile::tempdir().unwrap();
        let store = PresetStore::open(dir.path().join("p.json"), Vec::new());

        store.update_name(81.3, "J-WAVE");
        store.update_name(81.3, "J-WAVE 2");
        assert_eq!(store.list().presets[0].name, "J-WAVE 2");

        let added = store.add_many(&[76.1, f64::NAN, 5.0, 82.5, 81.3]);
        assert_eq!(added, 3);
        assert_eq!(freqs(&store), vec!["76.1", "81.3", "82.5"]);

        store.remove(81.3);
        store.remove(99.9);
        assert_eq!(freqs(&store), vec!["76.1", "82.5"]);
    }

    #[test]
    fn test_fill_range_replaces_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = PresetStore::open(dir.path().join("p.json"), Vec::new());
        store.add(100.0, Some("gone"));

        store.fill_range(76.0, 76.4, 0.2);
        assert_eq!(freqs(&store), vec!["76.0", "76.2", "76.4"]);
        assert!(store.list().presets.iter().all(|p| p.name == "-"));
    }

    #[test]
    fn test_legacy_file_is_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = dir.path().join("old.json");
        fs::write(&legacy, r#"{"presetsMHz": ["80.0", "bogus", "76.1", "80.0", "9000"]}"#).unwrap();
        let primary = dir.path().join("data").join("presets.json");

        let store = PresetStore::open(primary.clone(), vec![legacy]);
        assert_eq!(freqs(&store), vec!["76.1", "80.0"]);
        assert!(primary.is_file());
    }

    #[test]
    fn test_duplicates_prefer_real_names() {
        let list = PresetList {
            presets: vec![
                PresetEntry { freq_mhz: "80.0".into(), name: "-".into() },
                PresetEntry { freq_mhz: "80.02".into(), name: "TOKYO FM".into() },
                PresetEntry { freq_mhz: "2.0".into(), name: "out of band".into() },
            ],
            presets_mhz: Vec::new(),
        };
        let presets = from_wire(&list);
        assert_eq!(presets.len(), 1);
        assert_eq!(presets[0].name, "TOKYO FM");
    }

    #[test]
    fn test_corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presets.json");
        fs::write(&path, "not json").unwrap();
        let store = PresetStore::new(path, Vec::new());
        assert!(!store.load());
        assert!(store.list().presets.is_empty());
    }

    #[test]
    fn test_resolve_directory_path() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            resolve_path(Some(dir.path().to_path_buf())),
            dir.path().join("presets.json")
        );
        let file = dir.path().join("mine.json");
        assert_eq!(resolve_path(Some(file.clone())), file);
    }
}
