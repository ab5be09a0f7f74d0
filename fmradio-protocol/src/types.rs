//! Domain vocabulary and JSON message types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ValidationError;

/// Lowest tunable frequency in Hz.
pub const MIN_FREQUENCY_HZ: i64 = 10_000_000;

/// Highest tunable frequency in Hz.
pub const MAX_FREQUENCY_HZ: i64 = 2_200_000_000;

/// Grid used for scan probes and presets (100 kHz).
pub const FREQUENCY_QUANTUM_HZ: i64 = 100_000;

pub const MAX_BUFFER_SECONDS: f64 = 60.0;
pub const MIN_SEGMENT_BITRATE_KBPS: u32 = 32;
pub const MAX_SEGMENT_BITRATE_KBPS: u32 = 512;
pub const MAX_GAIN_DB: f64 = 100.0;

/// Band limits accepted by scan and preset requests, in MHz.
pub const MIN_BAND_MHZ: f64 = 10.0;
pub const MAX_BAND_MHZ: f64 = 3000.0;
pub const MAX_STEP_MHZ: f64 = 10.0;

pub const MIN_DWELL_MS: u64 = 200;
pub const MAX_DWELL_MS: u64 = 10_000;

/// Convert a MHz value to whole Hz.
pub fn mhz_to_hz(mhz: f64) -> i64 {
    (mhz * 1_000_000.0).round() as i64
}

/// Snap a frequency to the nearest 100 kHz grid point.
pub fn quantize_hz(hz: i64) -> i64 {
    (hz as f64 / FREQUENCY_QUANTUM_HZ as f64).round() as i64 * FREQUENCY_QUANTUM_HZ
}

/// Format Hz as MHz with one decimal, the form used on the wire.
pub fn format_mhz(hz: i64) -> String {
    format!("{:.1}", hz as f64 / 1_000_000.0)
}

fn in_band(mhz: f64) -> bool {
    (MIN_BAND_MHZ..=MAX_BAND_MHZ).contains(&mhz)
}

/// Deserialize helper separating an absent field from an explicit `null`.
///
/// Absent stays `None` (via `#[serde(default)]`), `null` becomes `Some(None)`.
fn explicit_null<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

// ============================================================================
// Enumerations
// ============================================================================

/// Stereo decoding policy passed to the demodulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StereoMode {
    /// Let the demodulator decide from the pilot tone.
    #[default]
    Auto,
    /// Force stereo decoding.
    Stereo,
    /// Force mono output (single PCM channel).
    Mono,
}

impl StereoMode {
    pub fn as_str(self) -> &'static str {
        match self {
            StereoMode::Auto => "auto",
            StereoMode::Stereo => "stereo",
            StereoMode::Mono => "mono",
        }
    }

    /// Mapping for clients that only know the boolean `forceStereo` flag.
    pub fn from_force_flag(force_stereo: bool) -> Self {
        if force_stereo {
            StereoMode::Stereo
        } else {
            StereoMode::Auto
        }
    }

    pub fn forces_stereo(self) -> bool {
        self == StereoMode::Stereo
    }

    /// Number of interleaved PCM channels the demodulator emits.
    pub fn channels(self) -> u8 {
        match self {
            StereoMode::Mono => 1,
            _ => 2,
        }
    }
}

impl FromStr for StereoMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "off" => Ok(StereoMode::Auto),
            "stereo" | "on" | "force" | "forcestereo" => Ok(StereoMode::Stereo),
            "mono" => Ok(StereoMode::Mono),
            _ => Err(ValidationError::StereoMode(s.to_string())),
        }
    }
}

impl fmt::Display for StereoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How audio reaches listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Delivery {
    /// Per-request live stream.
    #[serde(rename = "direct")]
    Direct,
    /// Continuous HLS segment output.
    #[default]
    #[serde(rename = "hls", alias = "segmented")]
    Segmented,
}

impl Delivery {
    pub fn as_str(self) -> &'static str {
        match self {
            Delivery::Direct => "direct",
            Delivery::Segmented => "hls",
        }
    }
}

impl FromStr for Delivery {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Delivery::Direct),
            "hls" | "segmented" => Ok(Delivery::Segmented),
            _ => Err(ValidationError::Delivery(s.to_string())),
        }
    }
}

impl fmt::Display for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container/codec of a live stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Mp3,
    Aac,
    Opus,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "mp3",
            OutputFormat::Aac => "aac",
            OutputFormat::Opus => "opus",
        }
    }

    /// HTTP content type of the encoded stream.
    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "audio/mpeg",
            OutputFormat::Aac => "audio/mp4; codecs=mp4a.40.2",
            OutputFormat::Opus => "audio/webm; codecs=opus",
        }
    }

    /// Encoder bitrate used for live streams, also the basis of buffer sizing.
    pub fn live_bitrate_kbps(self) -> u32 {
        match self {
            OutputFormat::Mp3 | OutputFormat::Aac => 192,
            OutputFormat::Opus => 96,
        }
    }
}

impl FromStr for OutputFormat {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp3" => Ok(OutputFormat::Mp3),
            "aac" => Ok(OutputFormat::Aac),
            "opus" => Ok(OutputFormat::Opus),
            _ => Err(ValidationError::Format(s.to_string())),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Peak acceptance threshold above the scan noise floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdLevel {
    Weak,
    #[default]
    Medium,
    Strong,
}

impl ThresholdLevel {
    pub fn offset_db(self) -> f64 {
        match self {
            ThresholdLevel::Weak => 6.0,
            ThresholdLevel::Medium => 10.0,
            ThresholdLevel::Strong => 14.0,
        }
    }

    /// Lenient parse: anything unrecognised falls back to medium.
    pub fn parse_lenient(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "weak" => ThresholdLevel::Weak,
            Some(v) if v == "strong" => ThresholdLevel::Strong,
            _ => ThresholdLevel::Medium,
        }
    }
}

// ============================================================================
// Status / configuration
// ============================================================================

/// Point-in-time view of the radio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub freq_hz: i64,
    /// A live lease is active or continuous output is running.
    pub streaming: bool,
    pub hls_running: bool,
    pub scan_running: bool,
    pub scan_done: usize,
    pub scan_total: usize,
    /// `None` until the first pipeline of the current tuning starts.
    pub stereo_detected: Option<bool>,
    pub pilot_level: Option<f64>,
    pub stereo_updated_utc: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub delivery: Delivery,
    pub stereo_mode: StereoMode,
    pub force_stereo: bool,
}

/// Persistent streaming configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    pub delivery: Delivery,
    pub format: OutputFormat,
    pub buffer_seconds: f64,
    pub hls_bitrate_kbps: u32,
    /// `None` selects automatic gain.
    pub rtl_gain_db: Option<f64>,
    pub rtl_agc: bool,
    pub stereo_mode: StereoMode,
    pub force_stereo: bool,
}

/// Body of `POST /api/start`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub freq_hz: Option<i64>,
    #[serde(rename = "freqMHz")]
    pub freq_mhz: Option<f64>,
}

impl StartRequest {
    /// Resolve to Hz, preferring `freqHz`, and range-check.
    pub fn resolve_hz(&self) -> Result<i64, ValidationError> {
        let hz = match (self.freq_hz, self.freq_mhz) {
            (Some(hz), _) => hz,
            (None, Some(mhz)) if mhz.is_finite() => mhz_to_hz(mhz),
            (None, Some(_)) => return Err(ValidationError::FrequencyOutOfRange(0)),
            (None, None) => return Err(ValidationError::MissingFrequency),
        };
        validate_frequency(hz)
    }
}

/// Range-check a tuning frequency.
pub fn validate_frequency(hz: i64) -> Result<i64, ValidationError> {
    if (MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&hz) {
        Ok(hz)
    } else {
        Err(ValidationError::FrequencyOutOfRange(hz))
    }
}

/// Partial configuration update; absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingConfigUpdate {
    pub delivery: Option<String>,
    pub format: Option<String>,
    pub buffer_seconds: Option<f64>,
    pub hls_bitrate_kbps: Option<i64>,
    /// Absent keeps the gain, `null` switches to automatic gain.
    #[serde(default, deserialize_with = "explicit_null")]
    pub rtl_gain_db: Option<Option<f64>>,
    pub rtl_agc: Option<bool>,
    pub stereo_mode: Option<String>,
    /// Legacy flag, only honoured when `stereoMode` is absent.
    pub force_stereo: Option<bool>,
}

/// A validated [`StreamingConfigUpdate`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamingConfigChange {
    pub delivery: Option<Delivery>,
    pub format: Option<OutputFormat>,
    pub buffer_seconds: Option<f64>,
    pub segment_bitrate_kbps: Option<u32>,
    pub gain_db: Option<Option<f64>>,
    pub agc: Option<bool>,
    pub stereo_mode: Option<StereoMode>,
}

impl StreamingConfigUpdate {
    /// Validate every present field; the first violation rejects the update.
    pub fn validate(&self) -> Result<StreamingConfigChange, ValidationError> {
        let buffer_seconds = match self.buffer_seconds {
            Some(v) if !(0.0..=MAX_BUFFER_SECONDS).contains(&v) => {
                return Err(ValidationError::BufferSeconds(v))
            }
            other => other,
        };
        let delivery = self.delivery.as_deref().map(str::parse).transpose()?;
        let segment_bitrate_kbps = match self.hls_bitrate_kbps {
            Some(v)
                if !(MIN_SEGMENT_BITRATE_KBPS as i64..=MAX_SEGMENT_BITRATE_KBPS as i64)
                    .contains(&v) =>
            {
                return Err(ValidationError::SegmentBitrate(v))
            }
            other => other.map(|v| v as u32),
        };
        let format = self.format.as_deref().map(str::parse).transpose()?;
        let gain_db = match self.rtl_gain_db {
            Some(Some(v)) if !(0.0..=MAX_GAIN_DB).contains(&v) => {
                return Err(ValidationError::Gain(v))
            }
            other => other,
        };
        let stereo_mode = match (&self.stereo_mode, self.force_stereo) {
            (Some(mode), _) => Some(mode.parse()?),
            (None, Some(force)) => Some(StereoMode::from_force_flag(force)),
            (None, None) => None,
        };

        Ok(StreamingConfigChange {
            delivery,
            format,
            buffer_seconds,
            segment_bitrate_kbps,
            gain_db,
            agc: self.rtl_agc,
            stereo_mode,
        })
    }
}

// ============================================================================
// Scan
// ============================================================================

/// Body of `POST /api/scan/start`; missing fields take the wide FM band defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    #[serde(rename = "startMHz")]
    pub start_mhz: Option<f64>,
    #[serde(rename = "endMHz")]
    pub end_mhz: Option<f64>,
    #[serde(rename = "stepMHz")]
    pub step_mhz: Option<f64>,
    pub dwell_ms: Option<i64>,
}

/// Validated scan parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanPlan {
    pub start_mhz: f64,
    pub end_mhz: f64,
    pub step_mhz: f64,
    pub dwell_ms: u64,
}

impl Default for ScanPlan {
    fn default() -> Self {
        Self {
            start_mhz: 76.0,
            end_mhz: 95.0,
            step_mhz: 0.1,
            dwell_ms: 600,
        }
    }
}

/// Check a `[start, end]` band with a step, shared by scan and preset fill.
pub fn validate_band(start_mhz: f64, end_mhz: f64, step_mhz: f64) -> Result<(), ValidationError> {
    if !in_band(start_mhz) || !in_band(end_mhz) || start_mhz > end_mhz {
        return Err(ValidationError::ScanRange { start_mhz, end_mhz });
    }
    if !(step_mhz > 0.0 && step_mhz <= MAX_STEP_MHZ) {
        return Err(ValidationError::ScanStep(step_mhz));
    }
    Ok(())
}

impl ScanRequest {
    pub fn validate(&self) -> Result<ScanPlan, ValidationError> {
        let defaults = ScanPlan::default();
        let start_mhz = self.start_mhz.unwrap_or(defaults.start_mhz);
        let end_mhz = self.end_mhz.unwrap_or(defaults.end_mhz);
        let step_mhz = self.step_mhz.unwrap_or(defaults.step_mhz);
        validate_band(start_mhz, end_mhz, step_mhz)?;

        let dwell_ms = self.dwell_ms.unwrap_or(defaults.dwell_ms as i64);
        if !(MIN_DWELL_MS as i64..=MAX_DWELL_MS as i64).contains(&dwell_ms) {
            return Err(ValidationError::ScanDwell(dwell_ms));
        }

        Ok(ScanPlan {
            start_mhz,
            end_mhz,
            step_mhz,
            dwell_ms: dwell_ms as u64,
        })
    }
}

/// One reported station (or raw probe).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResultEntry {
    /// Probe frequency formatted with one decimal.
    #[serde(rename = "freqMHz")]
    pub freq_mhz: String,
    /// Frequency the demodulator reported it actually tuned.
    #[serde(rename = "tunedMHz")]
    pub tuned_mhz: Option<f64>,
    pub if_db: Option<f64>,
    pub bb_db: Option<f64>,
    pub audio_db: Option<f64>,
    pub stereo: bool,
    pub pilot_level: Option<f64>,
}

/// Scan progress and results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub running: bool,
    pub started_utc: Option<DateTime<Utc>>,
    pub total: usize,
    pub done: usize,
    pub error: Option<String>,
    pub raw: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub threshold_level: Option<ThresholdLevel>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub threshold_offset_db: Option<f64>,
    pub raw_count: usize,
    pub filtered_count: usize,
    pub noise_floor_if_db: Option<f64>,
    pub if_threshold_db: Option<f64>,
    #[serde(rename = "clusterGapMHz")]
    pub cluster_gap_mhz: f64,
    pub results: Vec<ScanResultEntry>,
}

// ============================================================================
// Presets
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetEntry {
    #[serde(rename = "freqMHz")]
    pub freq_mhz: String,
    pub name: String,
}

/// Preset list as stored on disk and returned by the API.
///
/// `presetsMHz` duplicates the frequencies for older readers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetList {
    #[serde(default)]
    pub presets: Vec<PresetEntry>,
    #[serde(rename = "presetsMHz", default)]
    pub presets_mhz: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PresetFillRequest {
    #[serde(rename = "startMHz")]
    pub start_mhz: Option<f64>,
    #[serde(rename = "endMHz")]
    pub end_mhz: Option<f64>,
    #[serde(rename = "stepMHz")]
    pub step_mhz: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PresetRequest {
    #[serde(rename = "freqMHz")]
    pub freq_mhz: Option<f64>,
    pub name: Option<String>,
}

impl PresetRequest {
    /// Frequency presence and band check.
    pub fn frequency(&self) -> Result<f64, ValidationError> {
        let mhz = self.freq_mhz.ok_or(ValidationError::MissingPresetFrequency)?;
        if !in_band(mhz) {
            return Err(ValidationError::PresetFrequency(mhz));
        }
        Ok(mhz)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PresetBatchRequest {
    #[serde(rename = "freqMHzList")]
    pub freq_mhz_list: Option<Vec<f64>>,
}
