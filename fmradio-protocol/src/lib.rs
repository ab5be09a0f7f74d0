//! Wire and domain types for the fmradio live streaming server.
//!
//! This crate defines the JSON vocabulary spoken between the fmradio server
//! and its web clients, together with the validation rules applied to every
//! caller-supplied value before it reaches the radio core.
//!
//! # Example
//!
//! ```rust
//! use fmradio_protocol::{OutputFormat, StartRequest, StreamingConfigUpdate};
//!
//! let start = StartRequest { freq_hz: None, freq_mhz: Some(80.0) };
//! assert_eq!(start.resolve_hz().unwrap(), 80_000_000);
//!
//! let update = StreamingConfigUpdate {
//!     format: Some("opus".to_string()),
//!     ..Default::default()
//! };
//! let change = update.validate().unwrap();
//! assert_eq!(change.format, Some(OutputFormat::Opus));
//! ```

pub mod error;
pub mod types;

pub use error::ValidationError;
pub use types::{
    format_mhz, mhz_to_hz, quantize_hz, validate_band, validate_frequency,
    // Enumerations
    Delivery, OutputFormat, StereoMode, ThresholdLevel,
    // Radio control
    ConfigSnapshot, StartRequest, StatusSnapshot, StreamingConfigChange, StreamingConfigUpdate,
    // Scan
    ScanPlan, ScanReport, ScanRequest, ScanResultEntry,
    // Presets
    PresetBatchRequest, PresetEntry, PresetFillRequest, PresetList, PresetRequest,
    // Limits
    FREQUENCY_QUANTUM_HZ, MAX_BAND_MHZ, MAX_BUFFER_SECONDS, MAX_FREQUENCY_HZ, MAX_GAIN_DB,
    MAX_SEGMENT_BITRATE_KBPS, MIN_BAND_MHZ, MIN_FREQUENCY_HZ, MIN_SEGMENT_BITRATE_KBPS,
};
