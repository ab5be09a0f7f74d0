//! Error types for the fmradio control surface.

use thiserror::Error;

/// Rejections of caller-supplied values.
///
/// The display text is what the HTTP layer hands back in `{"error": ...}`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Neither `freqHz` nor `freqMHz` was provided.
    #[error("Provide freqHz or freqMHz")]
    MissingFrequency,

    /// Tuning frequency outside the supported range.
    #[error("Frequency out of range")]
    FrequencyOutOfRange(i64),

    #[error("bufferSeconds must be between 0 and 60")]
    BufferSeconds(f64),

    #[error("delivery must be one of: direct, hls")]
    Delivery(String),

    #[error("hlsBitrateKbps must be between 32 and 512")]
    SegmentBitrate(i64),

    #[error("format must be one of: mp3, aac, opus")]
    Format(String),

    #[error("rtlGainDb must be between 0 and 100 (or null for auto)")]
    Gain(f64),

    #[error("stereoMode must be one of: auto, stereo, mono")]
    StereoMode(String),

    /// Scan or preset range bounds are invalid.
    #[error("Invalid startMHz/endMHz")]
    ScanRange { start_mhz: f64, end_mhz: f64 },

    #[error("Invalid stepMHz")]
    ScanStep(f64),

    #[error("dwellMs must be between 200 and 10000")]
    ScanDwell(i64),

    /// A preset operation is missing its frequency.
    #[error("Provide freqMHz")]
    MissingPresetFrequency,

    #[error("freqMHz out of range")]
    PresetFrequency(f64),

    #[error("Provide name")]
    MissingPresetName,

    #[error("Provide freqMHzList")]
    EmptyPresetList,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_client_facing() {
        assert_eq!(
            ValidationError::FrequencyOutOfRange(5).to_string(),
            "Frequency out of range"
        );
        assert_eq!(
            ValidationError::Gain(120.0).to_string(),
            "rtlGainDb must be between 0 and 100 (or null for auto)"
        );
        assert_eq!(
            ValidationError::ScanRange { start_mhz: 90.0, end_mhz: 80.0 }.to_string(),
            "Invalid startMHz/endMHz"
        );
    }
}
