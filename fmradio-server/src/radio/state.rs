//! Radio configuration and observed state.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fmradio_protocol::{
    ConfigSnapshot, Delivery, OutputFormat, StereoMode, StreamingConfigChange, MAX_BUFFER_SECONDS,
    MAX_GAIN_DB, MAX_SEGMENT_BITRATE_KBPS, MIN_SEGMENT_BITRATE_KBPS,
};
use parking_lot::Mutex;

use crate::pipeline::{parse_stats, DeviceLock, TailObserver, ToolConfig, Tuning};

/// User-adjustable settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RadioSettings {
    pub freq_hz: i64,
    pub delivery: Delivery,
    pub format: OutputFormat,
    pub buffer_seconds: f64,
    pub segment_bitrate_kbps: u32,
    /// `None` selects automatic gain.
    pub gain_db: Option<f64>,
    pub agc: bool,
    pub stereo_mode: StereoMode,
}

impl Default for RadioSettings {
    fn default() -> Self {
        Self {
            freq_hz: 80_000_000,
            delivery: Delivery::Segmented,
            format: OutputFormat::Mp3,
            buffer_seconds: 2.0,
            segment_bitrate_kbps: 320,
            gain_db: Some(19.7),
            agc: false,
            stereo_mode: StereoMode::Auto,
        }
    }
}

/// Settings plus what the running pipeline has reported.
#[derive(Debug, Clone, Default)]
pub struct RadioState {
    pub settings: RadioSettings,
    pub stereo_detected: Option<bool>,
    pub pilot_level: Option<f64>,
    pub stereo_updated: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl RadioState {
    pub fn new(settings: RadioSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    /// Tuning for the configured frequency.
    pub fn tuning(&self) -> Tuning {
        self.tuning_at(self.settings.freq_hz)
    }

    /// Tuning with the configured gain and stereo mode at another frequency.
    pub fn tuning_at(&self, freq_hz: i64) -> Tuning {
        Tuning {
            freq_hz,
            gain_db: self.settings.gain_db,
            agc: self.settings.agc,
            stereo_mode: self.settings.stereo_mode,
        }
    }

    /// A pipeline is starting: mono until the demodulator reports a pilot.
    pub fn begin_pipeline(&mut self) {
        self.stereo_detected = Some(false);
        self.pilot_level = None;
        self.stereo_updated = Some(Utc::now());
    }

    /// Tuning changed: nothing is known about the new station yet.
    pub fn forget_stereo(&mut self) {
        self.stereo_detected = None;
        self.pilot_level = None;
        self.stereo_updated = None;
    }

    /// Apply a validated change, clamping numeric fields.
    pub fn apply(&mut self, change: &StreamingConfigChange) {
        let settings = &mut self.settings;
        if let Some(delivery) = change.delivery {
            settings.delivery = delivery;
        }
        if let Some(format) = change.format {
            settings.format = format;
        }
        if let Some(seconds) = change.buffer_seconds {
            settings.buffer_seconds = seconds.clamp(0.0, MAX_BUFFER_SECONDS);
        }
        if let Some(kbps) = change.segment_bitrate_kbps {
            settings.segment_bitrate_kbps =
                kbps.clamp(MIN_SEGMENT_BITRATE_KBPS, MAX_SEGMENT_BITRATE_KBPS);
        }
        if let Some(gain) = change.gain_db {
            settings.gain_db = gain.map(|db| db.clamp(0.0, MAX_GAIN_DB));
        }
        if let Some(agc) = change.agc {
            settings.agc = agc;
        }
        if let Some(mode) = change.stereo_mode {
            settings.stereo_mode = mode;
        }
        self.last_error = None;
    }

    pub fn config_snapshot(&self) -> ConfigSnapshot {
        let s = &self.settings;
        ConfigSnapshot {
            delivery: s.delivery,
            format: s.format,
            buffer_seconds: s.buffer_seconds,
            hls_bitrate_kbps: s.segment_bitrate_kbps,
            rtl_gain_db: s.gain_db,
            rtl_agc: s.agc,
            stereo_mode: s.stereo_mode,
            force_stereo: s.stereo_mode.forces_stereo(),
        }
    }
}

/// Shared context handed to every pipeline owner.
pub struct RadioContext {
    pub state: Mutex<RadioState>,
    pub tools: ToolConfig,
    pub device: DeviceLock,
    /// Directory the segmented encoder writes into.
    pub segment_dir: PathBuf,
    /// Log scan probe diagnostics as they arrive.
    pub debug_scan: bool,
}

impl RadioContext {
    pub fn new(settings: RadioSettings, tools: ToolConfig, segment_dir: PathBuf) -> Self {
        Self {
            state: Mutex::new(RadioState::new(settings)),
            tools,
            device: DeviceLock::new(),
            segment_dir,
            debug_scan: false,
        }
    }

    pub fn with_debug_scan(mut self, debug_scan: bool) -> Self {
        self.debug_scan = debug_scan;
        self
    }

    pub fn record_error(&self, message: impl Into<String>) {
        self.state.lock().last_error = Some(message.into());
    }
}

/// Feeds stereo lock changes from a live or continuous pipeline into the state.
pub struct StereoTracker {
    ctx: Arc<RadioContext>,
}

impl StereoTracker {
    pub fn new(ctx: Arc<RadioContext>) -> Self {
        Self { ctx }
    }
}

impl TailObserver for StereoTracker {
    fn observe(&self, tail: &str) {
        let stats = parse_stats(tail);
        let Some(stereo) = stats.stereo else {
            return;
        };
        let mut state = self.ctx.state.lock();
        state.stereo_detected = Some(stereo);
        if stereo {
            if let Some(pilot) = stats.pilot_level {
                state.pilot_level = Some(pilot);
            }
        }
        state.stereo_updated = Some(Utc::now());
    }
}
