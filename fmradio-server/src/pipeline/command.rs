//! Command lines for the demodulator and encoder processes.

use std::env;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use fmradio_protocol::{OutputFormat, StereoMode};

/// Manifest written by the segmented encoder.
pub const MANIFEST_FILE: &str = "stream.m3u8";
const INIT_SEGMENT_FILE: &str = "init.mp4";
const SEGMENT_PATTERN: &str = "seg_%05d.m4s";

/// Target duration of one segment in seconds.
const SEGMENT_SECONDS: f64 = 1.0;

/// Which end of the pipeline a process sits at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Demodulator,
    Encoder,
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessRole::Demodulator => f.write_str("demodulator"),
            ProcessRole::Encoder => f.write_str("encoder"),
        }
    }
}

/// A fully resolved process launch description.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub role: ProcessRole,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, OsString)>,
}

impl ProcessSpec {
    pub fn new(role: ProcessRole, program: impl Into<PathBuf>) -> Self {
        Self {
            role,
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Locate the program, searching `PATH` when it is a bare name.
    pub fn resolve_program(&self) -> Option<PathBuf> {
        let search_path = self
            .env
            .iter()
            .find(|(key, _)| key == "PATH")
            .map(|(_, value)| value.clone())
            .or_else(|| env::var_os("PATH"));
        resolve_executable(&self.program, search_path.as_deref())
    }
}

fn resolve_executable(program: &Path, search_path: Option<&std::ffi::OsStr>) -> Option<PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        return program.is_file().then(|| program.to_path_buf());
    }
    let search_path = search_path?;
    env::split_paths(search_path).find_map(|dir| {
        let candidate = dir.join(program);
        if candidate.is_file() {
            return Some(candidate);
        }
        if cfg!(windows) && candidate.extension().is_none() {
            let exe = candidate.with_extension("exe");
            if exe.is_file() {
                return Some(exe);
            }
        }
        None
    })
}

/// Program plus fixed leading arguments and environment for one tool.
#[derive(Debug, Clone)]
pub struct ToolTemplate {
    pub program: PathBuf,
    /// Arguments placed before the generated ones (wrappers, scripts).
    pub prefix_args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Directory prepended to `PATH` for the child when it exists.
    pub path_prepend: Option<PathBuf>,
}

impl ToolTemplate {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            env: Vec::new(),
            path_prepend: None,
        }
    }

    fn spec(&self, role: ProcessRole) -> ProcessSpec {
        let mut spec = ProcessSpec::new(role, self.program.clone()).args(self.prefix_args.clone());
        spec.env = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), OsString::from(v)))
            .collect();
        if let Some(dir) = self.path_prepend.as_ref().filter(|d| d.is_dir()) {
            let mut paths = vec![dir.clone()];
            if let Some(current) = env::var_os("PATH") {
                paths.extend(env::split_paths(&current));
            }
            if let Ok(joined) = env::join_paths(paths) {
                spec.env.push(("PATH".to_string(), joined));
            }
        }
        spec
    }
}

/// Tuning inputs shared by every demodulator launch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tuning {
    pub freq_hz: i64,
    /// `None` selects automatic gain.
    pub gain_db: Option<f64>,
    pub agc: bool,
    pub stereo_mode: StereoMode,
}

/// External tool configuration.
#[derive(Debug, Clone)]
pub struct ToolConfig {
    pub demodulator: ToolTemplate,
    pub encoder: ToolTemplate,
    /// Audio codec used for segmented output.
    pub segment_codec: String,
    /// PCM rate the demodulator emits.
    pub pcm_sample_rate: u32,
    /// Sample rate requested from the SDR device.
    pub device_sample_rate: u32,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            demodulator: ToolTemplate::new("softfm"),
            encoder: ToolTemplate::new("ffmpeg"),
            segment_codec: "aac".to_string(),
            pcm_sample_rate: 48_000,
            device_sample_rate: 1_000_000,
        }
    }
}

impl ToolConfig {
    /// Demodulator writing raw S16LE PCM to stdout.
    pub fn demodulator_spec(&self, tuning: &Tuning) -> ProcessSpec {
        let mut args: Vec<String> = Vec::new();
        match tuning.stereo_mode {
            StereoMode::Mono => args.push("--mono".into()),
            StereoMode::Stereo => args.push("--force-stereo".into()),
            StereoMode::Auto => {}
        }
        args.extend([
            "-t".to_string(),
            "rtlsdr".to_string(),
            "-r".to_string(),
            self.pcm_sample_rate.to_string(),
            "-c".to_string(),
            device_config(tuning, self.device_sample_rate),
            "-R".to_string(),
            "-".to_string(),
        ]);
        self.demodulator.spec(ProcessRole::Demodulator).args(args)
    }

    /// Encoder turning PCM on stdin into a live stream on stdout.
    pub fn live_encoder_spec(&self, format: OutputFormat, channels: u8) -> ProcessSpec {
        let mut args = self.pcm_input_args(channels);
        let codec: &[&str] = match format {
            OutputFormat::Mp3 => &["-c:a", "libmp3lame", "-b:a", "192k", "-flush_packets", "1", "-f", "mp3"],
            OutputFormat::Aac => &[
                "-c:a", "aac", "-b:a", "192k",
                "-movflags", "+frag_keyframe+empty_moov+default_base_moof",
                "-muxdelay", "0", "-muxpreload", "0",
                "-flush_packets", "1", "-f", "mp4",
            ],
            OutputFormat::Opus => &[
                "-c:a", "libopus", "-b:a", "96k", "-vbr", "on",
                "-compression_level", "10", "-application", "audio",
                "-cluster_time_limit", "1000", "-cluster_size_limit", "0",
                "-flush_packets", "1", "-f", "webm",
            ],
        };
        args.extend(codec.iter().map(|s| s.to_string()));
        args.push("pipe:1".to_string());
        self.encoder.spec(ProcessRole::Encoder).args(args)
    }

    /// Encoder writing HLS segments into `dir` with relative file names.
    pub fn segment_encoder_spec(
        &self,
        dir: &Path,
        bitrate_kbps: u32,
        buffer_seconds: f64,
        channels: u8,
    ) -> ProcessSpec {
        let mut args = self.pcm_input_args(channels);
        args.extend([
            "-c:a".to_string(),
            self.segment_codec.clone(),
            "-b:a".to_string(),
            format!("{}k", bitrate_kbps),
            "-f".to_string(),
            "hls".to_string(),
            "-hls_time".to_string(),
            format!("{:.1}", SEGMENT_SECONDS),
            "-hls_list_size".to_string(),
            segment_list_size(buffer_seconds).to_string(),
            "-hls_flags".to_string(),
            "delete_segments+append_list+independent_segments+omit_endlist".to_string(),
            "-hls_allow_cache".to_string(),
            "0".to_string(),
            "-hls_segment_type".to_string(),
            "fmp4".to_string(),
            "-hls_fmp4_init_filename".to_string(),
            INIT_SEGMENT_FILE.to_string(),
            "-hls_segment_filename".to_string(),
            SEGMENT_PATTERN.to_string(),
            MANIFEST_FILE.to_string(),
        ]);
        self.encoder
            .spec(ProcessRole::Encoder)
            .args(args)
            .working_dir(dir)
    }

    fn pcm_input_args(&self, channels: u8) -> Vec<String> {
        let channels = if channels == 1 { 1 } else { 2 };
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "warning".into(),
            "-f".into(),
            "s16le".into(),
            "-ar".into(),
            self.pcm_sample_rate.to_string(),
            "-ac".into(),
            channels.to_string(),
            "-i".into(),
            "pipe:0".into(),
        ]
    }
}

/// Device option string, e.g. `freq=88100000,srate=1000000,gain=19.7,agc`.
fn device_config(tuning: &Tuning, device_sample_rate: u32) -> String {
    let gain = match tuning.gain_db {
        Some(db) => format!("gain={:.1}", db),
        None => "gain=auto".to_string(),
    };
    let agc = if tuning.agc { ",agc" } else { "" };
    format!(
        "freq={},srate={},{}{}",
        tuning.freq_hz, device_sample_rate, gain, agc
    )
}

/// Number of segments kept in the manifest.
pub fn segment_list_size(buffer_seconds: f64) -> u32 {
    (buffer_seconds.max(1.0) / SEGMENT_SECONDS).ceil().clamp(2.0, 20.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning(stereo_mode: StereoMode) -> Tuning {
        Tuning {
            freq_hz: 88_100_000,
            gain_db: Some(19.7),
            agc: false,
            stereo_mode,
        }
    }

    #[test]
    fn test_demodulator_args() {
        let tools = ToolConfig::default();
        let spec = tools.demodulator_spec(&tuning(StereoMode::Auto));
        assert_eq!(spec.role, ProcessRole::Demodulator);
        assert_eq!(
            spec.args,
            vec!["-t", "rtlsdr", "-r", "48000", "-c", "freq=88100000,srate=1000000,gain=19.7", "-R", "-"]
        );

        let mut t = tuning(StereoMode::Mono);
        t.gain_db = None;
        t.agc = true;
        let spec = tools.demodulator_spec(&t);
        assert_eq!(spec.args[0], "--mono");
        assert!(spec.args.contains(&"freq=88100000,srate=1000000,gain=auto,agc".to_string()));

        let spec = tools.demodulator_spec(&tuning(StereoMode::Stereo));
        assert_eq!(spec.args[0], "--force-stereo");
    }

    #[test]
    fn test_prefix_args_come_first() {
        let mut tools = ToolConfig::default();
        tools.demodulator.prefix_args = vec!["-c".into(), "exec softfm \"$@\"".into(), "sh".into()];
        let spec = tools.demodulator_spec(&tuning(StereoMode::Auto));
        assert_eq!(&spec.args[..3], &["-c", "exec softfm \"$@\"", "sh"]);
        assert_eq!(spec.args[3], "-t");
    }

    #[test]
    fn test_live_encoder_args() {
        let tools = ToolConfig::default();
        let spec = tools.live_encoder_spec(OutputFormat::Opus, 1);
        assert!(spec.args.windows(2).any(|w| w == ["-ac", "1"]));
        assert!(spec.args.windows(2).any(|w| w == ["-c:a", "libopus"]));
        assert_eq!(spec.args.last().map(String::as_str), Some("pipe:1"));

        let spec = tools.live_encoder_spec(OutputFormat::Mp3, 2);
        assert!(spec.args.windows(2).any(|w| w == ["-ac", "2"]));
        assert!(spec.args.windows(2).any(|w| w == ["-f", "mp3"]));
    }

    #[test]
    fn test_segment_encoder_args() {
        let tools = ToolConfig::default();
        let spec = tools.segment_encoder_spec(Path::new("/tmp/hls"), 320, 2.0, 2);
        assert_eq!(spec.working_dir.as_deref(), Some(Path::new("/tmp/hls")));
        assert!(spec.args.windows(2).any(|w| w == ["-b:a", "320k"]));
        assert!(spec.args.windows(2).any(|w| w == ["-hls_list_size", "2"]));
        assert_eq!(spec.args.last().map(String::as_str), Some(MANIFEST_FILE));
    }

    #[test]
    fn test_segment_list_size() {
        assert_eq!(segment_list_size(0.0), 2);
        assert_eq!(segment_list_size(2.5), 3);
        assert_eq!(segment_list_size(60.0), 20);
    }

    #[test]
    fn test_resolve_missing_program() {
        let spec = ProcessSpec::new(ProcessRole::Encoder, "definitely-not-installed-fmradio-tool");
        assert!(spec.resolve_program().is_none());

        let spec = ProcessSpec::new(ProcessRole::Encoder, "/nonexistent/dir/tool");
        assert!(spec.resolve_program().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_absolute_program() {
        let spec = ProcessSpec::new(ProcessRole::Encoder, "/bin/sh");
        assert_eq!(spec.resolve_program(), Some(PathBuf::from("/bin/sh")));
    }
}
