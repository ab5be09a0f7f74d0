//! fmradio-server: live FM radio streaming over HTTP.
//!
//! Drives an SDR demodulator and an audio encoder as child processes and
//! serves the result either as a per-listener live stream or as continuously
//! written HLS segments.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use fmradio_protocol::{validate_frequency, StreamingConfigUpdate};
use log::{error, info};

mod hls;
mod logging;
mod pipeline;
mod presets;
mod radio;
mod scan;
mod web;

use pipeline::{ToolConfig, ToolTemplate};
use presets::PresetStore;
use radio::{RadioContext, RadioService, RadioSettings, RadioState};
use web::{WebState, RESTART_EXIT_CODE};

const DEFAULT_CONFIG_FILE: &str = "fmradio.toml";
const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

/// fmradio-server - live FM radio streaming server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address for the HTTP server to listen on
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files
    #[arg(long)]
    log_retention_days: Option<u64>,

    /// Directory the segmented encoder writes into
    #[arg(long)]
    segment_dir: Option<PathBuf>,

    /// Preset file (or directory holding presets.json)
    #[arg(long)]
    presets: Option<PathBuf>,

    /// Demodulator executable
    #[arg(long)]
    demodulator: Option<PathBuf>,

    /// Encoder executable
    #[arg(long)]
    encoder: Option<PathBuf>,

    /// Token required by the restart endpoint
    #[arg(long, env = "FMRADIO_ADMIN_TOKEN")]
    admin_token: Option<String>,

    /// Log scan probe diagnostics
    #[arg(long, env = "FMRADIO_DEBUG_SCAN")]
    debug_scan: bool,
}

/// Configuration file format.
#[derive(Debug, serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    tools: ToolsSection,
    #[serde(default)]
    radio: RadioSection,
    #[serde(default)]
    presets: PresetsSection,
    #[serde(default)]
    logging: LoggingSection,
    #[serde(default)]
    admin: AdminSection,
}

#[derive(Debug, serde::Deserialize, Default)]
struct ServerSection {
    listen: Option<String>,
    segment_dir: Option<String>,
    /// Static player UI served for unmatched paths.
    web_root: Option<String>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct ToolsSection {
    demodulator: Option<String>,
    #[serde(default)]
    demodulator_args: Vec<String>,
    #[serde(default)]
    demodulator_env: BTreeMap<String, String>,
    /// Directory prepended to the demodulator's PATH (driver DLLs, plugins).
    path_prepend: Option<String>,
    encoder: Option<String>,
    #[serde(default)]
    encoder_args: Vec<String>,
    segment_codec: Option<String>,
    pcm_sample_rate: Option<u32>,
    device_sample_rate: Option<u32>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct RadioSection {
    freq_hz: Option<i64>,
    delivery: Option<String>,
    format: Option<String>,
    buffer_seconds: Option<f64>,
    hls_bitrate_kbps: Option<i64>,
    gain_db: Option<f64>,
    /// Automatic gain; overrides `gain_db`.
    auto_gain: Option<bool>,
    agc: Option<bool>,
    stereo_mode: Option<String>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct PresetsSection {
    path: Option<String>,
    /// Older preset files read once when the primary file is missing.
    #[serde(default)]
    legacy_paths: Vec<String>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct LoggingSection {
    log_dir: Option<String>,
    retention_days: Option<u64>,
    level: Option<String>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct AdminSection {
    token: Option<String>,
    debug_scan: Option<bool>,
}

fn load_config(path: &Path) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

/// Initial radio settings: defaults overlaid with the `[radio]` section.
fn radio_settings(section: &RadioSection) -> Result<RadioSettings, Box<dyn std::error::Error>> {
    let update = StreamingConfigUpdate {
        delivery: section.delivery.clone(),
        format: section.format.clone(),
        buffer_seconds: section.buffer_seconds,
        hls_bitrate_kbps: section.hls_bitrate_kbps,
        rtl_gain_db: match section.auto_gain {
            Some(true) => Some(None),
            _ => section.gain_db.map(Some),
        },
        rtl_agc: section.agc,
        stereo_mode: section.stereo_mode.clone(),
        force_stereo: None,
    };
    let change = update.validate()?;

    let mut state = RadioState::new(RadioSettings::default());
    state.apply(&change);
    if let Some(freq_hz) = section.freq_hz {
        state.settings.freq_hz = validate_frequency(freq_hz)?;
    }
    Ok(state.settings)
}

fn tool_config(args: &Args, section: &ToolsSection) -> ToolConfig {
    let defaults = ToolConfig::default();

    let mut demodulator = match args.demodulator.clone().or(section.demodulator.as_ref().map(PathBuf::from)) {
        Some(program) => ToolTemplate::new(program),
        None => defaults.demodulator,
    };
    demodulator.prefix_args = section.demodulator_args.clone();
    demodulator.env = section
        .demodulator_env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    demodulator.path_prepend = section.path_prepend.as_ref().map(PathBuf::from);

    let mut encoder = match args.encoder.clone().or(section.encoder.as_ref().map(PathBuf::from)) {
        Some(program) => ToolTemplate::new(program),
        None => defaults.encoder,
    };
    encoder.prefix_args = section.encoder_args.clone();

    ToolConfig {
        demodulator,
        encoder,
        segment_codec: section.segment_codec.clone().unwrap_or(defaults.segment_codec),
        pcm_sample_rate: section.pcm_sample_rate.unwrap_or(defaults.pcm_sample_rate),
        device_sample_rate: section
            .device_sample_rate
            .unwrap_or(defaults.device_sample_rate),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load config file: explicit path > auto-detect > default
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        default_path.exists().then_some(default_path)
    });
    let file_config = match &config_path {
        Some(path) => match load_config(path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e);
            }
        },
        None => ConfigFile::default(),
    };

    // Command line takes precedence over the file.
    let log_dir = args
        .log_dir
        .clone()
        .or_else(|| file_config.logging.log_dir.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let log_retention_days = args
        .log_retention_days
        .or(file_config.logging.retention_days)
        .unwrap_or(7);
    logging::init_logging(
        &log_dir,
        log_retention_days,
        args.verbose,
        file_config.logging.level.as_deref(),
    )?;

    let listen_addr: SocketAddr = match args.listen {
        Some(addr) => addr,
        None => file_config
            .server
            .listen
            .as_deref()
            .unwrap_or(DEFAULT_LISTEN)
            .parse()?,
    };
    let segment_dir = args
        .segment_dir
        .clone()
        .or_else(|| file_config.server.segment_dir.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| std::env::temp_dir().join("fmradio").join("hls"));
    std::fs::create_dir_all(&segment_dir)?;
    let web_root = file_config.server.web_root.as_ref().map(PathBuf::from);

    let settings = match radio_settings(&file_config.radio) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Invalid [radio] configuration: {}", e);
            return Err(e);
        }
    };
    let tools = tool_config(&args, &file_config.tools);
    let debug_scan = args.debug_scan || file_config.admin.debug_scan.unwrap_or(false);
    let admin_token = args.admin_token.clone().or(file_config.admin.token.clone());

    info!("fmradio-server starting...");
    info!("  Listen address: {}", listen_addr);
    info!("  Segment directory: {}", segment_dir.display());
    info!("  Demodulator: {}", tools.demodulator.program.display());
    info!("  Encoder: {}", tools.encoder.program.display());
    info!(
        "  Initial tuning: {} Hz, delivery {}, format {}",
        settings.freq_hz, settings.delivery, settings.format
    );
    if admin_token.is_some() {
        info!("  Restart endpoint requires an admin token");
    }

    let ctx = Arc::new(
        RadioContext::new(settings, tools, segment_dir.clone()).with_debug_scan(debug_scan),
    );
    let radio = Arc::new(RadioService::new(ctx));

    let presets_path = presets::resolve_path(
        args.presets
            .clone()
            .or_else(|| file_config.presets.path.as_ref().map(PathBuf::from)),
    );
    let legacy_paths = file_config
        .presets
        .legacy_paths
        .iter()
        .map(PathBuf::from)
        .collect();
    let presets = Arc::new(PresetStore::open(presets_path, legacy_paths));
    info!("  Presets: {}", presets.path().display());

    let web_state = Arc::new(WebState::new(Arc::clone(&radio), presets).with_admin_token(admin_token));
    let restart = web_state.restart.clone();

    // Segmented delivery runs from startup so the player can attach at any time.
    radio.ensure_delivery_started();

    // Live streams keep their connections open; stop them so the server can drain.
    let shutdown = {
        let restart = restart.clone();
        let radio = Arc::clone(&radio);
        async move {
            tokio::select! {
                _ = restart.cancelled() => info!("Restart requested, shutting down"),
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => info!("Interrupted, shutting down"),
                    Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
                },
            }
            radio.stop();
        }
    };

    let served = web::start_web_server(
        listen_addr,
        web_state,
        &segment_dir,
        web_root.as_deref(),
        shutdown,
    )
    .await;
    radio.stop();
    // Let the child processes be killed before the runtime goes away.
    tokio::time::sleep(pipeline::TEARDOWN_GRACE * 2).await;
    if let Err(e) = served {
        error!("Web server error: {}", e);
        return Err(e);
    }

    if restart.is_cancelled() {
        info!("Exiting with code {} for restart", RESTART_EXIT_CODE);
        std::process::exit(RESTART_EXIT_CODE);
    }
    info!("fmradio-server stopped");
    Ok(())
}
