//! HTTP API endpoints for tuning, streaming, presets and scanning.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use fmradio_protocol::{
    validate_band, OutputFormat, PresetBatchRequest, PresetFillRequest, PresetRequest,
    ScanRequest, StartRequest, StreamingConfigUpdate, ThresholdLevel, ValidationError,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::web::state::{WebState, RESTART_EXIT_CODE};

/// In-memory pipe between the relay and the response body.
const STREAM_PIPE_BYTES: usize = 64 * 1024;

/// Time given to the restart response before the server shuts down.
const RESTART_DELAY: Duration = Duration::from_millis(300);

// ============================================================================
// Query parameters
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ScanStatusQuery {
    pub raw: Option<String>,
    pub level: Option<String>,
}

impl ScanStatusQuery {
    fn is_raw(&self) -> bool {
        self.raw
            .as_deref()
            .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub fmt: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AdminQuery {
    pub token: Option<String>,
}

fn bad_request(e: ValidationError) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response()
}

// ============================================================================
// Radio control
// ============================================================================

pub async fn get_status(State(web_state): State<Arc<WebState>>) -> impl IntoResponse {
    Json(web_state.radio.status())
}

pub async fn get_config(State(web_state): State<Arc<WebState>>) -> impl IntoResponse {
    Json(web_state.radio.config())
}

/// Update the streaming configuration and restart whatever is running.
pub async fn update_config(
    State(web_state): State<Arc<WebState>>,
    Json(update): Json<StreamingConfigUpdate>,
) -> Response {
    match web_state.radio.set_streaming_config(&update, true) {
        Ok(snapshot) => {
            web_state.radio.ensure_delivery_started();
            Json(snapshot).into_response()
        }
        Err(e) => bad_request(e),
    }
}

/// Tune to a new frequency and (re)start delivery.
pub async fn start(
    State(web_state): State<Arc<WebState>>,
    Json(request): Json<StartRequest>,
) -> Response {
    let freq_hz = match request.resolve_hz() {
        Ok(hz) => hz,
        Err(e) => return bad_request(e),
    };
    if let Err(e) = web_state.radio.set_frequency(freq_hz, true) {
        return bad_request(e);
    }
    web_state.radio.ensure_delivery_started();
    Json(web_state.radio.status()).into_response()
}

pub async fn stop(State(web_state): State<Arc<WebState>>) -> impl IntoResponse {
    web_state.radio.stop();
    Json(web_state.radio.status())
}

pub async fn hls_ready(State(web_state): State<Arc<WebState>>) -> impl IntoResponse {
    match web_state.radio.segmented_readiness() {
        Ok(()) => Json(json!({ "ready": true })),
        Err(reason) => Json(json!({ "ready": false, "reason": reason.reason() })),
    }
}

// ============================================================================
// Presets
// ============================================================================

pub async fn get_presets(State(web_state): State<Arc<WebState>>) -> impl IntoResponse {
    Json(web_state.presets.list())
}

/// Replace the presets with a regular grid (wide FM band by default).
pub async fn fill_presets(
    State(web_state): State<Arc<WebState>>,
    request: Option<Json<PresetFillRequest>>,
) -> Response {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let start_mhz = request.start_mhz.unwrap_or(76.0);
    let end_mhz = request.end_mhz.unwrap_or(95.0);
    let step_mhz = request.step_mhz.unwrap_or(0.1);
    if let Err(e) = validate_band(start_mhz, end_mhz, step_mhz) {
        return bad_request(e);
    }
    web_state.presets.fill_range(start_mhz, end_mhz, step_mhz);
    Json(web_state.presets.list()).into_response()
}

pub async fn add_preset(
    State(web_state): State<Arc<WebState>>,
    Json(request): Json<PresetRequest>,
) -> Response {
    let mhz = match request.frequency() {
        Ok(mhz) => mhz,
        Err(e) => return bad_request(e),
    };
    web_state.presets.add(mhz, request.name.as_deref());
    Json(web_state.presets.list()).into_response()
}

pub async fn update_preset(
    State(web_state): State<Arc<WebState>>,
    Json(request): Json<PresetRequest>,
) -> Response {
    let mhz = match request.frequency() {
        Ok(mhz) => mhz,
        Err(e) => return bad_request(e),
    };
    let Some(name) = request.name.as_deref() else {
        return bad_request(ValidationError::MissingPresetName);
    };
    web_state.presets.update_name(mhz, name);
    Json(web_state.presets.list()).into_response()
}

pub async fn add_many_presets(
    State(web_state): State<Arc<WebState>>,
    Json(request): Json<PresetBatchRequest>,
) -> Response {
    let list = request.freq_mhz_list.unwrap_or_default();
    if list.is_empty() {
        return bad_request(ValidationError::EmptyPresetList);
    }
    let added = web_state.presets.add_many(&list);
    Json(json!({ "added": added, "presets": web_state.presets.list() })).into_response()
}

/// Remove a preset; unknown frequencies are not an error.
pub async fn remove_preset(
    State(web_state): State<Arc<WebState>>,
    Json(request): Json<PresetRequest>,
) -> Response {
    let Some(mhz) = request.freq_mhz else {
        return bad_request(ValidationError::MissingPresetFrequency);
    };
    web_state.presets.remove(mhz);
    Json(web_state.presets.list()).into_response()
}

// ============================================================================
// Scan
// ============================================================================

pub async fn scan_status(
    State(web_state): State<Arc<WebState>>,
    Query(query): Query<ScanStatusQuery>,
) -> impl IntoResponse {
    let level = ThresholdLevel::parse_lenient(query.level.as_deref());
    Json(web_state.radio.scan_report(query.is_raw(), level))
}

pub async fn scan_start(
    State(web_state): State<Arc<WebState>>,
    request: Option<Json<ScanRequest>>,
) -> Response {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let plan = match request.validate() {
        Ok(plan) => plan,
        Err(e) => return bad_request(e),
    };
    if !web_state.radio.start_scan(plan) {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": "Scan already running" })),
        )
            .into_response();
    }
    Json(web_state.radio.scan_report(false, ThresholdLevel::default())).into_response()
}

pub async fn scan_stop(State(web_state): State<Arc<WebState>>) -> impl IntoResponse {
    web_state.radio.stop_scan();
    Json(web_state.radio.scan_report(false, ThresholdLevel::default()))
}

// ============================================================================
// Live streams
// ============================================================================

/// `GET /stream.mp3`: always MP3.
pub async fn stream_mp3(State(web_state): State<Arc<WebState>>) -> Response {
    stream_response(web_state, OutputFormat::Mp3)
}

/// `GET /stream?fmt=`: requested format when supported, else the configured one.
pub async fn stream(
    State(web_state): State<Arc<WebState>>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let format = web_state.radio.resolve_format(query.fmt.as_deref());
    stream_response(web_state, format)
}

/// Take over the stream lease and pipe the live pipeline into the response.
///
/// Dropping the response body (client gone) cancels the request token.
fn stream_response(web_state: Arc<WebState>, format: OutputFormat) -> Response {
    if let Some(holder) = web_state.radio.live_blocker() {
        let message = match holder {
            "scan" => "Scan in progress",
            _ => "HLS output running",
        };
        return (StatusCode::CONFLICT, Json(json!({ "error": message }))).into_response();
    }

    let radio = Arc::clone(&web_state.radio);
    let lease = radio.begin_streaming();
    let request = CancellationToken::new();
    let (mut writer, reader) = tokio::io::duplex(STREAM_PIPE_BYTES);

    tokio::spawn({
        let request = request.clone();
        async move {
            if let Err(e) = radio.stream_to(&mut writer, &request, &lease, format).await {
                log::debug!("[Stream] lease {} ended with error: {}", lease.generation, e);
            }
            radio.end_streaming(lease.generation);
        }
    });

    let disconnect = request.drop_guard();
    let body = ReaderStream::new(reader).map(move |chunk| {
        let _alive = &disconnect;
        chunk
    });

    (
        [(CACHE_CONTROL, "no-store"), (CONTENT_TYPE, format.content_type())],
        Body::from_stream(body),
    )
        .into_response()
}

// ============================================================================
// Administration
// ============================================================================

/// Stop everything and exit with the restart code shortly after answering.
pub async fn restart_server(
    State(web_state): State<Arc<WebState>>,
    headers: HeaderMap,
    Query(query): Query<AdminQuery>,
) -> Response {
    let presented = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or(query.token.as_deref());
    if !web_state.admin_authorized(presented) {
        log::warn!("[Admin] restart rejected: bad token");
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "Unauthorized" })))
            .into_response();
    }

    log::info!("[Admin] restart requested");
    web_state.radio.stop_scan();
    web_state.radio.stop();

    let restart = web_state.restart.clone();
    tokio::spawn(async move {
        tokio::time::sleep(RESTART_DELAY).await;
        restart.cancel();
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({ "ok": true, "action": "restart", "exitCode": RESTART_EXIT_CODE })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use axum::http::HeaderValue;
    use fmradio_protocol::Delivery;
    use tempfile::TempDir;

    use crate::pipeline::{ToolConfig, ToolTemplate};
    use crate::presets::PresetStore;
    use crate::radio::{RadioContext, RadioService, RadioSettings};

    fn web_state(dir: &Path, admin_token: Option<&str>) -> Arc<WebState> {
        let settings = RadioSettings {
            delivery: Delivery::Direct,
            ..RadioSettings::default()
        };
        let tools = ToolConfig {
            demodulator: ToolTemplate::new("/nonexistent/softfm"),
            encoder: ToolTemplate::new("/nonexistent/ffmpeg"),
            ..ToolConfig::default()
        };
        let ctx = Arc::new(RadioContext::new(settings, tools, dir.join("hls")));
        let radio = Arc::new(RadioService::with_timings(
            ctx,
            Duration::from_millis(50),
            Duration::from_secs(30),
        ));
        let presets = Arc::new(PresetStore::new(dir.join("presets.json"), Vec::new()));
        Arc::new(
            WebState::new(radio, presets).with_admin_token(admin_token.map(str::to_string)),
        )
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_start_validates_frequency() {
        let dir = TempDir::new().unwrap();
        let state = web_state(dir.path(), None);

        let response = start(State(state.clone()), Json(StartRequest::default())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "Provide freqHz or freqMHz");

        let request = StartRequest { freq_hz: Some(5_000_000), freq_mhz: None };
        let response = start(State(state.clone()), Json(request)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "Frequency out of range");

        let request = StartRequest { freq_hz: None, freq_mhz: Some(88.1) };
        let response = start(State(state.clone()), Json(request)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let status = body_json(response).await;
        assert_eq!(status["freqHz"], 88_100_000);
        assert_eq!(status["delivery"], "direct");
    }

    #[tokio::test]
    async fn test_config_rejects_invalid_update() {
        let dir = TempDir::new().unwrap();
        let state = web_state(dir.path(), None);

        let update: StreamingConfigUpdate =
            serde_json::from_str(r#"{"format": "opus", "hlsBitrateKbps": 9000}"#).unwrap();
        let response = update_config(State(state.clone()), Json(update)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await["error"],
            "hlsBitrateKbps must be between 32 and 512"
        );
        assert_eq!(state.radio.config().format, OutputFormat::Mp3);

        let update: StreamingConfigUpdate =
            serde_json::from_str(r#"{"format": "opus", "rtlGainDb": null}"#).unwrap();
        let response = update_config(State(state.clone()), Json(update)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let config = body_json(response).await;
        assert_eq!(config["format"], "opus");
        assert!(config["rtlGainDb"].is_null());
    }

    #[tokio::test]
    async fn test_hls_ready_in_direct_mode() {
        let dir = TempDir::new().unwrap();
        let state = web_state(dir.path(), None);

        let response = hls_ready(State(state)).await.into_response();
        let body = body_json(response).await;
        assert_eq!(body["ready"], false);
        assert_eq!(body["reason"], "delivery is not hls");
    }

    #[tokio::test]
    async fn test_preset_endpoints() {
        let dir = TempDir::new().unwrap();
        let state = web_state(dir.path(), None);

        let request = PresetRequest { freq_mhz: Some(88.1), name: Some("Local".into()) };
        let response = add_preset(State(state.clone()), Json(request)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["presetsMHz"][0], "88.1");

        let request = PresetRequest { freq_mhz: Some(88.1), name: None };
        let response = update_preset(State(state.clone()), Json(request)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "Provide name");

        let request = PresetRequest { freq_mhz: Some(5000.0), name: None };
        let response = add_preset(State(state.clone()), Json(request)).await;
        assert_eq!(body_json(response).await["error"], "freqMHz out of range");

        let request = PresetBatchRequest { freq_mhz_list: Some(vec![90.0, f64::NAN, 4000.0]) };
        let response = add_many_presets(State(state.clone()), Json(request)).await;
        let body = body_json(response).await;
        assert_eq!(body["added"], 1);
        assert_eq!(body["presets"]["presetsMHz"].as_array().unwrap().len(), 2);

        let response =
            add_many_presets(State(state.clone()), Json(PresetBatchRequest::default())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let request = PresetRequest { freq_mhz: Some(88.1), name: None };
        let response = remove_preset(State(state.clone()), Json(request)).await;
        let body = body_json(response).await;
        assert_eq!(body["presets"][0]["freqMHz"], "90.0");
        assert!(dir.path().join("presets.json").exists());
    }

    #[tokio::test]
    async fn test_fill_presets_defaults_and_validation() {
        let dir = TempDir::new().unwrap();
        let state = web_state(dir.path(), None);

        let response = fill_presets(State(state.clone()), None).await;
        let body = body_json(response).await;
        let list = body["presetsMHz"].as_array().unwrap();
        assert_eq!(list.len(), 191);
        assert_eq!(list[0], "76.0");
        assert_eq!(list[190], "95.0");

        let request = PresetFillRequest { start_mhz: Some(95.0), end_mhz: Some(76.0), step_mhz: None };
        let response = fill_presets(State(state.clone()), Some(Json(request))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_scan_conflicts() {
        let dir = TempDir::new().unwrap();
        let state = web_state(dir.path(), None);

        let bad = ScanRequest { dwell_ms: Some(50), ..ScanRequest::default() };
        let response = scan_start(State(state.clone()), Some(Json(bad))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = scan_start(State(state.clone()), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let report = body_json(response).await;
        assert_eq!(report["running"], true);
        assert_eq!(report["total"], 191);

        let response = scan_start(State(state.clone()), None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["error"], "Scan already running");

        let response = stream_mp3(State(state.clone())).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let query = ScanStatusQuery { raw: Some("true".into()), level: Some("loud".into()) };
        let response = scan_status(State(state.clone()), Query(query)).await.into_response();
        let report = body_json(response).await;
        assert_eq!(report["raw"], true);
        assert_eq!(report["clusterGapMHz"], 0.25);

        scan_stop(State(state.clone())).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!state.radio.status().scan_running);
    }

    #[tokio::test]
    async fn test_stream_refused_while_segmented_output_runs() {
        let dir = TempDir::new().unwrap();
        let state = web_state(dir.path(), None);

        let update = StreamingConfigUpdate {
            delivery: Some("hls".into()),
            ..Default::default()
        };
        let response = update_config(State(state.clone()), Json(update)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.radio.status().hls_running);

        let response = stream_mp3(State(state.clone())).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["error"], "HLS output running");

        state.radio.stop();
    }

    #[tokio::test]
    async fn test_stream_headers() {
        let dir = TempDir::new().unwrap();
        let state = web_state(dir.path(), None);

        let query = StreamQuery { fmt: Some("opus".into()) };
        let response = stream(State(state.clone()), Query(query)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CACHE_CONTROL], "no-store");
        assert_eq!(response.headers()[CONTENT_TYPE], "audio/webm; codecs=opus");

        // The demodulator is missing: the body ends and the failure is recorded.
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(bytes.is_empty());
        let status = state.radio.status();
        assert!(status.last_error.is_some());
        assert!(!status.streaming);
    }

    #[tokio::test]
    async fn test_restart_requires_token() {
        let dir = TempDir::new().unwrap();
        let state = web_state(dir.path(), Some("secret"));

        let response = restart_server(
            State(state.clone()),
            HeaderMap::new(),
            Query(AdminQuery::default()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let query = AdminQuery { token: Some("wrong".into()) };
        let response = restart_server(State(state.clone()), HeaderMap::new(), Query(query)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(!state.restart.is_cancelled());

        let mut headers = HeaderMap::new();
        headers.insert("x-admin-token", HeaderValue::from_static("secret"));
        let response =
            restart_server(State(state.clone()), headers, Query(AdminQuery::default())).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["action"], "restart");
        assert_eq!(body["exitCode"], 42);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(state.restart.is_cancelled());
    }

    #[tokio::test]
    async fn test_restart_without_configured_token() {
        let dir = TempDir::new().unwrap();
        let state = web_state(dir.path(), None);

        let response = restart_server(
            State(state.clone()),
            HeaderMap::new(),
            Query(AdminQuery::default()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }
}
