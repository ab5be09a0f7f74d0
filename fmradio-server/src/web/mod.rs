//! HTTP front end: control API, live streams and segment files.

pub mod api;
pub mod state;

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

pub use state::{WebState, RESTART_EXIT_CODE};

/// Build the application router.
///
/// `web_root`, when given, serves the player UI for every other path.
pub fn router(web_state: Arc<WebState>, segment_dir: &Path, web_root: Option<&Path>) -> Router {
    let app = Router::new()
        // Radio control
        .route("/api/status", get(api::get_status))
        .route("/api/config", get(api::get_config))
        .route("/api/config", post(api::update_config))
        .route("/api/start", post(api::start))
        .route("/api/stop", post(api::stop))
        .route("/api/hls/ready", get(api::hls_ready))
        // Presets
        .route("/api/presets", get(api::get_presets))
        .route("/api/presets/auto", post(api::fill_presets))
        .route("/api/presets/add", post(api::add_preset))
        .route("/api/presets/update", post(api::update_preset))
        .route("/api/presets/addMany", post(api::add_many_presets))
        .route("/api/presets/remove", post(api::remove_preset))
        // Scan
        .route("/api/scan/status", get(api::scan_status))
        .route("/api/scan/start", post(api::scan_start))
        .route("/api/scan/stop", post(api::scan_stop))
        // Administration
        .route("/api/server/restart", post(api::restart_server))
        // Live streams
        .route("/stream.mp3", get(api::stream_mp3))
        .route("/stream", get(api::stream))
        .nest_service("/hls", ServeDir::new(segment_dir));
    let app = match web_root {
        Some(root) => app.fallback_service(ServeDir::new(root)),
        None => app,
    };
    app.with_state(web_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve until `shutdown` resolves.
pub async fn start_web_server<F>(
    listen_addr: SocketAddr,
    web_state: Arc<WebState>,
    segment_dir: &Path,
    web_root: Option<&Path>,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(web_state, segment_dir, web_root);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    log::info!("Web server listening on http://{}", listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
