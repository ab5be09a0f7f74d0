//! Web server shared state.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::presets::PresetStore;
use crate::radio::RadioService;

/// Process exit code that asks the supervisor (systemd, a shell loop) to start us again.
pub const RESTART_EXIT_CODE: i32 = 42;

/// State shared by every handler.
pub struct WebState {
    pub radio: Arc<RadioService>,
    pub presets: Arc<PresetStore>,
    /// Required for the restart endpoint when set.
    pub admin_token: Option<String>,
    /// Cancelled when a restart has been requested.
    pub restart: CancellationToken,
}

impl WebState {
    pub fn new(radio: Arc<RadioService>, presets: Arc<PresetStore>) -> Self {
        Self {
            radio,
            presets,
            admin_token: None,
            restart: CancellationToken::new(),
        }
    }

    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token.filter(|t| !t.is_empty());
        self
    }

    /// Whether `presented` unlocks the admin endpoints.
    pub fn admin_authorized(&self, presented: Option<&str>) -> bool {
        match &self.admin_token {
            None => true,
            Some(expected) => presented == Some(expected.as_str()),
        }
    }
}
