//! Shared state handed to every handler.

use std::sync::Arc;
use std::time::Instant;

use axum::http::HeaderMap;

use crate::catalog::ChannelCatalog;
use crate::device::DeviceRegistry;
use crate::scan::ScanCoordinator;
use crate::setup::SetupStateMachine;
use crate::tuner::lock::LockRegistry;
use crate::tuner::pool::InstancePool;
use crate::web::error::ApiError;
use crate::web::stream::MetaCache;

/// Header carrying the shared secret for destructive endpoints.
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

pub struct AppState {
    pub devices: Arc<DeviceRegistry>,
    pub locks: Arc<LockRegistry>,
    pub pool: Arc<InstancePool>,
    pub scans: Arc<ScanCoordinator>,
    pub catalog: Arc<ChannelCatalog>,
    pub setup: Arc<SetupStateMachine>,
    pub meta_cache: MetaCache,
    pub started_at: Instant,
    /// Shared secret gating destructive endpoints; `None` disables the
    /// gate entirely.
    pub admin_token: Option<String>,
    pub default_gain: i32,
}

impl AppState {
    /// Enforce the shared-secret gate when a token is configured.
    pub fn require_admin(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let Some(expected) = &self.admin_token else {
            return Ok(());
        };
        let presented = headers
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());
        if presented == Some(expected.as_str()) {
            Ok(())
        } else {
            Err(ApiError::Unauthorized)
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
