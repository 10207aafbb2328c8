//! Audio stream proxying and per-service metadata side channels.
//!
//! The stream handler pipes the decoder's MP3 output through unbuffered;
//! dropping the client drops the upstream response with it. The dls and
//! slide side channels are finite and fall back to a disk cache when the
//! live instance cannot answer.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::backend::DlsStatus;
use crate::tuner::instance::{InstanceError, InstanceRecord};
use crate::web::error::ApiError;
use crate::web::state::AppState;

/// Device routing for stream and metadata requests.
#[derive(Debug, Deserialize)]
pub struct DeviceQuery {
    #[serde(rename = "deviceIndex")]
    pub device_index: Option<u32>,
}

/// Cached now-playing document for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlsDocument {
    pub sid: String,
    pub label: Option<String>,
    pub dls: DlsStatus,
    #[serde(rename = "mottime")]
    pub mot_time: Option<i64>,
}

/// Disk cache for dls text and slideshow images, so station metadata
/// survives the instance being retuned or restarted.
#[derive(Clone)]
pub struct MetaCache {
    dir: PathBuf,
}

impl MetaCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("Failed to create meta cache dir {:?}: {}", dir, e);
        }
        Self { dir }
    }

    pub fn store_dls(&self, sid: &str, doc: &DlsDocument) {
        let Ok(body) = serde_json::to_vec(doc) else {
            return;
        };
        if let Err(e) = std::fs::write(self.dir.join(format!("{}.dls.json", sid)), body) {
            debug!("Failed to cache dls for {}: {}", sid, e);
        }
    }

    pub fn load_dls(&self, sid: &str) -> Option<DlsDocument> {
        let body = std::fs::read(self.dir.join(format!("{}.dls.json", sid))).ok()?;
        serde_json::from_slice(&body).ok()
    }

    pub fn store_slide(&self, sid: &str, content_type: Option<&str>, bytes: &[u8]) {
        if let Err(e) = std::fs::write(self.dir.join(format!("{}.slide", sid)), bytes) {
            debug!("Failed to cache slide for {}: {}", sid, e);
            return;
        }
        if let Some(content_type) = content_type {
            let _ = std::fs::write(
                self.dir.join(format!("{}.slide.type", sid)),
                content_type,
            );
        }
    }

    pub fn load_slide(&self, sid: &str) -> Option<(Option<String>, Vec<u8>)> {
        let bytes = std::fs::read(self.dir.join(format!("{}.slide", sid))).ok()?;
        let content_type = std::fs::read_to_string(self.dir.join(format!("{}.slide.type", sid)))
            .ok()
            .map(|s| s.trim().to_string());
        Some((content_type, bytes))
    }
}

/// Service ids arrive in the URL path; only hex-style ids are accepted.
fn validate_sid(sid: &str) -> Result<(), ApiError> {
    let ok = !sid.is_empty()
        && sid.len() <= 16
        && sid.chars().all(|c| c.is_ascii_alphanumeric());
    if ok {
        Ok(())
    } else {
        Err(ApiError::Validation(format!("invalid service id {:?}", sid)))
    }
}

/// Route a request to a running instance. With no explicit index the
/// request goes to the only running instance, if there is exactly one.
async fn resolve_instance(
    state: &AppState,
    device_index: Option<u32>,
) -> Result<Arc<InstanceRecord>, ApiError> {
    match device_index {
        Some(index) => state
            .pool
            .get(index)
            .await
            .ok_or_else(|| InstanceError::NoActiveInstance(index).into()),
        None => {
            let indices = state.pool.device_indices().await;
            match indices.as_slice() {
                [] => Err(ApiError::NotFound("No active instance".into())),
                [only] => Ok(state
                    .pool
                    .get(*only)
                    .await
                    .ok_or(InstanceError::NoActiveInstance(*only))?),
                _ => Err(ApiError::Validation(
                    "deviceIndex required when several instances are running".into(),
                )),
            }
        }
    }
}

/// `GET /stream/:serviceId?deviceIndex=` - proxy the MP3 stream.
pub async fn stream(
    State(state): State<Arc<AppState>>,
    Path(service_id): Path<String>,
    Query(query): Query<DeviceQuery>,
) -> Result<Response, ApiError> {
    validate_sid(&service_id)?;
    let instance = resolve_instance(&state, query.device_index).await?;

    let upstream = instance.client().open_stream(&service_id).await?;
    debug!(
        "Streaming service {} from device {}",
        service_id, instance.device_index
    );

    // Bytes pass through as received; dropping the response body drops
    // the upstream request with it.
    let body = Body::from_stream(upstream.bytes_stream());
    Ok((
        [
            (header::CONTENT_TYPE, "audio/mpeg"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        body,
    )
        .into_response())
}

/// `GET /current?deviceIndex=` - status of the tuned ensemble.
pub async fn current(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeviceQuery>,
) -> Result<Response, ApiError> {
    let instance = resolve_instance(&state, query.device_index).await?;
    let status = instance.client().mux_status().await?;
    Ok(Json(serde_json::json!({
        "deviceIndex": instance.device_index,
        "channel": instance.channel(),
        "ensemble": status.ensemble,
        "services": status.services,
    }))
    .into_response())
}

/// `GET /dls/:serviceId?deviceIndex=` - now-playing text, live with
/// cache fallback.
pub async fn dls(
    State(state): State<Arc<AppState>>,
    Path(service_id): Path<String>,
    Query(query): Query<DeviceQuery>,
) -> Result<Json<DlsDocument>, ApiError> {
    validate_sid(&service_id)?;

    let live = match resolve_instance(&state, query.device_index).await {
        Ok(instance) => match instance.client().mux_status().await {
            Ok(status) => status
                .services
                .iter()
                .find(|s| s.sid.eq_ignore_ascii_case(&service_id))
                .map(|s| DlsDocument {
                    sid: s.sid.clone(),
                    label: s.label.clone(),
                    dls: s.dls.clone(),
                    mot_time: s.mot_time,
                }),
            Err(e) => {
                debug!("Live dls fetch failed for {}: {}", service_id, e);
                None
            }
        },
        Err(_) => None,
    };

    if let Some(doc) = live {
        state.meta_cache.store_dls(&service_id, &doc);
        return Ok(Json(doc));
    }

    state
        .meta_cache
        .load_dls(&service_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No dls for service {}", service_id)))
}

/// `GET /slide/:serviceId?deviceIndex=` - slideshow image, live with
/// cache fallback.
pub async fn slide(
    State(state): State<Arc<AppState>>,
    Path(service_id): Path<String>,
    Query(query): Query<DeviceQuery>,
) -> Result<Response, ApiError> {
    validate_sid(&service_id)?;

    if let Ok(instance) = resolve_instance(&state, query.device_index).await {
        match instance.client().fetch_slide(&service_id).await {
            Ok((content_type, bytes)) if !bytes.is_empty() => {
                state
                    .meta_cache
                    .store_slide(&service_id, content_type.as_deref(), &bytes);
                return Ok(image_response(content_type, bytes.to_vec()));
            }
            Ok(_) => {}
            Err(e) => debug!("Live slide fetch failed for {}: {}", service_id, e),
        }
    }

    match state.meta_cache.load_slide(&service_id) {
        Some((content_type, bytes)) => Ok(image_response(content_type, bytes)),
        None => Err(ApiError::NotFound(format!(
            "No slide for service {}",
            service_id
        ))),
    }
}

fn image_response(content_type: Option<String>, bytes: Vec<u8>) -> Response {
    (
        [(
            header::CONTENT_TYPE,
            content_type.unwrap_or_else(|| "image/jpeg".to_string()),
        )],
        bytes,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sid_validation() {
        assert!(validate_sid("0xC221").is_ok());
        assert!(validate_sid("D220").is_ok());
        assert!(validate_sid("").is_err());
        assert!(validate_sid("../etc/passwd").is_err());
        assert!(validate_sid("0xC221/..").is_err());
    }

    #[test]
    fn dls_cache_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MetaCache::new(dir.path());

        assert!(cache.load_dls("0xC221").is_none());
        let doc = DlsDocument {
            sid: "0xC221".into(),
            label: Some("Dlf".into()),
            dls: DlsStatus {
                label: Some("Nachrichten".into()),
                time: Some(1_700_000_000),
            },
            mot_time: None,
        };
        cache.store_dls("0xC221", &doc);

        let loaded = cache.load_dls("0xC221").unwrap();
        assert_eq!(loaded.sid, "0xC221");
        assert_eq!(loaded.dls.label.as_deref(), Some("Nachrichten"));
    }

    #[test]
    fn slide_cache_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MetaCache::new(dir.path());

        cache.store_slide("0xD220", Some("image/png"), &[1, 2, 3]);
        let (content_type, bytes) = cache.load_slide("0xD220").unwrap();
        assert_eq!(content_type.as_deref(), Some("image/png"));
        assert_eq!(bytes, vec![1, 2, 3]);

        // Missing content type still serves the bytes.
        cache.store_slide("0xD221", None, &[9]);
        let (content_type, bytes) = cache.load_slide("0xD221").unwrap();
        assert!(content_type.is_none());
        assert_eq!(bytes, vec![9]);
    }
}
