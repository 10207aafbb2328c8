//! Control-plane API handlers: devices, scan, tune, setup, status.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::channels;
use crate::device::DeviceDescriptor;
use crate::scan::ScanProgress;
use crate::setup::SetupStatus;
use crate::tuner::lock::LockRecord;
use crate::web::error::ApiError;
use crate::web::state::AppState;
use crate::web::stream::DeviceQuery;

/// Device listing entry with lock enrichment.
#[derive(Debug, Serialize)]
pub struct DeviceWithLock {
    #[serde(flatten)]
    pub device: DeviceDescriptor,
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock: Option<LockRecord>,
}

fn validate_device_index(index: u32) -> Result<(), ApiError> {
    if channels::is_valid_device_index(index) {
        Ok(())
    } else {
        Err(ApiError::Validation(format!(
            "device index {} out of range 0..={}",
            index,
            channels::MAX_DEVICE_INDEX
        )))
    }
}

fn validate_gain(gain: i32) -> Result<(), ApiError> {
    if channels::is_valid_gain(gain) {
        Ok(())
    } else {
        Err(ApiError::Validation(format!(
            "gain {} out of range (-1 for AGC, 0..=49 manual)",
            gain
        )))
    }
}

/// `POST /devices/probe` - re-enumerate hardware.
pub async fn probe_devices(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DeviceDescriptor>>, ApiError> {
    let devices = state.devices.probe().await?;
    Ok(Json(devices))
}

/// `GET /devices` - cached listing with lock state.
pub async fn get_devices(State(state): State<Arc<AppState>>) -> Json<Vec<DeviceWithLock>> {
    let devices = state.devices.list().await;
    let enriched = devices
        .into_iter()
        .map(|device| {
            let lock = state.locks.get(device.index);
            DeviceWithLock {
                locked: lock.is_some(),
                lock,
                device,
            }
        })
        .collect();
    Json(enriched)
}

#[derive(Debug, Deserialize)]
pub struct LabelRequest {
    pub label: Option<String>,
}

/// `PATCH /devices/:index` - assign a user label.
pub async fn patch_device(
    State(state): State<Arc<AppState>>,
    Path(index): Path<u32>,
    Json(body): Json<LabelRequest>,
) -> Result<Json<DeviceDescriptor>, ApiError> {
    let device = state.devices.set_label(index, body.label).await?;
    Ok(Json(device))
}

#[derive(Debug, Default, Deserialize)]
pub struct ScanRequest {
    pub gain: Option<i32>,
}

/// `POST /scan/:index` - start a channel sweep.
pub async fn start_scan(
    State(state): State<Arc<AppState>>,
    Path(index): Path<u32>,
    body: Option<Json<ScanRequest>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_device_index(index)?;
    let gain = body
        .and_then(|Json(b)| b.gain)
        .unwrap_or(state.default_gain);
    validate_gain(gain)?;

    let scan_id = state.scans.start_scan(index, gain).await?;
    Ok(Json(json!({ "status": "scanning", "scanId": scan_id })))
}

/// `GET /scan/:index/progress`.
pub async fn scan_progress(
    State(state): State<Arc<AppState>>,
    Path(index): Path<u32>,
) -> Result<Json<ScanProgress>, ApiError> {
    validate_device_index(index)?;
    Ok(Json(state.scans.progress(index).await))
}

/// `POST /scan/:index/cancel` - idempotent.
pub async fn cancel_scan(
    State(state): State<Arc<AppState>>,
    Path(index): Path<u32>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_device_index(index)?;
    state.scans.cancel_scan(index).await;
    Ok(Json(json!({ "status": "cancelled" })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TuneRequest {
    pub device_index: u32,
    pub channel: String,
    pub gain: Option<i32>,
}

/// `POST /tune` - start or retune an instance.
pub async fn tune(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TuneRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_device_index(body.device_index)?;
    if !channels::is_valid_channel(&body.channel) {
        return Err(ApiError::Validation(format!(
            "unknown channel {:?}",
            body.channel
        )));
    }
    let gain = body.gain.unwrap_or(state.default_gain);
    validate_gain(gain)?;

    let serial = state
        .devices
        .get(body.device_index)
        .await
        .and_then(|d| d.serial);
    state
        .pool
        .start(body.device_index, serial, &body.channel, gain)
        .await?;

    info!("Tuned device {} to {}", body.device_index, body.channel);
    Ok(Json(json!({
        "success": true,
        "deviceIndex": body.device_index,
        "channel": body.channel,
    })))
}

/// `GET /channels?deviceIndex=` - scanned transponders for a device.
pub async fn get_channels(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeviceQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let index = query
        .device_index
        .ok_or_else(|| ApiError::Validation("deviceIndex required".into()))?;
    validate_device_index(index)?;
    let transponders = state.catalog.get(index).unwrap_or_default();
    Ok(Json(json!({
        "deviceIndex": index,
        "transponders": transponders,
    })))
}

/// `GET /setup/status`.
pub async fn setup_status(State(state): State<Arc<AppState>>) -> Json<SetupStatus> {
    Json(state.setup.status())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupCompleteRequest {
    pub device_index: u32,
    pub device_serial: Option<String>,
    /// Channel name of the chosen transponder.
    pub transponder: String,
    pub gain: Option<i32>,
}

/// `POST /setup/complete` - leave the wizard.
pub async fn setup_complete(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SetupCompleteRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_device_index(body.device_index)?;
    let gain = body.gain.unwrap_or(state.default_gain);
    validate_gain(gain)?;

    let started = state
        .setup
        .complete(body.device_index, body.device_serial, &body.transponder, gain)
        .await?;
    Ok(Json(json!({ "success": true, "started": started })))
}

/// `POST /setup/reset` - back to the wizard; admin-gated.
pub async fn setup_reset(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.require_admin(&headers)?;
    state.setup.reset().await?;
    Ok(Json(json!({ "success": true })))
}

/// `GET /status` - aggregate health.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let mut instances = Vec::new();
    for index in state.pool.device_indices().await {
        if let Some(record) = state.pool.get(index).await {
            let reachable = record.client().is_reachable().await;
            instances.push(json!({
                "deviceIndex": record.device_index,
                "channel": record.channel(),
                "controlPort": record.control_port,
                "reachable": reachable,
                "uptimeSeconds": record.started_at.elapsed().as_secs(),
            }));
        }
    }

    Json(json!({
        "mode": state.setup.mode(),
        "uptimeSeconds": state.uptime_seconds(),
        "activeStreams": instances.len(),
        "instances": instances,
        "activeScans": state.scans.active_count().await,
        "locks": state.locks.all(),
    }))
}
