//! HTTP client for a running decoder instance.
//!
//! Each instance exposes a small web interface on its control port:
//! ensemble/service status as JSON, a channel-switch endpoint, an MP3
//! stream per service, and slideshow images. This module wraps those
//! calls with explicit timeouts and models the status document.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{ServiceRecord, Transponder};

/// Timeout for finite control-plane calls against an instance.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport-mode tag marking a service as streamable audio.
pub const TRANSPORT_MODE_AUDIO: &str = "audio";

/// Backend call errors.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The instance did not answer at all.
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    /// The instance answered too slowly.
    #[error("Backend timed out")]
    Timeout,

    /// The instance answered with an error status.
    #[error("Backend returned HTTP {0}")]
    Status(u16),

    /// The status document could not be decoded.
    #[error("Backend returned malformed status: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BackendError::Timeout
        } else if let Some(status) = e.status() {
            BackendError::Status(status.as_u16())
        } else if e.is_decode() {
            BackendError::Decode(e.to_string())
        } else {
            BackendError::Unreachable(e.to_string())
        }
    }
}

/// Ensemble identification from the status document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnsembleStatus {
    pub label: Option<String>,
    pub id: Option<String>,
}

/// Now-playing text for a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DlsStatus {
    pub label: Option<String>,
    /// Unix timestamp of the last label change.
    pub time: Option<i64>,
}

/// One audio/data component of a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub bitrate: Option<u32>,
    pub codec: Option<String>,
    #[serde(rename = "transportmode")]
    pub transport_mode: Option<String>,
}

/// One service within the currently tuned ensemble.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Service id as a hex string, e.g. "0xC221".
    pub sid: String,
    pub label: Option<String>,
    pub language: Option<String>,
    #[serde(rename = "pty")]
    pub programme_type: Option<String>,
    #[serde(default)]
    pub dls: DlsStatus,
    /// Unix timestamp of the last slideshow image change.
    #[serde(rename = "mottime")]
    pub mot_time: Option<i64>,
    #[serde(default)]
    pub components: Vec<ComponentStatus>,
}

impl ServiceStatus {
    /// Whether any component carries streamable audio.
    pub fn is_audio(&self) -> bool {
        self.components
            .iter()
            .any(|c| c.transport_mode.as_deref() == Some(TRANSPORT_MODE_AUDIO))
    }
}

/// The decoder's full status document for the tuned channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MuxStatus {
    #[serde(default)]
    pub ensemble: EnsembleStatus,
    #[serde(default)]
    pub services: Vec<ServiceStatus>,
}

impl MuxStatus {
    /// Fold the snapshot into a catalog transponder for `channel`.
    pub fn to_transponder(&self, channel: &str) -> Transponder {
        Transponder {
            channel: channel.to_string(),
            ensemble_label: self.ensemble.label.clone(),
            ensemble_id: self.ensemble.id.clone(),
            services: self
                .services
                .iter()
                .map(|s| {
                    let component = s.components.first();
                    ServiceRecord {
                        sid: s.sid.clone(),
                        label: s.label.clone(),
                        bitrate: component.and_then(|c| c.bitrate),
                        codec: component.and_then(|c| c.codec.clone()),
                        language: s.language.clone(),
                        programme_type: s.programme_type.clone(),
                        transport_mode: component.and_then(|c| c.transport_mode.clone()),
                    }
                })
                .collect(),
        }
    }
}

/// Client for one instance's control interface.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base: String,
}

impl BackendClient {
    pub fn new(control_port: u16) -> Self {
        // No global timeout: the same client serves unbounded audio
        // streams. Finite calls set per-request timeouts instead.
        let http = reqwest::Client::builder()
            .connect_timeout(CONTROL_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base: format!("http://127.0.0.1:{}", control_port),
        }
    }

    /// Fetch the ensemble/service status document.
    pub async fn mux_status(&self) -> Result<MuxStatus, BackendError> {
        let resp = self
            .http
            .get(format!("{}/mux.json", self.base))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(BackendError::Status(resp.status().as_u16()));
        }
        Ok(resp.json().await?)
    }

    /// Switch the instance to another channel.
    pub async fn set_channel(&self, channel: &str) -> Result<(), BackendError> {
        let resp = self
            .http
            .post(format!("{}/channel", self.base))
            .timeout(CONTROL_TIMEOUT)
            .body(channel.to_string())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(BackendError::Status(resp.status().as_u16()));
        }
        Ok(())
    }

    /// Lightweight reachability check.
    pub async fn is_reachable(&self) -> bool {
        self.http
            .get(format!("{}/mux.json", self.base))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    /// Start an unbounded audio stream for a service.
    pub async fn open_stream(&self, service_id: &str) -> Result<reqwest::Response, BackendError> {
        let resp = self
            .http
            .get(format!("{}/mp3/{}", self.base, service_id))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(BackendError::Status(resp.status().as_u16()));
        }
        Ok(resp)
    }

    /// Fetch the current slideshow image for a service.
    pub async fn fetch_slide(
        &self,
        service_id: &str,
    ) -> Result<(Option<String>, bytes::Bytes), BackendError> {
        let resp = self
            .http
            .get(format!("{}/slide/{}", self.base, service_id))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(BackendError::Status(resp.status().as_u16()));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        Ok((content_type, resp.bytes().await?))
    }
}
