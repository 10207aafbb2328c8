//! Tuner device enumeration and registry.
//!
//! The registry caches the last hardware probe wholesale and persists
//! it so user-assigned labels survive restarts. How devices are actually
//! detected is hidden behind [`DeviceEnumerator`]; the default
//! implementation shells out to a probe command that prints the device
//! listing as JSON.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

/// One physical tuner as reported by enumeration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// OS-assigned index; unstable across reboots.
    pub index: u32,
    /// Stable hardware serial, if the dongle reports one.
    pub serial: Option<String>,
    pub driver: Option<String>,
    pub product: Option<String>,
    pub manufacturer: Option<String>,
    /// User-assigned label, preserved across re-probes.
    pub label: Option<String>,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Device probe failed: {0}")]
    ProbeFailed(String),

    #[error("Unknown device index {0}")]
    UnknownIndex(u32),
}

/// Source of device listings.
#[async_trait]
pub trait DeviceEnumerator: Send + Sync {
    async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, DeviceError>;
}

/// Enumerator that runs an external probe command and parses its JSON
/// stdout (a `[DeviceDescriptor]` array).
pub struct ProbeCommand {
    command: String,
    timeout: Duration,
}

impl ProbeCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl DeviceEnumerator for ProbeCommand {
    async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        let output = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(&self.command)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| DeviceError::ProbeFailed(format!("{} timed out", self.command)))?
        .map_err(|e| DeviceError::ProbeFailed(format!("{}: {}", self.command, e)))?;

        if !output.status.success() {
            return Err(DeviceError::ProbeFailed(format!(
                "{} exited with {}",
                self.command, output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(trimmed)
            .map_err(|e| DeviceError::ProbeFailed(format!("bad probe output: {}", e)))
    }
}

/// Cached device list with persisted labels.
pub struct DeviceRegistry {
    path: PathBuf,
    enumerator: Box<dyn DeviceEnumerator>,
    devices: RwLock<Vec<DeviceDescriptor>>,
}

impl DeviceRegistry {
    /// Load the persisted registry; call [`DeviceRegistry::probe`] to
    /// refresh it against the actual hardware.
    pub fn load(path: impl Into<PathBuf>, enumerator: Box<dyn DeviceEnumerator>) -> Self {
        let path = path.into();
        let devices = match std::fs::read_to_string(&path) {
            Ok(body) => match serde_json::from_str(&body) {
                Ok(devices) => devices,
                Err(e) => {
                    warn!("Ignoring malformed device registry {:?}: {}", path, e);
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        Self {
            path,
            enumerator,
            devices: RwLock::new(devices),
        }
    }

    /// Re-enumerate hardware, replacing the cached list wholesale.
    /// User labels carry over, matched by serial first, index second.
    pub async fn probe(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        let mut fresh = self.enumerator.enumerate().await?;

        {
            let current = self.devices.read().await;
            for device in fresh.iter_mut() {
                let previous = current
                    .iter()
                    .find(|d| {
                        d.serial.is_some() && d.serial == device.serial
                    })
                    .or_else(|| current.iter().find(|d| d.index == device.index));
                if let Some(previous) = previous {
                    if device.label.is_none() {
                        device.label = previous.label.clone();
                    }
                }
            }
        }

        info!("Device probe found {} device(s)", fresh.len());
        *self.devices.write().await = fresh.clone();
        self.persist(&fresh);
        Ok(fresh)
    }

    /// Cached device list from the last probe.
    pub async fn list(&self) -> Vec<DeviceDescriptor> {
        self.devices.read().await.clone()
    }

    pub async fn get(&self, index: u32) -> Option<DeviceDescriptor> {
        self.devices
            .read()
            .await
            .iter()
            .find(|d| d.index == index)
            .cloned()
    }

    pub async fn find_by_serial(&self, serial: &str) -> Option<DeviceDescriptor> {
        self.devices
            .read()
            .await
            .iter()
            .find(|d| d.serial.as_deref() == Some(serial))
            .cloned()
    }

    /// Assign a user label to a device.
    pub async fn set_label(&self, index: u32, label: Option<String>) -> Result<DeviceDescriptor, DeviceError> {
        let mut devices = self.devices.write().await;
        let device = devices
            .iter_mut()
            .find(|d| d.index == index)
            .ok_or(DeviceError::UnknownIndex(index))?;
        device.label = label;
        let updated = device.clone();
        self.persist(&devices);
        Ok(updated)
    }

    fn persist(&self, devices: &[DeviceDescriptor]) {
        let body = match serde_json::to_vec_pretty(devices) {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to serialize device registry: {}", e);
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.path, body) {
            warn!("Failed to write device registry {:?}: {}", self.path, e);
        }
    }
}
