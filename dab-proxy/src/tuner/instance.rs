//! Decoder instance lifecycle: launch contract and runtime record.
//!
//! The decoder has no device-index flag of its own, so each instance is
//! a pair of processes: an `rtl_tcp` intermediary bound to the device
//! (`-d <index>`) and the decoder connected to it. Ports are derived
//! deterministically from the device index so concurrent instances
//! never collide.

use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::backend::{BackendClient, BackendError};
use crate::tuner::lock::LockPurpose;
use crate::tuner::process::terminate_with_escalation;

/// Grace window between terminate and kill when stopping children.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Instance lifecycle errors.
#[derive(Debug, Error)]
pub enum InstanceError {
    /// The device is locked by another operation.
    #[error("Device {device_index} is busy ({purpose})")]
    DeviceBusy {
        device_index: u32,
        purpose: LockPurpose,
    },

    /// A child process could not be spawned or died immediately.
    #[error("Failed to launch backend: {0}")]
    LaunchFailed(String),

    /// The instance never became reachable.
    #[error("Backend for device {0} did not come up in time")]
    StartTimeout(u32),

    /// No instance is running for the device.
    #[error("No active instance for device {0}")]
    NoActiveInstance(u32),

    /// A control call against the instance failed.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Everything needed to launch one instance.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub device_index: u32,
    /// Stable serial, preferred over the index when the launcher
    /// supports addressing by serial.
    pub device_serial: Option<String>,
    pub channel: String,
    /// -1 selects AGC; otherwise manual gain in dB.
    pub gain: i32,
    pub rtl_tcp_port: u16,
    pub control_port: u16,
}

/// Handle to a launched backend's processes.
#[async_trait]
pub trait RunningBackend: Send + Sync {
    /// Stop the processes, escalating from terminate to kill.
    async fn shutdown(&mut self, grace: Duration);

    /// PIDs of the live children, for diagnostics.
    fn pids(&self) -> Vec<u32>;
}

/// Spawns backend processes for a launch spec.
#[async_trait]
pub trait InstanceLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn RunningBackend>, InstanceError>;
}

/// Real launcher: `rtl_tcp` intermediary plus the decoder process.
pub struct ProcessLauncher {
    rtl_tcp_bin: String,
    decoder_bin: String,
}

impl ProcessLauncher {
    pub fn new(rtl_tcp_bin: impl Into<String>, decoder_bin: impl Into<String>) -> Self {
        Self {
            rtl_tcp_bin: rtl_tcp_bin.into(),
            decoder_bin: decoder_bin.into(),
        }
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new("rtl_tcp", "welle-cli")
    }
}

#[async_trait]
impl InstanceLauncher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn RunningBackend>, InstanceError> {
        // Step 1: rtl_tcp bound to the device. Serial selection maps to
        // an index lookup inside rtl_tcp itself, so the index is what
        // actually goes on the command line.
        let mut rtl_tcp = Command::new(&self.rtl_tcp_bin)
            .arg("-d")
            .arg(spec.device_index.to_string())
            .arg("-p")
            .arg(spec.rtl_tcp_port.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| InstanceError::LaunchFailed(format!("{}: {}", self.rtl_tcp_bin, e)))?;

        // Give it a moment to bind, then check for an early exit
        // (typically the device index does not exist).
        tokio::time::sleep(Duration::from_secs(1)).await;
        if let Ok(Some(status)) = rtl_tcp.try_wait() {
            return Err(InstanceError::LaunchFailed(format!(
                "{} exited immediately ({}); device {} may not exist",
                self.rtl_tcp_bin, status, spec.device_index
            )));
        }

        // Step 2: decoder connected through rtl_tcp.
        let mut cmd = Command::new(&self.decoder_bin);
        cmd.arg("-F")
            .arg(format!("rtl_tcp,127.0.0.1:{}", spec.rtl_tcp_port))
            .arg("-c")
            .arg(&spec.channel)
            .arg("-w")
            .arg(spec.control_port.to_string());
        if spec.gain != -1 {
            cmd.arg("-g").arg(spec.gain.to_string());
        }
        info!(
            "Launching decoder for device {} on channel {} (control port {})",
            spec.device_index, spec.channel, spec.control_port
        );

        let mut decoder = match cmd
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                terminate_with_escalation(&mut rtl_tcp, STOP_GRACE).await;
                return Err(InstanceError::LaunchFailed(format!(
                    "{}: {}",
                    self.decoder_bin, e
                )));
            }
        };

        tokio::time::sleep(Duration::from_secs(2)).await;
        if let Ok(Some(status)) = decoder.try_wait() {
            terminate_with_escalation(&mut rtl_tcp, STOP_GRACE).await;
            return Err(InstanceError::LaunchFailed(format!(
                "{} exited immediately ({})",
                self.decoder_bin, status
            )));
        }

        Ok(Box::new(ProcessBackend {
            rtl_tcp,
            decoder,
        }))
    }
}

struct ProcessBackend {
    rtl_tcp: tokio::process::Child,
    decoder: tokio::process::Child,
}

#[async_trait]
impl RunningBackend for ProcessBackend {
    async fn shutdown(&mut self, grace: Duration) {
        // Decoder first so it stops reading before its source vanishes.
        terminate_with_escalation(&mut self.decoder, grace).await;
        terminate_with_escalation(&mut self.rtl_tcp, grace).await;
    }

    fn pids(&self) -> Vec<u32> {
        [self.decoder.id(), self.rtl_tcp.id()]
            .into_iter()
            .flatten()
            .collect()
    }
}

/// One running instance. Exactly one may exist per device index, and it
/// only runs while the device's streaming lock is held.
pub struct InstanceRecord {
    pub device_index: u32,
    pub control_port: u16,
    pub rtl_tcp_port: u16,
    pub started_at: Instant,
    channel: std::sync::Mutex<String>,
    client: BackendClient,
    backend: Mutex<Option<Box<dyn RunningBackend>>>,
    health_failures: AtomicU32,
}

impl std::fmt::Debug for InstanceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRecord")
            .field("device_index", &self.device_index)
            .field("control_port", &self.control_port)
            .field("rtl_tcp_port", &self.rtl_tcp_port)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl InstanceRecord {
    pub fn new(
        spec: &LaunchSpec,
        backend: Box<dyn RunningBackend>,
        client: BackendClient,
    ) -> Self {
        Self {
            device_index: spec.device_index,
            control_port: spec.control_port,
            rtl_tcp_port: spec.rtl_tcp_port,
            started_at: Instant::now(),
            channel: std::sync::Mutex::new(spec.channel.clone()),
            client,
            backend: Mutex::new(Some(backend)),
            health_failures: AtomicU32::new(0),
        }
    }

    pub fn channel(&self) -> String {
        self.channel.lock().expect("channel poisoned").clone()
    }

    pub fn set_channel(&self, channel: &str) {
        *self.channel.lock().expect("channel poisoned") = channel.to_string();
    }

    pub fn client(&self) -> &BackendClient {
        &self.client
    }

    pub fn pids(&self) -> Vec<u32> {
        // Non-blocking peek; empty while a shutdown is in flight.
        match self.backend.try_lock() {
            Ok(guard) => guard.as_ref().map(|b| b.pids()).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    /// Record a health probe outcome; returns the current consecutive
    /// failure count.
    pub fn note_health(&self, reachable: bool) -> u32 {
        if reachable {
            self.health_failures.store(0, Ordering::SeqCst);
            0
        } else {
            self.health_failures.fetch_add(1, Ordering::SeqCst) + 1
        }
    }

    /// Stop the backend processes. Safe to call more than once.
    pub async fn shutdown(&self, grace: Duration) {
        let mut guard = self.backend.lock().await;
        if let Some(mut backend) = guard.take() {
            debug!("Stopping backend for device {}", self.device_index);
            backend.shutdown(grace).await;
        } else {
            warn!(
                "Backend for device {} already stopped",
                self.device_index
            );
        }
    }
}
