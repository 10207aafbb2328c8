//! Two-mode setup lifecycle: wizard until completed, operating after.
//!
//! The persisted setup document records which devices should be
//! streaming which channel. Completion validates and persists before it
//! tries to start anything, so a failed start never loses the saved
//! configuration; a restart replays the document instead.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::ChannelCatalog;
use crate::device::DeviceRegistry;
use crate::scan::ScanCoordinator;
use crate::tuner::lock::LockRegistry;
use crate::tuner::pool::InstancePool;

/// Delay before startup replay, so a freshly booted backend can settle.
pub const REPLAY_GRACE: Duration = Duration::from_secs(3);

/// How long a reset waits for cancelled sweeps to tear down before it
/// clears the remaining locks regardless.
const SCAN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Unknown device index {0}")]
    UnknownDevice(u32),

    #[error("Device {device_index} has no scanned transponder on channel {channel}")]
    UnknownTransponder { device_index: u32, channel: String },

    /// The setup document could not be written. The configuration is
    /// not saved; the caller must know.
    #[error("Failed to persist setup: {0}")]
    Persist(#[from] std::io::Error),
}

/// Lifecycle mode of the whole system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SetupMode {
    Wizard,
    Operating,
}

/// One device-to-channel binding that should be streaming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamBinding {
    pub device_index: u32,
    /// Serial recorded at completion time; checked on replay so a
    /// reshuffled index never starts the wrong dongle.
    pub device_serial: Option<String>,
    pub channel: String,
    #[serde(default = "default_gain")]
    pub gain: i32,
}

fn default_gain() -> i32 {
    -1
}

/// The persisted setup document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetupConfig {
    pub completed: bool,
    #[serde(default)]
    pub bindings: Vec<StreamBinding>,
}

/// Snapshot returned by status queries.
#[derive(Debug, Clone, Serialize)]
pub struct SetupStatus {
    pub mode: SetupMode,
    pub completed: bool,
    pub bindings: Vec<StreamBinding>,
}

/// Tracks and persists the wizard/operating lifecycle.
pub struct SetupStateMachine {
    path: PathBuf,
    config: Mutex<SetupConfig>,
    devices: Arc<DeviceRegistry>,
    catalog: Arc<ChannelCatalog>,
    pool: Arc<InstancePool>,
    scans: Arc<ScanCoordinator>,
    locks: Arc<LockRegistry>,
    keep_catalog_on_reset: bool,
}

impl SetupStateMachine {
    /// Load the setup document, starting in wizard mode if absent or
    /// unreadable.
    pub fn load(
        path: impl Into<PathBuf>,
        devices: Arc<DeviceRegistry>,
        catalog: Arc<ChannelCatalog>,
        pool: Arc<InstancePool>,
        scans: Arc<ScanCoordinator>,
        locks: Arc<LockRegistry>,
        keep_catalog_on_reset: bool,
    ) -> Self {
        let path = path.into();
        let config = match std::fs::read_to_string(&path) {
            Ok(body) => match serde_json::from_str(&body) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Ignoring malformed setup document {:?}: {}", path, e);
                    SetupConfig::default()
                }
            },
            Err(_) => SetupConfig::default(),
        };
        Self {
            path,
            config: Mutex::new(config),
            devices,
            catalog,
            pool,
            scans,
            locks,
            keep_catalog_on_reset,
        }
    }

    pub fn mode(&self) -> SetupMode {
        if self.config.lock().expect("setup poisoned").completed {
            SetupMode::Operating
        } else {
            SetupMode::Wizard
        }
    }

    pub fn status(&self) -> SetupStatus {
        let config = self.config.lock().expect("setup poisoned").clone();
        SetupStatus {
            mode: if config.completed {
                SetupMode::Operating
            } else {
                SetupMode::Wizard
            },
            completed: config.completed,
            bindings: config.bindings,
        }
    }

    /// Complete the wizard: validate, persist, then best-effort start.
    ///
    /// Returns whether the instance actually started. A start failure
    /// after a successful save is not an error; the saved binding is
    /// replayed on the next restart or retuned by hand.
    pub async fn complete(
        &self,
        device_index: u32,
        device_serial: Option<String>,
        channel: &str,
        gain: i32,
    ) -> Result<bool, SetupError> {
        if self.devices.get(device_index).await.is_none() {
            return Err(SetupError::UnknownDevice(device_index));
        }
        if !self.catalog.has_channel(device_index, channel) {
            return Err(SetupError::UnknownTransponder {
                device_index,
                channel: channel.to_string(),
            });
        }

        let binding = StreamBinding {
            device_index,
            device_serial: device_serial.clone(),
            channel: channel.to_string(),
            gain,
        };

        // Persist before starting; durability over immediate streaming.
        {
            let mut config = self.config.lock().expect("setup poisoned");
            config.bindings.retain(|b| b.device_index != device_index);
            config.bindings.push(binding);
            config.completed = true;
            self.persist(&config)?;
        }
        info!(
            "Setup completed: device {} on channel {}",
            device_index, channel
        );

        match self
            .pool
            .start(device_index, device_serial, channel, gain)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(
                    "Configured instance for device {} failed to start: {}",
                    device_index, e
                );
                Ok(false)
            }
        }
    }

    /// Reset to wizard mode: cancel scans, stop everything, release
    /// every lock, clear the completed flag.
    pub async fn reset(&self) -> Result<(), SetupError> {
        info!("Resetting setup to wizard mode");
        // Sweeps own backend processes and release their own locks;
        // let them tear down before the registry is cleared wholesale,
        // so no sweep outlives its lock.
        self.scans.cancel_all(SCAN_DRAIN_TIMEOUT).await;
        self.pool.stop(None).await;
        self.locks.release_all();
        if !self.keep_catalog_on_reset {
            self.catalog.clear();
        }

        let mut config = self.config.lock().expect("setup poisoned");
        config.completed = false;
        config.bindings.clear();
        self.persist(&config)?;
        Ok(())
    }

    /// Replay the persisted bindings into the pool after a restart.
    /// Never fatal; every failure is logged and skipped.
    pub async fn replay(&self, grace: Duration) {
        let config = self.config.lock().expect("setup poisoned").clone();
        if !config.completed || config.bindings.is_empty() {
            return;
        }

        tokio::time::sleep(grace).await;
        info!("Replaying {} stored binding(s)", config.bindings.len());

        for binding in config.bindings {
            // Serial is authoritative when recorded: a device that moved
            // to another index is found again, one that vanished is
            // reported as missing rather than started blind.
            let device_index = if let Some(serial) = &binding.device_serial {
                match self.devices.find_by_serial(serial).await {
                    Some(device) => device.index,
                    None => {
                        warn!(
                            "Device not found for stored binding (serial {}, was index {})",
                            serial, binding.device_index
                        );
                        continue;
                    }
                }
            } else {
                binding.device_index
            };

            match self
                .pool
                .start(
                    device_index,
                    binding.device_serial.clone(),
                    &binding.channel,
                    binding.gain,
                )
                .await
            {
                Ok(_) => info!(
                    "Replayed device {} on channel {}",
                    device_index, binding.channel
                ),
                Err(e) => error!(
                    "Replay failed for device {} on channel {}: {}",
                    device_index, binding.channel, e
                ),
            }
        }
    }

    fn persist(&self, config: &SetupConfig) -> Result<(), std::io::Error> {
        let body = serde_json::to_vec_pretty(config)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&self.path, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ServiceRecord, Transponder};
    use crate::device::{DeviceDescriptor, DeviceEnumerator, DeviceError};
    use crate::scan::{ScanBackend, ScanConfig, ScanError, ScanProbe, ScanStatus};
    use crate::tuner::instance::{
        InstanceError, InstanceLauncher, LaunchSpec, RunningBackend,
    };
    use crate::tuner::lock::DEFAULT_MAX_LOCK_AGE;
    use crate::tuner::pool::InstancePoolConfig;
    use crate::tuner::process::ProcessProbe;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct AlwaysAlive;
    impl ProcessProbe for AlwaysAlive {
        fn is_alive(&self, _pid: u32) -> bool {
            true
        }
    }

    struct FixedEnumerator {
        devices: Vec<DeviceDescriptor>,
    }

    #[async_trait]
    impl DeviceEnumerator for FixedEnumerator {
        async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
            Ok(self.devices.clone())
        }
    }

    struct NullBackend;

    #[async_trait]
    impl RunningBackend for NullBackend {
        async fn shutdown(&mut self, _grace: Duration) {}
        fn pids(&self) -> Vec<u32> {
            vec![]
        }
    }

    #[derive(Default)]
    struct RecordingLauncher {
        launches: StdMutex<Vec<LaunchSpec>>,
        count: AtomicUsize,
    }

    #[async_trait]
    impl InstanceLauncher for RecordingLauncher {
        async fn launch(
            &self,
            spec: &LaunchSpec,
        ) -> Result<Box<dyn RunningBackend>, InstanceError> {
            self.launches.lock().unwrap().push(spec.clone());
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NullBackend))
        }
    }

    /// Sweep backend that never finds anything; the sweep parks on the
    /// first channel until cancelled.
    struct SilentScanBackend;
    struct SilentScanProbe;

    #[async_trait]
    impl ScanBackend for SilentScanBackend {
        async fn begin(
            &self,
            _device_index: u32,
            _gain: i32,
        ) -> Result<Box<dyn ScanProbe>, ScanError> {
            Ok(Box::new(SilentScanProbe))
        }
    }

    #[async_trait]
    impl ScanProbe for SilentScanProbe {
        async fn switch_channel(&mut self, _channel: &str) -> Result<(), ScanError> {
            Ok(())
        }

        async fn observe(&mut self, _channel: &str) -> Result<Option<Transponder>, ScanError> {
            Ok(None)
        }

        async fn finish(&mut self) {}
    }

    struct Fixture {
        setup: SetupStateMachine,
        locks: Arc<LockRegistry>,
        catalog: Arc<ChannelCatalog>,
        launcher: Arc<RecordingLauncher>,
        scans: Arc<ScanCoordinator>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(devices: Vec<DeviceDescriptor>, keep_catalog: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let locks = Arc::new(
            LockRegistry::open(
                dir.path().join("locks"),
                Box::new(AlwaysAlive),
                DEFAULT_MAX_LOCK_AGE,
            )
            .unwrap(),
        );
        let catalog = Arc::new(ChannelCatalog::load(dir.path().join("catalog.json")));
        let registry = Arc::new(DeviceRegistry::load(
            dir.path().join("devices.json"),
            Box::new(FixedEnumerator { devices }),
        ));
        registry.probe().await.unwrap();
        let launcher = Arc::new(RecordingLauncher::default());
        let pool = Arc::new(InstancePool::new(
            Arc::clone(&launcher) as Arc<dyn InstanceLauncher>,
            Arc::clone(&locks),
            InstancePoolConfig {
                // Readiness probes hit nothing in tests.
                start_timeout: Duration::from_millis(1),
                readiness_poll_interval: Duration::from_millis(1),
                ..InstancePoolConfig::default()
            },
        ));
        let scans = ScanCoordinator::new(
            Arc::clone(&locks),
            Arc::new(SilentScanBackend),
            Arc::clone(&catalog),
            ScanConfig {
                // Park the sweep on its first channel; only reset ends it.
                channel_timeout: Duration::from_secs(30),
                settle_window: Duration::from_millis(5),
                poll_interval: Duration::from_millis(2),
                overall_timeout: Duration::from_secs(60),
            },
        );
        let setup = SetupStateMachine::load(
            dir.path().join("setup.json"),
            registry,
            Arc::clone(&catalog),
            pool,
            Arc::clone(&scans),
            Arc::clone(&locks),
            keep_catalog,
        );
        Fixture {
            setup,
            locks,
            catalog,
            launcher,
            scans,
            _dir: dir,
        }
    }

    fn device(index: u32, serial: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            index,
            serial: Some(serial.to_string()),
            driver: None,
            product: None,
            manufacturer: None,
            label: None,
        }
    }

    fn transponder(channel: &str) -> Transponder {
        Transponder {
            channel: channel.into(),
            ensemble_label: Some("Test".into()),
            ensemble_id: Some("0x1000".into()),
            services: vec![ServiceRecord {
                sid: "0x0001".into(),
                label: Some("Station".into()),
                bitrate: Some(128),
                codec: Some("DAB+".into()),
                language: None,
                programme_type: None,
                transport_mode: Some("audio".into()),
            }],
        }
    }

    #[tokio::test]
    async fn complete_persists_even_when_start_fails() {
        let f = fixture(vec![device(0, "00000001")], true).await;
        f.catalog.replace_for_device(0, vec![transponder("5C")]);

        // The fake launcher never becomes reachable, so the start fails
        // after the binding was saved.
        let started = f.setup.complete(0, Some("00000001".into()), "5C", -1).await.unwrap();
        assert!(!started);

        let status = f.setup.status();
        assert_eq!(status.mode, SetupMode::Operating);
        assert!(status.completed);
        assert_eq!(status.bindings.len(), 1);
        assert_eq!(status.bindings[0].channel, "5C");
        // Failed start must not leave the lock behind either.
        assert!(!f.locks.is_locked(0));
    }

    #[tokio::test]
    async fn complete_validates_device_and_channel() {
        let f = fixture(vec![device(0, "00000001")], true).await;
        f.catalog.replace_for_device(0, vec![transponder("5C")]);

        let err = f.setup.complete(7, None, "5C", -1).await.unwrap_err();
        assert!(matches!(err, SetupError::UnknownDevice(7)));

        let err = f.setup.complete(0, None, "9A", -1).await.unwrap_err();
        assert!(matches!(err, SetupError::UnknownTransponder { .. }));

        // Nothing was saved or launched.
        assert_eq!(f.setup.mode(), SetupMode::Wizard);
        assert_eq!(f.launcher.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reset_returns_to_wizard() {
        let f = fixture(vec![device(0, "00000001")], false).await;
        f.catalog.replace_for_device(0, vec![transponder("5C")]);
        f.setup.complete(0, None, "5C", -1).await.unwrap();

        f.setup.reset().await.unwrap();
        assert_eq!(f.setup.mode(), SetupMode::Wizard);
        assert!(f.setup.status().bindings.is_empty());
        assert!(!f.locks.is_locked(0));
        // keep_catalog_on_reset = false dropped the scan results.
        assert!(f.catalog.get(0).is_none());
    }

    #[tokio::test]
    async fn reset_can_preserve_catalog() {
        let f = fixture(vec![device(0, "00000001")], true).await;
        f.catalog.replace_for_device(0, vec![transponder("5C")]);
        f.setup.complete(0, None, "5C", -1).await.unwrap();

        f.setup.reset().await.unwrap();
        assert!(f.catalog.has_channel(0, "5C"));
    }

    #[tokio::test]
    async fn reset_cancels_active_scan() {
        let f = fixture(vec![device(0, "00000001")], true).await;

        f.scans.start_scan(0, -1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.locks.is_locked(0));

        f.setup.reset().await.unwrap();

        // The sweep was cancelled and drained, not just unlocked out
        // from under it; the device stays free afterwards.
        let progress = f.scans.progress(0).await;
        assert_eq!(progress.status, ScanStatus::Cancelled);
        assert_eq!(f.scans.active_count().await, 0);
        assert!(!f.locks.is_locked(0));
    }

    #[tokio::test]
    async fn replay_skips_serial_mismatch() {
        // Stored binding references a serial that is no longer present.
        let f = fixture(vec![device(0, "00000009")], true).await;
        {
            let mut config = f.setup.config.lock().unwrap();
            config.completed = true;
            config.bindings.push(StreamBinding {
                device_index: 0,
                device_serial: Some("00000001".into()),
                channel: "5C".into(),
                gain: -1,
            });
        }

        f.setup.replay(Duration::ZERO).await;
        assert_eq!(f.launcher.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn replay_follows_serial_to_new_index() {
        // Same dongle came back on index 3 after a reboot.
        let f = fixture(vec![device(3, "00000001")], true).await;
        {
            let mut config = f.setup.config.lock().unwrap();
            config.completed = true;
            config.bindings.push(StreamBinding {
                device_index: 0,
                device_serial: Some("00000001".into()),
                channel: "5C".into(),
                gain: -1,
            });
        }

        f.setup.replay(Duration::ZERO).await;
        // The launch was attempted against the re-resolved index. It
        // fails readiness with the fake launcher, which replay logs and
        // tolerates.
        let launches = f.launcher.launches.lock().unwrap();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].device_index, 3);
    }

    #[tokio::test]
    async fn replay_noop_when_not_completed() {
        let f = fixture(vec![device(0, "00000001")], true).await;
        f.setup.replay(Duration::ZERO).await;
        assert_eq!(f.launcher.count.load(Ordering::SeqCst), 0);
    }
}
