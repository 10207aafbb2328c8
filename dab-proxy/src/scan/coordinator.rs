//! Channel scan coordination.
//!
//! A scan sweeps one device across the Band III plan as a detached
//! background task. The device's `scanning` lock is held for the whole
//! sweep and released exactly once, whatever the outcome; progress is
//! observable at any time through polling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{error, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::catalog::{ChannelCatalog, Transponder};
use crate::channels::SCAN_CHANNELS;
use crate::tuner::lock::{LockError, LockPurpose, LockRegistry};

/// Scan configuration.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// How long to listen on one channel before giving up on it.
    pub channel_timeout: Duration,
    /// Extra wait after first service detection, so labels that arrive
    /// late can still resolve. Bounded; unresolved labels are accepted.
    pub settle_window: Duration,
    /// Cancellation and status polling granularity.
    pub poll_interval: Duration,
    /// Ceiling on the whole sweep.
    pub overall_timeout: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            channel_timeout: Duration::from_secs(10),
            settle_window: Duration::from_secs(3),
            poll_interval: Duration::from_millis(500),
            overall_timeout: Duration::from_secs(600),
        }
    }
}

/// Scan lifecycle errors.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The device is locked by another operation.
    #[error("Device {device_index} is busy ({purpose})")]
    DeviceBusy {
        device_index: u32,
        purpose: LockPurpose,
    },

    /// The scan backend could not be brought up or driven.
    #[error("Scan backend failed: {0}")]
    Backend(String),
}

/// Public scan status, as reported by progress polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Idle,
    Scanning,
    Complete,
    Cancelled,
    Error,
}

/// Live progress snapshot of one scan session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanProgress {
    pub status: ScanStatus,
    pub scan_id: u64,
    pub channels_scanned: u32,
    pub channels_total: u32,
    pub current_channel: Option<String>,
    pub transponders: Vec<Transponder>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScanProgress {
    fn idle() -> Self {
        Self {
            status: ScanStatus::Idle,
            scan_id: 0,
            channels_scanned: 0,
            channels_total: SCAN_CHANNELS.len() as u32,
            current_channel: None,
            transponders: Vec::new(),
            error: None,
        }
    }
}

/// One in-flight sweep.
struct ScanSession {
    device_index: u32,
    progress: Mutex<ScanProgress>,
    cancel: CancellationToken,
}

impl ScanSession {
    fn snapshot(&self) -> ScanProgress {
        self.progress.lock().expect("scan progress poisoned").clone()
    }

    fn update(&self, f: impl FnOnce(&mut ScanProgress)) {
        let mut progress = self.progress.lock().expect("scan progress poisoned");
        f(&mut progress);
    }
}

/// Observation of the currently tuned channel during a sweep.
#[async_trait]
pub trait ScanProbe: Send + Sync {
    /// Switch the sweep backend to another channel.
    async fn switch_channel(&mut self, channel: &str) -> Result<(), ScanError>;

    /// Snapshot the channel; `Some` once at least one service is seen.
    async fn observe(&mut self, channel: &str) -> Result<Option<Transponder>, ScanError>;

    /// Tear the sweep backend down. Must tolerate repeated calls.
    async fn finish(&mut self);
}

/// Brings up a sweep backend for one device.
#[async_trait]
pub trait ScanBackend: Send + Sync {
    async fn begin(&self, device_index: u32, gain: i32) -> Result<Box<dyn ScanProbe>, ScanError>;
}

/// Coordinates per-device channel sweeps.
pub struct ScanCoordinator {
    active: RwLock<HashMap<u32, Arc<ScanSession>>>,
    /// Final snapshots of finished sweeps, for progress polls after the
    /// session leaves the active set.
    finished: RwLock<HashMap<u32, ScanProgress>>,
    locks: Arc<LockRegistry>,
    backend: Arc<dyn ScanBackend>,
    catalog: Arc<ChannelCatalog>,
    config: ScanConfig,
    next_scan_id: AtomicU64,
}

impl ScanCoordinator {
    pub fn new(
        locks: Arc<LockRegistry>,
        backend: Arc<dyn ScanBackend>,
        catalog: Arc<ChannelCatalog>,
        config: ScanConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            active: RwLock::new(HashMap::new()),
            finished: RwLock::new(HashMap::new()),
            locks,
            backend,
            catalog,
            config,
            next_scan_id: AtomicU64::new(1),
        })
    }

    /// Number of sweeps currently in flight.
    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Device indices with a sweep in flight.
    pub async fn active_devices(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self.active.read().await.keys().copied().collect();
        indices.sort_unstable();
        indices
    }

    /// Cancel every active sweep and wait for the sweep tasks to drain,
    /// bounded by `drain_timeout`. Each sweep releases its own lock on
    /// the way out, so after the drain no scanning lock is left behind.
    pub async fn cancel_all(&self, drain_timeout: Duration) {
        let devices = self.active_devices().await;
        if devices.is_empty() {
            return;
        }
        for device_index in &devices {
            self.cancel_scan(*device_index).await;
        }

        let deadline = tokio::time::Instant::now() + drain_timeout;
        while self.active_count().await > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "{} scan(s) still draining after {:?}",
                    self.active_count().await,
                    drain_timeout
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Start a sweep for a device and return its scan id.
    ///
    /// Acquires the device's scanning lock; contention propagates as
    /// [`ScanError::DeviceBusy`] with no side effects. The sweep itself
    /// runs detached.
    pub async fn start_scan(
        self: &Arc<Self>,
        device_index: u32,
        gain: i32,
    ) -> Result<u64, ScanError> {
        match self.locks.acquire(
            device_index,
            LockPurpose::Scanning,
            Some("channel sweep".to_string()),
        ) {
            Ok(_) => {}
            Err(LockError::AlreadyLocked { purpose, .. }) => {
                return Err(ScanError::DeviceBusy {
                    device_index,
                    purpose,
                });
            }
            Err(LockError::Storage(e)) => {
                return Err(ScanError::Backend(format!("lock storage: {}", e)));
            }
        }

        let scan_id = self.next_scan_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(ScanSession {
            device_index,
            progress: Mutex::new(ScanProgress {
                status: ScanStatus::Scanning,
                scan_id,
                ..ScanProgress::idle()
            }),
            cancel: CancellationToken::new(),
        });

        self.active
            .write()
            .await
            .insert(device_index, Arc::clone(&session));

        info!(
            "Starting scan {} for device {} ({} channels)",
            scan_id,
            device_index,
            SCAN_CHANNELS.len()
        );

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.run_sweep(session, gain).await;
        });

        Ok(scan_id)
    }

    /// Cancel the sweep on a device, if any. Safe no-op otherwise.
    pub async fn cancel_scan(&self, device_index: u32) {
        if let Some(session) = self.active.read().await.get(&device_index) {
            info!("Cancelling scan for device {}", device_index);
            session.cancel.cancel();
        }
    }

    /// Progress of the current or most recent sweep for a device.
    pub async fn progress(&self, device_index: u32) -> ScanProgress {
        if let Some(session) = self.active.read().await.get(&device_index) {
            return session.snapshot();
        }
        if let Some(finished) = self.finished.read().await.get(&device_index) {
            return finished.clone();
        }
        ScanProgress::idle()
    }

    /// Drive one sweep to its end. Owns the lock release: exactly one
    /// release happens here for the acquisition in `start_scan`.
    async fn run_sweep(self: Arc<Self>, session: Arc<ScanSession>, gain: i32) {
        let device_index = session.device_index;

        let outcome = tokio::time::timeout(
            self.config.overall_timeout,
            self.sweep(Arc::clone(&session), gain),
        )
        .await;

        let status = match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                error!("Scan for device {} failed: {}", device_index, e);
                session.update(|p| p.error = Some(e.to_string()));
                ScanStatus::Error
            }
            Err(_) => {
                error!(
                    "Scan for device {} exceeded overall ceiling {:?}",
                    device_index, self.config.overall_timeout
                );
                session.update(|p| p.error = Some("scan timed out".to_string()));
                ScanStatus::Error
            }
        };

        session.update(|p| p.current_channel = None);

        if status == ScanStatus::Complete {
            let final_progress = session.snapshot();
            info!(
                "Scan {} for device {} complete: {} transponder(s)",
                final_progress.scan_id,
                device_index,
                final_progress.transponders.len()
            );
            self.catalog
                .replace_for_device(device_index, final_progress.transponders);
        }

        // Single release point for the whole sweep lifecycle. The final
        // status is published only afterwards, so a poller that sees a
        // finished scan also sees the device unlocked.
        self.locks.release(device_index);
        session.update(|p| p.status = status);

        let final_progress = session.snapshot();
        {
            let mut finished = self.finished.write().await;
            // A newer sweep may have started (and even finished) once
            // the lock was released; never clobber its snapshot.
            let newer_exists = finished
                .get(&device_index)
                .map(|p| p.scan_id > final_progress.scan_id)
                .unwrap_or(false);
            if !newer_exists {
                finished.insert(device_index, final_progress);
            }
        }

        // Remove by identity: the slot may already hold a successor
        // session that acquired the freed lock.
        let mut active = self.active.write().await;
        let is_own = active
            .get(&device_index)
            .map(|s| Arc::ptr_eq(s, &session))
            .unwrap_or(false);
        if is_own {
            active.remove(&device_index);
        }
    }

    /// The sweep proper: bring the backend up and walk the plan.
    async fn sweep(
        &self,
        session: Arc<ScanSession>,
        gain: i32,
    ) -> Result<ScanStatus, ScanError> {
        let device_index = session.device_index;
        let mut probe = self.backend.begin(device_index, gain).await?;

        let mut cancelled = false;
        for channel in SCAN_CHANNELS {
            if session.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            session.update(|p| p.current_channel = Some(channel.to_string()));

            if let Err(e) = probe.switch_channel(channel).await {
                probe.finish().await;
                return Err(e);
            }

            match self.listen_on_channel(&session, &mut *probe, channel).await {
                Ok(Some(transponder)) => {
                    info!(
                        "Device {}: found ensemble {:?} on {}",
                        device_index, transponder.ensemble_label, channel
                    );
                    session.update(|p| p.transponders.push(transponder));
                }
                Ok(None) => {}
                Err(e) => {
                    probe.finish().await;
                    return Err(e);
                }
            }

            session.update(|p| p.channels_scanned += 1);
        }

        probe.finish().await;

        if cancelled || session.cancel.is_cancelled() {
            info!("Scan for device {} cancelled", device_index);
            Ok(ScanStatus::Cancelled)
        } else {
            Ok(ScanStatus::Complete)
        }
    }

    /// Wait on one channel until a transponder shows up or the channel
    /// window ends. Cancellable at every polling tick.
    async fn listen_on_channel(
        &self,
        session: &ScanSession,
        probe: &mut dyn ScanProbe,
        channel: &str,
    ) -> Result<Option<Transponder>, ScanError> {
        let deadline = tokio::time::Instant::now() + self.config.channel_timeout;
        let mut found: Option<Transponder> = None;
        let mut settle_until: Option<tokio::time::Instant> = None;

        loop {
            let now = tokio::time::Instant::now();
            match settle_until {
                // Settle window elapsed: take the freshest snapshot.
                Some(t) if now >= t => break,
                None if now >= deadline => break,
                _ => {}
            }

            tokio::select! {
                _ = session.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            match probe.observe(channel).await {
                Ok(Some(transponder)) => {
                    if settle_until.is_none() {
                        // First detection: keep listening briefly so
                        // late-arriving labels can resolve.
                        settle_until = Some(now + self.config.settle_window);
                    }
                    found = Some(transponder);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "Status poll failed on channel {} for device {}: {}",
                        channel, session.device_index, e
                    );
                    return Err(e);
                }
            }
        }

        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ServiceRecord;
    use crate::tuner::lock::DEFAULT_MAX_LOCK_AGE;
    use crate::tuner::process::ProcessProbe;
    use std::sync::atomic::AtomicUsize;

    struct AlwaysAlive;
    impl ProcessProbe for AlwaysAlive {
        fn is_alive(&self, _pid: u32) -> bool {
            true
        }
    }

    /// Scripted backend: yields a transponder on the listed channels.
    struct ScriptedBackend {
        hits: Vec<&'static str>,
        finish_calls: Arc<AtomicUsize>,
    }

    struct ScriptedProbe {
        hits: Vec<&'static str>,
        current: Option<String>,
        finish_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ScanBackend for ScriptedBackend {
        async fn begin(
            &self,
            _device_index: u32,
            _gain: i32,
        ) -> Result<Box<dyn ScanProbe>, ScanError> {
            Ok(Box::new(ScriptedProbe {
                hits: self.hits.clone(),
                current: None,
                finish_calls: Arc::clone(&self.finish_calls),
            }))
        }
    }

    #[async_trait]
    impl ScanProbe for ScriptedProbe {
        async fn switch_channel(&mut self, channel: &str) -> Result<(), ScanError> {
            self.current = Some(channel.to_string());
            Ok(())
        }

        async fn observe(&mut self, channel: &str) -> Result<Option<Transponder>, ScanError> {
            if self.hits.contains(&channel) {
                Ok(Some(Transponder {
                    channel: channel.to_string(),
                    ensemble_label: Some(format!("Ensemble {}", channel)),
                    ensemble_id: Some("0x1234".into()),
                    services: vec![ServiceRecord {
                        sid: "0xC221".into(),
                        label: Some("Station".into()),
                        bitrate: Some(128),
                        codec: Some("DAB+".into()),
                        language: None,
                        programme_type: None,
                        transport_mode: Some("audio".into()),
                    }],
                }))
            } else {
                Ok(None)
            }
        }

        async fn finish(&mut self) {
            self.finish_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_config() -> ScanConfig {
        ScanConfig {
            channel_timeout: Duration::from_millis(10),
            settle_window: Duration::from_millis(5),
            poll_interval: Duration::from_millis(2),
            overall_timeout: Duration::from_secs(30),
        }
    }

    fn setup(
        dir: &std::path::Path,
        hits: Vec<&'static str>,
        config: ScanConfig,
    ) -> (Arc<ScanCoordinator>, Arc<LockRegistry>, Arc<ChannelCatalog>, Arc<AtomicUsize>) {
        let locks = Arc::new(
            LockRegistry::open(dir.join("locks"), Box::new(AlwaysAlive), DEFAULT_MAX_LOCK_AGE)
                .unwrap(),
        );
        let catalog = Arc::new(ChannelCatalog::load(dir.join("catalog.json")));
        let finish_calls = Arc::new(AtomicUsize::new(0));
        let backend = Arc::new(ScriptedBackend {
            hits,
            finish_calls: Arc::clone(&finish_calls),
        });
        let coordinator = ScanCoordinator::new(
            Arc::clone(&locks),
            backend,
            Arc::clone(&catalog),
            config,
        );
        (coordinator, locks, catalog, finish_calls)
    }

    async fn wait_until_finished(coordinator: &Arc<ScanCoordinator>, device: u32) -> ScanProgress {
        for _ in 0..2000 {
            let progress = coordinator.progress(device).await;
            if progress.status != ScanStatus::Scanning {
                return progress;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("scan did not finish in time");
    }

    #[tokio::test]
    async fn full_sweep_completes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, locks, catalog, finish_calls) =
            setup(dir.path(), vec!["5C", "12A"], fast_config());

        let scan_id = coordinator.start_scan(0, -1).await.unwrap();
        assert!(scan_id > 0);
        assert!(locks.is_locked(0));

        let progress = wait_until_finished(&coordinator, 0).await;
        assert_eq!(progress.status, ScanStatus::Complete);
        assert_eq!(progress.channels_scanned, progress.channels_total);
        assert_eq!(progress.channels_total, 38);
        assert_eq!(progress.transponders.len(), 2);

        // Lock released, backend torn down once, results persisted.
        assert!(!locks.is_locked(0));
        assert_eq!(finish_calls.load(Ordering::SeqCst), 1);
        assert_eq!(catalog.get(0).unwrap().len(), 2);
        assert_eq!(coordinator.active_count().await, 0);
    }

    #[tokio::test]
    async fn progress_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _locks, _catalog, _f) =
            setup(dir.path(), vec![], fast_config());

        coordinator.start_scan(0, -1).await.unwrap();

        let mut last = 0;
        loop {
            let progress = coordinator.progress(0).await;
            assert!(progress.channels_scanned >= last);
            last = progress.channels_scanned;
            if progress.status != ScanStatus::Scanning {
                assert_eq!(progress.channels_scanned, progress.channels_total);
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn concurrent_start_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _locks, _catalog, _f) =
            setup(dir.path(), vec![], fast_config());

        coordinator.start_scan(0, -1).await.unwrap();
        let err = coordinator.start_scan(0, -1).await.unwrap_err();
        assert!(matches!(
            err,
            ScanError::DeviceBusy {
                device_index: 0,
                purpose: LockPurpose::Scanning
            }
        ));

        // The first scan carries on to completion regardless.
        let progress = wait_until_finished(&coordinator, 0).await;
        assert_eq!(progress.status, ScanStatus::Complete);
    }

    #[tokio::test]
    async fn cancel_within_first_channel() {
        let dir = tempfile::tempdir().unwrap();
        let config = ScanConfig {
            // Long channel window so cancellation hits mid-channel.
            channel_timeout: Duration::from_secs(30),
            settle_window: Duration::from_millis(5),
            poll_interval: Duration::from_millis(2),
            overall_timeout: Duration::from_secs(60),
        };
        let (coordinator, locks, _catalog, _f) = setup(dir.path(), vec![], config);

        coordinator.start_scan(0, -1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.cancel_scan(0).await;

        let progress = wait_until_finished(&coordinator, 0).await;
        assert_eq!(progress.status, ScanStatus::Cancelled);
        assert!(progress.channels_scanned < progress.channels_total);
        assert!(!locks.is_locked(0));
    }

    #[tokio::test]
    async fn finished_sweep_does_not_evict_successor_session() {
        let dir = tempfile::tempdir().unwrap();
        let config = ScanConfig {
            channel_timeout: Duration::from_secs(30),
            settle_window: Duration::from_millis(5),
            poll_interval: Duration::from_millis(2),
            overall_timeout: Duration::from_secs(60),
        };
        let (coordinator, _locks, _catalog, _f) = setup(dir.path(), vec![], config);

        coordinator.start_scan(0, -1).await.unwrap();
        coordinator.cancel_scan(0).await;
        let progress = wait_until_finished(&coordinator, 0).await;
        assert_eq!(progress.status, ScanStatus::Cancelled);

        // The lock is released before the final status is published, so
        // a new scan can start here while the first sweep's bookkeeping
        // teardown is still trailing. Its session must stay visible.
        let second_id = coordinator.start_scan(0, -1).await.unwrap();
        assert!(second_id > progress.scan_id);
        for _ in 0..20 {
            let current = coordinator.progress(0).await;
            assert_eq!(current.status, ScanStatus::Scanning);
            assert_eq!(current.scan_id, second_id);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(coordinator.active_count().await, 1);

        coordinator.cancel_scan(0).await;
        let finished = wait_until_finished(&coordinator, 0).await;
        assert_eq!(finished.scan_id, second_id);
    }

    #[tokio::test]
    async fn cancel_all_drains_active_sweeps() {
        let dir = tempfile::tempdir().unwrap();
        let config = ScanConfig {
            channel_timeout: Duration::from_secs(30),
            settle_window: Duration::from_millis(5),
            poll_interval: Duration::from_millis(2),
            overall_timeout: Duration::from_secs(60),
        };
        let (coordinator, locks, _catalog, _f) = setup(dir.path(), vec![], config);

        coordinator.start_scan(0, -1).await.unwrap();
        coordinator.start_scan(1, -1).await.unwrap();
        assert_eq!(coordinator.active_devices().await, vec![0, 1]);

        coordinator.cancel_all(Duration::from_secs(10)).await;
        assert_eq!(coordinator.active_count().await, 0);
        assert!(!locks.is_locked(0));
        assert!(!locks.is_locked(1));
        assert_eq!(
            coordinator.progress(0).await.status,
            ScanStatus::Cancelled
        );
        assert_eq!(
            coordinator.progress(1).await.status,
            ScanStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn cancel_without_scan_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _locks, _catalog, _f) =
            setup(dir.path(), vec![], fast_config());
        coordinator.cancel_scan(3).await;
        assert_eq!(coordinator.progress(3).await.status, ScanStatus::Idle);
    }

    #[tokio::test]
    async fn zero_transponders_is_valid_completion() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _locks, catalog, _f) =
            setup(dir.path(), vec![], fast_config());

        coordinator.start_scan(1, -1).await.unwrap();
        let progress = wait_until_finished(&coordinator, 1).await;
        assert_eq!(progress.status, ScanStatus::Complete);
        assert!(progress.transponders.is_empty());
        // The empty result still replaces whatever was stored before.
        assert_eq!(catalog.get(1).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn overall_timeout_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let config = ScanConfig {
            channel_timeout: Duration::from_secs(30),
            settle_window: Duration::from_millis(5),
            poll_interval: Duration::from_millis(2),
            overall_timeout: Duration::from_millis(30),
        };
        let (coordinator, locks, _catalog, _f) = setup(dir.path(), vec![], config);

        coordinator.start_scan(0, -1).await.unwrap();
        let progress = wait_until_finished(&coordinator, 0).await;
        assert_eq!(progress.status, ScanStatus::Error);
        assert_eq!(progress.error.as_deref(), Some("scan timed out"));
        assert!(!locks.is_locked(0));
    }
}
