//! Pool of running decoder instances, one per active device.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::RwLock;

use crate::backend::BackendClient;
use crate::tuner::instance::{
    InstanceError, InstanceLauncher, InstanceRecord, LaunchSpec, STOP_GRACE,
};
use crate::tuner::lock::{LockError, LockPurpose, LockRegistry};

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct InstancePoolConfig {
    /// Base port for rtl_tcp intermediaries (instance uses base + index).
    pub rtl_tcp_base_port: u16,
    /// Base port for decoder control interfaces (base + index).
    pub backend_base_port: u16,
    /// How long to wait for a freshly launched instance to answer.
    pub start_timeout: Duration,
    /// Poll interval while waiting for readiness.
    pub readiness_poll_interval: Duration,
    /// Consecutive failed health probes before an instance is reaped.
    pub health_failure_threshold: u32,
}

impl Default for InstancePoolConfig {
    fn default() -> Self {
        Self {
            rtl_tcp_base_port: 1234,
            backend_base_port: 7979,
            start_timeout: Duration::from_secs(15),
            readiness_poll_interval: Duration::from_millis(250),
            health_failure_threshold: 2,
        }
    }
}

/// Manages the set of running decoder instances.
///
/// Starting and stopping different device indices proceed independently;
/// the bookkeeping map is the only shared point.
pub struct InstancePool {
    instances: RwLock<HashMap<u32, Arc<InstanceRecord>>>,
    launcher: Arc<dyn InstanceLauncher>,
    locks: Arc<LockRegistry>,
    config: InstancePoolConfig,
}

impl InstancePool {
    pub fn new(
        launcher: Arc<dyn InstanceLauncher>,
        locks: Arc<LockRegistry>,
        config: InstancePoolConfig,
    ) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            launcher,
            locks,
            config,
        }
    }

    /// Deterministic rtl_tcp port for a device index.
    pub fn rtl_tcp_port(&self, device_index: u32) -> u16 {
        self.config.rtl_tcp_base_port + device_index as u16
    }

    /// Deterministic control port for a device index.
    pub fn control_port(&self, device_index: u32) -> u16 {
        self.config.backend_base_port + device_index as u16
    }

    pub fn launcher(&self) -> Arc<dyn InstanceLauncher> {
        Arc::clone(&self.launcher)
    }

    /// Start an instance for a device, or retune the running one.
    ///
    /// A fresh start acquires the device's streaming lock; a retune
    /// reuses the lock already held for the running instance.
    pub async fn start(
        &self,
        device_index: u32,
        device_serial: Option<String>,
        channel: &str,
        gain: i32,
    ) -> Result<Arc<InstanceRecord>, InstanceError> {
        // Idempotent retune: an already-running index switches channel
        // in place instead of erroring.
        if let Some(record) = self.get(device_index).await {
            info!(
                "Retuning device {} from {} to {}",
                device_index,
                record.channel(),
                channel
            );
            record.client().set_channel(channel).await?;
            record.set_channel(channel);
            return Ok(record);
        }

        let lock = match self.locks.acquire(
            device_index,
            LockPurpose::Streaming,
            Some(format!("channel {}", channel)),
        ) {
            Ok(lock) => lock,
            Err(LockError::AlreadyLocked { purpose, .. }) => {
                return Err(InstanceError::DeviceBusy {
                    device_index,
                    purpose,
                })
            }
            Err(LockError::Storage(e)) => {
                return Err(InstanceError::LaunchFailed(format!(
                    "lock storage: {}",
                    e
                )))
            }
        };
        debug!(
            "Holding {} lock for device {}",
            lock.purpose, lock.device_index
        );

        let spec = LaunchSpec {
            device_index,
            device_serial,
            channel: channel.to_string(),
            gain,
            rtl_tcp_port: self.rtl_tcp_port(device_index),
            control_port: self.control_port(device_index),
        };

        match self.launch_and_wait(&spec).await {
            Ok(record) => {
                let record = Arc::new(record);
                self.instances
                    .write()
                    .await
                    .insert(device_index, Arc::clone(&record));
                info!(
                    "Instance for device {} up on control port {}",
                    device_index, record.control_port
                );
                Ok(record)
            }
            Err(e) => {
                // Never leave the lock behind on a failed start.
                self.locks.release(device_index);
                Err(e)
            }
        }
    }

    async fn launch_and_wait(&self, spec: &LaunchSpec) -> Result<InstanceRecord, InstanceError> {
        let backend = self.launcher.launch(spec).await?;
        let client = BackendClient::new(spec.control_port);
        let record = InstanceRecord::new(spec, backend, client);

        let deadline = tokio::time::Instant::now() + self.config.start_timeout;
        loop {
            if record.client().is_reachable().await {
                return Ok(record);
            }
            if tokio::time::Instant::now() >= deadline {
                record.shutdown(STOP_GRACE).await;
                return Err(InstanceError::StartTimeout(spec.device_index));
            }
            tokio::time::sleep(self.config.readiness_poll_interval).await;
        }
    }

    pub async fn get(&self, device_index: u32) -> Option<Arc<InstanceRecord>> {
        self.instances.read().await.get(&device_index).cloned()
    }

    pub async fn count(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn device_indices(&self) -> Vec<u32> {
        let mut keys: Vec<u32> = self.instances.read().await.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Stop one instance, or every instance when no index is given.
    /// Tolerates the underlying processes already being gone.
    pub async fn stop(&self, device_index: Option<u32>) {
        let targets: Vec<Arc<InstanceRecord>> = {
            let mut instances = self.instances.write().await;
            match device_index {
                Some(index) => instances.remove(&index).into_iter().collect(),
                None => instances.drain().map(|(_, r)| r).collect(),
            }
        };

        for record in targets {
            record.shutdown(STOP_GRACE).await;
            self.locks.release(record.device_index);
            info!("Stopped instance for device {}", record.device_index);
        }
    }

    /// Probe every instance once; instances past the failure threshold
    /// are treated as stopped and reaped.
    pub async fn run_health_checks(&self) {
        let records: Vec<Arc<InstanceRecord>> =
            self.instances.read().await.values().cloned().collect();

        for record in records {
            let reachable = record.client().is_reachable().await;
            let failures = record.note_health(reachable);
            if !reachable {
                warn!(
                    "Health probe failed for device {} ({} consecutive)",
                    record.device_index, failures
                );
                if failures >= self.config.health_failure_threshold {
                    warn!(
                        "Instance for device {} unreachable, reaping",
                        record.device_index
                    );
                    self.stop(Some(record.device_index)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuner::instance::RunningBackend;
    use crate::tuner::lock::DEFAULT_MAX_LOCK_AGE;
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

    struct NullBackend;

    #[async_trait]
    impl RunningBackend for NullBackend {
        async fn shutdown(&mut self, _grace: Duration) {}
        fn pids(&self) -> Vec<u32> {
            vec![]
        }
    }

    /// Launcher that records specs and spawns nothing.
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

    fn locks(dir: &std::path::Path) -> Arc<LockRegistry> {
        Arc::new(
            LockRegistry::open(dir, Box::new(AlwaysAlive), DEFAULT_MAX_LOCK_AGE).unwrap(),
        )
    }

    fn pool_config() -> InstancePoolConfig {
        InstancePoolConfig {
            // Readiness probes hit nothing in tests; keep the wait short.
            start_timeout: Duration::from_millis(1),
            readiness_poll_interval: Duration::from_millis(1),
            ..InstancePoolConfig::default()
        }
    }

    #[test]
    fn port_assignment_is_deterministic_and_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let pool = InstancePool::new(
            Arc::new(RecordingLauncher::default()),
            locks(dir.path()),
            InstancePoolConfig::default(),
        );

        assert_eq!(pool.rtl_tcp_port(0), 1234);
        assert_eq!(pool.rtl_tcp_port(3), 1237);
        assert_eq!(pool.control_port(0), 7979);
        assert_eq!(pool.control_port(3), 7982);
        // Repeated computation yields the same ports.
        assert_eq!(pool.rtl_tcp_port(3), pool.rtl_tcp_port(3));

        let mut seen = std::collections::HashSet::new();
        for index in 0..=15u32 {
            assert!(seen.insert(pool.rtl_tcp_port(index)));
            assert!(seen.insert(pool.control_port(index)));
        }
    }

    #[tokio::test]
    async fn failed_start_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let locks = locks(dir.path());
        let pool = InstancePool::new(
            Arc::new(RecordingLauncher::default()),
            Arc::clone(&locks),
            pool_config(),
        );

        // Launch succeeds but readiness never does, so start times out.
        let err = pool.start(0, None, "5A", -1).await.unwrap_err();
        assert!(matches!(err, InstanceError::StartTimeout(0)));
        assert!(!locks.is_locked(0));
        assert_eq!(pool.count().await, 0);
    }

    #[tokio::test]
    async fn start_conflicts_with_existing_lock() {
        let dir = tempfile::tempdir().unwrap();
        let locks = locks(dir.path());
        locks
            .acquire(1, LockPurpose::Scanning, None)
            .unwrap();

        let pool = InstancePool::new(
            Arc::new(RecordingLauncher::default()),
            Arc::clone(&locks),
            pool_config(),
        );
        let err = pool.start(1, None, "7B", -1).await.unwrap_err();
        assert!(matches!(
            err,
            InstanceError::DeviceBusy {
                device_index: 1,
                purpose: LockPurpose::Scanning
            }
        ));
    }

    #[tokio::test]
    async fn running_index_takes_retune_path() {
        let dir = tempfile::tempdir().unwrap();
        let locks = locks(dir.path());
        let launcher = Arc::new(RecordingLauncher::default());
        let pool = InstancePool::new(
            Arc::clone(&launcher) as Arc<dyn InstanceLauncher>,
            Arc::clone(&locks),
            pool_config(),
        );

        // Simulate a running instance without spawning anything.
        locks
            .acquire(2, LockPurpose::Streaming, Some("channel 5A".into()))
            .unwrap();
        let spec = LaunchSpec {
            device_index: 2,
            device_serial: None,
            channel: "5A".into(),
            gain: -1,
            rtl_tcp_port: pool.rtl_tcp_port(2),
            control_port: pool.control_port(2),
        };
        let record = Arc::new(InstanceRecord::new(
            &spec,
            Box::new(NullBackend),
            BackendClient::new(spec.control_port),
        ));
        pool.instances.write().await.insert(2, record);

        // A second start for the same index must retune in place, not
        // report the device busy or launch a second backend. The switch
        // call itself fails here (nothing listens on the port), which
        // is enough to prove the path taken.
        let err = pool.start(2, None, "7D", -1).await.unwrap_err();
        assert!(matches!(err, InstanceError::Backend(_)));
        assert_eq!(launcher.count.load(Ordering::SeqCst), 0);
        assert!(locks.is_locked(2));
    }

    #[tokio::test]
    async fn stop_is_safe_without_instances() {
        let dir = tempfile::tempdir().unwrap();
        let pool = InstancePool::new(
            Arc::new(RecordingLauncher::default()),
            locks(dir.path()),
            pool_config(),
        );
        pool.stop(Some(4)).await;
        pool.stop(None).await;
        assert_eq!(pool.count().await, 0);
    }
}
