//! Exclusive device lock registry.
//!
//! Lock presence is the mutual-exclusion primitive: one JSON record per
//! locked device index, created with `create_new` so the existence check
//! and the create are a single atomic step. An in-memory mirror serves
//! cheap reads; the files make held locks survive a crash so a restarted
//! orchestrator can reap them.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tuner::process::ProcessProbe;

/// Default ceiling on lock age, applied regardless of owner liveness.
/// Backstop against liveness false positives such as PID reuse.
pub const DEFAULT_MAX_LOCK_AGE: Duration = Duration::from_secs(600);

/// What a device lock was taken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockPurpose {
    Scanning,
    Streaming,
}

impl std::fmt::Display for LockPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockPurpose::Scanning => write!(f, "scanning"),
            LockPurpose::Streaming => write!(f, "streaming"),
        }
    }
}

/// One held lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub device_index: u32,
    pub purpose: LockPurpose,
    /// PID of the owning process, probed during reaping.
    pub pid: u32,
    /// Free-form context, e.g. the channel being scanned.
    pub details: Option<String>,
    /// Acquisition time, unix seconds.
    pub acquired_at: i64,
}

impl LockRecord {
    fn age(&self, now: i64) -> Duration {
        Duration::from_secs(now.saturating_sub(self.acquired_at).max(0) as u64)
    }
}

/// Lock-related errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// Device is already locked.
    #[error("Device {device_index} is already locked for {purpose}")]
    AlreadyLocked {
        device_index: u32,
        purpose: LockPurpose,
    },

    /// Failed to persist or remove a lock record.
    #[error("Lock storage error: {0}")]
    Storage(#[from] std::io::Error),
}

/// Registry of exclusive per-device locks, backed by one file per lock.
pub struct LockRegistry {
    dir: PathBuf,
    held: Mutex<HashMap<u32, LockRecord>>,
    probe: Box<dyn ProcessProbe>,
    max_age: Duration,
}

impl LockRegistry {
    /// Open the registry, loading any lock records left behind by a
    /// previous run. Call [`LockRegistry::reap_stale`] once afterwards.
    pub fn open(
        dir: impl Into<PathBuf>,
        probe: Box<dyn ProcessProbe>,
        max_age: Duration,
    ) -> Result<Self, LockError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut held = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(LockError::from)
                .and_then(|s| {
                    serde_json::from_str::<LockRecord>(&s)
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e).into())
                }) {
                Ok(record) => {
                    info!(
                        "Recovered lock for device {} ({}) from {:?}",
                        record.device_index, record.purpose, path
                    );
                    held.insert(record.device_index, record);
                }
                Err(e) => {
                    warn!("Dropping unreadable lock record {:?}: {}", path, e);
                    let _ = fs::remove_file(&path);
                }
            }
        }

        Ok(Self {
            dir,
            held: Mutex::new(held),
            probe,
            max_age,
        })
    }

    fn lock_path(&self, device_index: u32) -> PathBuf {
        self.dir.join(format!("device-{}.json", device_index))
    }

    /// Acquire an exclusive lock on a device.
    ///
    /// Atomic with respect to concurrent callers: the backing record is
    /// created with `create_new`, so exactly one acquisition wins.
    pub fn acquire(
        &self,
        device_index: u32,
        purpose: LockPurpose,
        details: Option<String>,
    ) -> Result<LockRecord, LockError> {
        let record = LockRecord {
            device_index,
            purpose,
            pid: std::process::id(),
            details,
            acquired_at: chrono::Utc::now().timestamp(),
        };

        let path = self.lock_path(device_index);
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let purpose = self
                    .held
                    .lock()
                    .expect("lock registry poisoned")
                    .get(&device_index)
                    .map(|r| r.purpose)
                    .unwrap_or(purpose);
                return Err(LockError::AlreadyLocked {
                    device_index,
                    purpose,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let body = serde_json::to_vec_pretty(&record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        if let Err(e) = file.write_all(&body) {
            // The record file exists but is unusable; undo the claim.
            drop(file);
            let _ = fs::remove_file(&path);
            return Err(e.into());
        }

        self.held
            .lock()
            .expect("lock registry poisoned")
            .insert(device_index, record.clone());

        debug!("Acquired {} lock for device {}", purpose, device_index);
        Ok(record)
    }

    /// Release a device lock. Idempotent; returns whether a lock was
    /// actually removed.
    pub fn release(&self, device_index: u32) -> bool {
        let removed = self
            .held
            .lock()
            .expect("lock registry poisoned")
            .remove(&device_index)
            .is_some();

        match fs::remove_file(self.lock_path(device_index)) {
            Ok(()) => {
                debug!("Released lock for device {}", device_index);
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => removed,
            Err(e) => {
                warn!("Failed to remove lock file for device {}: {}", device_index, e);
                removed
            }
        }
    }

    /// Release every held lock (full reset path).
    pub fn release_all(&self) {
        let indices: Vec<u32> = self
            .held
            .lock()
            .expect("lock registry poisoned")
            .keys()
            .copied()
            .collect();
        for index in indices {
            self.release(index);
        }
    }

    pub fn is_locked(&self, device_index: u32) -> bool {
        self.held
            .lock()
            .expect("lock registry poisoned")
            .contains_key(&device_index)
    }

    pub fn get(&self, device_index: u32) -> Option<LockRecord> {
        self.held
            .lock()
            .expect("lock registry poisoned")
            .get(&device_index)
            .cloned()
    }

    /// Snapshot of all held locks.
    pub fn all(&self) -> Vec<LockRecord> {
        let mut locks: Vec<LockRecord> = self
            .held
            .lock()
            .expect("lock registry poisoned")
            .values()
            .cloned()
            .collect();
        locks.sort_by_key(|r| r.device_index);
        locks
    }

    pub fn count(&self) -> usize {
        self.held.lock().expect("lock registry poisoned").len()
    }

    /// Remove locks whose owner is dead or whose age exceeds the
    /// ceiling. Best-effort: failures are logged, never propagated.
    pub fn reap_stale(&self) -> usize {
        let now = chrono::Utc::now().timestamp();
        let snapshot = self.all();
        let mut reaped = 0;

        for record in snapshot {
            let age = record.age(now);
            let owner_alive = self.probe.is_alive(record.pid);

            let reason = if !owner_alive {
                Some(format!("owner pid {} is dead", record.pid))
            } else if age > self.max_age {
                Some(format!("age {:?} exceeds ceiling {:?}", age, self.max_age))
            } else {
                None
            };

            if let Some(reason) = reason {
                info!(
                    "Reaping stale {} lock for device {}: {}",
                    record.purpose, record.device_index, reason
                );
                self.release(record.device_index);
                reaped += 1;
            }
        }

        reaped
    }
}
