//! Tuner device orchestration: locks, processes, instances.

pub mod instance;
pub mod lock;
pub mod pool;
pub mod process;

pub use instance::{InstanceError, InstanceLauncher, InstanceRecord, LaunchSpec, ProcessLauncher};
pub use lock::{LockError, LockPurpose, LockRecord, LockRegistry};
pub use pool::{InstancePool, InstancePoolConfig};
pub use process::{ProcessProbe, SignalProbe};
