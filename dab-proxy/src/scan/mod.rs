//! Channel scanning.

pub mod coordinator;

pub use coordinator::{
    ScanBackend, ScanConfig, ScanCoordinator, ScanError, ScanProbe, ScanProgress, ScanStatus,
};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::BackendClient;
use crate::catalog::Transponder;
use crate::channels::SCAN_CHANNELS;
use crate::tuner::instance::{InstanceLauncher, LaunchSpec, RunningBackend, STOP_GRACE};

/// Consecutive failed status polls tolerated mid-sweep before the
/// backend is declared dead.
const MAX_POLL_FAILURES: u32 = 5;

/// Real sweep backend: launches a decoder instance on the scan device
/// and drives it through its control interface.
pub struct LaunchedScanBackend {
    launcher: Arc<dyn InstanceLauncher>,
    rtl_tcp_base_port: u16,
    backend_base_port: u16,
    start_timeout: Duration,
    readiness_poll_interval: Duration,
}

impl LaunchedScanBackend {
    pub fn new(
        launcher: Arc<dyn InstanceLauncher>,
        rtl_tcp_base_port: u16,
        backend_base_port: u16,
        start_timeout: Duration,
    ) -> Self {
        Self {
            launcher,
            rtl_tcp_base_port,
            backend_base_port,
            start_timeout,
            readiness_poll_interval: Duration::from_millis(250),
        }
    }
}

#[async_trait]
impl ScanBackend for LaunchedScanBackend {
    async fn begin(&self, device_index: u32, gain: i32) -> Result<Box<dyn ScanProbe>, ScanError> {
        let spec = LaunchSpec {
            device_index,
            device_serial: None,
            channel: SCAN_CHANNELS[0].to_string(),
            gain,
            rtl_tcp_port: self.rtl_tcp_base_port + device_index as u16,
            control_port: self.backend_base_port + device_index as u16,
        };

        let mut backend = self
            .launcher
            .launch(&spec)
            .await
            .map_err(|e| ScanError::Backend(e.to_string()))?;

        let client = BackendClient::new(spec.control_port);
        let deadline = tokio::time::Instant::now() + self.start_timeout;
        loop {
            if client.is_reachable().await {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                backend.shutdown(STOP_GRACE).await;
                return Err(ScanError::Backend(format!(
                    "decoder for device {} did not come up in time",
                    device_index
                )));
            }
            tokio::time::sleep(self.readiness_poll_interval).await;
        }

        Ok(Box::new(LaunchedScanProbe {
            backend: Some(backend),
            client,
            poll_failures: 0,
        }))
    }
}

struct LaunchedScanProbe {
    backend: Option<Box<dyn RunningBackend>>,
    client: BackendClient,
    poll_failures: u32,
}

#[async_trait]
impl ScanProbe for LaunchedScanProbe {
    async fn switch_channel(&mut self, channel: &str) -> Result<(), ScanError> {
        self.client
            .set_channel(channel)
            .await
            .map_err(|e| ScanError::Backend(e.to_string()))
    }

    async fn observe(&mut self, channel: &str) -> Result<Option<Transponder>, ScanError> {
        match self.client.mux_status().await {
            Ok(status) => {
                self.poll_failures = 0;
                if status.services.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(status.to_transponder(channel)))
                }
            }
            Err(e) => {
                // Single failed polls happen around channel switches;
                // a run of them means the decoder is gone.
                self.poll_failures += 1;
                if self.poll_failures >= MAX_POLL_FAILURES {
                    Err(ScanError::Backend(e.to_string()))
                } else {
                    Ok(None)
                }
            }
        }
    }

    async fn finish(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.shutdown(STOP_GRACE).await;
        }
    }
}
