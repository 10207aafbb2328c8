//! Per-device channel catalog.
//!
//! Stores the transponders discovered by the most recent scan of each
//! device. A completed scan replaces the device's entry wholesale; the
//! catalog never merges results from different scans.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::backend::TRANSPORT_MODE_AUDIO;

/// One service discovered within an ensemble.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub sid: String,
    pub label: Option<String>,
    pub bitrate: Option<u32>,
    pub codec: Option<String>,
    pub language: Option<String>,
    pub programme_type: Option<String>,
    pub transport_mode: Option<String>,
}

impl ServiceRecord {
    /// Only audio services are streamable; others are retained but
    /// filtered at presentation time.
    pub fn is_audio(&self) -> bool {
        self.transport_mode.as_deref() == Some(TRANSPORT_MODE_AUDIO)
    }
}

/// One discovered ensemble on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transponder {
    pub channel: String,
    pub ensemble_label: Option<String>,
    pub ensemble_id: Option<String>,
    pub services: Vec<ServiceRecord>,
}

/// Disk-backed map of device index to its latest scan results.
pub struct ChannelCatalog {
    path: PathBuf,
    entries: Mutex<HashMap<u32, Vec<Transponder>>>,
}

impl ChannelCatalog {
    /// Load the catalog document, starting empty if absent or unreadable.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(body) => match serde_json::from_str(&body) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Ignoring malformed catalog {:?}: {}", path, e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    /// Replace the stored transponder list for one device (upsert).
    pub fn replace_for_device(&self, device_index: u32, transponders: Vec<Transponder>) {
        let mut entries = self.entries.lock().expect("catalog poisoned");
        entries.insert(device_index, transponders);
        self.persist(&entries);
    }

    /// Latest scan results for a device, if any.
    pub fn get(&self, device_index: u32) -> Option<Vec<Transponder>> {
        self.entries
            .lock()
            .expect("catalog poisoned")
            .get(&device_index)
            .cloned()
    }

    /// Whether a device's catalog contains the given channel.
    pub fn has_channel(&self, device_index: u32, channel: &str) -> bool {
        self.entries
            .lock()
            .expect("catalog poisoned")
            .get(&device_index)
            .map(|ts| ts.iter().any(|t| t.channel == channel))
            .unwrap_or(false)
    }

    /// Drop all entries (full reset without catalog preservation).
    pub fn clear(&self) {
        let mut entries = self.entries.lock().expect("catalog poisoned");
        entries.clear();
        self.persist(&entries);
    }

    fn persist(&self, entries: &HashMap<u32, Vec<Transponder>>) {
        let body = match serde_json::to_vec_pretty(entries) {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to serialize catalog: {}", e);
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.path, body) {
            warn!("Failed to write catalog {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transponder(channel: &str, sid: &str) -> Transponder {
        Transponder {
            channel: channel.into(),
            ensemble_label: Some("Test".into()),
            ensemble_id: Some("0x1000".into()),
            services: vec![ServiceRecord {
                sid: sid.into(),
                label: Some("Station".into()),
                bitrate: Some(128),
                codec: Some("DAB+".into()),
                language: None,
                programme_type: None,
                transport_mode: Some("audio".into()),
            }],
        }
    }

    #[test]
    fn replace_not_merge() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = ChannelCatalog::load(dir.path().join("catalog.json"));

        catalog.replace_for_device(0, vec![transponder("5A", "0x0001"), transponder("7D", "0x0002")]);
        catalog.replace_for_device(0, vec![transponder("12A", "0x0003")]);

        let stored = catalog.get(0).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].channel, "12A");
    }

    #[test]
    fn empty_result_is_stored() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = ChannelCatalog::load(dir.path().join("catalog.json"));

        catalog.replace_for_device(1, vec![transponder("8B", "0x0001")]);
        catalog.replace_for_device(1, Vec::new());
        assert_eq!(catalog.get(1).unwrap().len(), 0);
    }

    #[test]
    fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        {
            let catalog = ChannelCatalog::load(&path);
            catalog.replace_for_device(2, vec![transponder("9C", "0xC221")]);
        }
        let catalog = ChannelCatalog::load(&path);
        assert!(catalog.has_channel(2, "9C"));
        assert!(!catalog.has_channel(2, "9D"));
        assert!(catalog.get(3).is_none());
    }
}
