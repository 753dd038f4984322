//! Registered device model.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connectivity status recorded for a device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Device registered and considered reachable.
    Online,
}

impl DeviceStatus {
    /// Persisted string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
        }
    }
}

/// A recording agent known to the coordinator.
///
/// The whole record is replaced on every registration; there is no
/// partial update path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    /// Unique device identifier chosen by the agent.
    pub device_id: String,
    /// Address the registration arrived from.
    pub ip: Option<String>,
    /// Time of the most recent registration.
    pub last_seen: DateTime<Utc>,
    /// Current status.
    pub status: DeviceStatus,
    /// Agent software version.
    pub version: String,
    /// Cameras attached to the device.
    pub cameras: BTreeSet<String>,
    /// Features the agent advertised.
    pub capabilities: Vec<String>,
}

impl Device {
    /// Build a freshly registered, online device stamped with the current time.
    #[must_use]
    pub fn new(
        device_id: String,
        ip: Option<String>,
        version: String,
        cameras: impl IntoIterator<Item = String>,
        capabilities: Vec<String>,
    ) -> Self {
        Self {
            device_id,
            ip,
            last_seen: Utc::now(),
            status: DeviceStatus::Online,
            version,
            cameras: cameras.into_iter().collect(),
            capabilities,
        }
    }

    /// Condensed view used by the status endpoint.
    #[must_use]
    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            cameras: self.cameras.len(),
            last_seen: self.last_seen,
        }
    }
}

/// Per-device entry of the `/status` listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSummary {
    /// Number of registered cameras.
    pub cameras: usize,
    /// Time of the most recent registration.
    pub last_seen: DateTime<Utc>,
}
