use std::collections::BTreeSet;
use std::fmt;
use std::time::SystemTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::constants::UNKNOWN_DEVICE_NAME;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Failed,
}

impl ConnectionState {
    /// Whether a connection is being set up, is up, or is being torn down.
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Disconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            ConnectionState::Discovered => "Discovered",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting",
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Failed => "Failed",
        };

        write!(f, "{}", result)
    }
}

/// A single sighting of a peripheral, as reported by the radio.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: Option<String>,
    pub last_seen: SystemTime,
    pub rssi: Option<i16>,
    pub state: ConnectionState,
    pub services: BTreeSet<Uuid>,
}

impl Device {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_DEVICE_NAME)
    }

    /// Fold a newer sighting of the same device into this record. The connection state is
    /// left untouched.
    pub fn merge(&mut self, newer: Device) {
        if newer.name.is_some() {
            self.name = newer.name;
        }
        if newer.rssi.is_some() {
            self.rssi = newer.rssi;
        }
        self.last_seen = newer.last_seen;
        self.services.extend(newer.services);
    }
}

impl From<Advertisement> for Device {
    fn from(advertisement: Advertisement) -> Self {
        Device {
            id: advertisement.id,
            name: advertisement.name,
            last_seen: SystemTime::now(),
            rssi: advertisement.rssi,
            state: ConnectionState::Discovered,
            services: advertisement.services.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFilter {
    All,
    Connected,
    State(ConnectionState),
}

impl DeviceFilter {
    pub fn matches(&self, device: &Device) -> bool {
        match self {
            DeviceFilter::All => true,
            DeviceFilter::Connected => device.state == ConnectionState::Connected,
            DeviceFilter::State(state) => device.state == *state,
        }
    }
}
