use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::device::constants::{CONNECT_DEADLINE, DISCONNECT_DEADLINE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RadioKind {
    Btleplug,
    Simulated,
}

impl std::fmt::Display for RadioKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let result = match self {
            RadioKind::Btleplug => "btleplug",
            RadioKind::Simulated => "simulated",
        };

        write!(f, "{}", result)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub connect_timeout_ms: u64,
    pub disconnect_timeout_ms: u64,
    /// Connecting + connected + disconnecting devices allowed at once. Unlimited when absent.
    pub max_concurrent_connections: Option<usize>,
    pub radio: RadioKind,
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            connect_timeout_ms: CONNECT_DEADLINE,
            disconnect_timeout_ms: DISCONNECT_DEADLINE,
            max_concurrent_connections: None,
            radio: RadioKind::Btleplug,
        }
    }
}
