use crate::device::types::{ConnectionState, Device};
use crate::error::BleError;
use crate::radio::AdapterState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStateReason {
    Started,
    Stopped,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DeviceDiscovered { device: Device },
    ConnectionStateChanged { id: String, previous: ConnectionState, current: ConnectionState },
    DeviceConnected { id: String },
    DeviceDisconnected { id: String },
    ScanStateChanged { scanning: bool, reason: ScanStateReason },
    Error { id: Option<String>, error: BleError },
    AdapterStateChanged { state: AdapterState },
}

impl Event {
    /// Name of the event as a host bridge emits it.
    pub fn bridge_name(&self) -> &'static str {
        match self {
            Event::DeviceDiscovered { .. } => "BleManagerDiscoverPeripheral",
            Event::ConnectionStateChanged { .. } => "BleManagerConnectionStateChanged",
            Event::DeviceConnected { .. } => "BleManagerConnectPeripheral",
            Event::DeviceDisconnected { .. } => "BleManagerDisconnectPeripheral",
            Event::ScanStateChanged { scanning: true, .. } => "BleManagerStartScan",
            Event::ScanStateChanged { scanning: false, .. } => "BleManagerStopScan",
            Event::Error { .. } => "BleManagerError",
            Event::AdapterStateChanged { .. } => "BleManagerDidUpdateState",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_changes_use_the_bridge_state_event() {
        let event = Event::AdapterStateChanged { state: AdapterState::PoweredOff };
        assert_eq!(event.bridge_name(), "BleManagerDidUpdateState");
        assert_eq!(Event::ScanStateChanged { scanning: false, reason: ScanStateReason::TimedOut }.bridge_name(), "BleManagerStopScan");
    }
}
