use std::io;
use std::str::Utf8Error;
use thiserror::Error;
use btleplug;
use serde_json;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Failure detail reported by a radio backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    #[error("No bluetooth adapter available")]
    NoAdapter,

    #[error("Peripheral {0} is not known to the radio")]
    UnknownPeripheral(String),

    #[error("Peripheral is not connected")]
    NotConnected,

    #[error("Radio operation timed out")]
    TimedOut,

    #[error("Radio operation {0} is not implemented on this platform")]
    NotImplemented(&'static str),

    #[error("Link to peripheral lost")]
    LinkLost,

    #[error("Radio failure: {0}")]
    Other(String),
}

impl From<btleplug::Error> for RadioError {
    fn from(error: btleplug::Error) -> Self {
        match error {
            btleplug::Error::PermissionDenied => RadioError::PermissionDenied,
            btleplug::Error::DeviceNotFound => RadioError::UnknownPeripheral(String::from("?")),
            btleplug::Error::NotConnected => RadioError::NotConnected,
            btleplug::Error::TimedOut(_) => RadioError::TimedOut,
            other => RadioError::Other(other.to_string()),
        }
    }
}

/// Errors surfaced to callers of the command interface, and carried by `Event::Error`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("A scan is already in progress")]
    AlreadyScanning,

    #[error("No scan is in progress")]
    NotScanning,

    #[error("Unknown device {id}")]
    UnknownDevice { id: String },

    #[error("Device {id} is already connecting")]
    AlreadyConnecting { id: String },

    #[error("Device {id} is already connected")]
    AlreadyConnected { id: String },

    #[error("Device {id} is not connected")]
    NotConnected { id: String },

    #[error("Device {id} has a connection in progress")]
    DeviceBusy { id: String },

    #[error("Connection limit of {limit} reached")]
    ConnectionLimit { limit: usize },

    #[error("Operation timed out")]
    Timeout,

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Error communicating with device: {source}")]
    TransportError { source: RadioError },

    #[error("{0} is not implemented on this platform")]
    NotImplemented(&'static str),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("The BLE manager has stopped")]
    ManagerStopped,
}

impl From<RadioError> for BleError {
    fn from(source: RadioError) -> Self {
        match source {
            RadioError::NotImplemented(operation) => BleError::NotImplemented(operation),
            RadioError::TimedOut => BleError::Timeout,
            source => BleError::TransportError { source },
        }
    }
}

impl BleError {
    /// The error code a host bridge rejects its promise with.
    pub fn code(&self) -> &'static str {
        match self {
            BleError::AlreadyScanning => "ALREADY_SCANNING",
            BleError::NotScanning => "NOT_SCANNING",
            BleError::UnknownDevice { .. } => "UNKNOWN_DEVICE",
            BleError::AlreadyConnecting { .. } => "ALREADY_CONNECTING",
            BleError::AlreadyConnected { .. } => "ALREADY_CONNECTED",
            BleError::NotConnected { .. } => "NOT_CONNECTED",
            BleError::DeviceBusy { .. } => "DEVICE_BUSY",
            BleError::ConnectionLimit { .. } => "CONNECTION_LIMIT",
            BleError::Timeout => "TIMEOUT",
            BleError::Cancelled => "CANCELLED",
            BleError::TransportError { .. } => "TRANSPORT_ERROR",
            BleError::NotImplemented(_) => "NOT_IMPLEMENTED",
            BleError::InvalidArgument(_) => "INVALID_ARGUMENT",
            BleError::ManagerStopped => "MANAGER_STOPPED",
        }
    }
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start application (runtime): {source}")]
    Runtime { #[from] source: io::Error },

    #[error("Failed to open bluetooth radio: {source}")]
    Radio { #[from] source: RadioError },

    #[error("{source}")]
    Ble { #[from] source: BleError },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radio_not_implemented_stays_explicit() {
        let error = BleError::from(RadioError::NotImplemented("connect"));
        assert_eq!(error, BleError::NotImplemented("connect"));
        assert_eq!(error.code(), "NOT_IMPLEMENTED");
    }

    #[test]
    fn radio_failures_become_transport_errors() {
        let error = BleError::from(RadioError::Other(String::from("gatt 133")));
        assert_eq!(error.code(), "TRANSPORT_ERROR");
        assert_eq!(error.to_string(), "Error communicating with device: Radio failure: gatt 133");
        assert_eq!(BleError::from(RadioError::TimedOut), BleError::Timeout);
    }

    #[test]
    fn btleplug_permission_error_is_recognised() {
        assert_eq!(RadioError::from(btleplug::Error::PermissionDenied), RadioError::PermissionDenied);
    }
}
