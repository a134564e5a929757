use indexmap::IndexMap;

use crate::device::types::{ConnectionState, Device};
use crate::error::BleError;

/// Notification raised by every registry mutation. Only the event dispatcher sees these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryChange {
    Inserted(String),
    Updated(String),
    StateChanged { id: String, state: ConnectionState },
    Removed(String),
}

pub type RegistryObserver = Box<dyn Fn(RegistryChange) + Send + Sync>;

/// Discovered and connected peripherals, keyed by identifier in first-seen order.
pub struct DeviceRegistry {
    devices: IndexMap<String, Device>,
    observer: Option<RegistryObserver>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry { devices: IndexMap::new(), observer: None }
    }

    pub fn with_observer(observer: RegistryObserver) -> Self {
        DeviceRegistry { devices: IndexMap::new(), observer: Some(observer) }
    }

    fn notify(&self, change: RegistryChange) {
        if let Some(observer) = &self.observer {
            observer(change);
        }
    }

    /// Insert a device, or merge it into the existing record keeping its connection state.
    /// Returns true if the device was not known before.
    pub fn upsert(&mut self, device: Device) -> bool {
        let id = device.id.clone();

        let inserted = match self.devices.get_mut(&id) {
            Some(existing) => {
                existing.merge(device);
                false
            },
            None => {
                self.devices.insert(id.clone(), device);
                true
            },
        };

        self.notify(if inserted { RegistryChange::Inserted(id) } else { RegistryChange::Updated(id) });
        inserted
    }

    pub fn get(&self, id: &str) -> Result<&Device, BleError> {
        self.devices.get(id).ok_or_else(|| BleError::UnknownDevice { id: id.to_string() })
    }

    /// Devices matching `predicate`, in first-seen order. Call again to restart.
    pub fn list<'a, P>(&'a self, predicate: P) -> impl Iterator<Item = &'a Device> + Clone + 'a
    where
        P: Fn(&Device) -> bool + Clone + 'a,
    {
        self.devices.values().filter(move |device| predicate(device))
    }

    pub fn remove(&mut self, id: &str) -> Result<Device, BleError> {
        let device = self.devices
            .shift_remove(id)
            .ok_or_else(|| BleError::UnknownDevice { id: id.to_string() })?;

        self.notify(RegistryChange::Removed(id.to_string()));
        Ok(device)
    }

    /// Only the connection state machine calls this. Returns the previous state.
    pub(crate) fn set_state(&mut self, id: &str, state: ConnectionState) -> Result<ConnectionState, BleError> {
        let device = self.devices
            .get_mut(id)
            .ok_or_else(|| BleError::UnknownDevice { id: id.to_string() })?;

        let previous = device.state;
        device.state = state;

        self.notify(RegistryChange::StateChanged { id: id.to_string(), state });
        Ok(previous)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    use super::*;
    use crate::device::types::{Advertisement, DeviceFilter};

    fn sighting(id: &str, name: Option<&str>, rssi: i16) -> Device {
        Device::from(Advertisement {
            id: id.to_string(),
            name: name.map(String::from),
            rssi: Some(rssi),
            services: vec![],
        })
    }

    #[test]
    fn upsert_preserves_connection_state() {
        let mut registry = DeviceRegistry::new();
        assert!(registry.upsert(sighting("AA", Some("Lock"), -60)));
        registry.set_state("AA", ConnectionState::Connected).unwrap();

        assert!(!registry.upsert(sighting("AA", None, -40)));

        let device = registry.get("AA").unwrap();
        assert_eq!(device.state, ConnectionState::Connected);
        assert_eq!(device.rssi, Some(-40));
        assert_eq!(device.display_name(), "Lock");
    }

    #[test]
    fn upsert_merges_advertised_services() {
        let first = Uuid::from_u128(1);
        let second = Uuid::from_u128(2);
        let mut registry = DeviceRegistry::new();

        let mut device = sighting("AA", None, -60);
        device.services.insert(first);
        registry.upsert(device);

        let mut device = sighting("AA", None, -60);
        device.services.insert(second);
        registry.upsert(device);

        let services: Vec<Uuid> = registry.get("AA").unwrap().services.iter().copied().collect();
        assert_eq!(services, vec![first, second]);
    }

    #[test]
    fn get_and_remove_unknown_device() {
        let mut registry = DeviceRegistry::new();
        assert_eq!(registry.get("nope").unwrap_err(), BleError::UnknownDevice { id: String::from("nope") });
        assert!(registry.remove("nope").is_err());
    }

    #[test]
    fn list_is_restartable_and_filtered() {
        let mut registry = DeviceRegistry::new();
        registry.upsert(sighting("A", None, -50));
        registry.upsert(sighting("B", None, -50));
        registry.upsert(sighting("C", None, -50));
        registry.set_state("B", ConnectionState::Connected).unwrap();

        let filter = DeviceFilter::Connected;
        let connected = registry.list(move |device| filter.matches(device));
        let first_pass: Vec<&str> = connected.clone().map(|device| device.id.as_str()).collect();
        let second_pass: Vec<&str> = connected.map(|device| device.id.as_str()).collect();
        assert_eq!(first_pass, vec!["B"]);
        assert_eq!(first_pass, second_pass);

        let all: Vec<&str> = registry.list(|_| true).map(|device| device.id.as_str()).collect();
        assert_eq!(all, vec!["A", "B", "C"]);
    }

    #[test]
    fn every_mutation_notifies_the_observer() {
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = changes.clone();
        let mut registry = DeviceRegistry::with_observer(Box::new(move |change| {
            sink.lock().unwrap().push(change);
        }));

        registry.upsert(sighting("A", None, -50));
        registry.upsert(sighting("A", None, -51));
        registry.set_state("A", ConnectionState::Connecting).unwrap();
        registry.remove("A").unwrap();

        assert_eq!(*changes.lock().unwrap(), vec![
            RegistryChange::Inserted(String::from("A")),
            RegistryChange::Updated(String::from("A")),
            RegistryChange::StateChanged { id: String::from("A"), state: ConnectionState::Connecting },
            RegistryChange::Removed(String::from("A")),
        ]);
        assert!(registry.is_empty());
    }
}
