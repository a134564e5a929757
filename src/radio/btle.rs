use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use btleplug::api::{Central, CentralEvent, CentralState, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::spawn;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::types::Advertisement;
use crate::error::RadioError;
use crate::radio::{AdapterState, Radio, RadioEvent, RadioFuture, RadioSink};

type PeripheralCache = Arc<Mutex<HashMap<String, Peripheral>>>;

/// Radio backed by every adapter btleplug can find.
pub struct BtleplugRadio {
    adapters: Vec<Adapter>,
    peripherals: PeripheralCache,
    cancel: CancellationToken,
}

impl BtleplugRadio {
    pub async fn new(cancel: CancellationToken) -> Result<Self, RadioError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;

        if adapters.is_empty() {
            return Err(RadioError::NoAdapter);
        }

        for adapter in &adapters {
            info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
        }

        Ok(BtleplugRadio {
            adapters,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            cancel,
        })
    }

    fn cached(&self, id: &str) -> Option<Peripheral> {
        self.peripherals.lock().expect("Failed to lock peripheral cache").get(id).cloned()
    }
}

// macOS hides the address, fall back to the platform identifier there
fn peripheral_key(peripheral: &Peripheral) -> String {
    let address = peripheral.address();
    if address.into_inner() == [0u8; 6] {
        format!("{:?}", peripheral.id())
    } else {
        address.to_string()
    }
}

async fn report_peripheral(adapter: &Adapter, id: &PeripheralId, peripherals: &PeripheralCache, sink: &RadioSink) {
    let peripheral = match adapter.peripheral(id).await {
        Ok(v) => v,
        Err(err) => {
            warn!("Failed to look up peripheral {:?}: {}", id, err);
            return;
        },
    };

    let properties = match peripheral.properties().await {
        Err(err) => {
            warn!("Could not query peripheral for properties: {:?}", err);
            return;
        },
        Ok(None) => {
            debug!("Peripheral {:?} has no properties", id);
            return;
        },
        Ok(Some(properties)) => properties,
    };

    let key = peripheral_key(&peripheral);
    peripherals.lock().expect("Failed to lock peripheral cache").insert(key.clone(), peripheral);

    sink.send(RadioEvent::Advertisement(Advertisement {
        id: key,
        name: properties.local_name,
        rssi: properties.rssi,
        services: properties.services,
    }));
}

async fn report_disconnect(adapter: &Adapter, id: &PeripheralId, sink: &RadioSink) {
    match adapter.peripheral(id).await {
        Ok(peripheral) => {
            sink.send(RadioEvent::LinkLost { id: peripheral_key(&peripheral), error: RadioError::LinkLost });
        },
        Err(err) => warn!("Disconnected peripheral {:?} could not be looked up: {}", id, err),
    }
}

fn adapter_state(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::PoweredOn,
        CentralState::PoweredOff => AdapterState::PoweredOff,
        CentralState::Unknown => AdapterState::Unknown,
    }
}

async fn watch_adapter(cancel: CancellationToken, adapter: Adapter, peripherals: PeripheralCache, sink: RadioSink) {
    let mut events = match adapter.events().await {
        Ok(v) => v,
        Err(err) => {
            warn!("Failed to subscribe to adapter events: {}", err);
            return;
        },
    };

    match adapter.adapter_state().await {
        Ok(state) => {
            sink.send(RadioEvent::StateUpdate(adapter_state(state)));
        },
        Err(err) => debug!("Adapter state is not available: {}", err),
    }

    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            event = events.next() => match event {
                None => break 'mainloop,
                Some(CentralEvent::DeviceDiscovered(id)) | Some(CentralEvent::DeviceUpdated(id)) => {
                    report_peripheral(&adapter, &id, &peripherals, &sink).await;
                },
                Some(CentralEvent::DeviceDisconnected(id)) => {
                    report_disconnect(&adapter, &id, &sink).await;
                },
                Some(CentralEvent::StateUpdate(state)) => {
                    sink.send(RadioEvent::StateUpdate(adapter_state(state)));
                },
                Some(_) => {},
            },
        }
    }

    debug!("Stopped watching adapter events");
}

async fn start_scanning(adapters: Vec<Adapter>, services: Vec<Uuid>) -> Result<(), RadioError> {
    // Some environments ignore the filter; the scan controller checks services again
    let filter = ScanFilter { services };

    for adapter in &adapters {
        adapter.start_scan(filter.clone()).await?;
    }

    Ok(())
}

async fn stop_scanning(adapters: Vec<Adapter>) -> Result<(), RadioError> {
    for adapter in &adapters {
        adapter.stop_scan().await?;
    }

    Ok(())
}

async fn connect_peripheral(peripheral: Option<Peripheral>, id: String) -> Result<(), RadioError> {
    let peripheral = peripheral.ok_or(RadioError::UnknownPeripheral(id))?;

    info!("Connecting to peripheral...");
    peripheral.connect().await?;

    info!("Connected; Discovering services...");
    peripheral.discover_services().await?;

    Ok(())
}

async fn disconnect_peripheral(peripheral: Option<Peripheral>, id: String) -> Result<(), RadioError> {
    let peripheral = peripheral.ok_or(RadioError::UnknownPeripheral(id))?;

    if peripheral.is_connected().await? {
        peripheral.disconnect().await?;
    }

    Ok(())
}

impl Radio for BtleplugRadio {
    fn attach(&self, sink: RadioSink) {
        for adapter in &self.adapters {
            spawn(watch_adapter(self.cancel.clone(), adapter.clone(), self.peripherals.clone(), sink.clone()));
        }
    }

    fn start_scan(&self, services: Vec<Uuid>) -> RadioFuture {
        Box::pin(start_scanning(self.adapters.clone(), services))
    }

    fn stop_scan(&self) -> RadioFuture {
        Box::pin(stop_scanning(self.adapters.clone()))
    }

    fn connect(&self, id: &str) -> RadioFuture {
        Box::pin(connect_peripheral(self.cached(id), id.to_string()))
    }

    fn disconnect(&self, id: &str) -> RadioFuture {
        Box::pin(disconnect_peripheral(self.cached(id), id.to_string()))
    }

    fn forget(&self, id: &str) {
        // rediscovery fills it in again
        self.peripherals.lock().expect("Failed to lock peripheral cache").remove(id);
    }
}
