use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use log::debug;
use tokio::spawn;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::types::Advertisement;
use crate::error::RadioError;
use crate::radio::{AdapterState, Radio, RadioEvent, RadioFuture, RadioSink};

/**
 * How often (milliseconds) simulated peripherals re-advertise while a scan runs.
 */
pub const ADVERTISE_INTERVAL: u64 = 500;

/**
 * How long (milliseconds) a simulated handshake takes unless configured otherwise.
 */
pub const CONNECT_LATENCY: u64 = 1500;

#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    pub advertisement: Advertisement,
    pub connect_latency: Duration,
    pub connect_result: Result<(), RadioError>,
    pub disconnect_latency: Duration,
    pub disconnect_result: Result<(), RadioError>,
}

impl SimulatedPeripheral {
    pub fn new(id: &str, name: &str, rssi: i16) -> Self {
        SimulatedPeripheral {
            advertisement: Advertisement {
                id: id.to_string(),
                name: Some(name.to_string()),
                rssi: Some(rssi),
                services: vec![],
            },
            connect_latency: Duration::from_millis(CONNECT_LATENCY),
            connect_result: Ok(()),
            disconnect_latency: Duration::ZERO,
            disconnect_result: Ok(()),
        }
    }

    pub fn with_services(mut self, services: Vec<Uuid>) -> Self {
        self.advertisement.services = services;
        self
    }

    pub fn with_connect_latency(mut self, latency: Duration) -> Self {
        self.connect_latency = latency;
        self
    }

    pub fn failing_with(mut self, error: RadioError) -> Self {
        self.connect_result = Err(error);
        self
    }

    pub fn with_disconnect_latency(mut self, latency: Duration) -> Self {
        self.disconnect_latency = latency;
        self
    }

    /// The link still goes down, but the radio reports `error`.
    pub fn failing_disconnect_with(mut self, error: RadioError) -> Self {
        self.disconnect_result = Err(error);
        self
    }
}

struct SimulatedInner {
    sink: Option<RadioSink>,
    roster: Vec<SimulatedPeripheral>,
    scan_cancel: Option<CancellationToken>,
    connected: HashSet<String>,
    auto_advertise: bool,
    start_scan_latency: Duration,
    stop_scan_latency: Duration,
}

/// An in-process radio with a scripted set of peripherals. Scanning re-advertises the
/// roster every `ADVERTISE_INTERVAL` unless the radio is quiet; `announce`, `advertise` and
/// `drop_link` inject events directly.
#[derive(Clone)]
pub struct SimulatedRadio {
    inner: Arc<Mutex<SimulatedInner>>,
}

impl SimulatedRadio {
    pub fn new(roster: Vec<SimulatedPeripheral>) -> Self {
        let inner = SimulatedInner {
            sink: None,
            roster,
            scan_cancel: None,
            connected: HashSet::new(),
            auto_advertise: true,
            start_scan_latency: Duration::ZERO,
            stop_scan_latency: Duration::ZERO,
        };
        SimulatedRadio { inner: Arc::new(Mutex::new(inner)) }
    }

    /// Peripherals only advertise when `announce`d.
    pub fn quiet(roster: Vec<SimulatedPeripheral>) -> Self {
        let radio = Self::new(roster);
        radio.lock().auto_advertise = false;
        radio
    }

    pub fn with_default_roster() -> Self {
        Self::new(vec![
            SimulatedPeripheral::new("00:00:00:00:00:01", "Smart Lock 001", -45),
            SimulatedPeripheral::new("00:00:00:00:00:02", "Smart Lock 002", -62),
            SimulatedPeripheral::new("00:00:00:00:00:03", "Smart Lock 003", -78),
            SimulatedPeripheral::new("00:00:00:00:00:04", "Smart Lock 004", -55),
            SimulatedPeripheral::new("00:00:00:00:00:05", "Smart Lock 005", -68),
        ])
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimulatedInner> {
        self.inner.lock().expect("Failed to lock simulated radio")
    }

    fn sink(&self) -> Option<RadioSink> {
        self.lock().sink.clone()
    }

    /// Add a peripheral, or replace the one with the same id.
    pub fn add_peripheral(&self, peripheral: SimulatedPeripheral) {
        let mut inner = self.lock();
        inner.roster.retain(|existing| existing.advertisement.id != peripheral.advertisement.id);
        inner.roster.push(peripheral);
    }

    /// Advertise a roster peripheral once.
    pub fn announce(&self, id: &str) -> bool {
        let advertisement = self.lock()
            .roster
            .iter()
            .find(|peripheral| peripheral.advertisement.id == id)
            .map(|peripheral| peripheral.advertisement.clone());

        match advertisement {
            Some(advertisement) => self.advertise(advertisement),
            None => false,
        }
    }

    /// Deliver one advertisement as if the hardware had just reported it.
    pub fn advertise(&self, advertisement: Advertisement) -> bool {
        match self.sink() {
            Some(sink) => sink.send(RadioEvent::Advertisement(advertisement)),
            None => false,
        }
    }

    /// Drop an established link as if the peripheral went out of range.
    pub fn drop_link(&self, id: &str) -> bool {
        let (was_connected, sink) = {
            let mut inner = self.lock();
            (inner.connected.remove(id), inner.sink.clone())
        };

        match sink {
            Some(sink) if was_connected => sink.send(RadioEvent::LinkLost { id: id.to_string(), error: RadioError::LinkLost }),
            _ => false,
        }
    }

    /// How long starting and stopping a scan take.
    pub fn set_scan_latency(&self, start: Duration, stop: Duration) {
        let mut inner = self.lock();
        inner.start_scan_latency = start;
        inner.stop_scan_latency = stop;
    }

    /// Report the adapter being switched on or off.
    pub fn set_adapter_state(&self, state: AdapterState) -> bool {
        match self.sink() {
            Some(sink) => sink.send(RadioEvent::StateUpdate(state)),
            None => false,
        }
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.lock().connected.contains(id)
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scan_cancel.is_some()
    }
}

async fn advertise_roster(radio: SimulatedRadio, services: Vec<Uuid>, cancel: CancellationToken) {
    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            _ = sleep(Duration::from_millis(ADVERTISE_INTERVAL)) => {
                let (roster, sink) = {
                    let inner = radio.lock();
                    (inner.roster.clone(), inner.sink.clone())
                };
                let Some(sink) = sink else { break 'mainloop };

                for peripheral in roster {
                    let advertisement = peripheral.advertisement;
                    if !services.is_empty() && !advertisement.services.iter().any(|service| services.contains(service)) {
                        continue;
                    }
                    if !sink.send(RadioEvent::Advertisement(advertisement)) {
                        break 'mainloop;
                    }
                }
            },
        }
    }

    debug!("Simulated advertising stopped");
}

async fn handshake(radio: SimulatedRadio, id: String) -> Result<(), RadioError> {
    let peripheral = radio.lock()
        .roster
        .iter()
        .find(|peripheral| peripheral.advertisement.id == id)
        .cloned()
        .ok_or_else(|| RadioError::UnknownPeripheral(id.clone()))?;

    sleep(peripheral.connect_latency).await;
    peripheral.connect_result?;

    radio.lock().connected.insert(id);
    Ok(())
}

async fn teardown(radio: SimulatedRadio, id: String) -> Result<(), RadioError> {
    let peripheral = radio.lock()
        .roster
        .iter()
        .find(|peripheral| peripheral.advertisement.id == id)
        .cloned();

    let Some(peripheral) = peripheral else {
        radio.lock().connected.remove(&id);
        return Ok(());
    };

    sleep(peripheral.disconnect_latency).await;
    radio.lock().connected.remove(&id);
    peripheral.disconnect_result
}

impl Radio for SimulatedRadio {
    fn attach(&self, sink: RadioSink) {
        self.lock().sink = Some(sink);
    }

    fn start_scan(&self, services: Vec<Uuid>) -> RadioFuture {
        let radio = self.clone();

        Box::pin(async move {
            let latency = radio.lock().start_scan_latency;
            sleep(latency).await;

            let cancel = CancellationToken::new();
            let auto_advertise = {
                let mut inner = radio.lock();
                if let Some(previous) = inner.scan_cancel.replace(cancel.clone()) {
                    previous.cancel();
                }
                inner.auto_advertise
            };
            if auto_advertise {
                spawn(advertise_roster(radio.clone(), services, cancel));
            }
            Ok::<(), RadioError>(())
        })
    }

    fn stop_scan(&self) -> RadioFuture {
        let radio = self.clone();

        Box::pin(async move {
            let latency = radio.lock().stop_scan_latency;
            sleep(latency).await;

            if let Some(cancel) = radio.lock().scan_cancel.take() {
                cancel.cancel();
            }
            Ok::<(), RadioError>(())
        })
    }

    fn connect(&self, id: &str) -> RadioFuture {
        Box::pin(handshake(self.clone(), id.to_string()))
    }

    fn disconnect(&self, id: &str) -> RadioFuture {
        Box::pin(teardown(self.clone(), id.to_string()))
    }
}
