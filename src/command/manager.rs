use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::channel::oneshot;
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::command::engine::{run_engine, Context, Engine};
use crate::command::types::{Command, Ingress, Reply};
use crate::config::types::Config;
use crate::device::registry::DeviceRegistry;
use crate::device::types::{ConnectionState, Device, DeviceFilter};
use crate::error::BleError;
use crate::events::dispatcher::{EventDispatcher, SubscriptionToken};
use crate::events::types::Event;
use crate::radio::{Radio, RadioSink};
use crate::scan::types::ScanFilter;

/// The operation surface a host application talks to.
///
/// Scan and connection operations are queued to the engine task and resolve when it has
/// handled them; registry reads answer directly from the shared registry.
#[derive(Clone)]
pub struct BleManager {
    ingress: UnboundedSender<Ingress>,
    registry: Arc<RwLock<DeviceRegistry>>,
    scanning: Arc<AtomicBool>,
    dispatcher: EventDispatcher,
    cancel: CancellationToken,
}

fn validate_id(id: &str) -> Result<String, BleError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(BleError::InvalidArgument(String::from("device id must not be empty")));
    }
    Ok(id.to_string())
}

/// Zero seconds scans until stopped.
fn scan_timeout(seconds: f64) -> Result<Option<Duration>, BleError> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(BleError::InvalidArgument(format!("scan duration must be a non-negative number of seconds, got {}", seconds)));
    }

    if seconds == 0.0 {
        return Ok(None);
    }

    Duration::try_from_secs_f64(seconds)
        .map(Some)
        .map_err(|err| BleError::InvalidArgument(format!("scan duration of {} seconds: {}", seconds, err)))
}

impl BleManager {
    /// Start the engine task. Must be called from within a tokio runtime. Cancelling
    /// `cancel` (or calling `shutdown`) stops scanning, tears down connections and ends the
    /// returned task.
    pub fn new(radio: Arc<dyn Radio>, config: Config, cancel: CancellationToken) -> (BleManager, JoinHandle<()>) {
        let (ingress, receiver) = unbounded::<Ingress>();
        let dispatcher = EventDispatcher::new();

        let observer = dispatcher.clone();
        let registry = Arc::new(RwLock::new(DeviceRegistry::with_observer(Box::new(
            move |change| observer.registry_changed(change)
        ))));
        let scanning = Arc::new(AtomicBool::new(false));

        radio.attach(RadioSink::new(ingress.clone()));

        let ctx = Context {
            radio,
            registry: registry.clone(),
            dispatcher: dispatcher.clone(),
            ingress: ingress.clone(),
            config,
        };
        let engine = Engine::new(ctx, scanning.clone());
        let handle = spawn(run_engine(engine, receiver, cancel.clone()));

        let manager = BleManager { ingress, registry, scanning, dispatcher, cancel };
        (manager, handle)
    }

    async fn request(&self, command: impl FnOnce(Reply<()>) -> Command) -> Result<(), BleError> {
        let (reply, response) = oneshot::channel();

        self.ingress
            .unbounded_send(Ingress::Command(command(reply)))
            .map_err(|_| BleError::ManagerStopped)?;

        response.await.unwrap_or(Err(BleError::ManagerStopped))
    }

    /// Begin scanning. `service_ids` restricts discovery to peripherals advertising one of
    /// the given service UUIDs; an empty list matches everything.
    pub async fn start_scan<S: AsRef<str>>(&self, service_ids: &[S], seconds: f64, allow_duplicates: bool) -> Result<(), BleError> {
        let filter = ScanFilter::parse(service_ids)?;
        let timeout = scan_timeout(seconds)?;

        self.request(|reply| Command::StartScan { filter, allow_duplicates, timeout, reply }).await
    }

    pub async fn stop_scan(&self) -> Result<(), BleError> {
        self.request(|reply| Command::StopScan { reply }).await
    }

    pub async fn connect(&self, id: &str) -> Result<(), BleError> {
        let id = validate_id(id)?;
        self.request(|reply| Command::Connect { id, reply }).await
    }

    pub async fn disconnect(&self, id: &str) -> Result<(), BleError> {
        let id = validate_id(id)?;
        self.request(|reply| Command::Disconnect { id, reply }).await
    }

    /// Drop an idle device from the registry.
    pub async fn forget(&self, id: &str) -> Result<(), BleError> {
        let id = validate_id(id)?;
        self.request(|reply| Command::Forget { id, reply }).await
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    pub fn connected_devices(&self) -> Vec<String> {
        self.registry
            .read()
            .expect("Failed to lock device registry")
            .list(|device| device.state == ConnectionState::Connected)
            .map(|device| device.id.clone())
            .collect()
    }

    pub fn device(&self, id: &str) -> Result<Device, BleError> {
        let id = validate_id(id)?;
        self.registry.read().expect("Failed to lock device registry").get(&id).cloned()
    }

    pub fn devices(&self, filter: DeviceFilter) -> Vec<Device> {
        self.registry
            .read()
            .expect("Failed to lock device registry")
            .list(move |device| filter.matches(device))
            .cloned()
            .collect()
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionToken
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.dispatcher.subscribe(handler)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.dispatcher.unsubscribe(token)
    }

    /// Bumped on every registry mutation.
    pub fn registry_revision(&self) -> u64 {
        self.dispatcher.registry_revision()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_duration_validation() {
        assert_eq!(scan_timeout(0.0), Ok(None));
        assert_eq!(scan_timeout(2.5), Ok(Some(Duration::from_millis(2500))));
        assert!(matches!(scan_timeout(-1.0), Err(BleError::InvalidArgument(_))));
        assert!(matches!(scan_timeout(f64::NAN), Err(BleError::InvalidArgument(_))));
        assert!(matches!(scan_timeout(1e20), Err(BleError::InvalidArgument(_))));
        assert_eq!(scan_timeout(1e19), Ok(Some(Duration::from_secs(10_000_000_000_000_000_000))));
    }

    #[test]
    fn device_ids_must_not_be_blank() {
        assert_eq!(validate_id(" AA:BB "), Ok(String::from("AA:BB")));
        assert!(matches!(validate_id("  "), Err(BleError::InvalidArgument(_))));
    }
}
