use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use futures::StreamExt;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use log::{debug, info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;

use crate::command::types::{Command, Completion, Ingress, Reply};
use crate::config::types::Config;
use crate::device::connection::ConnectionStateMachine;
use crate::device::registry::DeviceRegistry;
use crate::device::types::{Advertisement, Device};
use crate::error::{BleError, RadioError};
use crate::events::dispatcher::EventDispatcher;
use crate::events::types::{Event, ScanStateReason};
use crate::radio::{AdapterState, Radio, RadioEvent};
use crate::scan::controller::ScanController;
use crate::scan::driver::{run_scan_driver, ScanRequest};
use crate::scan::types::{ScanFilter, ScanSession, Sighting};

/// Shared handles the engine and the connection state machine act through.
pub(crate) struct Context {
    pub radio: Arc<dyn Radio>,
    pub registry: Arc<RwLock<DeviceRegistry>>,
    pub dispatcher: EventDispatcher,
    pub ingress: UnboundedSender<Ingress>,
    pub config: Config,
}

impl Context {
    pub fn read_registry(&self) -> RwLockReadGuard<'_, DeviceRegistry> {
        self.registry.read().expect("Failed to lock device registry")
    }

    pub fn write_registry(&self) -> RwLockWriteGuard<'_, DeviceRegistry> {
        self.registry.write().expect("Failed to lock device registry")
    }
}

/// The single owner of scan and connection state. Runs as one task and never awaits the
/// radio while handling a message. Connection work is spawned per device, scan work goes to
/// the scan driver in order, and both report back via ingress.
pub(crate) struct Engine {
    ctx: Context,
    scanner: ScanController,
    connections: ConnectionStateMachine,
    scanning: Arc<AtomicBool>,
    adapter: AdapterState,
    scan_requests: UnboundedSender<ScanRequest>,
    scan_driver: Option<JoinHandle<()>>,
}

impl Engine {
    /// Must be called from within a tokio runtime.
    pub fn new(ctx: Context, scanning: Arc<AtomicBool>) -> Self {
        let (scan_requests, receiver) = unbounded::<ScanRequest>();
        let scan_driver = spawn(run_scan_driver(ctx.radio.clone(), receiver, ctx.ingress.clone()));

        Engine {
            ctx,
            scanner: ScanController::new(),
            connections: ConnectionStateMachine::new(),
            scanning,
            adapter: AdapterState::Unknown,
            scan_requests,
            scan_driver: Some(scan_driver),
        }
    }

    fn handle(&mut self, message: Ingress) {
        match message {
            Ingress::Command(command) => self.handle_command(command),
            Ingress::Radio(RadioEvent::Advertisement(advertisement)) => self.advertisement(advertisement),
            Ingress::Radio(RadioEvent::LinkLost { id, error }) => {
                self.connections.link_lost(&self.ctx, id.clone(), error);
                self.run_queued(&id);
            },
            Ingress::Radio(RadioEvent::StateUpdate(state)) => self.adapter_state(state),
            Ingress::Completion(Completion::ScanStarted { generation, result }) => self.scan_started(generation, result),
            Ingress::Completion(Completion::ScanExpired { generation }) => {
                if let Some(session) = self.scanner.end(generation) {
                    info!("Scan {} reached its deadline", generation);
                    self.end_scan(session, ScanStateReason::TimedOut, None);
                }
            },
            Ingress::Completion(Completion::Handshake { id, attempt, result }) => {
                self.connections.handshake_finished(&self.ctx, id.clone(), attempt, result);
                self.run_queued(&id);
            },
            Ingress::Completion(Completion::Teardown { id, result }) => {
                self.connections.teardown_finished(&self.ctx, id.clone(), result);
                self.run_queued(&id);
            },
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartScan { filter, allow_duplicates, timeout, reply } => {
                self.start_scan(filter, allow_duplicates, timeout, reply);
            },
            Command::StopScan { reply } => match self.scanner.stop() {
                Ok(session) => self.end_scan(session, ScanStateReason::Stopped, Some(reply)),
                Err(err) => {
                    let _ = reply.send(Err(err));
                },
            },
            Command::Connect { id, reply } => self.connections.connect(&self.ctx, id, reply),
            Command::Disconnect { id, reply } => self.connections.disconnect(&self.ctx, id, reply),
            Command::Forget { id, reply } => {
                if self.connections.forget(&self.ctx, id.clone(), reply) {
                    self.scanner.forget(&id);
                    self.ctx.radio.forget(&id);
                }
            },
        }
    }

    fn run_queued(&mut self, id: &str) {
        for command in self.connections.take_queued(id) {
            self.handle_command(command);
        }
    }

    fn start_scan(&mut self, filter: ScanFilter, allow_duplicates: bool, timeout: Option<Duration>, reply: Reply<()>) {
        let session = match self.scanner.start(filter, allow_duplicates, timeout) {
            Ok(v) => v,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            },
        };

        session.pending_reply = Some(reply);
        let generation = session.generation;
        let deadline = session.deadline;
        let cancel = session.cancel.clone();
        let services = session.filter.services.clone();

        match (timeout, deadline) {
            (Some(timeout), Some(_)) => info!("Scan {} started for {}", generation, humantime::format_duration(timeout)),
            (Some(timeout), None) => warn!("Scan {} timeout of {} is out of range, scanning until stopped", generation, humantime::format_duration(timeout)),
            (None, _) => info!("Scan {} started until stopped", generation),
        }

        self.scanning.store(true, Ordering::SeqCst);
        self.ctx.dispatcher.emit(Event::ScanStateChanged { scanning: true, reason: ScanStateReason::Started });
        self.request_scan(ScanRequest::Start { generation, services });

        if let Some(deadline) = deadline {
            let ingress = self.ctx.ingress.clone();
            spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {},
                    _ = sleep_until(deadline) => {
                        let _ = ingress.unbounded_send(Ingress::Completion(Completion::ScanExpired { generation }));
                    },
                }
            });
        }
    }

    fn scan_started(&mut self, generation: u64, result: Result<(), RadioError>) {
        let Some(session) = self.scanner.session_mut(generation) else {
            // the scan ended before the radio confirmed; its stop is queued behind this start
            debug!("Scan {} confirmed after it ended", generation);
            return;
        };

        match result {
            Ok(()) => {
                if let Some(reply) = session.pending_reply.take() {
                    let _ = reply.send(Ok(()));
                }
            },
            Err(err) => {
                warn!("Scanning failed {:?}", err);
                if let Some(mut session) = self.scanner.end(generation) {
                    let error = BleError::from(err);
                    if let Some(reply) = session.pending_reply.take() {
                        let _ = reply.send(Err(error.clone()));
                    }
                    self.ctx.dispatcher.emit(Event::Error { id: None, error });
                    self.scanning.store(false, Ordering::SeqCst);
                    self.ctx.dispatcher.emit(Event::ScanStateChanged { scanning: false, reason: ScanStateReason::Failed });
                }
            },
        }
    }

    fn request_scan(&self, request: ScanRequest) {
        if self.scan_requests.unbounded_send(request).is_err() {
            warn!("Scan driver is gone, dropping scan request");
        }
    }

    /// `reply` is answered once the radio has stopped scanning.
    fn end_scan(&mut self, mut session: ScanSession, reason: ScanStateReason, reply: Option<Reply<()>>) {
        // a start that had not been confirmed yet did start; it is simply over now
        if let Some(reply) = session.pending_reply.take() {
            let _ = reply.send(Ok(()));
        }

        self.scanning.store(false, Ordering::SeqCst);
        self.request_scan(ScanRequest::Stop { reply });
        info!(
            "Scan {} ended ({:?}), {} device(s) seen, {} known",
            session.generation, reason, session.seen.len(), self.ctx.read_registry().len()
        );
        self.ctx.dispatcher.emit(Event::ScanStateChanged { scanning: false, reason });
    }

    fn adapter_state(&mut self, state: AdapterState) {
        if self.adapter == state {
            return;
        }

        info!("Bluetooth adapter is {}", state);
        self.adapter = state;
        self.ctx.dispatcher.emit(Event::AdapterStateChanged { state });
    }

    fn advertisement(&mut self, advertisement: Advertisement) {
        let sighting = self.scanner.observe(&advertisement);

        match sighting {
            Sighting::NoSession => {
                debug!("Ignoring advertisement from {} outside of a scan", advertisement.id);
            },
            Sighting::Filtered => {
                debug!("Advertisement from {} does not match the scan filter", advertisement.id);
            },
            Sighting::Repeat | Sighting::Report => {
                let id = advertisement.id.clone();
                let device = {
                    let mut registry = self.ctx.write_registry();
                    registry.upsert(Device::from(advertisement));
                    registry.get(&id).ok().cloned()
                };

                if let (Sighting::Report, Some(device)) = (sighting, device) {
                    self.ctx.dispatcher.emit(Event::DeviceDiscovered { device });
                }
            },
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down BLE engine");

        if let Ok(mut session) = self.scanner.stop() {
            if let Some(reply) = session.pending_reply.take() {
                let _ = reply.send(Err(BleError::ManagerStopped));
            }
            self.scanning.store(false, Ordering::SeqCst);
            self.request_scan(ScanRequest::Stop { reply: None });
            self.ctx.dispatcher.emit(Event::ScanStateChanged { scanning: false, reason: ScanStateReason::Stopped });
        }

        // let the driver finish whatever scan work is queued
        self.scan_requests.close_channel();
        if let Some(driver) = self.scan_driver.take() {
            if let Err(err) = driver.await {
                warn!("Scan driver failed: {}", err);
            }
        }

        self.connections.shutdown(&self.ctx).await;
        self.ctx.dispatcher.close();
    }
}

pub(crate) async fn run_engine(mut engine: Engine, mut ingress: UnboundedReceiver<Ingress>, cancel: CancellationToken) {
    info!("BLE engine started");

    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            message = ingress.next() => match message {
                Some(message) => engine.handle(message),
                None => break 'mainloop,
            },
        }
    }

    // callers still waiting on queued commands see ManagerStopped
    ingress.close();
    engine.shutdown().await;
    info!("BLE engine stopped");
}
