use std::collections::{HashMap, VecDeque};
use log::{debug, info, warn};
use tokio::spawn;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::command::engine::Context;
use crate::command::types::{Command, Completion, Ingress, Reply};
use crate::device::types::ConnectionState;
use crate::error::{BleError, RadioError};
use crate::events::types::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Connect,
    HandshakeSucceeded,
    HandshakeFailed,
    Disconnect,
    LinkLost,
    TeardownComplete,
}

/// The edges of the per-device lifecycle. `None` means the trigger is not valid in `state`.
pub fn next_state(state: ConnectionState, trigger: Trigger) -> Option<ConnectionState> {
    use ConnectionState::*;

    match (state, trigger) {
        (Discovered | Disconnected | Failed, Trigger::Connect) => Some(Connecting),
        (Connecting, Trigger::HandshakeSucceeded) => Some(Connected),
        (Connecting, Trigger::HandshakeFailed) => Some(Failed),
        // a disconnect during the handshake cancels it and tears down whatever was set up
        (Connecting, Trigger::Disconnect) => Some(Disconnecting),
        (Connected, Trigger::Disconnect | Trigger::LinkLost) => Some(Disconnecting),
        (Disconnecting, Trigger::TeardownComplete) => Some(Disconnected),
        _ => None,
    }
}

enum InFlight {
    Connecting {
        attempt: u64,
        cancel: CancellationToken,
        reply: Reply<()>,
    },
    Disconnecting {
        replies: Vec<Reply<()>>,
    },
    /// Radio disconnect after a failed handshake. The device already reads Failed.
    Cleanup,
}

/// Drives each device through its lifecycle. At most one radio operation runs per device;
/// commands that arrive while a teardown or cleanup is running wait in a per-device queue.
pub(crate) struct ConnectionStateMachine {
    in_flight: HashMap<String, InFlight>,
    queued: HashMap<String, VecDeque<Command>>,
    next_attempt: u64,
}

fn respond(reply: Reply<()>, result: Result<(), BleError>) {
    // the caller may have stopped waiting
    let _ = reply.send(result);
}

/// Apply `trigger` to the device and raise the matching events.
fn transition(ctx: &Context, id: &str, trigger: Trigger) -> Option<ConnectionState> {
    let (previous, current) = {
        let mut registry = ctx.write_registry();

        let previous = match registry.get(id) {
            Ok(device) => device.state,
            Err(err) => {
                warn!("Cannot apply {:?}: {}", trigger, err);
                return None;
            },
        };

        let Some(current) = next_state(previous, trigger) else {
            warn!("Ignoring {:?} for device {} in state {}", trigger, id, previous);
            return None;
        };

        registry.set_state(id, current).ok()?;
        (previous, current)
    };

    debug!("Device {}: {} -> {}", id, previous, current);
    ctx.dispatcher.emit(Event::ConnectionStateChanged { id: id.to_string(), previous, current });

    match current {
        ConnectionState::Connected => ctx.dispatcher.emit(Event::DeviceConnected { id: id.to_string() }),
        ConnectionState::Disconnected => ctx.dispatcher.emit(Event::DeviceDisconnected { id: id.to_string() }),
        _ => {},
    }

    Some(current)
}

fn spawn_handshake(ctx: &Context, id: String, attempt: u64, cancel: CancellationToken) {
    let handshake = ctx.radio.connect(&id);
    let deadline = ctx.config.connect_timeout();
    let ingress = ctx.ingress.clone();

    spawn(async move {
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                // whoever cancelled is tearing the link down
                return;
            },
            _ = sleep(deadline) => Err(BleError::Timeout),
            result = handshake => result.map_err(BleError::from),
        };

        let _ = ingress.unbounded_send(Ingress::Completion(Completion::Handshake { id, attempt, result }));
    });
}

fn spawn_teardown(ctx: &Context, id: String) {
    let teardown = ctx.radio.disconnect(&id);
    let deadline = ctx.config.disconnect_timeout();
    let ingress = ctx.ingress.clone();

    spawn(async move {
        let result = tokio::select! {
            _ = sleep(deadline) => Err(RadioError::TimedOut),
            result = teardown => result,
        };

        let _ = ingress.unbounded_send(Ingress::Completion(Completion::Teardown { id, result }));
    });
}

impl ConnectionStateMachine {
    pub(crate) fn new() -> Self {
        ConnectionStateMachine {
            in_flight: HashMap::new(),
            queued: HashMap::new(),
            next_attempt: 1,
        }
    }

    fn is_tearing_down(&self, id: &str) -> bool {
        matches!(self.in_flight.get(id), Some(InFlight::Disconnecting { .. } | InFlight::Cleanup))
    }

    fn enqueue(&mut self, id: &str, command: Command) {
        debug!("Device {} is tearing down, queueing command", id);
        self.queued.entry(id.to_string()).or_default().push_back(command);
    }

    /// Commands that waited for the device's previous operation to finish.
    pub(crate) fn take_queued(&mut self, id: &str) -> VecDeque<Command> {
        if self.in_flight.contains_key(id) {
            return VecDeque::new();
        }
        self.queued.remove(id).unwrap_or_default()
    }

    pub(crate) fn connect(&mut self, ctx: &Context, id: String, reply: Reply<()>) {
        if self.is_tearing_down(&id) {
            self.enqueue(&id, Command::Connect { id: id.clone(), reply });
            return;
        }

        let state = match ctx.read_registry().get(&id) {
            Ok(device) => device.state,
            Err(err) => return respond(reply, Err(err)),
        };

        match state {
            ConnectionState::Connecting => return respond(reply, Err(BleError::AlreadyConnecting { id })),
            ConnectionState::Connected => return respond(reply, Err(BleError::AlreadyConnected { id })),
            ConnectionState::Disconnecting => return respond(reply, Err(BleError::DeviceBusy { id })),
            _ => {},
        }

        if let Some(limit) = ctx.config.max_concurrent_connections {
            let active = ctx.read_registry().list(|device| device.state.is_active()).count();
            if active >= limit {
                return respond(reply, Err(BleError::ConnectionLimit { limit }));
            }
        }

        if transition(ctx, &id, Trigger::Connect).is_none() {
            return respond(reply, Err(BleError::UnknownDevice { id }));
        }

        let attempt = self.next_attempt;
        self.next_attempt += 1;
        let cancel = CancellationToken::new();

        info!("Connecting to {} (attempt {}, deadline {})", id, attempt, humantime::format_duration(ctx.config.connect_timeout()));
        spawn_handshake(ctx, id.clone(), attempt, cancel.clone());
        self.in_flight.insert(id, InFlight::Connecting { attempt, cancel, reply });
    }

    pub(crate) fn handshake_finished(&mut self, ctx: &Context, id: String, attempt: u64, result: Result<(), BleError>) {
        match self.in_flight.get(&id) {
            Some(InFlight::Connecting { attempt: current, .. }) if *current == attempt => {},
            _ => {
                debug!("Ignoring stale handshake result for {} (attempt {})", id, attempt);
                return;
            },
        }

        let Some(InFlight::Connecting { reply, .. }) = self.in_flight.remove(&id) else {
            return;
        };

        match result {
            Ok(()) => {
                transition(ctx, &id, Trigger::HandshakeSucceeded);
                info!("Connected to {}", id);
                respond(reply, Ok(()));
            },
            Err(error) => {
                warn!("Connecting to {} failed: {}", id, error);
                transition(ctx, &id, Trigger::HandshakeFailed);
                ctx.dispatcher.emit(Event::Error { id: Some(id.clone()), error: error.clone() });

                // the radio may have completed half a handshake; do not leave it open
                spawn_teardown(ctx, id.clone());
                self.in_flight.insert(id, InFlight::Cleanup);

                respond(reply, Err(error));
            },
        }
    }

    fn begin_teardown(&mut self, ctx: &Context, id: String, replies: Vec<Reply<()>>) {
        transition(ctx, &id, Trigger::Disconnect);
        info!("Disconnecting from {}", id);
        spawn_teardown(ctx, id.clone());
        self.in_flight.insert(id, InFlight::Disconnecting { replies });
    }

    pub(crate) fn disconnect(&mut self, ctx: &Context, id: String, reply: Reply<()>) {
        if self.is_tearing_down(&id) {
            self.enqueue(&id, Command::Disconnect { id: id.clone(), reply });
            return;
        }

        if let Some(InFlight::Connecting { cancel, reply: connect_reply, .. }) = self.in_flight.remove(&id) {
            info!("Cancelling connect to {}", id);
            cancel.cancel();
            respond(connect_reply, Err(BleError::Cancelled));
            return self.begin_teardown(ctx, id, vec![reply]);
        }

        let state = match ctx.read_registry().get(&id) {
            Ok(device) => device.state,
            Err(err) => return respond(reply, Err(err)),
        };

        match state {
            ConnectionState::Connected => self.begin_teardown(ctx, id, vec![reply]),
            _ => respond(reply, Err(BleError::NotConnected { id })),
        }
    }

    pub(crate) fn teardown_finished(&mut self, ctx: &Context, id: String, result: Result<(), RadioError>) {
        let replies = match self.in_flight.remove(&id) {
            Some(InFlight::Disconnecting { replies }) => replies,
            Some(InFlight::Cleanup) => {
                match result {
                    Ok(()) => debug!("Cleaned up after failed connect to {}", id),
                    Err(err) => debug!("Cleanup after failed connect to {}: {}", id, err),
                }
                return;
            },
            Some(other) => {
                self.in_flight.insert(id, other);
                return;
            },
            None => return,
        };

        // the link is gone from our side either way
        if let Err(err) = result {
            warn!("Radio did not confirm disconnect from {}: {}", id, err);
            ctx.dispatcher.emit(Event::Error { id: Some(id.clone()), error: BleError::from(err) });
        }

        transition(ctx, &id, Trigger::TeardownComplete);
        info!("Disconnected from {}", id);

        for reply in replies {
            respond(reply, Ok(()));
        }
    }

    pub(crate) fn link_lost(&mut self, ctx: &Context, id: String, error: RadioError) {
        if self.in_flight.contains_key(&id) {
            // a pending handshake or teardown resolves this on its own
            debug!("Link event for {} while an operation is in flight", id);
            return;
        }

        let connected = matches!(ctx.read_registry().get(&id).map(|device| device.state), Ok(ConnectionState::Connected));
        if !connected {
            return;
        }

        warn!("Connection to {} lost: {}", id, error);
        transition(ctx, &id, Trigger::LinkLost);
        ctx.dispatcher.emit(Event::Error { id: Some(id.clone()), error: BleError::from(error) });
        transition(ctx, &id, Trigger::TeardownComplete);
    }

    /// Remove an idle device from the registry. Returns true if it was removed.
    pub(crate) fn forget(&mut self, ctx: &Context, id: String, reply: Reply<()>) -> bool {
        if self.is_tearing_down(&id) {
            self.enqueue(&id, Command::Forget { id: id.clone(), reply });
            return false;
        }

        if self.in_flight.contains_key(&id) {
            respond(reply, Err(BleError::DeviceBusy { id }));
            return false;
        }

        let mut registry = ctx.write_registry();
        let busy = match registry.get(&id) {
            Ok(device) => device.state.is_active(),
            Err(err) => {
                drop(registry);
                respond(reply, Err(err));
                return false;
            },
        };

        if busy {
            drop(registry);
            respond(reply, Err(BleError::DeviceBusy { id }));
            return false;
        }

        let removed = registry.remove(&id).map(|_| ());
        drop(registry);

        let ok = removed.is_ok();
        respond(reply, removed);
        ok
    }

    /// Tear down every live connection and wait for the radio, so nothing is left half open.
    pub(crate) async fn shutdown(&mut self, ctx: &Context) {
        // dropping the queued replies tells those callers the manager stopped
        self.queued.clear();

        let mut replies: Vec<Reply<()>> = Vec::new();
        for (id, operation) in self.in_flight.drain() {
            match operation {
                InFlight::Connecting { cancel, reply, .. } => {
                    cancel.cancel();
                    respond(reply, Err(BleError::ManagerStopped));
                    transition(ctx, &id, Trigger::Disconnect);
                },
                InFlight::Disconnecting { replies: waiting } => replies.extend(waiting),
                InFlight::Cleanup => {},
            }
        }

        let connected: Vec<String> = ctx.read_registry()
            .list(|device| device.state == ConnectionState::Connected)
            .map(|device| device.id.clone())
            .collect();
        for id in &connected {
            transition(ctx, id, Trigger::Disconnect);
        }

        let tearing_down: Vec<String> = ctx.read_registry()
            .list(|device| device.state == ConnectionState::Disconnecting)
            .map(|device| device.id.clone())
            .collect();

        for id in tearing_down {
            let result = tokio::select! {
                _ = sleep(ctx.config.disconnect_timeout()) => Err(RadioError::TimedOut),
                result = ctx.radio.disconnect(&id) => result,
            };
            if let Err(err) = result {
                warn!("Radio did not confirm disconnect from {} during shutdown: {}", id, err);
            }
            transition(ctx, &id, Trigger::TeardownComplete);
        }

        for reply in replies {
            respond(reply, Ok(()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    const ALL_STATES: [ConnectionState; 6] = [Discovered, Connecting, Connected, Disconnecting, Disconnected, Failed];

    #[test]
    fn connect_is_allowed_from_idle_states_only() {
        for state in ALL_STATES {
            let expected = match state {
                Discovered | Disconnected | Failed => Some(Connecting),
                _ => None,
            };
            assert_eq!(next_state(state, Trigger::Connect), expected, "connect from {}", state);
        }
    }

    #[test]
    fn handshake_outcomes() {
        assert_eq!(next_state(Connecting, Trigger::HandshakeSucceeded), Some(Connected));
        assert_eq!(next_state(Connecting, Trigger::HandshakeFailed), Some(Failed));
        assert_eq!(next_state(Connected, Trigger::HandshakeSucceeded), None);
        assert_eq!(next_state(Failed, Trigger::HandshakeFailed), None);
    }

    #[test]
    fn teardown_path() {
        assert_eq!(next_state(Connected, Trigger::Disconnect), Some(Disconnecting));
        assert_eq!(next_state(Connected, Trigger::LinkLost), Some(Disconnecting));
        assert_eq!(next_state(Connecting, Trigger::Disconnect), Some(Disconnecting));
        assert_eq!(next_state(Disconnecting, Trigger::TeardownComplete), Some(Disconnected));
    }

    #[test]
    fn disconnect_is_rejected_when_not_connected() {
        for state in [Discovered, Disconnected, Failed, Disconnecting] {
            assert_eq!(next_state(state, Trigger::Disconnect), None, "disconnect from {}", state);
        }
        assert_eq!(next_state(Discovered, Trigger::LinkLost), None);
    }

    #[test]
    fn teardown_only_completes_a_teardown() {
        for state in ALL_STATES {
            let expected = if state == Disconnecting { Some(Disconnected) } else { None };
            assert_eq!(next_state(state, Trigger::TeardownComplete), expected);
        }
    }
}
