//! The seam between the manager and a Bluetooth radio stack.
//!
//! A backend performs scanning and handshakes and reports what it sees through a
//! [`RadioSink`]. Backend callbacks may come from any thread; the sink funnels them into the
//! engine's single ingress queue.

use std::fmt;
use futures::channel::mpsc::UnboundedSender;
use futures::future::{self, BoxFuture};
use uuid::Uuid;

use crate::command::types::Ingress;
use crate::device::types::Advertisement;
use crate::error::RadioError;

pub mod btle;
pub mod simulated;

/// Power state of the bluetooth adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Unknown,
    PoweredOn,
    PoweredOff,
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the strings a host bridge reports
        let result = match self {
            AdapterState::Unknown => "unknown",
            AdapterState::PoweredOn => "on",
            AdapterState::PoweredOff => "off",
        };

        write!(f, "{}", result)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    Advertisement(Advertisement),
    LinkLost { id: String, error: RadioError },
    StateUpdate(AdapterState),
}

#[derive(Clone)]
pub struct RadioSink {
    ingress: UnboundedSender<Ingress>,
}

impl RadioSink {
    pub(crate) fn new(ingress: UnboundedSender<Ingress>) -> Self {
        RadioSink { ingress }
    }

    /// Returns false once the manager has stopped.
    pub fn send(&self, event: RadioEvent) -> bool {
        self.ingress.unbounded_send(Ingress::Radio(event)).is_ok()
    }
}

pub type RadioFuture = BoxFuture<'static, Result<(), RadioError>>;

fn not_implemented(operation: &'static str) -> RadioFuture {
    Box::pin(future::ready(Err(RadioError::NotImplemented(operation))))
}

/// A radio backend. Operations a backend has not been ported for fail with
/// `RadioError::NotImplemented`.
pub trait Radio: Send + Sync {
    /// Called once, before any other operation.
    fn attach(&self, sink: RadioSink);

    fn start_scan(&self, _services: Vec<Uuid>) -> RadioFuture {
        not_implemented("start_scan")
    }

    fn stop_scan(&self) -> RadioFuture {
        not_implemented("stop_scan")
    }

    fn connect(&self, _id: &str) -> RadioFuture {
        not_implemented("connect")
    }

    fn disconnect(&self, _id: &str) -> RadioFuture {
        not_implemented("disconnect")
    }

    /// The manager dropped this peripheral from its registry.
    fn forget(&self, _id: &str) {}
}
