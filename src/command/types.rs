use std::time::Duration;
use futures::channel::oneshot;

use crate::error::{BleError, RadioError};
use crate::radio::RadioEvent;
use crate::scan::types::ScanFilter;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, BleError>>;

pub(crate) enum Command {
    StartScan {
        filter: ScanFilter,
        allow_duplicates: bool,
        timeout: Option<Duration>,
        reply: Reply<()>,
    },
    StopScan {
        reply: Reply<()>,
    },
    Connect {
        id: String,
        reply: Reply<()>,
    },
    Disconnect {
        id: String,
        reply: Reply<()>,
    },
    Forget {
        id: String,
        reply: Reply<()>,
    },
}

/// Results of work the engine spawned, reported back through the ingress queue.
pub(crate) enum Completion {
    ScanStarted { generation: u64, result: Result<(), RadioError> },
    ScanExpired { generation: u64 },
    Handshake { id: String, attempt: u64, result: Result<(), BleError> },
    Teardown { id: String, result: Result<(), RadioError> },
}

/// Everything the engine reacts to arrives as one of these, on a single queue.
pub(crate) enum Ingress {
    Command(Command),
    Radio(RadioEvent),
    Completion(Completion),
}
