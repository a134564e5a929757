use std::sync::Arc;
use std::time::Duration;
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender};
use log::{debug, warn};
use tokio::time::sleep;
use uuid::Uuid;

use crate::command::types::{Completion, Ingress, Reply};
use crate::error::RadioError;
use crate::radio::{Radio, RadioFuture};

/**
 * How long (milliseconds) the radio may take to start or stop scanning.
 */
pub const SCAN_RADIO_DEADLINE: u64 = 5_000;

pub(crate) enum ScanRequest {
    Start {
        generation: u64,
        services: Vec<Uuid>,
    },
    /// `reply` is answered once the radio has stopped.
    Stop {
        reply: Option<Reply<()>>,
    },
}

async fn within_deadline(operation: RadioFuture) -> Result<(), RadioError> {
    tokio::select! {
        _ = sleep(Duration::from_millis(SCAN_RADIO_DEADLINE)) => Err(RadioError::TimedOut),
        result = operation => result,
    }
}

/// Runs scan requests against the radio one at a time, in the order the engine sent them.
/// Ends once the engine closes the request queue and everything queued has run.
pub(crate) async fn run_scan_driver(radio: Arc<dyn Radio>, mut requests: UnboundedReceiver<ScanRequest>, ingress: UnboundedSender<Ingress>) {
    while let Some(request) = requests.next().await {
        match request {
            ScanRequest::Start { generation, services } => {
                debug!("Radio scan {} starting", generation);
                let result = within_deadline(radio.start_scan(services)).await;
                let _ = ingress.unbounded_send(Ingress::Completion(Completion::ScanStarted { generation, result }));
            },
            ScanRequest::Stop { reply } => {
                if let Err(err) = within_deadline(radio.stop_scan()).await {
                    warn!("Failed to stop scanning: {}", err);
                }

                // the scan session is already over, whatever the radio said
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            },
        }
    }

    debug!("Scan driver stopped");
}
