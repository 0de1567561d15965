//! Out-of-band cancellation channel and the worker that drives it.

use crate::error::SessionError;
use crate::handle::Canceller;
use crate::state::{CancelRequest, SessionStateMachine};
use async_trait::async_trait;
use pgshell_pg::{CancelEndpoint, CancelToken};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Upper bound on one cancel delivery; the next statement waits for it.
pub const CANCEL_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that can ask the server to stop the statement a token names.
///
/// Implementations open a short-lived link per call and never wait for an
/// answer from the server.
#[async_trait]
pub trait CancelChannel: Send + Sync {
    async fn send_cancel(&self, token: CancelToken) -> Result<(), SessionError>;
}

#[async_trait]
impl CancelChannel for CancelEndpoint {
    async fn send_cancel(&self, token: CancelToken) -> Result<(), SessionError> {
        CancelEndpoint::send_cancel(self, token)
            .await
            .map_err(|e| SessionError::CancelSend(e.to_string()))
    }
}

/// Marks the cancel for `seq` as settled when dropped, whatever path the
/// send took (delivered, failed, timed out, dropped as stale, task aborted).
struct InFlight<'a> {
    machine: &'a SessionStateMachine,
    seq: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.machine.settle_cancel(self.seq);
    }
}

/// Consumes cancel requests queued by the state machine and sends them.
///
/// Runs outside the state lock so the relay never blocks on the network.
/// Exits once the queue closes, which happens when the session terminates.
pub struct CancelWorker;

impl CancelWorker {
    pub fn spawn(
        machine: Arc<SessionStateMachine>,
        canceller: Canceller,
        mut requests: UnboundedReceiver<CancelRequest>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let seq = request.seq;
                let _in_flight = InFlight {
                    machine: &machine,
                    seq,
                };
                if !machine.is_cancelling(seq) {
                    debug!(seq, "statement already finished, cancel dropped");
                    continue;
                }
                match tokio::time::timeout(CANCEL_SEND_TIMEOUT, canceller.cancel()).await {
                    Ok(Ok(())) => debug!(seq, "cancel request delivered"),
                    // Best effort: the statement is left to finish on its own.
                    Ok(Err(e)) => warn!(seq, error = %e, "cancel request failed"),
                    Err(_) => warn!(seq, "cancel request timed out"),
                }
            }
            debug!("cancel worker stopped");
        })
    }
}
