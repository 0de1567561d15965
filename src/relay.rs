//! Interrupt relay: turns SIGINT into a cancel request.
//!
//! The relay only talks to the state machine. Network I/O for the cancel
//! happens in the [`CancelWorker`](crate::cancel::CancelWorker).

use crate::state::{CancelDecision, SessionStateMachine};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct InterruptRelay {
    machine: Arc<SessionStateMachine>,
    /// Interrupts ignored because a cancel was already in flight.
    repeats: AtomicU64,
}

impl InterruptRelay {
    pub fn new(machine: Arc<SessionStateMachine>) -> Self {
        Self {
            machine,
            repeats: AtomicU64::new(0),
        }
    }

    /// Handle one interrupt notification.
    pub fn on_interrupt(&self) -> CancelDecision {
        let decision = self.machine.interrupt();
        match decision {
            CancelDecision::Requested => {
                self.repeats.store(0, Ordering::Relaxed);
                info!("interrupt received, cancelling running statement");
            }
            CancelDecision::AlreadyCancelling => {
                let repeats = self.repeats.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(repeats, "cancel already in progress, interrupt ignored");
            }
            CancelDecision::Stale | CancelDecision::NotExecuting => {
                debug!(?decision, "interrupt with nothing to cancel");
            }
        }
        decision
    }

    /// Listen for SIGINT for the rest of the session.
    ///
    /// The listener is registered before this returns, so no interrupt after
    /// `install` is lost. Abort the returned task when the session ends.
    #[cfg(unix)]
    pub fn install(self: Arc<Self>) -> JoinHandle<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let interrupts = signal(SignalKind::interrupt());
        tokio::spawn(async move {
            let mut interrupts = match interrupts {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "failed to listen for interrupts");
                    return;
                }
            };
            while interrupts.recv().await.is_some() {
                self.on_interrupt();
            }
            debug!("interrupt stream closed");
        })
    }

    #[cfg(not(unix))]
    pub fn install(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "failed to listen for interrupts");
                    break;
                }
                self.on_interrupt();
            }
        })
    }
}
