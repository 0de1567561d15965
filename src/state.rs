//! Session state machine.
//!
//! Single source of truth for "is a statement running, and which one".
//! State, the pending statement and the cancel queue live behind one lock so
//! the relay's read-then-act on an interrupt is a single transaction against
//! `begin_execution` / `complete_execution`.
//!
//! ```text
//! Idle --begin--> Executing --complete--> Idle
//!                     |                    ^
//!                 cancel(seq)              |
//!                     v                    |
//!                 Cancelling --complete----+
//!
//! Idle | Executing --terminate--> Terminating
//! ```
//!
//! A cancel that was queued for statement `seq` stays "in flight" until the
//! worker has sent or dropped it. The next statement must not start before
//! that, see [`SessionStateMachine::cancel_settled`].

use crate::error::{SessionError, SessionResult};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Executing,
    Cancelling,
    Terminating,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "Idle",
            SessionState::Executing => "Executing",
            SessionState::Cancelling => "Cancelling",
            SessionState::Terminating => "Terminating",
        };
        f.write_str(name)
    }
}

/// The statement currently in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingStatement {
    pub seq: u64,
    pub sql: String,
}

/// A cancel queued for the worker that talks to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelRequest {
    pub seq: u64,
}

/// What happened to a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelDecision {
    /// Session moved to Cancelling and one request was queued.
    Requested,
    /// A cancel for this statement is already on its way.
    AlreadyCancelling,
    /// The targeted statement is no longer the one running.
    Stale,
    /// Nothing is running.
    NotExecuting,
}

struct Inner {
    state: SessionState,
    pending: Option<PendingStatement>,
    next_seq: u64,
    cancel_tx: Option<UnboundedSender<CancelRequest>>,
    /// Statement whose cancel the worker has not finished with yet.
    cancel_in_flight: Option<u64>,
}

pub struct SessionStateMachine {
    inner: Mutex<Inner>,
    settled: Notify,
}

impl SessionStateMachine {
    /// Create a machine in Idle.
    ///
    /// The returned receiver yields every honoured cancel request; it closes
    /// once the session reaches Terminating.
    pub fn new() -> (Self, UnboundedReceiver<CancelRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let machine = Self {
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                pending: None,
                next_seq: 1,
                cancel_tx: Some(tx),
                cancel_in_flight: None,
            }),
            settled: Notify::new(),
        };
        (machine, rx)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every critical section leaves Inner consistent, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// State and active sequence number, read together.
    pub fn snapshot(&self) -> (SessionState, Option<u64>) {
        let inner = self.lock();
        (inner.state, inner.pending.as_ref().map(|p| p.seq))
    }

    /// Idle -> Executing. Fails unless the session is Idle.
    pub fn begin_execution(&self, sql: &str) -> SessionResult<PendingStatement> {
        let mut inner = self.lock();
        if inner.state != SessionState::Idle {
            return Err(SessionError::invalid_state(SessionState::Idle, inner.state));
        }

        let pending = PendingStatement {
            seq: inner.next_seq,
            sql: sql.to_string(),
        };
        inner.next_seq += 1;
        inner.state = SessionState::Executing;
        inner.pending = Some(pending.clone());
        debug!(seq = pending.seq, "statement started");
        Ok(pending)
    }

    /// Cancel statement `seq` if, and only if, it is the one executing.
    pub fn request_cancel(&self, seq: u64) -> CancelDecision {
        let mut inner = self.lock();
        Self::cancel_locked(&mut inner, seq)
    }

    /// Cancel whatever is executing right now. Used by the interrupt relay.
    pub fn interrupt(&self) -> CancelDecision {
        let mut inner = self.lock();
        let active = inner.pending.as_ref().map(|p| p.seq);
        match active {
            Some(seq) => Self::cancel_locked(&mut inner, seq),
            None => CancelDecision::NotExecuting,
        }
    }

    fn cancel_locked(inner: &mut Inner, seq: u64) -> CancelDecision {
        let active = inner.pending.as_ref().map(|p| p.seq);
        match inner.state {
            SessionState::Idle | SessionState::Terminating => CancelDecision::NotExecuting,
            _ if active != Some(seq) => {
                debug!(seq, ?active, "ignoring stale cancel");
                CancelDecision::Stale
            }
            SessionState::Cancelling => CancelDecision::AlreadyCancelling,
            SessionState::Executing => {
                inner.state = SessionState::Cancelling;
                let queued = inner
                    .cancel_tx
                    .as_ref()
                    .is_some_and(|tx| tx.send(CancelRequest { seq }).is_ok());
                if queued {
                    inner.cancel_in_flight = Some(seq);
                } else {
                    warn!(seq, "cancel worker is gone; statement will run to completion");
                }
                debug!(seq, "cancel requested");
                CancelDecision::Requested
            }
        }
    }

    /// True while statement `seq` is running and waiting for its cancel.
    ///
    /// The worker checks this right before it contacts the server.
    pub fn is_cancelling(&self, seq: u64) -> bool {
        let inner = self.lock();
        inner.state == SessionState::Cancelling
            && inner.pending.as_ref().is_some_and(|p| p.seq == seq)
    }

    /// The worker is done with the cancel for `seq`, sent or dropped.
    pub fn settle_cancel(&self, seq: u64) {
        {
            let mut inner = self.lock();
            if inner.cancel_in_flight != Some(seq) {
                return;
            }
            inner.cancel_in_flight = None;
        }
        debug!(seq, "cancel settled");
        self.settled.notify_waiters();
    }

    /// Wait until no cancel request is in flight.
    ///
    /// A request for a finished statement that is still travelling could
    /// otherwise land on the next one.
    pub async fn cancel_settled(&self) {
        loop {
            let notified = self.settled.notified();
            let in_flight = self.lock().cancel_in_flight;
            match in_flight {
                None => return,
                Some(seq) => debug!(seq, "waiting for cancel to settle"),
            }
            notified.await;
        }
    }

    /// Executing | Cancelling -> Idle, clearing the pending statement.
    ///
    /// Returns true when a cancel had been requested for `pending`, which is
    /// what tells a user cancellation apart from a server-side 57014 with
    /// another cause. A session that reached Terminating stays there.
    pub fn complete_execution(&self, pending: &PendingStatement) -> bool {
        let mut inner = self.lock();
        let matches = inner.pending.as_ref().is_some_and(|p| p.seq == pending.seq);
        let cancelled = matches && inner.state == SessionState::Cancelling;

        if matches {
            inner.pending = None;
        }
        if inner.state != SessionState::Terminating {
            inner.state = SessionState::Idle;
        }
        debug!(seq = pending.seq, cancelled, "statement finished");
        cancelled
    }

    /// Enter Terminating. Allowed once, and never while a cancel is in flight.
    ///
    /// Drops the cancel queue sender, which stops the cancel worker.
    pub fn terminate(&self) -> SessionResult<()> {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Cancelling | SessionState::Terminating => {
                Err(SessionError::invalid_state(SessionState::Idle, inner.state))
            }
            SessionState::Idle | SessionState::Executing => {
                inner.state = SessionState::Terminating;
                inner.pending = None;
                inner.cancel_tx = None;
                debug!("session terminating");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::mpsc::error::TryRecvError;

    fn machine() -> (SessionStateMachine, UnboundedReceiver<CancelRequest>) {
        SessionStateMachine::new()
    }

    #[test]
    fn test_begin_requires_idle() {
        let (m, _rx) = machine();
        let first = m.begin_execution("SELECT 1").unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(m.snapshot(), (SessionState::Executing, Some(1)));

        let err = m.begin_execution("SELECT 2").unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidState {
                expected: SessionState::Idle,
                found: SessionState::Executing
            }
        ));

        assert!(!m.complete_execution(&first));
        assert_eq!(m.snapshot(), (SessionState::Idle, None));
        assert_eq!(m.begin_execution("SELECT 2").unwrap().seq, 2);
    }

    #[test]
    fn test_cancel_queues_one_request() {
        let (m, mut rx) = machine();
        let stmt = m.begin_execution("SELECT pg_sleep(10)").unwrap();

        assert_eq!(m.request_cancel(stmt.seq), CancelDecision::Requested);
        assert_eq!(m.state(), SessionState::Cancelling);
        assert!(m.is_cancelling(stmt.seq));
        assert_eq!(m.request_cancel(stmt.seq), CancelDecision::AlreadyCancelling);
        assert_eq!(m.interrupt(), CancelDecision::AlreadyCancelling);

        assert_eq!(rx.try_recv().unwrap(), CancelRequest { seq: stmt.seq });
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        assert!(m.complete_execution(&stmt));
        assert_eq!(m.state(), SessionState::Idle);
        assert!(!m.is_cancelling(stmt.seq));
    }

    #[test]
    fn test_stale_cancel_does_not_touch_next_statement() {
        let (m, mut rx) = machine();
        let a = m.begin_execution("SELECT 'a'").unwrap();
        m.complete_execution(&a);
        let b = m.begin_execution("SELECT 'b'").unwrap();

        assert_eq!(m.request_cancel(a.seq), CancelDecision::Stale);
        assert_eq!(m.state(), SessionState::Executing);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert!(!m.complete_execution(&b));
    }

    #[test]
    fn test_interrupt_while_idle_is_noop() {
        let (m, mut rx) = machine();
        assert_eq!(m.interrupt(), CancelDecision::NotExecuting);
        assert_eq!(m.request_cancel(1), CancelDecision::NotExecuting);
        assert_eq!(m.state(), SessionState::Idle);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_terminate_once_closes_queue() {
        let (m, mut rx) = machine();
        m.terminate().unwrap();
        assert_eq!(m.state(), SessionState::Terminating);
        assert!(m.terminate().is_err());
        assert!(m.begin_execution("SELECT 1").is_err());
        assert_eq!(m.interrupt(), CancelDecision::NotExecuting);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn test_terminate_refused_while_cancelling() {
        let (m, _rx) = machine();
        let stmt = m.begin_execution("SELECT pg_sleep(10)").unwrap();
        m.interrupt();
        assert!(matches!(
            m.terminate(),
            Err(SessionError::InvalidState {
                found: SessionState::Cancelling,
                ..
            })
        ));
        m.complete_execution(&stmt);
        assert!(m.terminate().is_ok());
    }

    #[test]
    fn test_complete_keeps_terminating() {
        let (m, _rx) = machine();
        let stmt = m.begin_execution("SELECT 1").unwrap();
        m.terminate().unwrap();
        assert!(!m.complete_execution(&stmt));
        assert_eq!(m.state(), SessionState::Terminating);
    }

    #[tokio::test]
    async fn test_cancel_without_worker_is_never_in_flight() {
        let (m, rx) = machine();
        drop(rx);
        let stmt = m.begin_execution("SELECT pg_sleep(10)").unwrap();
        assert_eq!(m.interrupt(), CancelDecision::Requested);
        assert!(m.complete_execution(&stmt));
        tokio::time::timeout(Duration::from_millis(100), m.cancel_settled())
            .await
            .expect("nothing was queued, nothing to wait for");
    }

    #[tokio::test]
    async fn test_cancel_settled_waits_for_worker() {
        let (m, _rx) = machine();
        let stmt = m.begin_execution("SELECT pg_sleep(10)").unwrap();
        m.interrupt();
        m.complete_execution(&stmt);

        let waited = tokio::time::timeout(Duration::from_millis(50), m.cancel_settled()).await;
        assert!(waited.is_err(), "statement finished but its cancel is still queued");

        // Settling another statement's cancel changes nothing.
        m.settle_cancel(stmt.seq + 1);
        let waited = tokio::time::timeout(Duration::from_millis(50), m.cancel_settled()).await;
        assert!(waited.is_err());

        m.settle_cancel(stmt.seq);
        tokio::time::timeout(Duration::from_millis(50), m.cancel_settled())
            .await
            .expect("settled cancel must release waiters");
    }
}
