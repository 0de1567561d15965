//! One interactive session: a connection handle plus everything that
//! cancels statements on it.

use crate::cancel::CancelWorker;
use crate::dispatcher::{CommandSource, Dispatcher, LoopExit, ResultSink};
use crate::error::SessionResult;
use crate::handle::ConnectionHandle;
use crate::relay::InterruptRelay;
use crate::state::SessionStateMachine;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct Session<H> {
    dispatcher: Dispatcher<H>,
    relay: Arc<InterruptRelay>,
    worker: JoinHandle<()>,
}

impl<H: ConnectionHandle> Session<H> {
    /// Set up the state machine and the cancel worker for `handle`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(handle: H) -> Self {
        let (machine, requests) = SessionStateMachine::new();
        let machine = Arc::new(machine);
        let worker = CancelWorker::spawn(Arc::clone(&machine), handle.canceller(), requests);
        let relay = Arc::new(InterruptRelay::new(Arc::clone(&machine)));

        Self {
            dispatcher: Dispatcher::new(machine, handle),
            relay,
            worker,
        }
    }

    pub fn machine(&self) -> Arc<SessionStateMachine> {
        Arc::clone(self.dispatcher.machine())
    }

    pub fn relay(&self) -> Arc<InterruptRelay> {
        Arc::clone(&self.relay)
    }

    pub fn handle(&self) -> &H {
        self.dispatcher.handle()
    }

    /// Listen for SIGINT and dispatch commands until the session ends.
    pub async fn run<S, R>(mut self, source: &mut S, sink: &mut R) -> SessionResult<LoopExit>
    where
        S: CommandSource + ?Sized,
        R: ResultSink + ?Sized,
    {
        let interrupts = Arc::clone(&self.relay).install();
        let result = self.dispatcher.run_loop(source, sink).await;
        interrupts.abort();

        self.worker.abort();
        debug!(?result, "session finished");
        result
    }
}
