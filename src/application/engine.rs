use super::reconciler::Reconciler;
use super::scheduler::LeaseScheduler;
use super::sweeper::LeaseSweeper;
use super::worker::{DispatchReceiver, Worker};
use crate::config::EngineConfig;
use crate::domain::ports::QueueLeasingRef;
use crate::domain::resolution::DeferReason;
use crate::error::{AccrualError, Result};
use crate::interfaces::http::accrual_client::AccrualClient;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of an [`AccrualEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Running,
    ShuttingDown,
    Faulted,
    Stopped,
}

/// The accrual polling engine.
///
/// Owns the lease scheduler, the worker pool and the lease sweeper as one unit
/// of concurrent work. The first fatal error from any of them cancels the
/// rest and is reported exactly once, through [`AccrualEngine::faulted`] or,
/// if nobody asked, from [`AccrualEngine::close`].
pub struct AccrualEngine {
    cancel: CancellationToken,
    wake: Arc<Notify>,
    state: Arc<watch::Sender<EngineState>>,
    fault: Option<oneshot::Receiver<AccrualError>>,
    supervisor: Option<JoinHandle<()>>,
}

impl AccrualEngine {
    /// Validates `config` and spawns every engine task on the current runtime.
    pub fn start(store: QueueLeasingRef, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let client = AccrualClient::new(&config.accrual_system_address, config.request_timeout)?;

        let cancel = CancellationToken::new();
        let wake = Arc::new(Notify::new());
        let (state, _) = watch::channel(EngineState::Running);
        let state = Arc::new(state);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(1);
        let dispatch_rx: DispatchReceiver = Arc::new(Mutex::new(dispatch_rx));
        let reconciler = Arc::new(Reconciler::new(store.clone()));

        let mut tasks = JoinSet::new();
        tasks.spawn(
            LeaseScheduler::new(
                store.clone(),
                dispatch_tx,
                config.empty_queue_backoff,
                wake.clone(),
                cancel.clone(),
            )
            .run(),
        );
        for id in 0..config.workers {
            tasks.spawn(
                Worker::new(
                    id,
                    client.clone(),
                    reconciler.clone(),
                    dispatch_rx.clone(),
                    config.rate_limit_cooldown,
                    cancel.clone(),
                )
                .run(),
            );
        }
        tasks.spawn(
            LeaseSweeper::new(
                store.clone(),
                config.sweep_interval,
                config.lease_ttl,
                cancel.clone(),
            )
            .run(),
        );

        let (fault_tx, fault_rx) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(
            tasks,
            cancel.clone(),
            state.clone(),
            fault_tx,
            dispatch_rx,
            store,
        ));

        info!(
            workers = config.workers,
            accrual_system = %config.accrual_system_address,
            "accrual engine started"
        );
        Ok(Self {
            cancel,
            wake,
            state,
            fault: Some(fault_rx),
            supervisor: Some(supervisor),
        })
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Lets an idle scheduler claim right away instead of waiting out its backoff.
    pub fn notify_enqueued(&self) {
        self.wake.notify_one();
    }

    /// Resolves with the engine's first fatal error, or `None` once the engine
    /// has stopped cleanly or the error was already taken.
    pub async fn faulted(&mut self) -> Option<AccrualError> {
        let fault = self.fault.as_mut()?.await.ok();
        self.fault = None;
        fault
    }

    /// Cancels all engine tasks and waits until every one of them has exited.
    ///
    /// Returns the first fatal error if it was never taken via `faulted`.
    pub async fn close(&mut self) -> Result<()> {
        self.state.send_if_modified(|state| {
            let running = *state == EngineState::Running;
            if running {
                *state = EngineState::ShuttingDown;
            }
            running
        });
        self.cancel.cancel();

        if let Some(supervisor) = self.supervisor.take() {
            supervisor
                .await
                .map_err(|e| AccrualError::Task(e.to_string()))?;
        }
        info!("accrual engine closed");

        match self.fault.take().map(|mut fault| fault.try_recv()) {
            Some(Ok(err)) => Err(err),
            _ => Ok(()),
        }
    }
}

impl Drop for AccrualEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn supervise(
    mut tasks: JoinSet<Result<()>>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<EngineState>>,
    fault_tx: oneshot::Sender<AccrualError>,
    dispatch: DispatchReceiver,
    store: QueueLeasingRef,
) {
    let mut fault_tx = Some(fault_tx);
    while let Some(joined) = tasks.join_next().await {
        let err = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => err,
            Err(join_err) => AccrualError::Task(join_err.to_string()),
        };

        match fault_tx.take() {
            Some(tx) => {
                error!(error = %err, "accrual engine faulted, shutting down");
                state.send_if_modified(|state| {
                    let running = *state == EngineState::Running;
                    if running {
                        *state = EngineState::Faulted;
                    }
                    running
                });
                cancel.cancel();
                // The owner may have stopped listening; the error is logged above.
                let _ = tx.send(err);
            }
            None => warn!(error = %err, "further engine error during shutdown"),
        }
    }

    // Orders still sitting in the dispatch slot were claimed but never worked on.
    let mut dispatch = dispatch.lock().await;
    while let Ok(lease) = dispatch.try_recv() {
        match store.release_lease(&lease, &DeferReason::Shutdown).await {
            Ok(()) => {}
            Err(AccrualError::LeaseLost(_)) => debug!(%lease, "lease expired before shutdown"),
            Err(err) => warn!(%lease, error = %err, "could not release lease on shutdown"),
        }
    }

    state.send_replace(EngineState::Stopped);
}
