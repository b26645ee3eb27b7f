//! Worker Pool
//!
//! A fixed number of workers consume the negotiation event queue. Events
//! for distinct agreement ids are processed in parallel; the per-agreement
//! locks inside the handlers serialize events for the same id.
//!
//! The pool also owns the deferred-cancel retry loop: cancellations whose
//! ledger work could not complete are parked on an unbounded channel by the
//! protocol driver and re-enqueued as `AsyncCancel` work on a fixed
//! interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use agbot_exchange::ExchangeClient;
use agbot_protocol::{AsyncCancelCmd, ProtocolDriver};
use agbot_store::AgreementStore;

use crate::events::{AgreementWork, AsyncCancelAgreement};
use crate::locks::AgreementLockManager;
use crate::worker::{AgreementWorker, NegotiationConfig};

/// Queue depth before enqueuers start applying backpressure.
const EVENT_QUEUE_DEPTH: usize = 256;

/// A running pool of negotiation workers.
pub struct WorkerPool {
    tx: mpsc::Sender<AgreementWork>,
    worker_handles: Vec<JoinHandle<()>>,
    deferred_handle: JoinHandle<()>,
}

impl WorkerPool {
    /// Spawn `worker_count` workers plus the deferred-cancel retry task.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        worker_count: usize,
        store: Arc<dyn AgreementStore>,
        exchange: Arc<dyn ExchangeClient>,
        driver: Arc<dyn ProtocolDriver>,
        locks: Arc<AgreementLockManager>,
        config: NegotiationConfig,
        deferred_rx: mpsc::UnboundedReceiver<AsyncCancelCmd>,
        deferred_retry_interval: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<AgreementWork>(EVENT_QUEUE_DEPTH);
        let rx = Arc::new(AsyncMutex::new(rx));

        let mut worker_handles = Vec::with_capacity(worker_count);
        for n in 0..worker_count {
            let worker_id = format!("worker-{n}-{}", &Uuid::new_v4().to_string()[..8]);
            let worker = AgreementWorker::new(
                &worker_id,
                store.clone(),
                exchange.clone(),
                driver.clone(),
                locks.clone(),
                config.clone(),
            );
            let rx = rx.clone();
            worker_handles.push(tokio::spawn(async move {
                loop {
                    // Only the dequeue is serialized; processing runs
                    // concurrently across workers.
                    let work = { rx.lock().await.recv().await };
                    match work {
                        Some(work) => worker.handle(work).await,
                        None => break,
                    }
                }
                debug!(worker_id = %worker.worker_id(), "worker stopped");
            }));
        }

        let deferred_handle = tokio::spawn(Self::deferred_cancel_loop(
            tx.clone(),
            deferred_rx,
            deferred_retry_interval,
        ));

        info!(worker_count, "agreement worker pool started");

        Self {
            tx,
            worker_handles,
            deferred_handle,
        }
    }

    /// Handle for enqueuing work; clone freely.
    pub fn sender(&self) -> mpsc::Sender<AgreementWork> {
        self.tx.clone()
    }

    /// Stop the retry loop, close the queue, and wait for in-flight events
    /// to finish.
    pub async fn shutdown(self) {
        self.deferred_handle.abort();
        let _ = self.deferred_handle.await;
        drop(self.tx);
        for handle in self.worker_handles {
            let _ = handle.await;
        }
        info!("agreement worker pool stopped");
    }

    /// Periodically drain deferred cancellations back into the main queue.
    async fn deferred_cancel_loop(
        tx: mpsc::Sender<AgreementWork>,
        mut deferred_rx: mpsc::UnboundedReceiver<AsyncCancelCmd>,
        interval: Duration,
    ) {
        loop {
            tokio::time::sleep(interval).await;
            loop {
                match deferred_rx.try_recv() {
                    Ok(cmd) => {
                        debug!(agreement_id = %cmd.agreement_id, "retrying deferred cancel");
                        let work = AgreementWork::AsyncCancel(AsyncCancelAgreement {
                            agreement_id: cmd.agreement_id,
                            protocol: cmd.protocol,
                            reason: cmd.reason,
                        });
                        if tx.send(work).await.is_err() {
                            warn!("event queue closed, stopping deferred cancel loop");
                            return;
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        debug!("deferred command channel closed");
                        return;
                    }
                }
            }
        }
    }
}
