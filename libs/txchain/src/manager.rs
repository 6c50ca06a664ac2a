//! Transaction Chain Manager
//!
//! Owns the ordered queue of pending [`StatOperation`]s for exactly one
//! device and drains it into chained datastore transactions.
//!
//! ## Status
//!
//! ```text
//! WORKING ──close()──────────┐
//!    │                       ▼
//!    └──commit failure──> TEARING_DOWN ──close() drains──> CLOSED
//! ```
//!
//! Status transitions and the pending queue share one mutex. Submissions are
//! serialized by a separate async lock that is held across the datastore
//! await, so batches reach the datastore in the order they were drained and
//! `enqueue` never waits on I/O.

use crate::connection::ReadyForNewChainHandler;
use crate::datastore::{DataBroker, TransactionChain};
use crate::metrics::{ChainMetrics, ChainStats};
use crate::operation::StatOperation;
use crate::registration::Registration;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use types::{ChainStatus, DeviceId, PluginError, Result, SessionToken};

struct ChainState {
    status: ChainStatus,
    pending: VecDeque<StatOperation>,
    successor: Option<Arc<dyn ReadyForNewChainHandler>>,
    statistics_producer: bool,
    close_started: bool,
}

/// Serializes datastore mutations for one device
pub struct TransactionChainManager {
    device: DeviceId,
    session: SessionToken,
    chain: Arc<dyn TransactionChain>,
    state: Mutex<ChainState>,
    submit_lock: tokio::sync::Mutex<()>,
    registration: Registration,
    submitter: Mutex<Option<JoinHandle<()>>>,
    metrics: ChainMetrics,
}

impl TransactionChainManager {
    /// Create a `WORKING` manager with a fresh session token.
    ///
    /// `registration` is closed exactly once, when the manager reaches `CLOSED`.
    pub fn new(device: DeviceId, broker: &dyn DataBroker, registration: Registration) -> Self {
        let session = SessionToken::generate();
        let chain = broker.create_transaction_chain(&device);

        info!(device = %device, session = %session, "Creating new transaction chain");

        Self {
            device,
            session,
            chain,
            state: Mutex::new(ChainState {
                status: ChainStatus::Working,
                pending: VecDeque::new(),
                successor: None,
                statistics_producer: true,
                close_started: false,
            }),
            submit_lock: tokio::sync::Mutex::new(()),
            registration,
            submitter: Mutex::new(None),
            metrics: ChainMetrics::default(),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device
    }

    pub fn session_token(&self) -> SessionToken {
        self.session
    }

    pub fn status(&self) -> ChainStatus {
        self.state.lock().status
    }

    pub fn is_working(&self) -> bool {
        self.status().is_working()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn has_successor(&self) -> bool {
        self.state.lock().successor.is_some()
    }

    pub fn metrics(&self) -> ChainStats {
        self.metrics.get_stats()
    }

    /// Append an operation; rejected unless the manager is `WORKING`
    pub fn enqueue(&self, operation: StatOperation) -> Result<()> {
        debug_assert_eq!(operation.device(), &self.device);

        let mut state = self.state.lock();
        if !state.status.is_working() {
            self.metrics.operations_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(PluginError::rejected(&self.device, state.status));
        }
        state.pending.push_back(operation);
        self.metrics.operations_enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Register the handler of a waiting successor connection.
    ///
    /// Only one successor is accepted, and only while `WORKING`; `false` means
    /// the caller's connection conflicts and must be dropped.
    pub fn attempt_to_register_handler(&self, handler: Arc<dyn ReadyForNewChainHandler>) -> bool {
        let mut state = self.state.lock();
        if state.status.is_working() && state.successor.is_none() {
            state.successor = Some(handler);
            true
        } else {
            false
        }
    }

    /// Clear the registered successor if it is `handler`. Returns true if it
    /// was; a different or already notified handler is left alone.
    pub fn unregister_handler(&self, handler: &Arc<dyn ReadyForNewChainHandler>) -> bool {
        let mut state = self.state.lock();
        match &state.successor {
            Some(current) if Arc::ptr_eq(current, handler) => {
                state.successor = None;
                debug!(device = %self.device, session = %self.session, "Successor handler withdrawn");
                true
            }
            _ => false,
        }
    }

    /// The statistics collector will not enqueue anything further
    pub fn release_statistics_producer(&self) {
        let mut state = self.state.lock();
        if state.statistics_producer {
            state.statistics_producer = false;
            debug!(device = %self.device, session = %self.session, "Statistics producer released");
        }
    }

    pub fn has_statistics_producer(&self) -> bool {
        self.state.lock().statistics_producer
    }

    /// Drain the pending queue into one chained transaction.
    ///
    /// Returns the number of committed operations. A failed commit moves the
    /// manager to `TEARING_DOWN` and returns `ChainBroken`.
    pub async fn submit_chain(&self) -> Result<usize> {
        let _submit = self.submit_lock.lock().await;
        let batch: Vec<StatOperation> = {
            let mut state = self.state.lock();
            if !state.status.is_working() {
                return Err(PluginError::rejected(&self.device, state.status));
            }
            state.pending.drain(..).collect()
        };
        self.commit_batch(batch).await
    }

    async fn commit_batch(&self, batch: Vec<StatOperation>) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let count = batch.len();
        let mut tx = self.chain.new_transaction();
        for operation in &batch {
            operation.apply(&mut tx);
        }

        match self.chain.submit(tx).await {
            Ok(()) => {
                self.metrics.record_commit(count);
                debug!(device = %self.device, operations = count, "Transaction chain committed");
                Ok(count)
            }
            Err(source) => {
                self.metrics.record_commit_failure(count);
                {
                    let mut state = self.state.lock();
                    if state.status.is_working() {
                        state.status = ChainStatus::TearingDown;
                    }
                }
                warn!(
                    device = %self.device,
                    session = %self.session,
                    operations = count,
                    error = %source,
                    "Transaction chain commit failed, tearing down"
                );
                Err(PluginError::chain_broken(&self.device, source))
            }
        }
    }

    /// Spawn a task that submits the chain every `period` while `WORKING`
    pub fn start_periodic_submit(self: &Arc<Self>, period: Duration) {
        let manager = Arc::downgrade(self);
        let device = self.device.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                match manager.submit_chain().await {
                    Ok(0) => {}
                    Ok(committed) => {
                        debug!(device = %device, committed, "Periodic chain submit");
                    }
                    Err(e) => {
                        debug!(device = %device, error = %e, "Periodic chain submit stopped");
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self.submitter.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Tear the manager down: `TEARING_DOWN`, best-effort drain, `CLOSED`,
    /// registry removal, then successor notification. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.close_started {
                return;
            }
            state.close_started = true;
            if state.status.is_working() {
                state.status = ChainStatus::TearingDown;
            }
        }

        info!(device = %self.device, session = %self.session, "Closing transaction chain manager");

        {
            let _submit = self.submit_lock.lock().await;
            let batch: Vec<StatOperation> = self.state.lock().pending.drain(..).collect();
            let remaining = batch.len();
            if let Err(e) = self.commit_batch(batch).await {
                warn!(
                    device = %self.device,
                    remaining,
                    error = %e,
                    "Dropping remaining operations during teardown"
                );
            }
        }

        let successor = {
            let mut state = self.state.lock();
            state.status = ChainStatus::Closed;
            state.statistics_producer = false;
            let leftover = state.pending.len();
            if leftover > 0 {
                self.metrics
                    .operations_discarded
                    .fetch_add(leftover as u64, Ordering::Relaxed);
                state.pending.clear();
            }
            state.successor.take()
        };

        if let Some(handle) = self.submitter.lock().take() {
            handle.abort();
        }
        self.chain.close();
        self.registration.close();

        info!(device = %self.device, session = %self.session, "Transaction chain manager closed");

        if let Some(handler) = successor {
            debug!(device = %self.device, "Notifying waiting connection");
            handler.on_ready_for_new_chain();
        }
    }

    /// Discard a manager that lost the registry insert race; no callbacks run
    pub(crate) fn abandon(&self) {
        {
            let mut state = self.state.lock();
            state.close_started = true;
            state.status = ChainStatus::Closed;
            state.pending.clear();
            state.successor = None;
        }
        self.chain.close();
    }
}

impl std::fmt::Debug for TransactionChainManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionChainManager")
            .field("device", &self.device)
            .field("session", &self.session)
            .field("status", &self.status())
            .finish()
    }
}
