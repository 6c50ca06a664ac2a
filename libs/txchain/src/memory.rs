//! In-memory datastore
//!
//! Backs the simulator binary and the test suites. Every applied mutation is
//! appended to a journal so commit order can be inspected afterwards.

use crate::datastore::{is_within, merge_values, DataBroker, DataReader, Mutation, ReadWriteTransaction, TransactionChain};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use types::{DatastoreError, DeviceId};

/// A mutation as it was applied, tagged with its device and commit number
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub device: DeviceId,
    pub commit: u64,
    pub mutation: Mutation,
}

#[derive(Default)]
struct MemoryStore {
    data: RwLock<BTreeMap<String, Value>>,
    journal: Mutex<Vec<JournalEntry>>,
    commits: AtomicU64,
    chains_created: AtomicU64,
    fail_next: AtomicUsize,
    commit_delay: Mutex<Option<Duration>>,
}

impl DataReader for MemoryStore {
    fn read(&self, path: &str) -> Option<Value> {
        self.data.read().get(path).cloned()
    }
}

impl MemoryStore {
    fn take_injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn apply(&self, device: &DeviceId, mutations: Vec<Mutation>) {
        let commit = self.commits.fetch_add(1, Ordering::AcqRel) + 1;
        let mut data = self.data.write();
        let mut journal = self.journal.lock();

        for mutation in mutations {
            match &mutation {
                Mutation::Put { path, value } => {
                    data.insert(path.clone(), value.clone());
                }
                Mutation::Merge { path, value } => {
                    let merged = merge_values(data.get(path).cloned(), value);
                    data.insert(path.clone(), merged);
                }
                Mutation::Delete { path } => {
                    data.retain(|key, _| !is_within(key, path));
                }
            }
            journal.push(JournalEntry {
                device: device.clone(),
                commit,
                mutation,
            });
        }
    }
}

/// Data broker holding everything in a single process-local tree
#[derive(Clone, Default)]
pub struct MemoryDataBroker {
    store: Arc<MemoryStore>,
}

impl MemoryDataBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, path: &str) -> Option<Value> {
        self.store.read(path)
    }

    /// Committed paths at or below `root`
    pub fn paths_under(&self, root: &str) -> Vec<String> {
        self.store
            .data
            .read()
            .keys()
            .filter(|key| is_within(key, root))
            .cloned()
            .collect()
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.store.journal.lock().clone()
    }

    /// Journal entries of one device, in commit order
    pub fn journal_for(&self, device: &DeviceId) -> Vec<JournalEntry> {
        self.store
            .journal
            .lock()
            .iter()
            .filter(|entry| &entry.device == device)
            .cloned()
            .collect()
    }

    pub fn commit_count(&self) -> u64 {
        self.store.commits.load(Ordering::Acquire)
    }

    pub fn chains_created(&self) -> u64 {
        self.store.chains_created.load(Ordering::Acquire)
    }

    /// Make the next `n` submissions fail with `CommitFailed`
    pub fn fail_next_commits(&self, n: usize) {
        self.store.fail_next.store(n, Ordering::Release);
    }

    /// Delay every submission, to widen race windows in tests
    pub fn set_commit_delay(&self, delay: Option<Duration>) {
        *self.store.commit_delay.lock() = delay;
    }
}

impl DataBroker for MemoryDataBroker {
    fn create_transaction_chain(&self, device: &DeviceId) -> Arc<dyn TransactionChain> {
        self.store.chains_created.fetch_add(1, Ordering::AcqRel);
        Arc::new(MemoryChain {
            device: device.clone(),
            store: Arc::clone(&self.store),
            closed: AtomicBool::new(false),
        })
    }
}

struct MemoryChain {
    device: DeviceId,
    store: Arc<MemoryStore>,
    closed: AtomicBool,
}

#[async_trait]
impl TransactionChain for MemoryChain {
    fn new_transaction(&self) -> ReadWriteTransaction {
        ReadWriteTransaction::new(Arc::clone(&self.store) as Arc<dyn DataReader>)
    }

    async fn submit(&self, tx: ReadWriteTransaction) -> Result<(), DatastoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DatastoreError::ChainClosed);
        }

        let delay = *self.store.commit_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.store.take_injected_failure() {
            return Err(DatastoreError::CommitFailed(format!(
                "injected failure for {}",
                self.device
            )));
        }

        let mutations = tx.into_mutations();
        debug!(device = %self.device, mutations = mutations.len(), "Applying memory commit");
        self.store.apply(&self.device, mutations);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
