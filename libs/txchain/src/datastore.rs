//! Datastore collaborator interface
//!
//! The store is an abstract key-value tree addressed by `/`-separated paths.
//! Deleting a path removes everything below it. A [`ReadWriteTransaction`]
//! buffers mutations on top of a read view; a [`TransactionChain`] commits
//! transactions for one device strictly in submission order.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use types::{DatastoreError, DeviceId};

/// One buffered write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    Put { path: String, value: Value },
    Merge { path: String, value: Value },
    Delete { path: String },
}

impl Mutation {
    pub fn path(&self) -> &str {
        match self {
            Mutation::Put { path, .. } | Mutation::Merge { path, .. } | Mutation::Delete { path } => path,
        }
    }
}

/// Read access to committed state
pub trait DataReader: Send + Sync {
    fn read(&self, path: &str) -> Option<Value>;
}

/// True if `path` equals `root` or lies below it
pub fn is_within(path: &str, root: &str) -> bool {
    path == root || (path.starts_with(root) && path.as_bytes().get(root.len()) == Some(&b'/'))
}

/// Shallow object merge; non-objects are replaced
pub fn merge_values(base: Option<Value>, update: &Value) -> Value {
    match (base, update) {
        (Some(Value::Object(mut current)), Value::Object(incoming)) => {
            for (key, value) in incoming {
                current.insert(key.clone(), value.clone());
            }
            Value::Object(current)
        }
        (_, update) => update.clone(),
    }
}

/// Scoped read/write transaction
pub struct ReadWriteTransaction {
    reader: Arc<dyn DataReader>,
    mutations: Vec<Mutation>,
}

impl ReadWriteTransaction {
    pub fn new(reader: Arc<dyn DataReader>) -> Self {
        Self {
            reader,
            mutations: Vec::new(),
        }
    }

    /// Read through this transaction's own writes
    pub fn read(&self, path: &str) -> Option<Value> {
        let mut value = self.reader.read(path);
        for mutation in &self.mutations {
            match mutation {
                Mutation::Put { path: p, value: v } if p == path => value = Some(v.clone()),
                Mutation::Merge { path: p, value: v } if p == path => value = Some(merge_values(value, v)),
                Mutation::Delete { path: p } if is_within(path, p) => value = None,
                _ => {}
            }
        }
        value
    }

    pub fn put(&mut self, path: impl Into<String>, value: Value) {
        self.mutations.push(Mutation::Put { path: path.into(), value });
    }

    pub fn merge(&mut self, path: impl Into<String>, value: Value) {
        self.mutations.push(Mutation::Merge { path: path.into(), value });
    }

    pub fn delete(&mut self, path: impl Into<String>) {
        self.mutations.push(Mutation::Delete { path: path.into() });
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn into_mutations(self) -> Vec<Mutation> {
        self.mutations
    }
}

/// Ordered commit stream for one device
#[async_trait]
pub trait TransactionChain: Send + Sync {
    fn new_transaction(&self) -> ReadWriteTransaction;

    /// Commit; a rejected commit is `CommitFailed`, distinct from `Timeout`
    async fn submit(&self, tx: ReadWriteTransaction) -> Result<(), DatastoreError>;

    fn close(&self);
}

/// Factory for per-device transaction chains
pub trait DataBroker: Send + Sync {
    fn create_transaction_chain(&self, device: &DeviceId) -> Arc<dyn TransactionChain>;
}
