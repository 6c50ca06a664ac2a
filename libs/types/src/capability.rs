//! Statistics capability model
//!
//! The declaration order of [`Capability`] is the poll order. `CapabilitySet`
//! stores kinds in a `BTreeSet`, so iterating a set always yields the same
//! order regardless of how the device advertised them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A statistics kind a device may support
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Flow,
    Table,
    Group,
    Meter,
    Port,
    Queue,
}

impl Capability {
    /// All kinds in poll order
    pub const ALL: [Capability; 6] = [
        Capability::Flow,
        Capability::Table,
        Capability::Group,
        Capability::Meter,
        Capability::Port,
        Capability::Queue,
    ];

    /// Kinds a switch must support when switch features are mandatory
    pub const MANDATORY: [Capability; 4] = [
        Capability::Flow,
        Capability::Table,
        Capability::Group,
        Capability::Meter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Flow => "flow-statistics",
            Capability::Table => "table-statistics",
            Capability::Group => "group-statistics",
            Capability::Meter => "meter-statistics",
            Capability::Port => "port-statistics",
            Capability::Queue => "queue-statistics",
        }
    }

    /// Datastore path under the node record where this kind is committed
    pub fn data_path(&self, node_path: &str) -> String {
        format!("{}/{}", node_path, self.as_str())
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capabilities declared by one device plus its table count.
///
/// Grows through [`CapabilitySet::insert`]; there is no removal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    kinds: BTreeSet<Capability>,
    table_count: u8,
}

impl CapabilitySet {
    pub fn new(kinds: impl IntoIterator<Item = Capability>, table_count: u8) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            table_count,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Add a kind; returns false if it was already present
    pub fn insert(&mut self, capability: Capability) -> bool {
        self.kinds.insert(capability)
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.kinds.contains(&capability)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    pub fn table_count(&self) -> u8 {
        self.table_count
    }

    /// Iterate in the fixed poll order
    pub fn poll_order(&self) -> impl Iterator<Item = Capability> + '_ {
        self.kinds.iter().copied()
    }

    /// Mandatory kinds this set lacks, in poll order
    pub fn missing_mandatory(&self) -> Vec<Capability> {
        Capability::MANDATORY
            .iter()
            .copied()
            .filter(|c| !self.kinds.contains(c))
            .collect()
    }
}
