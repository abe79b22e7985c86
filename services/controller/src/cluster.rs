//! The shared state every control loop works against.

use tokio::sync::watch;
use vmctl_model::{Instance, MigrationRequest, RunPolicy};

use crate::store::{Revision, Store};

/// Object stores plus the host inventory.
///
/// Passed explicitly to every component; there is no ambient client.
pub struct Cluster {
    pub policies: Store<RunPolicy>,
    pub instances: Store<Instance>,
    pub migrations: Store<MigrationRequest>,
    nodes: Vec<String>,
    revision: Revision,
}

impl Cluster {
    /// Create a cluster with the given host names (sorted, deduplicated).
    pub fn new<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut nodes: Vec<String> = nodes.into_iter().map(Into::into).collect();
        nodes.sort();
        nodes.dedup();

        let revision = Revision::new();
        Self {
            policies: Store::new(revision.clone()),
            instances: Store::new(revision.clone()),
            migrations: Store::new(revision.clone()),
            nodes,
            revision,
        }
    }

    /// Host names, ordered by name.
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    /// Receiver notified on every write to any store.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Current global revision.
    pub fn revision(&self) -> u64 {
        self.revision.current()
    }
}
