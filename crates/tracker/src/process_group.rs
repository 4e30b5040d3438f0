#![forbid(unsafe_code)]

use crate::domain::{BlockStatus, Connection};
use serde::Serialize;
use std::collections::HashSet;
use tracing::trace;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionUpdate {
    Added { key: String, connection: Connection },
    Updated { key: String, connection: Connection },
    Deleted { key: String },
}

impl ConnectionUpdate {
    pub fn key(&self) -> &str {
        match self {
            Self::Added { key, .. } | Self::Updated { key, .. } | Self::Deleted { key } => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessGroupSummary {
    pub id: String,
    pub source: String,
    pub name: String,
    pub size: usize,
    pub permitted: usize,
    pub unpermitted: usize,
    pub internal: usize,
    pub block_status: BlockStatus,
}

/// Connection keys of one application profile, split by verdict.
///
/// The three key sets are disjoint and `size` counts only the first two.
#[derive(Debug)]
pub struct ProcessGroup {
    id: String,
    source: String,
    name: String,
    permitted: HashSet<String>,
    unpermitted: HashSet<String>,
    internal: HashSet<String>,
    block_status: BlockStatus,
    listeners: Vec<flume::Sender<ConnectionUpdate>>,
}

impl ProcessGroup {
    pub fn new(id: impl Into<String>, name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            name: name.into(),
            permitted: HashSet::new(),
            unpermitted: HashSet::new(),
            internal: HashSet::new(),
            block_status: BlockStatus::Off,
            listeners: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn size(&self) -> usize {
        self.permitted.len() + self.unpermitted.len()
    }

    pub fn count_permitted(&self) -> usize {
        self.permitted.len()
    }

    pub fn count_unpermitted(&self) -> usize {
        self.unpermitted.len()
    }

    pub fn count_internal(&self) -> usize {
        self.internal.len()
    }

    /// No permitted or unpermitted keys. Internal keys alone do not keep
    /// a group alive.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn block_status(&self) -> BlockStatus {
        self.block_status
    }

    pub fn contains(&self, key: &str) -> bool {
        self.permitted.contains(key)
            || self.unpermitted.contains(key)
            || self.internal.contains(key)
    }

    /// Every tracked key, permitted first.
    pub fn keys(&self, include_internal: bool) -> Vec<String> {
        let mut keys: Vec<String> = self
            .permitted
            .iter()
            .chain(&self.unpermitted)
            .cloned()
            .collect();
        if include_internal {
            keys.extend(self.internal.iter().cloned());
        }
        keys
    }

    /// Receive every change made to this group from now on.
    pub fn subscribe(&mut self) -> flume::Receiver<ConnectionUpdate> {
        let (tx, rx) = flume::unbounded();
        self.listeners.push(tx);
        rx
    }

    /// Classify `key` afresh from `connection`.
    pub fn track(&mut self, key: &str, connection: &Connection, is_update: bool) {
        self.remove_key(key);

        let set = if connection.internal {
            &mut self.internal
        } else if connection.is_accepted() {
            &mut self.permitted
        } else {
            &mut self.unpermitted
        };
        set.insert(key.to_owned());
        self.update_block_status();

        let key = key.to_owned();
        let connection = connection.clone();
        self.notify(if is_update {
            ConnectionUpdate::Updated { key, connection }
        } else {
            ConnectionUpdate::Added { key, connection }
        });
    }

    /// Drop `key`. Returns whether it was tracked.
    pub fn forget(&mut self, key: &str) -> bool {
        if !self.remove_key(key) {
            trace!(key, group = %self.id, "forgetting unknown key");
            return false;
        }
        self.update_block_status();
        self.notify(ConnectionUpdate::Deleted {
            key: key.to_owned(),
        });
        true
    }

    /// Release all keys and listeners.
    pub fn dispose(&mut self) {
        self.permitted.clear();
        self.unpermitted.clear();
        self.internal.clear();
        self.listeners.clear();
        self.block_status = BlockStatus::Off;
    }

    pub fn summary(&self) -> ProcessGroupSummary {
        ProcessGroupSummary {
            id: self.id.clone(),
            source: self.source.clone(),
            name: self.name.clone(),
            size: self.size(),
            permitted: self.permitted.len(),
            unpermitted: self.unpermitted.len(),
            internal: self.internal.len(),
            block_status: self.block_status,
        }
    }

    fn remove_key(&mut self, key: &str) -> bool {
        // Non-short-circuiting so every set is cleared.
        self.permitted.remove(key) | self.unpermitted.remove(key) | self.internal.remove(key)
    }

    fn update_block_status(&mut self) {
        self.block_status = BlockStatus::from_counts(self.permitted.len(), self.unpermitted.len());
    }

    fn notify(&mut self, update: ConnectionUpdate) {
        self.listeners.retain(|tx| tx.send(update.clone()).is_ok());
    }
}
