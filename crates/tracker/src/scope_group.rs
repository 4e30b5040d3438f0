#![forbid(unsafe_code)]

use crate::domain::{BlockStatus, Connection, Domain, ScopeIdentifier, parse_domain};
use crate::stats::ConnectionStatistics;
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Predicate deciding which connections a scope group publishes.
pub type ConnectionFilter = Arc<dyn Fn(&Connection) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeSummary {
    pub scope: String,
    pub domain: Option<String>,
    pub subdomain: Option<String>,
    pub size: usize,
    pub block_status: BlockStatus,
}

/// Connections of an inspected profile that share one scope.
pub struct ScopeGroup {
    scope: String,
    identifier: Option<ScopeIdentifier>,
    domain: Option<Domain>,
    connections: Vec<Connection>,
    stats: ConnectionStatistics,
    block_status: BlockStatus,
    filter: Option<ConnectionFilter>,
    snapshot: watch::Sender<Vec<Connection>>,
}

impl fmt::Debug for ScopeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeGroup")
            .field("scope", &self.scope)
            .field("connections", &self.connections.len())
            .field("block_status", &self.block_status)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

fn sort_key(conn: &Connection) -> (i64, i64, &str, &str) {
    (conn.started, conn.ended, &conn.scope, &conn.id)
}

impl ScopeGroup {
    pub fn new(scope: impl Into<String>) -> Self {
        let scope = scope.into();
        let identifier = scope.parse::<ScopeIdentifier>().ok();
        let domain = if identifier.is_none() {
            parse_domain(&scope)
        } else {
            None
        };
        Self {
            scope,
            identifier,
            domain,
            connections: Vec::new(),
            stats: ConnectionStatistics::default(),
            block_status: BlockStatus::Off,
            filter: None,
            snapshot: watch::Sender::new(Vec::new()),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn identifier(&self) -> Option<ScopeIdentifier> {
        self.identifier
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_ref().map(|d| d.domain.as_str())
    }

    pub fn subdomain(&self) -> Option<&str> {
        self.domain.as_ref().and_then(|d| d.subdomain.as_deref())
    }

    pub fn stats(&self) -> &ConnectionStatistics {
        &self.stats
    }

    pub fn block_status(&self) -> BlockStatus {
        self.block_status
    }

    /// Non-internal connections.
    pub fn size(&self) -> usize {
        self.connections.len() - self.stats.count_internal
    }

    /// No non-internal connections.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Whether the group holds incoming traffic, judged by its oldest record.
    pub fn incoming(&self) -> bool {
        self.connections.first().is_some_and(|c| c.inbound)
    }

    /// All connections, oldest first.
    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn add(&mut self, connection: Connection) {
        self.stats.update(&connection);
        let at = self
            .connections
            .partition_point(|c| sort_key(c) < sort_key(&connection));
        self.connections.insert(at, connection);
        self.update_block_status();
        self.publish();
    }

    pub fn remove(&mut self, id: &str) -> Option<Connection> {
        let at = self.connections.iter().position(|c| c.id == id)?;
        let removed = self.connections.remove(at);
        self.stats.remove(&removed);
        self.update_block_status();
        self.publish();
        Some(removed)
    }

    pub fn set_filter(&mut self, filter: Option<ConnectionFilter>) {
        self.filter = filter;
        self.publish();
    }

    /// The published list, filter applied.
    pub fn visible(&self) -> Vec<Connection> {
        match &self.filter {
            Some(keep) => self.connections.iter().filter(|c| keep(c)).cloned().collect(),
            None => self.connections.clone(),
        }
    }

    pub fn publish(&self) {
        self.snapshot.send_replace(self.visible());
    }

    pub fn watch(&self) -> watch::Receiver<Vec<Connection>> {
        self.snapshot.subscribe()
    }

    pub fn summary(&self) -> ScopeSummary {
        ScopeSummary {
            scope: self.scope.clone(),
            domain: self.domain().map(str::to_owned),
            subdomain: self.subdomain().map(str::to_owned),
            size: self.size(),
            block_status: self.block_status,
        }
    }

    fn update_block_status(&mut self) {
        let permitted = self.stats.count_accepted;
        let unpermitted = self.size().saturating_sub(permitted);
        self.block_status = BlockStatus::from_counts(permitted, unpermitted);
    }
}

/// Coarse scopes first in their fixed order, then domains alphabetically.
pub fn display_order(a: &ScopeGroup, b: &ScopeGroup) -> Ordering {
    match (&a.domain, &b.domain) {
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.domain.cmp(&y.domain).then_with(|| a.scope.cmp(&b.scope)),
        (None, None) => a
            .identifier
            .cmp(&b.identifier)
            .then_with(|| a.scope.cmp(&b.scope)),
    }
}
