#![forbid(unsafe_code)]

use crate::domain::{AppProfile, Connection, LayeredProfile};
use crate::process_group::{ConnectionUpdate, ProcessGroup};
use crate::scope_group::{ConnectionFilter, ScopeGroup, ScopeSummary, display_order};
use crate::stats::{ConnectionStatistics, StatisticsSummary};
use config::RetryPolicy;
use portapi::{Client, Watch};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeChange {
    Init,
    Added,
    Deleted,
}

/// Scope list of an inspected profile in display order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeGroupUpdate {
    pub change: ScopeChange,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InspectedSummary {
    pub id: String,
    pub source: String,
    pub name: Option<String>,
    pub loading: bool,
    pub size: usize,
    pub revision: i64,
    pub layers: Vec<String>,
    pub stats: StatisticsSummary,
    pub scopes: Vec<ScopeSummary>,
}

/// Something the helper tasks of an inspection produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InspectEvent {
    /// The initial batch of connections has been applied.
    Loaded,
    /// Profile metadata changed; the owning group should take the new name.
    ProfileChanged { name: String },
    LayersChanged,
    /// Nothing observable changed.
    Idle,
}

type Batch = Vec<(String, Connection)>;

/// Detailed, per-scope view of one process group.
///
/// Follows the group's updates, fetches every connection the group already
/// knew about and watches the profile metadata. Live updates are applied
/// immediately, even while the initial batch is still loading; batch
/// results never override them.
pub struct InspectedProfile {
    id: String,
    source: String,
    updates: flume::Receiver<ConnectionUpdate>,
    connections: HashMap<String, Connection>,
    scopes: HashMap<String, ScopeGroup>,
    stats: ConnectionStatistics,
    loading: bool,
    /// Keys deleted while loading, so a stale batch result cannot revive them.
    deleted_while_loading: HashSet<String>,
    filter: Option<ConnectionFilter>,
    profile: Option<AppProfile>,
    layered: Option<LayeredProfile>,
    scope_updates: watch::Sender<ScopeGroupUpdate>,
    loaded: watch::Sender<bool>,

    client: Client,
    layered_key: String,
    load: Option<JoinHandle<Batch>>,
    profile_watch: Option<Watch<AppProfile>>,
    layers: JoinSet<Result<LayeredProfile, portapi::Error>>,
}

impl std::fmt::Debug for InspectedProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InspectedProfile")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("connections", &self.connections.len())
            .field("scopes", &self.scopes.len())
            .field("loading", &self.loading)
            .finish_non_exhaustive()
    }
}

async fn load_batch(client: Client, keys: Vec<String>) -> Batch {
    let mut gets = JoinSet::new();
    for key in keys {
        let client = client.clone();
        gets.spawn(async move {
            let result = client.get::<Connection>(key.clone()).await;
            (key, result)
        });
    }

    let mut batch = Vec::new();
    while let Some(joined) = gets.join_next().await {
        match joined {
            Ok((key, Ok(connection))) => batch.push((key, connection)),
            Ok((key, Err(err))) => warn!(%key, %err, "failed to load connection"),
            Err(err) => warn!(%err, "connection fetch task failed"),
        }
    }
    batch
}

async fn finished_load(load: &mut Option<JoinHandle<Batch>>) -> Result<Batch, JoinError> {
    let Some(handle) = load.as_mut() else {
        return std::future::pending().await;
    };
    let result = handle.await;
    *load = None;
    result
}

async fn next_profile(
    profile_watch: &mut Option<Watch<AppProfile>>,
) -> Option<Result<AppProfile, portapi::Error>> {
    let Some(stream) = profile_watch.as_mut() else {
        return std::future::pending().await;
    };
    let item = stream.next().await;
    if item.is_none() {
        *profile_watch = None;
    }
    item
}

async fn next_layers<T: 'static>(layers: &mut JoinSet<T>) -> Result<T, JoinError> {
    match layers.join_next().await {
        Some(joined) => joined,
        None => std::future::pending().await,
    }
}

impl InspectedProfile {
    /// Start inspecting `group`. Must be called from within a tokio runtime.
    pub fn new(
        group: &mut ProcessGroup,
        client: &Client,
        keys: &config::Tracker,
        policy: RetryPolicy,
    ) -> Self {
        let updates = group.subscribe();
        let known = group.keys(true);
        debug!(id = group.id(), count = known.len(), "loading connections of inspected profile");
        let load = tokio::spawn(load_batch(client.clone(), known));

        let profile_key = keys.profile_key(group.source(), group.id());
        let profile_watch = match Watch::new(client, profile_key, policy) {
            Ok(watch) => Some(watch),
            Err(err) => {
                warn!(id = group.id(), %err, "cannot watch profile metadata");
                None
            }
        };

        Self {
            id: group.id().to_owned(),
            source: group.source().to_owned(),
            updates,
            connections: HashMap::new(),
            scopes: HashMap::new(),
            stats: ConnectionStatistics::default(),
            loading: true,
            deleted_while_loading: HashSet::new(),
            filter: None,
            profile: None,
            layered: None,
            scope_updates: watch::Sender::new(ScopeGroupUpdate {
                change: ScopeChange::Init,
                scopes: Vec::new(),
            }),
            loaded: watch::Sender::new(false),
            client: client.clone(),
            layered_key: keys.layered_profile_key(group.source(), group.id()),
            load: Some(load),
            profile_watch,
            layers: JoinSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn stats(&self) -> &ConnectionStatistics {
        &self.stats
    }

    pub fn profile(&self) -> Option<&AppProfile> {
        self.profile.as_ref()
    }

    /// Revision of the applied layered profile, -1 while unknown.
    pub fn current_revision(&self) -> i64 {
        self.layered.as_ref().map_or(-1, |l| l.revision_counter)
    }

    pub fn layers(&self) -> &[String] {
        match &self.layered {
            Some(layered) => &layered.layer_ids,
            None => &[],
        }
    }

    /// Non-internal connections.
    pub fn size(&self) -> usize {
        self.connections.len() - self.stats.count_internal
    }

    pub fn connection(&self, key: &str) -> Option<&Connection> {
        self.connections.get(key)
    }

    pub fn scope(&self, scope: &str) -> Option<&ScopeGroup> {
        self.scopes.get(scope)
    }

    /// Scope groups in display order.
    pub fn scope_groups(&self) -> Vec<&ScopeGroup> {
        let mut groups: Vec<_> = self.scopes.values().collect();
        groups.sort_by(|a, b| display_order(a, b));
        groups
    }

    pub fn subscribe_scopes(&self) -> watch::Receiver<ScopeGroupUpdate> {
        self.scope_updates.subscribe()
    }

    /// Flips to `true` once the initial batch has been applied.
    pub fn loaded(&self) -> watch::Receiver<bool> {
        self.loaded.subscribe()
    }

    /// Filter applied to every current and future scope group.
    pub fn set_filter(&mut self, filter: Option<ConnectionFilter>) {
        for group in self.scopes.values_mut() {
            group.set_filter(filter.clone());
        }
        self.filter = filter;
    }

    /// Apply every update the process group queued since the last call.
    pub fn apply_pending(&mut self) -> usize {
        let pending: Vec<_> = self.updates.try_iter().collect();
        let count = pending.len();
        for update in pending {
            match update {
                ConnectionUpdate::Added { key, connection } => {
                    self.add_connection(key, connection, false);
                }
                ConnectionUpdate::Updated { key, connection } => {
                    self.add_connection(key, connection, true);
                }
                ConnectionUpdate::Deleted { key } => self.delete_connection(&key, false),
            }
        }
        count
    }

    /// Wait for one of the helper tasks and apply what it produced.
    ///
    /// Cancel safe. Pends forever once every helper is done.
    pub async fn drive(&mut self) -> InspectEvent {
        tokio::select! {
            loaded = finished_load(&mut self.load) => {
                let batch = loaded.unwrap_or_else(|err| {
                    warn!(id = %self.id, %err, "initial load failed");
                    Vec::new()
                });
                self.complete_load(batch);
                InspectEvent::Loaded
            }
            profile = next_profile(&mut self.profile_watch) => match profile {
                Some(Ok(profile)) => self.apply_profile(profile),
                Some(Err(err)) => {
                    warn!(id = %self.id, %err, "profile watch failed");
                    InspectEvent::Idle
                }
                None => {
                    debug!(id = %self.id, "profile deleted");
                    InspectEvent::Idle
                }
            },
            layered = next_layers(&mut self.layers) => match layered {
                Ok(Ok(layered)) => {
                    self.layered = Some(layered);
                    InspectEvent::LayersChanged
                }
                Ok(Err(err)) => {
                    warn!(id = %self.id, %err, "failed to load layered profile");
                    InspectEvent::Idle
                }
                Err(err) => {
                    debug!(id = %self.id, %err, "layered profile fetch aborted");
                    InspectEvent::Idle
                }
            },
        }
    }

    /// Apply the initial batch. Keys already known from live updates win.
    pub fn complete_load(&mut self, batch: Batch) {
        let deleted = std::mem::take(&mut self.deleted_while_loading);
        for (key, connection) in batch {
            if deleted.contains(&key) {
                continue;
            }
            self.add_connection(key, connection, false);
        }
        self.loading = false;

        let empty: Vec<_> = self
            .scopes
            .iter()
            .filter(|(_, group)| group.is_empty())
            .map(|(scope, _)| scope.clone())
            .collect();
        for scope in &empty {
            self.scopes.remove(scope);
        }
        if !empty.is_empty() {
            self.publish_scopes(ScopeChange::Deleted);
        }
        for group in self.scopes.values() {
            group.publish();
        }

        self.loaded.send_replace(true);
        info!(id = %self.id, connections = self.connections.len(), "inspected profile loaded");
    }

    /// Take new profile metadata and start fetching its layered profile.
    pub fn apply_profile(&mut self, profile: AppProfile) -> InspectEvent {
        let client = self.client.clone();
        let key = self.layered_key.clone();
        self.layers
            .spawn(async move { client.get::<LayeredProfile>(key).await });

        let name = profile.name.clone();
        self.profile = Some(profile);
        InspectEvent::ProfileChanged { name }
    }

    /// Cancel helpers and release everything. Cancel frames for open
    /// streams are queued before this returns.
    pub fn dispose(&mut self) {
        self.profile_watch = None;
        if let Some(load) = self.load.take() {
            load.abort();
        }
        self.layers.abort_all();
        self.connections.clear();
        self.scopes.clear();
        self.stats = ConnectionStatistics::default();
        debug!(id = %self.id, "inspection disposed");
    }

    pub fn summary(&self) -> InspectedSummary {
        InspectedSummary {
            id: self.id.clone(),
            source: self.source.clone(),
            name: self.profile.as_ref().map(|p| p.name.clone()),
            loading: self.loading,
            size: self.size(),
            revision: self.current_revision(),
            layers: self.layers().to_vec(),
            stats: self.stats.summary(),
            scopes: self
                .scope_groups()
                .into_iter()
                .map(ScopeGroup::summary)
                .collect(),
        }
    }

    fn add_connection(&mut self, key: String, mut connection: Connection, update: bool) {
        if update {
            self.delete_connection(&key, true);
        } else if self.connections.contains_key(&key) {
            return;
        }

        if connection.profile_revision_counter < 1 {
            connection.profile_revision_counter = 1;
        }

        self.stats.update(&connection);
        let scope = connection.scope.clone();
        let created = !self.scopes.contains_key(&scope);
        let filter = self.filter.clone();
        let group = self.scopes.entry(scope).or_insert_with_key(|scope| {
            let mut group = ScopeGroup::new(scope.clone());
            group.set_filter(filter);
            group
        });
        group.add(connection.clone());
        self.connections.insert(key, connection);

        if created {
            self.publish_scopes(ScopeChange::Added);
        }
    }

    fn delete_connection(&mut self, key: &str, update: bool) {
        // The pending batch may still carry this key.
        if self.loading && !update {
            self.deleted_while_loading.insert(key.to_owned());
        }
        let Some(connection) = self.connections.remove(key) else {
            return;
        };

        if let Some(group) = self.scopes.get_mut(&connection.scope) {
            group.remove(&connection.id);
            if group.is_empty() && !self.loading {
                self.scopes.remove(&connection.scope);
                self.publish_scopes(ScopeChange::Deleted);
            }
        }
        self.stats.remove(&connection);
    }

    fn publish_scopes(&self, change: ScopeChange) {
        let scopes = self
            .scope_groups()
            .into_iter()
            .map(|group| group.scope().to_owned())
            .collect();
        self.scope_updates
            .send_replace(ScopeGroupUpdate { change, scopes });
    }
}

impl Drop for InspectedProfile {
    fn drop(&mut self) {
        if let Some(load) = self.load.take() {
            load.abort();
        }
    }
}
