#![forbid(unsafe_code)]

use crate::domain::{Connection, is_process_record};
use crate::error::Error;
use crate::inspected::{InspectEvent, InspectedProfile, InspectedSummary};
use crate::process_group::{ProcessGroup, ProcessGroupSummary};
use crate::scope_group::ConnectionFilter;
use config::{Config, RetryPolicy};
use portapi::{Client, DataKind, DataReply, Event, Request, RequestOptions, RetryingSubscription};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Everything the tracker knows, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackerSnapshot {
    pub ready: bool,
    pub generation: u64,
    pub tracked_connections: usize,
    pub profiles: Vec<ProcessGroupSummary>,
    pub inspected: Option<InspectedSummary>,
}

/// Live aggregation of every connection, grouped by owning profile.
pub struct Tracker {
    client: Client,
    keys: config::Tracker,
    policy: RetryPolicy,
    stream: RetryingSubscription,
    stream_ended: bool,
    generation: u64,
    groups: HashMap<String, ProcessGroup>,
    owners: HashMap<String, String>,
    inspected: Option<InspectedProfile>,
    ready: bool,
    profiles_tx: watch::Sender<Vec<ProcessGroupSummary>>,
    ready_tx: watch::Sender<bool>,
    inspected_tx: watch::Sender<Option<InspectedSummary>>,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("ready", &self.ready)
            .field("generation", &self.generation)
            .field("groups", &self.groups.len())
            .field("inspected", &self.inspected.as_ref().map(InspectedProfile::id))
            .finish_non_exhaustive()
    }
}

async fn drive(inspected: &mut Option<InspectedProfile>) -> InspectEvent {
    match inspected {
        Some(inspected) => inspected.drive().await,
        None => std::future::pending().await,
    }
}

impl Tracker {
    /// Subscribe to the live connection stream.
    pub fn new(client: Client, config: &Config) -> Result<Self, Error> {
        let stream = RetryingSubscription::new(
            client.clone(),
            Request::QuerySubscribe {
                query: config.tracker.network_query.clone(),
            },
            RequestOptions { forward_done: true },
            config.retry,
        )?;
        Ok(Self::with_stream(client, config, stream))
    }

    /// Use an already configured stream, e.g. one with a custom clock.
    pub fn with_stream(client: Client, config: &Config, stream: RetryingSubscription) -> Self {
        Self {
            client,
            keys: config.tracker.clone(),
            policy: config.retry,
            generation: stream.generation(),
            stream,
            stream_ended: false,
            groups: HashMap::new(),
            owners: HashMap::new(),
            inspected: None,
            ready: false,
            profiles_tx: watch::Sender::new(Vec::new()),
            ready_tx: watch::Sender::new(false),
            inspected_tx: watch::Sender::new(None),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn group(&self, id: &str) -> Option<&ProcessGroup> {
        self.groups.get(id)
    }

    /// Groups ordered by id.
    pub fn groups(&self) -> Vec<&ProcessGroup> {
        let mut groups: Vec<_> = self.groups.values().collect();
        groups.sort_by(|a, b| a.id().cmp(b.id()));
        groups
    }

    pub fn inspected(&self) -> Option<&InspectedProfile> {
        self.inspected.as_ref()
    }

    pub fn inspected_mut(&mut self) -> Option<&mut InspectedProfile> {
        self.inspected.as_mut()
    }

    pub fn subscribe_profiles(&self) -> watch::Receiver<Vec<ProcessGroupSummary>> {
        self.profiles_tx.subscribe()
    }

    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    pub fn subscribe_inspected(&self) -> watch::Receiver<Option<InspectedSummary>> {
        self.inspected_tx.subscribe()
    }

    /// Wait for the next input and apply it. Returns `false` once the live
    /// stream ended for good; the inspection keeps being driven afterwards.
    ///
    /// Cancel safe.
    pub async fn step(&mut self) -> bool {
        tokio::select! {
            item = self.stream.next(), if !self.stream_ended => match item {
                Some(Ok(event)) => {
                    if self.stream.generation() != self.generation {
                        info!(
                            generation = self.stream.generation(),
                            "live stream restarted, resetting"
                        );
                        self.generation = self.stream.generation();
                        self.reset();
                    }
                    self.process(event);
                }
                Some(Err(err)) => warn!(%err, "live connection stream failed"),
                None => {
                    info!("live connection stream ended");
                    self.stream_ended = true;
                    self.set_ready(false);
                }
            },
            event = drive(&mut self.inspected) => self.on_inspect_event(event),
        }
        !self.stream_ended
    }

    /// Apply one event of the live stream.
    pub fn process(&mut self, event: Event) {
        match event {
            Event::Done => {
                if !self.ready {
                    info!(groups = self.groups.len(), "initial connection replay complete");
                }
                self.set_ready(true);
            }
            Event::Data(reply) => self.route(reply),
        }

        if let Some(inspected) = self.inspected.as_mut() {
            inspected.apply_pending();
        }
        self.publish();
    }

    /// Start inspecting group `id`, replacing any current inspection.
    /// Returns `false` and clears the inspection if there is no such group.
    pub fn inspect(&mut self, id: &str) -> bool {
        if self.inspected.as_ref().is_some_and(|p| p.id() == id) {
            return true;
        }
        self.clear_inspection();

        let Some(group) = self.groups.get_mut(id) else {
            debug!(id, "cannot inspect unknown profile");
            return false;
        };
        info!(id, name = group.name(), "inspecting profile");
        self.inspected = Some(InspectedProfile::new(
            group,
            &self.client,
            &self.keys,
            self.policy,
        ));
        self.publish();
        true
    }

    pub fn clear_inspection(&mut self) {
        if let Some(mut inspected) = self.inspected.take() {
            inspected.dispose();
            self.inspected_tx.send_replace(None);
        }
    }

    /// Filter the connection lists of the current inspection.
    pub fn set_filter(&mut self, filter: Option<ConnectionFilter>) -> bool {
        match self.inspected.as_mut() {
            Some(inspected) => {
                inspected.set_filter(filter);
                true
            }
            None => false,
        }
    }

    /// Published connections of one scope of the current inspection.
    pub fn scope_connections(&self, scope: &str) -> Option<Vec<Connection>> {
        self.inspected.as_ref()?.scope(scope).map(|group| group.visible())
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            ready: self.ready,
            generation: self.generation,
            tracked_connections: self.owners.len(),
            profiles: self.summaries(),
            inspected: self.inspected.as_ref().map(InspectedProfile::summary),
        }
    }

    /// Drop all state and cancel the inspection and the live stream.
    pub fn dispose(mut self) {
        self.reset();
        debug!("tracker disposed");
    }

    fn route(&mut self, reply: DataReply) {
        let key = reply.key;
        if reply.kind == DataKind::Delete {
            self.remove(&key);
            return;
        }

        let Some(payload) = reply.data else {
            debug!(%key, "record without data");
            return;
        };
        if is_process_record(&payload) {
            trace!(%key, "skipping process record");
            return;
        }
        let connection: Connection = match payload.decode() {
            Ok(connection) => connection,
            Err(err) => {
                warn!(%key, %err, "dropping undecodable connection record");
                return;
            }
        };
        let Some(context) = connection
            .process_context
            .as_ref()
            .filter(|ctx| !ctx.profile.is_empty())
        else {
            warn!(%key, "connection without owning profile");
            return;
        };
        let profile_id = context.profile.clone();

        let previous = self.owners.get(&key).cloned();
        if let Some(previous) = previous
            && previous != profile_id
        {
            debug!(%key, from = %previous, to = %profile_id, "connection moved to another profile");
            self.forget_in(&previous, &key);
        }

        let group = self.groups.entry(profile_id.clone()).or_insert_with(|| {
            debug!(id = %profile_id, name = %context.profile_name, "new process group");
            ProcessGroup::new(
                profile_id.clone(),
                context.profile_name.clone(),
                context.source.clone(),
            )
        });
        if group.name() != context.profile_name {
            debug!(
                id = %profile_id,
                from = group.name(),
                to = %context.profile_name,
                "profile renamed"
            );
            group.set_name(context.profile_name.clone());
        }

        let is_update = reply.kind == DataKind::Update || group.contains(&key);
        group.track(&key, &connection, is_update);
        self.owners.insert(key, profile_id);
    }

    fn remove(&mut self, key: &str) {
        let Some(profile_id) = self.owners.remove(key) else {
            trace!(key, "delete for untracked connection");
            return;
        };
        self.forget_in(&profile_id, key);
    }

    fn forget_in(&mut self, profile_id: &str, key: &str) {
        let Some(group) = self.groups.get_mut(profile_id) else {
            return;
        };
        group.forget(key);
        if !group.is_empty() {
            return;
        }

        if self.inspected.as_ref().is_some_and(|p| p.id() == profile_id) {
            debug!(id = profile_id, "inspected profile went away");
            self.clear_inspection();
        }
        if let Some(mut group) = self.groups.remove(profile_id) {
            for internal in group.keys(true) {
                self.owners.remove(&internal);
            }
            group.dispose();
            debug!(id = profile_id, "process group disposed");
        }
    }

    fn on_inspect_event(&mut self, event: InspectEvent) {
        match event {
            InspectEvent::ProfileChanged { name } => {
                if let Some(inspected) = &self.inspected
                    && let Some(group) = self.groups.get_mut(inspected.id())
                    && group.name() != name
                {
                    debug!(id = group.id(), from = group.name(), to = %name, "profile renamed");
                    group.set_name(name);
                }
            }
            InspectEvent::Loaded | InspectEvent::LayersChanged => {}
            InspectEvent::Idle => return,
        }
        self.publish();
    }

    fn reset(&mut self) {
        self.clear_inspection();
        self.set_ready(false);
        for group in self.groups.values_mut() {
            group.dispose();
        }
        self.groups.clear();
        self.owners.clear();
        self.publish();
    }

    fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
        self.ready_tx.send_if_modified(|current| {
            let changed = *current != ready;
            *current = ready;
            changed
        });
    }

    fn summaries(&self) -> Vec<ProcessGroupSummary> {
        self.groups().into_iter().map(ProcessGroup::summary).collect()
    }

    fn publish(&self) {
        let profiles = self.summaries();
        self.profiles_tx.send_if_modified(|current| {
            let changed = *current != profiles;
            if changed {
                *current = profiles;
            }
            changed
        });

        let inspected = self.inspected.as_ref().map(InspectedProfile::summary);
        self.inspected_tx.send_if_modified(|current| {
            let changed = *current != inspected;
            if changed {
                *current = inspected;
            }
            changed
        });
    }
}

enum Command {
    Inspect(String, oneshot::Sender<bool>),
    ClearInspection,
    SetFilter(Option<ConnectionFilter>, oneshot::Sender<bool>),
    ScopeConnections(String, oneshot::Sender<Option<Vec<Connection>>>),
    Snapshot(oneshot::Sender<TrackerSnapshot>),
    Shutdown,
}

/// Runs a [`Tracker`] on its own task and serves [`TrackerHandle`] requests.
pub struct TrackerService {
    tracker: Tracker,
    commands: flume::Receiver<Command>,
}

impl TrackerService {
    pub fn new(tracker: Tracker) -> (Self, TrackerHandle) {
        let (tx, commands) = flume::unbounded();
        let handle = TrackerHandle {
            commands: tx,
            profiles: tracker.subscribe_profiles(),
            ready: tracker.subscribe_ready(),
            inspected: tracker.subscribe_inspected(),
        };
        (Self { tracker, commands }, handle)
    }

    /// Serve until `cancel` fires or every handle is gone.
    pub async fn run_until(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("tracker shutdown requested");
                    break;
                }
                command = self.commands.recv_async() => match command {
                    Ok(Command::Shutdown) => {
                        info!("tracker shutdown requested by handle");
                        break;
                    }
                    Ok(command) => self.handle_command(command),
                    Err(_) => {
                        debug!("all tracker handles dropped");
                        break;
                    }
                },
                _ = self.tracker.step() => {}
            }
        }
        self.tracker.dispose();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Inspect(id, reply) => {
                let _ = reply.send(self.tracker.inspect(&id));
            }
            Command::ClearInspection => {
                self.tracker.clear_inspection();
            }
            Command::SetFilter(filter, reply) => {
                let _ = reply.send(self.tracker.set_filter(filter));
            }
            Command::ScopeConnections(scope, reply) => {
                let _ = reply.send(self.tracker.scope_connections(&scope));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.tracker.snapshot());
            }
            Command::Shutdown => {}
        }
    }
}

/// Cloneable front end of a running [`TrackerService`].
#[derive(Clone)]
pub struct TrackerHandle {
    commands: flume::Sender<Command>,
    profiles: watch::Receiver<Vec<ProcessGroupSummary>>,
    ready: watch::Receiver<bool>,
    inspected: watch::Receiver<Option<InspectedSummary>>,
}

impl std::fmt::Debug for TrackerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerHandle")
            .field("ready", &*self.ready.borrow())
            .finish_non_exhaustive()
    }
}

impl TrackerHandle {
    pub fn profiles(&self) -> watch::Receiver<Vec<ProcessGroupSummary>> {
        self.profiles.clone()
    }

    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready.clone()
    }

    pub fn inspected(&self) -> watch::Receiver<Option<InspectedSummary>> {
        self.inspected.clone()
    }

    /// Resolve once the initial replay of the live stream completed.
    pub async fn wait_ready(&self) -> Result<(), Error> {
        let mut ready = self.ready.clone();
        ready
            .wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| Error::Stopped)
    }

    pub async fn inspect(&self, id: impl Into<String>) -> Result<bool, Error> {
        self.call(|reply| Command::Inspect(id.into(), reply)).await
    }

    pub fn clear_inspection(&self) -> Result<(), Error> {
        self.commands
            .send(Command::ClearInspection)
            .map_err(|_| Error::Stopped)
    }

    pub async fn set_filter(&self, filter: Option<ConnectionFilter>) -> Result<bool, Error> {
        self.call(|reply| Command::SetFilter(filter, reply)).await
    }

    pub async fn scope_connections(
        &self,
        scope: impl Into<String>,
    ) -> Result<Option<Vec<Connection>>, Error> {
        self.call(|reply| Command::ScopeConnections(scope.into(), reply))
            .await
    }

    pub async fn snapshot(&self) -> Result<TrackerSnapshot, Error> {
        self.call(Command::Snapshot).await
    }

    /// Stop the service. Commands queued before this one are still served.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.commands
            .send(Command::Shutdown)
            .map_err(|_| Error::Stopped)
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, Error> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send_async(command(tx))
            .await
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)
    }
}
