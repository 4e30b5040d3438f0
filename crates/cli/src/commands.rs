#![forbid(unsafe_code)]

use crate::cli::Command;
use crate::error::Error;
use crate::signals::SignalEvent;
use config::{Config, RetryPolicy};
use portapi::{Client, DataReply, Event, LineTransport, Payload, WatchAll};
use serde_json::Value;
use std::io::Write;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracker::{InspectedSummary, ProcessGroupSummary, Tracker, TrackerHandle, TrackerService};

type Signals = flume::Receiver<SignalEvent>;

/// Open a line transport to the configured endpoint.
pub async fn connect(config: &config::Client) -> Result<Client, Error> {
    let endpoint = config.endpoint.as_str();
    let transport = tokio::time::timeout(
        config.connect_timeout,
        LineTransport::connect_tcp(endpoint),
    )
    .await
    .map_err(|_| Error::ConnectTimeout(endpoint.to_owned()))?
    .map_err(|source| Error::Connect {
        endpoint: endpoint.to_owned(),
        source,
    })?;
    info!(endpoint, "connected");
    Ok(Client::new(transport))
}

/// Run one subcommand until it completes or a shutdown signal arrives.
pub async fn run<W: Write>(
    client: &Client,
    command: Command,
    config: &Config,
    signals: &Signals,
    out: &mut W,
) -> Result<(), Error> {
    match command {
        Command::Get { key } => get(client, &key, out).await,
        Command::Query { query: prefix } => query(client, &prefix, out).await,
        Command::Watch { query } => watch(client, &query, config.retry, signals, out).await,
        Command::Profiles { inspect, blocked } => {
            profiles(client, config, inspect.as_deref(), blocked, signals, out).await
        }
        Command::Config => {
            debug!("config needs no connection");
            Ok(())
        }
    }
}

pub async fn get<W: Write>(client: &Client, key: &str, out: &mut W) -> Result<(), Error> {
    let value: Value = client.get(key).await?;
    writeln!(out, "{}", serde_json::to_string_pretty(&value)?)?;
    Ok(())
}

pub async fn query<W: Write>(client: &Client, query: &str, out: &mut W) -> Result<(), Error> {
    let mut results = client.query(query)?;
    let mut count = 0usize;
    while let Some(event) = results.next().await {
        if let Event::Data(reply) = event? {
            write_record(out, &reply)?;
            count += 1;
        }
    }
    debug!(query, count, "query complete");
    Ok(())
}

pub async fn watch<W: Write>(
    client: &Client,
    query: &str,
    policy: RetryPolicy,
    signals: &Signals,
    out: &mut W,
) -> Result<(), Error> {
    let mut records = WatchAll::<Value>::new(client, query, policy)?;
    loop {
        tokio::select! {
            item = records.next() => match item {
                Some(Ok(_)) => {
                    writeln!(out, "--- {} records", records.entries().len())?;
                    for entry in records.entries() {
                        writeln!(out, "{} {}", entry.key, entry.value)?;
                    }
                }
                Some(Err(err)) => return Err(err.into()),
                None => {
                    debug!(query, "watch ended");
                    return Ok(());
                }
            },
            event = signals.recv_async() => {
                if !on_signal(event, client, None, out).await? {
                    return Ok(());
                }
            }
        }
    }
}

pub async fn profiles<W: Write>(
    client: &Client,
    config: &Config,
    inspect: Option<&str>,
    blocked: bool,
    signals: &Signals,
    out: &mut W,
) -> Result<(), Error> {
    let tracker = Tracker::new(client.clone(), config)?;
    let (service, handle) = TrackerService::new(tracker);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(service.run_until(cancel.clone()));

    let result = follow_profiles(client, &handle, inspect, blocked, signals, out).await;

    cancel.cancel();
    if let Err(err) = task.await {
        warn!(%err, "tracker service failed");
    }
    result
}

async fn follow_profiles<W: Write>(
    client: &Client,
    handle: &TrackerHandle,
    inspect: Option<&str>,
    blocked: bool,
    signals: &Signals,
    out: &mut W,
) -> Result<(), Error> {
    loop {
        tokio::select! {
            ready = handle.wait_ready() => {
                ready?;
                break;
            }
            event = signals.recv_async() => {
                if !on_signal(event, client, Some(handle), out).await? {
                    return Ok(());
                }
            }
        }
    }

    if let Some(id) = inspect
        && !handle.inspect(id).await?
    {
        return Err(Error::UnknownProfile(id.to_owned()));
    }

    let mut profiles = handle.profiles();
    let mut inspected = handle.inspected();
    let current = profiles.borrow_and_update().clone();
    write_profiles(out, &current, blocked)?;

    loop {
        tokio::select! {
            changed = profiles.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = profiles.borrow_and_update().clone();
                write_profiles(out, &current, blocked)?;
            }
            changed = inspected.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = inspected.borrow_and_update().clone();
                if let Some(summary) = current {
                    write_inspected(out, &summary)?;
                }
            }
            event = signals.recv_async() => {
                if !on_signal(event, client, Some(handle), out).await? {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Handle a signal event. Returns `false` when the command should stop.
async fn on_signal<W: Write>(
    event: Result<SignalEvent, flume::RecvError>,
    client: &Client,
    tracker: Option<&TrackerHandle>,
    out: &mut W,
) -> Result<bool, Error> {
    match event {
        Ok(SignalEvent::SigUSR1) => match tracker {
            Some(tracker) => {
                let snapshot = tracker.snapshot().await?;
                writeln!(out, "{}", serde_json::to_string_pretty(&snapshot)?)?;
            }
            None => debug!("no tracker state to dump"),
        },
        Ok(SignalEvent::SigUSR2) => write_requests(out, client)?,
        Ok(SignalEvent::Shutdown) => {
            info!("shutting down");
            return Ok(false);
        }
        Err(_) => return Ok(false),
    }
    Ok(true)
}

pub fn write_record<W: Write>(out: &mut W, reply: &DataReply) -> std::io::Result<()> {
    match &reply.data {
        Some(Payload::Json(value)) => writeln!(out, "{} {}", reply.key, value),
        Some(Payload::Raw(raw)) => writeln!(out, "{} {}", reply.key, raw),
        None => writeln!(out, "{}", reply.key),
    }
}

pub fn write_requests<W: Write>(out: &mut W, client: &Client) -> std::io::Result<()> {
    let requests = client.active_requests();
    writeln!(out, "--- {} open requests", requests.len())?;
    for request in requests {
        writeln!(
            out,
            "{:>6} {:<5} cancellable={} last_key={}",
            request.id,
            request.kind.as_str(),
            request.cancellable,
            request.last_key.as_deref().unwrap_or("-"),
        )?;
    }
    Ok(())
}

pub fn write_profiles<W: Write>(
    out: &mut W,
    profiles: &[ProcessGroupSummary],
    blocked: bool,
) -> std::io::Result<()> {
    writeln!(
        out,
        "{:<28} {:<28} {:>6} {:>6} {:>6}  STATUS",
        "PROFILE", "NAME", "TOTAL", "ALLOW", "BLOCK"
    )?;
    for profile in profiles.iter().filter(|p| !blocked || p.unpermitted > 0) {
        writeln!(
            out,
            "{:<28} {:<28} {:>6} {:>6} {:>6}  {}",
            format!("{}/{}", profile.source, profile.id),
            profile.name,
            profile.size,
            profile.permitted,
            profile.unpermitted,
            profile.block_status,
        )?;
    }
    Ok(())
}

pub fn write_inspected<W: Write>(out: &mut W, summary: &InspectedSummary) -> std::io::Result<()> {
    let name = summary.name.as_deref().unwrap_or(&summary.id);
    if summary.loading {
        return writeln!(out, "=== {name} (loading)");
    }
    writeln!(
        out,
        "=== {name}: {} connections, revision {}, layers [{}]",
        summary.size,
        summary.revision,
        summary.layers.join(", "),
    )?;
    for scope in &summary.scopes {
        writeln!(out, "  {:<40} {:>6}  {}", scope.scope, scope.size, scope.block_status)?;
    }
    Ok(())
}
