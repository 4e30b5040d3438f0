//! Request multiplexer over a single transport.
//!
//! Every request gets a fresh numeric id. Replies are routed back to the
//! [`Subscription`] that owns the id until the request reaches a terminal
//! state, after which the id is forgotten and late replies are dropped.

#![forbid(unsafe_code)]

use crate::error::Error;
use crate::message::{Body, DecodeError, Message, Payload, Reply, Request, RequestKind};
use crate::transport::{FrameReader, FrameWriter, Transport};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Surface the end of the initial replay of `sub`/`qsub` as [`Event::Done`].
    pub forward_done: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Ok,
    Update,
    New,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataReply {
    pub kind: DataKind,
    pub key: String,
    /// Absent for deletions.
    pub data: Option<Payload>,
}

impl DataReply {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
        Ok(self.data.as_ref().ok_or(Error::EmptyReply)?.decode()?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Data(DataReply),
    Done,
}

/// Snapshot of an open request, for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveRequestInfo {
    pub id: String,
    pub kind: RequestKind,
    pub cancellable: bool,
    pub last_key: Option<String>,
    pub last_data: Option<Payload>,
}

type Sink = flume::Sender<Result<Event, Error>>;

struct ActiveRequest {
    kind: RequestKind,
    forward_done: bool,
    sink: Sink,
    last: Option<(String, Option<Payload>)>,
}

enum Step {
    Skip,
    Warn(String),
    Emit(Event),
    Finish(Option<Event>),
    Fail(Error),
}

fn interpret(kind: RequestKind, forward_done: bool, reply: Reply) -> Step {
    let data = |kind, key, data| Event::Data(DataReply { kind, key, data });
    match reply {
        Reply::Error(message) => Step::Fail(Error::Remote(message)),
        Reply::Warning(message) => Step::Warn(message),
        Reply::Success => Step::Finish(None),
        Reply::Done if kind.is_subscription() && forward_done => Step::Emit(Event::Done),
        Reply::Done if kind.is_subscription() => Step::Skip,
        Reply::Done => Step::Finish(None),
        Reply::Ok { key, data: payload } if kind == RequestKind::Get => {
            Step::Finish(Some(data(DataKind::Ok, key, Some(payload))))
        }
        Reply::Ok { key, data: payload } => Step::Emit(data(DataKind::Ok, key, Some(payload))),
        Reply::Update { key, data: payload } => {
            Step::Emit(data(DataKind::Update, key, Some(payload)))
        }
        Reply::New { key, data: payload } => Step::Emit(data(DataKind::New, key, Some(payload))),
        Reply::Delete { key } => Step::Emit(data(DataKind::Delete, key, None)),
    }
}

fn validate(request: &Request) -> Result<(), Error> {
    fn check(field: &str, value: &str, allow_empty: bool) -> Result<(), Error> {
        if value.is_empty() && !allow_empty {
            return Err(Error::InvalidRequest(format!("{field} must not be empty")));
        }
        if value.contains(['|', '\n', '\r']) {
            return Err(Error::InvalidRequest(format!(
                "{field} {value:?} contains a reserved character"
            )));
        }
        Ok(())
    }

    match request {
        Request::Get { key } | Request::Delete { key } => check("key", key, false),
        Request::Query { query }
        | Request::Subscribe { query }
        | Request::QuerySubscribe { query } => check("query", query, true),
        Request::Create { key, data }
        | Request::Update { key, data }
        | Request::Insert { key, data } => {
            check("key", key, false)?;
            match data {
                Payload::Raw(raw) if raw.starts_with('J') => Err(Error::InvalidRequest(
                    "raw payload would be read back as JSON".into(),
                )),
                Payload::Raw(raw) if raw.contains(['\n', '\r']) => Err(Error::InvalidRequest(
                    "raw payload contains a line break".into(),
                )),
                _ => Ok(()),
            }
        }
        Request::Cancel => Err(Error::InvalidRequest(
            "cancel is sent by dropping the subscription".into(),
        )),
    }
}

struct Shared {
    next_id: AtomicU64,
    requests: Mutex<HashMap<String, ActiveRequest>>,
    outbound: flume::Sender<String>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Shared {
    fn dispatch(&self, frame: &str) {
        let Message { id, body } = match frame.parse::<Message>() {
            Ok(message) => message,
            Err(DecodeError::UnknownType { id, kind }) => {
                warn!(%id, %kind, "unknown reply type");
                self.fail(&id, Error::Protocol(format!("unknown reply type {kind:?}")));
                return;
            }
            Err(err) => {
                warn!(%err, "dropping undecodable frame");
                return;
            }
        };
        let reply = match body {
            Body::Reply(reply) => reply,
            Body::Request(request) => {
                warn!(%id, kind = %request.kind(), "backend sent a request frame");
                return;
            }
        };

        let mut requests = self.requests.lock();
        let Some(active) = requests.get_mut(&id) else {
            trace!(%id, kind = reply.as_str(), "reply for unknown request");
            return;
        };

        match interpret(active.kind, active.forward_done, reply) {
            Step::Skip => {}
            Step::Warn(message) => warn!(%id, %message, "backend warning"),
            Step::Emit(event) => {
                active.remember(&event);
                if active.sink.send(Ok(event)).is_err() {
                    requests.remove(&id);
                }
            }
            Step::Finish(event) => {
                if let Some(active) = requests.remove(&id)
                    && let Some(event) = event
                {
                    let _ = active.sink.send(Ok(event));
                }
                trace!(%id, "request finished");
            }
            Step::Fail(err) => {
                if let Some(active) = requests.remove(&id) {
                    let _ = active.sink.send(Err(err));
                }
            }
        }
    }

    fn fail(&self, id: &str, err: Error) {
        if let Some(active) = self.requests.lock().remove(id) {
            let _ = active.sink.send(Err(err));
        }
    }

    /// Forget `id`, telling the backend when the request is still streaming.
    fn detach(&self, id: &str) {
        let removed = self.requests.lock().remove(id);
        if let Some(active) = removed
            && active.kind.is_cancellable()
        {
            let frame = Message::request(id, Request::Cancel).to_string();
            if self.outbound.send(frame).is_err() {
                debug!(id, "transport gone before cancel could be sent");
            } else {
                debug!(id, kind = %active.kind, "request cancelled");
            }
        }
    }

    /// End every open request without an error.
    fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        let open: Vec<_> = self.requests.lock().drain().collect();
        if !open.is_empty() {
            debug!(count = open.len(), "ending open requests after transport close");
        }
    }
}

impl ActiveRequest {
    fn remember(&mut self, event: &Event) {
        if let Event::Data(reply) = event {
            self.last = Some((reply.key.clone(), reply.data.clone()));
        }
    }
}

/// Handle to the multiplexer. Cheap to clone; all clones share the transport.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("closed", &self.is_closed())
            .field("active", &self.shared.requests.lock().len())
            .finish()
    }
}

impl Client {
    /// Start the reader and writer tasks for `transport`. Must be called
    /// from within a tokio runtime.
    pub fn new(transport: impl Transport) -> Self {
        let (writer, reader) = transport.split();
        let (outbound, frames) = flume::unbounded();
        let shutdown = CancellationToken::new();
        let shared = Arc::new(Shared {
            next_id: AtomicU64::new(1),
            requests: Mutex::new(HashMap::new()),
            outbound,
            closed: AtomicBool::new(false),
            shutdown: shutdown.clone(),
        });

        tokio::spawn(write_loop(frames, writer, shutdown.clone()));
        tokio::spawn(read_loop(Arc::downgrade(&shared), reader, shutdown));

        Self { shared }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stop both tasks. Open requests end without an error.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.shutdown.cancel();
    }

    /// Issue `request` and return the stream of its replies.
    pub fn request(
        &self,
        request: Request,
        options: RequestOptions,
    ) -> Result<Subscription, Error> {
        validate(&request)?;
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let kind = request.kind();
        let (sink, rx) = flume::unbounded();
        let frame = Message::request(id.clone(), request).to_string();

        // Registered before the frame leaves so a fast reply is never missed.
        self.shared.requests.lock().insert(
            id.clone(),
            ActiveRequest {
                kind,
                forward_done: options.forward_done,
                sink,
                last: None,
            },
        );
        if self.shared.outbound.send(frame).is_err() {
            self.shared.requests.lock().remove(&id);
            return Err(Error::Closed);
        }
        debug!(%id, %kind, "request sent");

        Ok(Subscription {
            id,
            kind,
            rx,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Fetch and decode a single record.
    pub async fn get<T: DeserializeOwned>(&self, key: impl Into<String>) -> Result<T, Error> {
        let mut sub = self.request(Request::Get { key: key.into() }, RequestOptions::default())?;
        match sub.next().await {
            Some(Ok(Event::Data(reply))) => reply.decode(),
            Some(Ok(Event::Done)) | None => Err(Error::EmptyReply),
            Some(Err(err)) => Err(err),
        }
    }

    pub fn query(&self, query: impl Into<String>) -> Result<Subscription, Error> {
        self.request(
            Request::Query {
                query: query.into(),
            },
            RequestOptions::default(),
        )
    }

    pub fn sub(
        &self,
        query: impl Into<String>,
        options: RequestOptions,
    ) -> Result<Subscription, Error> {
        self.request(
            Request::Subscribe {
                query: query.into(),
            },
            options,
        )
    }

    pub fn qsub(
        &self,
        query: impl Into<String>,
        options: RequestOptions,
    ) -> Result<Subscription, Error> {
        self.request(
            Request::QuerySubscribe {
                query: query.into(),
            },
            options,
        )
    }

    pub async fn create<T: Serialize + ?Sized>(
        &self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), Error> {
        let data = Payload::json(value)?;
        self.mutate(Request::Create {
            key: key.into(),
            data,
        })
        .await
    }

    pub async fn update<T: Serialize + ?Sized>(
        &self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), Error> {
        let data = Payload::json(value)?;
        self.mutate(Request::Update {
            key: key.into(),
            data,
        })
        .await
    }

    pub async fn insert<T: Serialize + ?Sized>(
        &self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), Error> {
        let data = Payload::json(value)?;
        self.mutate(Request::Insert {
            key: key.into(),
            data,
        })
        .await
    }

    pub async fn delete(&self, key: impl Into<String>) -> Result<(), Error> {
        self.mutate(Request::Delete { key: key.into() }).await
    }

    async fn mutate(&self, request: Request) -> Result<(), Error> {
        let mut sub = self.request(request, RequestOptions::default())?;
        while let Some(item) = sub.next().await {
            item?;
        }
        Ok(())
    }

    /// Open requests ordered by id.
    pub fn active_requests(&self) -> Vec<ActiveRequestInfo> {
        let mut open: Vec<_> = self
            .shared
            .requests
            .lock()
            .iter()
            .map(|(id, active)| ActiveRequestInfo {
                id: id.clone(),
                kind: active.kind,
                cancellable: active.kind.is_cancellable(),
                last_key: active.last.as_ref().map(|(key, _)| key.clone()),
                last_data: active.last.as_ref().and_then(|(_, data)| data.clone()),
            })
            .collect();
        open.sort_by_key(|info| info.id.parse::<u64>().unwrap_or(u64::MAX));
        open
    }
}

async fn write_loop(
    frames: flume::Receiver<String>,
    mut writer: Box<dyn FrameWriter>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = frames.recv_async() => frame,
        };
        let Ok(frame) = frame else { break };
        trace!(%frame, "sending");
        if let Err(err) = writer.send(frame).await {
            warn!(%err, "transport send failed");
            shutdown.cancel();
            break;
        }
    }

    // Flush what was queued before shutdown, cancel frames included.
    while let Ok(frame) = frames.try_recv() {
        if writer.send(frame).await.is_err() {
            break;
        }
    }
    if let Err(err) = writer.close().await {
        debug!(%err, "closing transport failed");
    }
}

async fn read_loop(
    shared: Weak<Shared>,
    mut reader: Box<dyn FrameReader>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = reader.recv() => frame,
        };
        let Some(shared) = shared.upgrade() else { break };
        match frame {
            Some(Ok(frame)) => {
                trace!(%frame, "received");
                shared.dispatch(&frame);
            }
            Some(Err(err)) => {
                warn!(%err, "transport receive failed");
                break;
            }
            None => {
                debug!("transport closed by peer");
                break;
            }
        }
    }

    if let Some(shared) = shared.upgrade() {
        shared.close_all();
    }
    shutdown.cancel();
}

/// Replies of one request. Dropping it cancels the request.
pub struct Subscription {
    id: String,
    kind: RequestKind,
    rx: flume::Receiver<Result<Event, Error>>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Next reply. `None` once the request completed, failed or was closed.
    ///
    /// Cancel safe: dropping the future never loses a reply.
    pub async fn next(&mut self) -> Option<Result<Event, Error>> {
        self.rx.recv_async().await.ok()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            id: self.id.clone(),
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.detach(&self.id);
    }
}

/// Cancels a request from outside the task that consumes it.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    id: String,
    shared: Weak<Shared>,
}

impl CancelHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Send `cancel` if the request is still open. The stream ends
    /// without further items.
    pub fn cancel(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.detach(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn done_semantics_follow_request_kind() {
        assert!(matches!(
            interpret(RequestKind::Query, false, Reply::Done),
            Step::Finish(None)
        ));
        assert!(matches!(
            interpret(RequestKind::QuerySubscribe, false, Reply::Done),
            Step::Skip
        ));
        assert!(matches!(
            interpret(RequestKind::Subscribe, true, Reply::Done),
            Step::Emit(Event::Done)
        ));
        assert!(matches!(
            interpret(RequestKind::Create, false, Reply::Success),
            Step::Finish(None)
        ));
    }

    #[test]
    fn get_finishes_on_first_ok() {
        let reply = Reply::Ok {
            key: "a".into(),
            data: Payload::Raw("x".into()),
        };
        assert!(matches!(
            interpret(RequestKind::Get, false, reply.clone()),
            Step::Finish(Some(Event::Data(_)))
        ));
        assert!(matches!(
            interpret(RequestKind::Query, false, reply),
            Step::Emit(Event::Data(_))
        ));
    }

    #[test]
    fn errors_fail_every_kind() {
        for kind in [
            RequestKind::Get,
            RequestKind::Query,
            RequestKind::Subscribe,
            RequestKind::QuerySubscribe,
            RequestKind::Delete,
        ] {
            assert!(matches!(
                interpret(kind, true, Reply::Error("nope".into())),
                Step::Fail(Error::Remote(message)) if message == "nope"
            ));
        }
    }

    #[test]
    fn validation_rejects_reserved_characters() {
        let bad = [
            Request::Get { key: String::new() },
            Request::Get {
                key: "a|b".into(),
            },
            Request::Subscribe {
                query: "net\nwork".into(),
            },
            Request::Create {
                key: "k".into(),
                data: Payload::Raw("Jlooks like json".into()),
            },
            Request::Cancel,
        ];
        for request in bad {
            assert!(matches!(validate(&request), Err(Error::InvalidRequest(_))), "{request:?}");
        }
        assert!(
            validate(&Request::QuerySubscribe {
                query: String::new()
            })
            .is_ok()
        );
    }
}
