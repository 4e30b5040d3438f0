#![forbid(unsafe_code)]

use crate::client::{Client, DataKind, DataReply, Event, RequestOptions};
use crate::clock::Clock;
use crate::error::Error;
use crate::message::{Payload, Request};
use crate::retry::RetryingSubscription;
use config::RetryPolicy;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct Entry<T> {
    pub key: String,
    pub value: T,
    /// Number of truthy top-level fields in the raw record.
    pub informative: usize,
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn informative(payload: &Payload) -> usize {
    match payload {
        Payload::Json(Value::Object(fields)) => fields.values().filter(|v| truthy(v)).count(),
        Payload::Json(value) => usize::from(truthy(value)),
        Payload::Raw(raw) => usize::from(!raw.is_empty()),
    }
}

/// Live list of every record under a query prefix.
///
/// Nothing is yielded until the initial replay completed. Afterwards every
/// change yields the full list, in arrival order.
pub struct WatchAll<T> {
    stream: RetryingSubscription,
    entries: Vec<Entry<T>>,
    replayed: bool,
    generation: u64,
}

impl<T: DeserializeOwned + Clone> WatchAll<T> {
    pub fn new(
        client: &Client,
        query: impl Into<String>,
        policy: RetryPolicy,
    ) -> Result<Self, Error> {
        let stream = RetryingSubscription::new(
            client.clone(),
            Request::QuerySubscribe {
                query: query.into(),
            },
            RequestOptions { forward_done: true },
            policy,
        )?;
        Ok(Self {
            stream,
            entries: Vec::new(),
            replayed: false,
            generation: 0,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.stream = self.stream.with_clock(clock);
        self
    }

    pub fn entries(&self) -> &[Entry<T>] {
        &self.entries
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.entries.iter().map(|entry| entry.value.clone()).collect()
    }

    /// Next full list. Cancel safe.
    pub async fn next(&mut self) -> Option<Result<Vec<T>, Error>> {
        loop {
            let item = self.stream.next().await?;
            if self.stream.generation() != self.generation {
                debug!(
                    generation = self.stream.generation(),
                    "resubscribed, replaying from scratch"
                );
                self.generation = self.stream.generation();
                self.entries.clear();
                self.replayed = false;
            }

            match item {
                Err(err) => return Some(Err(err)),
                Ok(Event::Done) => {
                    self.replayed = true;
                    return Some(Ok(self.snapshot()));
                }
                Ok(Event::Data(reply)) => {
                    if let Err(err) = self.apply(reply) {
                        warn!(%err, "skipping undecodable record");
                        continue;
                    }
                    if self.replayed {
                        return Some(Ok(self.snapshot()));
                    }
                }
            }
        }
    }

    fn apply(&mut self, reply: DataReply) -> Result<(), Error> {
        let position = self.entries.iter().position(|entry| entry.key == reply.key);

        if reply.kind == DataKind::Delete {
            if let Some(index) = position {
                self.entries.remove(index);
            }
            return Ok(());
        }

        let Some(payload) = reply.data else {
            return Err(Error::EmptyReply);
        };
        let incoming = Entry {
            value: payload.decode()?,
            informative: informative(&payload),
            key: reply.key,
        };

        match (reply.kind, position) {
            (_, None) if !self.replayed => self.entries.push(incoming),
            (DataKind::Ok | DataKind::New, None) => self.entries.push(incoming),
            (DataKind::Update | DataKind::Delete, None) => {}
            (DataKind::New, Some(index)) if self.replayed => {
                if incoming.informative > self.entries[index].informative {
                    self.entries[index] = incoming;
                }
            }
            (_, Some(index)) => self.entries[index] = incoming,
        }
        Ok(())
    }
}

/// Watch a single record. Ends when the record is deleted.
pub struct Watch<T> {
    key: String,
    stream: RetryingSubscription,
    ended: bool,
    _value: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Watch<T> {
    pub fn new(
        client: &Client,
        key: impl Into<String>,
        policy: RetryPolicy,
    ) -> Result<Self, Error> {
        let key = key.into();
        let stream = RetryingSubscription::new(
            client.clone(),
            Request::QuerySubscribe { query: key.clone() },
            RequestOptions::default(),
            policy,
        )?;
        Ok(Self {
            key,
            stream,
            ended: false,
            _value: PhantomData,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.stream = self.stream.with_clock(clock);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn request_id(&self) -> Option<&str> {
        self.stream.request_id()
    }

    /// Next version of the record. Cancel safe.
    pub async fn next(&mut self) -> Option<Result<T, Error>> {
        while !self.ended {
            match self.stream.next().await? {
                Err(err) => return Some(Err(err)),
                Ok(Event::Done) => {}
                // The query is a prefix; siblings sharing it are not ours.
                Ok(Event::Data(reply)) if reply.key != self.key => {}
                Ok(Event::Data(reply)) if reply.kind == DataKind::Delete => {
                    debug!(key = %self.key, "watched record deleted");
                    self.ended = true;
                }
                Ok(Event::Data(reply)) => return Some(reply.decode()),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counts_truthy_fields() {
        assert_eq!(informative(&Payload::Json(json!({"x": 1, "y": null}))), 1);
        assert_eq!(
            informative(&Payload::Json(
                json!({"a": "", "b": 0, "c": false, "d": [], "e": "x"})
            )),
            2
        );
        assert_eq!(informative(&Payload::Raw(String::new())), 0);
    }
}
