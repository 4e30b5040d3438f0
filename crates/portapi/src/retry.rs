#![forbid(unsafe_code)]

use crate::client::{Client, DataKind, Event, RequestOptions, Subscription};
use crate::clock::{Clock, SystemClock};
use crate::error::Error;
use crate::message::Request;
use config::RetryPolicy;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

type Backoff = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A `sub`/`qsub` stream that resubscribes after failure or completion.
///
/// Each resubscription bumps [`generation`](Self::generation); consumers
/// that aggregate replies use it to notice that a fresh replay started.
pub struct RetryingSubscription {
    client: Client,
    request: Request,
    options: RequestOptions,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    /// Pending delay before the next resubscription, kept across polls.
    backoff: Option<Backoff>,
    current: Option<Subscription>,
    retries: u32,
    generation: u64,
    exhausted: bool,
}

impl std::fmt::Debug for RetryingSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingSubscription")
            .field("request", &self.request)
            .field("retries", &self.retries)
            .field("generation", &self.generation)
            .field("exhausted", &self.exhausted)
            .field("backing_off", &self.backoff.is_some())
            .finish_non_exhaustive()
    }
}

impl RetryingSubscription {
    pub fn new(
        client: Client,
        request: Request,
        options: RequestOptions,
        policy: RetryPolicy,
    ) -> Result<Self, Error> {
        if !request.kind().is_subscription() {
            return Err(Error::NotRetryable(request.kind()));
        }
        let current = client.request(request.clone(), options)?;
        Ok(Self {
            client,
            request,
            options,
            policy,
            clock: Arc::new(SystemClock),
            backoff: None,
            current: Some(current),
            retries: 0,
            generation: 0,
            exhausted: false,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Number of resubscriptions issued so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Id of the request currently carrying the stream.
    pub fn request_id(&self) -> Option<&str> {
        self.current.as_ref().map(Subscription::id)
    }

    /// Next event across resubscriptions. An error is only yielded once the
    /// policy gives up, and ends the stream.
    ///
    /// Cancel safe: an interrupted delay resumes where it left off.
    pub async fn next(&mut self) -> Option<Result<Event, Error>> {
        loop {
            let Some(current) = self.current.as_mut() else {
                if self.exhausted {
                    return None;
                }
                let clock = &self.clock;
                let delay = self.policy.delay;
                let backoff = self.backoff.get_or_insert_with(|| {
                    let clock = Arc::clone(clock);
                    let sleep: Backoff = Box::pin(async move { clock.sleep(delay).await });
                    sleep
                });
                backoff.as_mut().await;
                self.backoff = None;
                match self.client.request(self.request.clone(), self.options) {
                    Ok(sub) => {
                        self.generation += 1;
                        debug!(id = sub.id(), generation = self.generation, "resubscribed");
                        self.current = Some(sub);
                    }
                    Err(Error::Closed) => {
                        debug!("client closed, not resubscribing");
                        self.exhausted = true;
                        return Some(Err(Error::Closed));
                    }
                    Err(err) => {
                        if let Some(err) = self.give_up(err) {
                            return Some(Err(err));
                        }
                    }
                }
                continue;
            };

            match current.next().await {
                Some(Ok(Event::Data(reply)))
                    if self.policy.ignore_new && reply.kind == DataKind::New => {}
                Some(Ok(event)) => return Some(Ok(event)),
                Some(Err(err)) => {
                    self.current = None;
                    if let Some(err) = self.give_up(err) {
                        return Some(Err(err));
                    }
                }
                None => {
                    self.current = None;
                    if self.client.is_closed() {
                        self.exhausted = true;
                        return None;
                    }
                    if !self.policy.allows(self.retries) {
                        self.exhausted = true;
                        return None;
                    }
                    self.retries += 1;
                    debug!(query = ?self.request, "stream completed, resubscribing");
                }
            }
        }
    }

    /// Account for a failed attempt. Returns the error when retries are used up.
    fn give_up(&mut self, err: Error) -> Option<Error> {
        if self.policy.allows(self.retries) {
            self.retries += 1;
            warn!(
                %err,
                retries = self.retries,
                delay = ?self.policy.delay,
                "subscription failed, retrying"
            );
            None
        } else {
            warn!(%err, "subscription failed, giving up");
            self.exhausted = true;
            Some(err)
        }
    }
}
