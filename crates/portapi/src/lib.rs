#![forbid(unsafe_code)]

pub mod client;
pub mod clock;
pub mod error;
pub mod message;
pub mod retry;
pub mod transport;
pub mod watch;

pub use client::{
    ActiveRequestInfo, CancelHandle, Client, DataKind, DataReply, Event, RequestOptions,
    Subscription,
};
pub use clock::{Clock, SystemClock};
pub use error::Error;
pub use message::{Body, DecodeError, Message, Payload, Reply, Request, RequestKind};
pub use retry::RetryingSubscription;
pub use transport::{ChannelTransport, LineTransport, Peer, Transport, channel};
pub use watch::{Entry, Watch, WatchAll};
