#![forbid(unsafe_code)]

use crate::message::RequestKind;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection to the backend is closed")]
    Closed,

    #[error("backend reported an error: {0}")]
    Remote(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0} requests cannot be resubscribed")]
    NotRetryable(RequestKind),

    #[error("reply carried no data")]
    EmptyReply,

    #[error("failed to (de)serialize payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
