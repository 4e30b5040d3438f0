#![forbid(unsafe_code)]

use crate::signals::SignalEvent;
use flume::SendError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to install signal handler: {0}")]
    SignalHandler(#[source] io::Error),

    #[error("Failed to send signal event: {0}")]
    SendSignal(#[from] SendError<SignalEvent>),

    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("No profile with id {0:?} has live connections")]
    UnknownProfile(String),

    #[error(transparent)]
    Api(#[from] portapi::Error),

    #[error(transparent)]
    Tracker(#[from] tracker::Error),

    #[error("Failed to render record: {0}")]
    Render(#[from] serde_json::Error),

    #[error("Failed to write output: {0}")]
    Output(#[from] io::Error),
}
