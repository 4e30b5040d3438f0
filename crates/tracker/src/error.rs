#![forbid(unsafe_code)]

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Api(#[from] portapi::Error),

    #[error("tracker service stopped")]
    Stopped,
}
