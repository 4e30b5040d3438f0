#![forbid(unsafe_code)]

use crate::error::Error;
use flume::Sender;
use tokio::signal::unix::{SignalKind, signal};

/// Indefinitely listens to signals and sends signal events to the provided channel.
pub async fn wait_for_signal(signal_event: &Sender<SignalEvent>) -> Result<(), Error> {
    let mut sigusr1 = signal(SignalKind::user_defined1()).map_err(Error::SignalHandler)?;
    let mut sigusr2 = signal(SignalKind::user_defined2()).map_err(Error::SignalHandler)?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(Error::SignalHandler)?;

    loop {
        tokio::select! {
            _ = sigusr1.recv() => {
                signal_event.send_async(SignalEvent::SigUSR1).await?;
            }
            _ = sigusr2.recv() => {
                signal_event.send_async(SignalEvent::SigUSR2).await?;
            }
            _ = sigterm.recv() => {
                signal_event.send_async(SignalEvent::Shutdown).await?;
            }
            result = tokio::signal::ctrl_c() => {
                result.map_err(Error::SignalHandler)?;
                signal_event.send_async(SignalEvent::Shutdown).await?;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// Dump tracker state.
    SigUSR1,
    /// Dump open requests.
    SigUSR2,
    Shutdown,
}
