//! Typed errors surfaced by the multiplexer's public API.
//!
//! Most errors here are fatal: once the packet-handling thread observes one
//! it stops, and the multiplexer must be torn down by the caller.
//! `ClosedPipe` and `DoubleClose` are the exceptions, recoverable at the call
//! site since they only describe a caller mistake on a single pipe.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to resolve host '{host}': {source}")]
    ResolveFailed { host: String, source: io::Error },

    #[error("socket setup failed: {0}")]
    SocketSetupFailed(#[source] io::Error),

    #[error("communication lost: no data received after {attempts} ping requests")]
    CommunicationLost { attempts: u32 },

    #[error("fatal packet loss: slave is {gap} bytes behind the oldest retained packet")]
    FatalPacketLoss { gap: u32 },

    #[error("receive error: {0}")]
    ReceiveError(#[source] io::Error),

    #[error("operation on closed pipe {0}")]
    ClosedPipe(u32),

    #[error("attempt to close already-closed pipe {0}")]
    DoubleClose(u32),
}

pub type Result<T> = std::result::Result<T, Error>;
