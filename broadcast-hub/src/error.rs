use std::{io, net::SocketAddr};

use thiserror::Error;

use crate::registry::ClientId;

/// Errors surfaced by direct, single-recipient operations on the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("client {0} not found")]
    NotFound(ClientId),
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write to client {id}: {source}")]
    Write {
        id: ClientId,
        #[source]
        source: io::Error,
    },
}

/// Errors surfaced by the client-side wrapper.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("incoming envelopes are already being received on this connection")]
    AlreadyReceiving,
    #[error(transparent)]
    Io(#[from] io::Error),
}
