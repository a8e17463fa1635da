//! The client registry: identifier allocation plus the writer half of every
//! live connection, all behind one lock.
//!
//! Every operation, broadcasts included, holds the lock for its full
//! duration. That serializes writes per connection, so no recipient ever sees
//! two envelopes interleaved, and a client registered while a broadcast is in
//! flight gets either all of it or none of it.

use std::{collections::BTreeMap, io, net::SocketAddr};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tracing::{debug, warn};

use crate::{
    envelope::{Envelope, encode_line, write_line},
    error::RegistryError,
};

pub type ClientId = u64;

type ClientWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ClientId,
    pub peer: Option<SocketAddr>,
}

/// Outcome of one [`Registry::broadcast`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Successful per-recipient writes.
    pub delivered: usize,
    /// Envelopes dropped because they could not be encoded. Payloads are
    /// `serde_json::Value`, which always serializes, so this stays 0 today; it
    /// is counted for the encode-failure path rather than panicking on it.
    pub skipped: usize,
    /// One entry per failed write, in the order the failures happened.
    pub failed: Vec<ClientId>,
}

/// A client that has just been removed from the registry.
///
/// Holds the writer half that the registry owned; [`Departed::close`]
/// consumes it, so the connection is shut down at most once.
pub struct Departed {
    pub info: ClientInfo,
    writer: ClientWriter,
}

impl Departed {
    pub async fn close(mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

struct ClientRecord {
    peer: Option<SocketAddr>,
    writer: ClientWriter,
}

#[derive(Default)]
struct RegistryState {
    next_id: ClientId,
    clients: BTreeMap<ClientId, ClientRecord>,
}

#[derive(Default)]
pub struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next identifier and takes ownership of `writer`.
    ///
    /// Identifiers start at 0 and are never reused, even after the client
    /// leaves.
    pub async fn register<W>(&self, writer: W, peer: Option<SocketAddr>) -> ClientId
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut state = self.state.lock().await;
        let id = state.next_id;
        state.next_id += 1;
        state.clients.insert(
            id,
            ClientRecord {
                peer,
                writer: Box::new(writer),
            },
        );
        debug!(client_id = id, ?peer, "client registered");
        id
    }

    /// Removes a client. Unknown identifiers are ignored.
    pub async fn deregister(&self, id: ClientId) -> Option<Departed> {
        let mut state = self.state.lock().await;
        let ClientRecord { peer, writer } = state.clients.remove(&id)?;
        debug!(client_id = id, ?peer, "client deregistered");
        Some(Departed {
            info: ClientInfo { id, peer },
            writer,
        })
    }

    pub async fn lookup(&self, id: ClientId) -> Result<ClientInfo, RegistryError> {
        let state = self.state.lock().await;
        state
            .clients
            .get(&id)
            .map(|record| ClientInfo {
                id,
                peer: record.peer,
            })
            .ok_or(RegistryError::NotFound(id))
    }

    /// Registered clients in identifier order.
    pub async fn clients(&self) -> Vec<ClientInfo> {
        let state = self.state.lock().await;
        state
            .clients
            .iter()
            .map(|(&id, record)| ClientInfo {
                id,
                peer: record.peer,
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.clients.is_empty()
    }

    /// Writes one envelope to one client.
    pub async fn send_to(&self, id: ClientId, envelope: &Envelope) -> Result<(), RegistryError> {
        let mut state = self.state.lock().await;
        let record = state
            .clients
            .get_mut(&id)
            .ok_or(RegistryError::NotFound(id))?;
        let line = encode_line(envelope)?;
        write_line(&mut record.writer, &line)
            .await
            .map_err(|source| RegistryError::Write { id, source })
    }

    /// Writes every envelope, in order, to every registered client.
    ///
    /// A failed write is logged and reported but neither stops delivery to
    /// the remaining clients nor removes the failing client. Only that
    /// client's own read loop deregisters it, so until then it is retried on
    /// every broadcast.
    pub async fn broadcast(&self, envelopes: &[Envelope]) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        if envelopes.is_empty() {
            return report;
        }

        let mut lines = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            match encode_line(envelope) {
                Ok(line) => lines.push(line),
                Err(error) => {
                    warn!(kind = %envelope.kind, %error, "failed to encode envelope, skipping");
                    report.skipped += 1;
                }
            }
        }

        let mut state = self.state.lock().await;
        for line in &lines {
            for (&id, record) in state.clients.iter_mut() {
                match write_line(&mut record.writer, line).await {
                    Ok(()) => report.delivered += 1,
                    Err(error) => {
                        warn!(client_id = id, %error, "failed to deliver envelope");
                        report.failed.push(id);
                    }
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio::io::{BufReader, DuplexStream};

    use super::*;
    use crate::envelope::read_envelope;

    fn pipe() -> (DuplexStream, BufReader<DuplexStream>) {
        let (writer, reader) = tokio::io::duplex(4096);
        (writer, BufReader::new(reader))
    }

    #[tokio::test]
    async fn identifiers_start_at_zero_and_are_never_reused() {
        let registry = Registry::new();

        let first = registry.register(tokio::io::sink(), None).await;
        let second = registry.register(tokio::io::sink(), None).await;
        registry.deregister(second).await.expect("second is registered");
        let third = registry.register(tokio::io::sink(), None).await;

        assert_eq!((first, second, third), (0, 1, 2));
        let ids: Vec<_> = registry.clients().await.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![0, 2]);
    }

    #[tokio::test]
    async fn concurrent_registrations_get_distinct_identifiers() {
        let registry = Arc::new(Registry::new());

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                registry.register(tokio::io::sink(), None).await
            }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.expect("register task"));
        }
        ids.sort_unstable();

        assert_eq!(ids, (0..16).collect::<Vec<_>>());
        assert_eq!(registry.len().await, 16);
    }

    #[tokio::test]
    async fn deregister_is_idempotent_and_lookup_reports_missing_clients() {
        let registry = Registry::new();
        let peer: SocketAddr = "127.0.0.1:4000".parse().expect("socket addr");
        let id = registry.register(tokio::io::sink(), Some(peer)).await;

        assert_eq!(
            registry.lookup(id).await.expect("registered"),
            ClientInfo {
                id,
                peer: Some(peer)
            }
        );

        let departed = registry.deregister(id).await.expect("first removal");
        assert_eq!(departed.info.id, id);
        departed.close().await.expect("close writer");

        assert!(registry.deregister(id).await.is_none());
        assert!(matches!(
            registry.lookup(id).await,
            Err(RegistryError::NotFound(missing)) if missing == id
        ));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn broadcast_delivers_every_envelope_in_order_to_every_client() {
        let registry = Registry::new();
        let (writer_a, mut reader_a) = pipe();
        let (writer_b, mut reader_b) = pipe();
        registry.register(writer_a, None).await;
        registry.register(writer_b, None).await;

        let envelopes = vec![
            Envelope::new("first", json!({ "n": 1 })),
            Envelope::bare("second"),
        ];
        let report = registry.broadcast(&envelopes).await;

        assert_eq!(report.delivered, 4);
        assert!(report.failed.is_empty());
        for reader in [&mut reader_a, &mut reader_b] {
            for expected in &envelopes {
                let received = read_envelope(&mut *reader)
                    .await
                    .expect("read envelope")
                    .expect("envelope present");
                assert_eq!(&received, expected);
            }
        }
    }

    #[tokio::test]
    async fn empty_broadcast_touches_nobody() {
        let registry = Registry::new();
        registry.register(tokio::io::sink(), None).await;

        assert_eq!(registry.broadcast(&[]).await, BroadcastReport::default());
    }

    #[tokio::test]
    async fn failed_write_keeps_client_registered_and_is_retried() {
        let registry = Registry::new();
        let (broken_writer, broken_reader) = pipe();
        let (healthy_writer, mut healthy_reader) = pipe();
        let broken = registry.register(broken_writer, None).await;
        registry.register(healthy_writer, None).await;
        drop(broken_reader);

        let first = registry.broadcast(&[Envelope::bare("one")]).await;
        assert_eq!(first.failed, vec![broken]);
        assert_eq!(first.delivered, 1);
        assert!(registry.lookup(broken).await.is_ok());

        let second = registry.broadcast(&[Envelope::bare("two")]).await;
        assert_eq!(second.failed, vec![broken]);

        for kind in ["one", "two"] {
            let received = read_envelope(&mut healthy_reader)
                .await
                .expect("read envelope")
                .expect("envelope present");
            assert_eq!(received.kind, kind);
        }
    }

    #[tokio::test]
    async fn send_to_reaches_only_the_addressed_client() {
        let registry = Registry::new();
        let (writer_a, mut reader_a) = pipe();
        let (writer_b, mut reader_b) = pipe();
        let a = registry.register(writer_a, None).await;
        let b = registry.register(writer_b, None).await;

        registry
            .send_to(b, &Envelope::bare("direct"))
            .await
            .expect("send to b");
        registry.broadcast(&[Envelope::bare("all")]).await;

        let first_b = read_envelope(&mut reader_b).await.expect("read b");
        assert_eq!(first_b, Some(Envelope::bare("direct")));
        let first_a = read_envelope(&mut reader_a).await.expect("read a");
        assert_eq!(first_a, Some(Envelope::bare("all")));

        let missing = registry.send_to(a + b + 1, &Envelope::bare("nobody")).await;
        assert!(matches!(missing, Err(RegistryError::NotFound(_))));
    }
}
