use std::{
    future::Future,
    io,
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use anyhow::{Context, Result};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream, ToSocketAddrs, tcp::OwnedReadHalf},
    select,
    sync::watch,
    task::{JoinError, JoinSet},
};
use tracing::{debug, error, info, warn};

use crate::{
    envelope::{Envelope, read_envelope},
    error::RegistryError,
    handler::ReactionHandler,
    registry::{BroadcastReport, ClientId, ClientInfo, Registry},
};

/// Binds `addr` and serves `handler` until accepting fails.
pub async fn start<A, H>(addr: A, handler: H) -> Result<()>
where
    A: ToSocketAddrs,
    H: ReactionHandler,
{
    let server = Server::bind(addr, handler).await?;
    info!("server listening on {}", server.local_addr()?);
    server.run().await
}

pub struct Server<H> {
    listener: TcpListener,
    registry: Arc<Registry>,
    handler: Arc<H>,
}

impl<H: ReactionHandler> Server<H> {
    pub fn new(listener: TcpListener, handler: H) -> Self {
        Self {
            listener,
            registry: Arc::new(Registry::new()),
            handler: Arc::new(handler),
        }
    }

    pub async fn bind<A: ToSocketAddrs>(addr: A, handler: H) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .context("failed to bind listener")?;
        Ok(Self::new(listener, handler))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// A handle onto the registry that stays usable while the server runs.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            registry: Arc::clone(&self.registry),
        }
    }

    /// Serves until an accept error, which is returned.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }

    /// Serves until `shutdown` resolves or accepting fails.
    ///
    /// Either way the accept loop stops first, then every dispatch loop is
    /// told to stop and awaited, so each client still goes through
    /// deregistration and its disconnect notification before this returns.
    /// Accept errors are not retried.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            registry,
            handler,
        } = self;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let hub = Hub {
            registry,
            handler,
            cancel: cancel_rx,
        };
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        let outcome = loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => hub.admit(stream, peer, &mut sessions).await,
                    Err(err) => {
                        break Err(anyhow::Error::new(err).context("failed to accept connection"));
                    }
                },
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    log_session_exit(finished);
                }
            }
        };

        cancel_tx.send_replace(true);
        while let Some(finished) = sessions.join_next().await {
            log_session_exit(finished);
        }

        outcome
    }
}

/// Cloneable access to the registry of a running server.
#[derive(Clone)]
pub struct ServerHandle {
    registry: Arc<Registry>,
}

impl ServerHandle {
    /// Sends one envelope to one client. Not used by the broadcast flow.
    pub async fn send_message(&self, id: ClientId, envelope: &Envelope) -> Result<(), RegistryError> {
        self.registry.send_to(id, envelope).await
    }

    pub async fn broadcast(&self, envelopes: &[Envelope]) -> BroadcastReport {
        self.registry.broadcast(envelopes).await
    }

    pub async fn lookup(&self, id: ClientId) -> Result<ClientInfo, RegistryError> {
        self.registry.lookup(id).await
    }

    pub async fn clients(&self) -> Vec<ClientInfo> {
        self.registry.clients().await
    }
}

enum Ending {
    Closed,
    Malformed(io::Error),
    Failed(io::Error),
    HandlerPanicked,
    Cancelled,
}

struct Hub<H> {
    registry: Arc<Registry>,
    handler: Arc<H>,
    cancel: watch::Receiver<bool>,
}

impl<H> Clone for Hub<H> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            handler: Arc::clone(&self.handler),
            cancel: self.cancel.clone(),
        }
    }
}

impl<H: ReactionHandler> Hub<H> {
    /// Registers the connection, starts its dispatch loop, then announces it.
    ///
    /// Registration comes first so the new client already receives whatever
    /// its own connect notification broadcasts.
    async fn admit(&self, stream: TcpStream, peer: SocketAddr, sessions: &mut JoinSet<()>) {
        let (reader, writer) = stream.into_split();
        let id = self.registry.register(writer, Some(peer)).await;
        info!(client_id = id, %peer, "client connected");

        sessions.spawn(self.clone().dispatch(id, BufReader::new(reader)));

        if let Some(replies) = react(id, "client_connected", || {
            self.handler.client_connected(id)
        }) {
            self.registry.broadcast(&replies).await;
        }
    }

    async fn dispatch(mut self, id: ClientId, mut reader: BufReader<OwnedReadHalf>) {
        let ending = loop {
            let next = select! {
                read = read_envelope(&mut reader) => read,
                _ = self.cancel.changed() => break Ending::Cancelled,
            };

            match next {
                Ok(Some(envelope)) => {
                    debug!(client_id = id, kind = %envelope.kind, "envelope received");
                    let reaction = react(id, "handle_message", || {
                        self.handler.handle_message(id, envelope)
                    });
                    match reaction {
                        Some(replies) => {
                            self.registry.broadcast(&replies).await;
                        }
                        None => break Ending::HandlerPanicked,
                    }
                }
                Ok(None) => break Ending::Closed,
                Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                    break Ending::Malformed(err);
                }
                Err(err) => break Ending::Failed(err),
            }
        };

        match &ending {
            Ending::Closed => debug!(client_id = id, "peer closed the connection"),
            Ending::Malformed(error) => {
                warn!(client_id = id, %error, "malformed envelope, dropping client");
            }
            Ending::Failed(error) => warn!(client_id = id, %error, "connection read failed"),
            Ending::HandlerPanicked => warn!(client_id = id, "dropping client after handler panic"),
            Ending::Cancelled => debug!(client_id = id, "dispatch loop cancelled"),
        }

        drop(reader);
        if let Some(departed) = self.registry.deregister(id).await {
            if let Err(error) = departed.close().await {
                debug!(client_id = id, %error, "failed to shut down connection cleanly");
            }
        }
        info!(client_id = id, "client disconnected");

        if let Some(replies) = react(id, "client_disconnected", || {
            self.handler.client_disconnected(id)
        }) {
            self.registry.broadcast(&replies).await;
        }
    }
}

/// Runs one handler callback, turning a panic into `None`.
///
/// A panicking callback must not take down the accept loop or skip a
/// client's teardown, so its replies are simply dropped.
fn react<F>(id: ClientId, callback: &'static str, reaction: F) -> Option<Vec<Envelope>>
where
    F: FnOnce() -> Vec<Envelope>,
{
    match panic::catch_unwind(AssertUnwindSafe(reaction)) {
        Ok(replies) => Some(replies),
        Err(_) => {
            error!(client_id = id, callback, "reaction handler panicked");
            None
        }
    }
}

fn log_session_exit(result: Result<(), JoinError>) {
    if let Err(err) = result {
        warn!(error = ?err, "dispatch task ended abnormally");
    }
}
