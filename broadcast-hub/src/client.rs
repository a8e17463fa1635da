use std::{
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use futures::Stream;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    envelope::{Envelope, read_envelope, write_envelope},
    error::ClientError,
};

/// Envelopes buffered between the reader task and the consumer.
const INCOMING_CAPACITY: usize = 64;

/// A single connection to a broadcast server.
pub struct Client {
    server: SocketAddr,
    reader: Option<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::Connect { addr, source })?;

        info!("connected to {addr}");

        let (reader, writer) = stream.into_split();
        Ok(Self {
            server: addr,
            reader: Some(BufReader::new(reader)),
            writer,
        })
    }

    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), ClientError> {
        write_envelope(&mut self.writer, envelope).await?;
        Ok(())
    }

    /// Starts delivering incoming envelopes through the returned queue.
    ///
    /// The queue closes when the server ends the stream or sends a line that
    /// does not decode. Only one receiver exists per connection; a second
    /// call fails with [`ClientError::AlreadyReceiving`].
    pub fn receive(&mut self) -> Result<Incoming, ClientError> {
        let mut reader = self.reader.take().ok_or(ClientError::AlreadyReceiving)?;
        let (tx, rx) = mpsc::channel(INCOMING_CAPACITY);
        let server = self.server;

        tokio::spawn(async move {
            loop {
                match read_envelope(&mut reader).await {
                    Ok(Some(envelope)) => {
                        if tx.send(envelope).await.is_err() {
                            debug!(%server, "incoming queue dropped by consumer");
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(%server, "server closed the connection");
                        break;
                    }
                    Err(error) => {
                        warn!(%server, %error, "failed to read envelope");
                        break;
                    }
                }
            }
        });

        Ok(Incoming { rx })
    }

    /// Shuts down the write side. The server sees EOF and closes its end,
    /// which in turn ends any [`Incoming`] queue.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Envelopes received from the server, in arrival order.
pub struct Incoming {
    rx: mpsc::Receiver<Envelope>,
}

impl Incoming {
    /// Waits for the next envelope; `None` once the connection has ended.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

impl Stream for Incoming {
    type Item = Envelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
