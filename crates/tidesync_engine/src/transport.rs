//! Message channels between two engines and the connectors that open them.

use std::future::Future;
use std::io;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use tidesync_protocol::{
    decode_message, encode_message, frame, frame_len, SyncMessage, FRAME_HEADER_SIZE,
};

use crate::controller::SyncController;
use crate::error::{SyncError, SyncResult};

/// An ordered, reliable, bidirectional message link to one peer.
///
/// Messages travel as encoded frames. Dropping the channel closes the link.
#[derive(Debug)]
pub struct Channel {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Channel {
    /// Creates two connected in-process endpoints.
    pub fn pair() -> (Channel, Channel) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Channel {
                outgoing: a_tx,
                incoming: b_rx,
            },
            Channel {
                outgoing: b_tx,
                incoming: a_rx,
            },
        )
    }

    /// Wraps a byte stream, such as a TCP or TLS connection, using
    /// length-prefixed frames.
    ///
    /// Spawns a reader and a writer task, so it must be called inside a
    /// tokio runtime.
    pub fn from_stream<S>(stream: S) -> Channel
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (in_tx, incoming) = mpsc::unbounded_channel();
        let (outgoing, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(body)) => {
                        if in_tx.send(body).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(%err, "closing stream after read failure");
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(body) = out_rx.recv().await {
                if let Err(err) = write_frame(&mut writer, &body).await {
                    tracing::warn!(%err, "closing stream after write failure");
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        Channel { outgoing, incoming }
    }

    /// Queues a message for the peer.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotConnected`] once the link is closed.
    pub fn send(&self, message: &SyncMessage) -> SyncResult<()> {
        let body = encode_message(message)?;
        self.outgoing
            .send(body)
            .map_err(|_| SyncError::NotConnected)
    }

    /// Waits for the next message. `None` means the peer closed the link.
    pub async fn recv(&mut self) -> Option<SyncResult<SyncMessage>> {
        let body = self.incoming.recv().await?;
        Some(decode_message(&body).map_err(SyncError::from))
    }

    /// Returns true once the peer side has gone away.
    pub fn is_closed(&self) -> bool {
        self.outgoing.is_closed()
    }
}

async fn read_frame<R>(reader: &mut R) -> SyncResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(SyncError::transport_retryable(err.to_string())),
    }
    let len = frame_len(header)?;
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|err| SyncError::transport_retryable(err.to_string()))?;
    Ok(Some(body))
}

async fn write_frame<W>(writer: &mut W, body: &[u8]) -> SyncResult<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = frame(body)?;
    writer
        .write_all(&framed)
        .await
        .map_err(|err| SyncError::transport_retryable(err.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|err| SyncError::transport_retryable(err.to_string()))
}

/// Future returned by [`Connector::connect`].
pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = SyncResult<Channel>> + Send + 'a>>;

/// Opens outbound channels for an engine.
pub trait Connector: Send + Sync {
    /// Establishes a new channel to the remote side.
    fn connect(&self) -> ConnectFuture<'_>;
}

/// Connects to another engine in the same process.
#[derive(Clone)]
pub struct MemoryConnector {
    peer: SyncController,
}

impl MemoryConnector {
    /// Creates a connector whose channels are accepted by `peer`.
    pub fn new(peer: SyncController) -> Self {
        Self { peer }
    }
}

impl Connector for MemoryConnector {
    fn connect(&self) -> ConnectFuture<'_> {
        Box::pin(async move {
            let (local, remote) = Channel::pair();
            self.peer.accept(remote)?;
            Ok(local)
        })
    }
}

/// Connects over TCP. Transport security is expected to be provided by
/// the network.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
}

impl TcpConnector {
    /// Creates a connector for `address` (`host:port`).
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// The remote address.
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> ConnectFuture<'_> {
        Box::pin(async move {
            let stream = TcpStream::connect(self.address.as_str())
                .await
                .map_err(|err| {
                    SyncError::transport_retryable(format!("connect to {}: {err}", self.address))
                })?;
            if let Err(err) = stream.set_nodelay(true) {
                tracing::debug!(%err, "could not disable Nagle");
            }
            Ok(Channel::from_stream(stream))
        })
    }
}
