//! Duplex message channels between peers.
//!
//! A [`Transport`] splits into a [`WireSink`] and a [`WireSource`] so a link
//! can read and write concurrently. Two implementations ship:
//!
//! - [`ChannelTransport`]: in-process pair of queues (tests, embedded use).
//! - [`LineTransport`]: newline-delimited JSON over any async byte stream,
//!   e.g. the halves of a TCP connection.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::protocol::WireMessage;
use crate::error::SyncError;

#[async_trait]
pub trait WireSink: Send {
    async fn send(&mut self, msg: &WireMessage) -> Result<(), SyncError>;
}

#[async_trait]
pub trait WireSource: Send {
    /// Next message, or `None` once the peer has closed the channel.
    async fn recv(&mut self) -> Result<Option<WireMessage>, SyncError>;
}

pub trait Transport: Send {
    /// Identifies the remote end in logs and patch origins.
    fn peer_id(&self) -> &str;
    fn split(self: Box<Self>) -> (Box<dyn WireSink>, Box<dyn WireSource>);
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

pub struct ChannelTransport {
    peer_id: String,
    tx: mpsc::UnboundedSender<WireMessage>,
    rx: mpsc::UnboundedReceiver<WireMessage>,
}

/// Two connected in-process transports. Each side is named after the peer it
/// talks to.
pub fn duplex(a: &str, b: &str) -> (ChannelTransport, ChannelTransport) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        ChannelTransport {
            peer_id: b.to_string(),
            tx: a_tx,
            rx: a_rx,
        },
        ChannelTransport {
            peer_id: a.to_string(),
            tx: b_tx,
            rx: b_rx,
        },
    )
}

struct ChannelSink {
    peer_id: String,
    tx: mpsc::UnboundedSender<WireMessage>,
}

struct ChannelSource {
    rx: mpsc::UnboundedReceiver<WireMessage>,
}

#[async_trait]
impl WireSink for ChannelSink {
    async fn send(&mut self, msg: &WireMessage) -> Result<(), SyncError> {
        self.tx
            .send(msg.clone())
            .map_err(|_| SyncError::ChannelClosed(self.peer_id.clone()))
    }
}

#[async_trait]
impl WireSource for ChannelSource {
    async fn recv(&mut self) -> Result<Option<WireMessage>, SyncError> {
        Ok(self.rx.recv().await)
    }
}

impl Transport for ChannelTransport {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn split(self: Box<Self>) -> (Box<dyn WireSink>, Box<dyn WireSource>) {
        let ChannelTransport { peer_id, tx, rx } = *self;
        (
            Box::new(ChannelSink { peer_id, tx }),
            Box::new(ChannelSource { rx }),
        )
    }
}

// ---------------------------------------------------------------------------
// JSON lines
// ---------------------------------------------------------------------------

pub struct LineTransport<R, W> {
    peer_id: String,
    reader: R,
    writer: W,
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(peer_id: impl Into<String>, reader: R, writer: W) -> Self {
        Self {
            peer_id: peer_id.into(),
            reader,
            writer,
        }
    }
}

impl LineTransport<tokio::net::tcp::OwnedReadHalf, tokio::net::tcp::OwnedWriteHalf> {
    /// Wrap an accepted or connected TCP stream; the peer address is the id.
    pub fn tcp(stream: TcpStream) -> Self {
        let peer_id = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "tcp".to_string());
        let (reader, writer) = stream.into_split();
        Self::new(peer_id, reader, writer)
    }
}

struct LineSink<W> {
    peer_id: String,
    writer: W,
}

struct LineSource<R> {
    peer_id: String,
    lines: Lines<BufReader<R>>,
}

#[async_trait]
impl<W> WireSink for LineSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, msg: &WireMessage) -> Result<(), SyncError> {
        let mut line = msg.to_line()?;
        line.push('\n');
        let closed = |_| SyncError::ChannelClosed(self.peer_id.clone());
        self.writer.write_all(line.as_bytes()).await.map_err(closed)?;
        self.writer.flush().await.map_err(closed)
    }
}

#[async_trait]
impl<R> WireSource for LineSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<WireMessage>, SyncError> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(None),
                Err(_) => return Err(SyncError::ChannelClosed(self.peer_id.clone())),
            };
            if line.trim().is_empty() {
                continue;
            }
            match WireMessage::from_line(&line) {
                Ok(msg) => return Ok(Some(msg)),
                Err(e) => {
                    tracing::warn!(peer = %self.peer_id, error = %e, "skipping unreadable wire message")
                }
            }
        }
    }
}

impl<R, W> Transport for LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn split(self: Box<Self>) -> (Box<dyn WireSink>, Box<dyn WireSource>) {
        let LineTransport {
            peer_id,
            reader,
            writer,
        } = *self;
        (
            Box::new(LineSink {
                peer_id: peer_id.clone(),
                writer,
            }),
            Box::new(LineSource {
                peer_id,
                lines: BufReader::new(reader).lines(),
            }),
        )
    }
}
