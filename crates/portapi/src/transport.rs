//! Frame transports the multiplexer runs on.
//!
//! A transport only moves whole text frames. Connecting, reconnecting and
//! framing rules beyond "one frame per message" are its own business.

#![forbid(unsafe_code)]

use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

#[async_trait::async_trait]
pub trait FrameWriter: Send {
    async fn send(&mut self, frame: String) -> io::Result<()>;

    /// Flush and release the outbound half.
    async fn close(&mut self) -> io::Result<()>;
}

#[async_trait::async_trait]
pub trait FrameReader: Send {
    /// Next inbound frame, or `None` once the peer closed the transport.
    async fn recv(&mut self) -> Option<io::Result<String>>;
}

pub trait Transport: Send + 'static {
    fn split(self) -> (Box<dyn FrameWriter>, Box<dyn FrameReader>);
}

/// In-process transport backed by a pair of channels.
#[derive(Debug)]
pub struct ChannelTransport {
    outbound: flume::Sender<String>,
    inbound: flume::Receiver<String>,
}

/// The backend end of a [`ChannelTransport`].
#[derive(Debug)]
pub struct Peer {
    from_client: flume::Receiver<String>,
    to_client: flume::Sender<String>,
}

pub fn channel() -> (ChannelTransport, Peer) {
    let (outbound, from_client) = flume::unbounded();
    let (to_client, inbound) = flume::unbounded();
    (
        ChannelTransport { outbound, inbound },
        Peer {
            from_client,
            to_client,
        },
    )
}

impl Peer {
    /// Next frame written by the client, `None` once it closed its side.
    pub async fn recv(&self) -> Option<String> {
        self.from_client.recv_async().await.ok()
    }

    pub fn try_recv(&self) -> Option<String> {
        self.from_client.try_recv().ok()
    }

    /// Push a frame to the client. Returns `false` if the client is gone.
    pub fn send(&self, frame: impl Into<String>) -> bool {
        self.to_client.send(frame.into()).is_ok()
    }
}

impl Transport for ChannelTransport {
    fn split(self) -> (Box<dyn FrameWriter>, Box<dyn FrameReader>) {
        (
            Box::new(ChannelWriter(Some(self.outbound))),
            Box::new(ChannelReader(self.inbound)),
        )
    }
}

struct ChannelWriter(Option<flume::Sender<String>>);

struct ChannelReader(flume::Receiver<String>);

#[async_trait::async_trait]
impl FrameWriter for ChannelWriter {
    async fn send(&mut self, frame: String) -> io::Result<()> {
        let Some(tx) = &self.0 else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        tx.send_async(frame)
            .await
            .map_err(|_| io::ErrorKind::BrokenPipe.into())
    }

    async fn close(&mut self) -> io::Result<()> {
        self.0 = None;
        Ok(())
    }
}

#[async_trait::async_trait]
impl FrameReader for ChannelReader {
    async fn recv(&mut self) -> Option<io::Result<String>> {
        self.0.recv_async().await.ok().map(Ok)
    }
}

/// Newline-delimited frames over any byte stream.
#[derive(Debug)]
pub struct LineTransport<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl LineTransport<OwnedReadHalf, OwnedWriteHalf> {
    pub async fn connect_tcp(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self::new(reader, writer))
    }
}

impl<R, W> Transport for LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn split(self) -> (Box<dyn FrameWriter>, Box<dyn FrameReader>) {
        (
            Box::new(LineWriter(self.writer)),
            Box::new(LineReader(BufReader::new(self.reader).lines())),
        )
    }
}

struct LineWriter<W>(W);

struct LineReader<R>(Lines<BufReader<R>>);

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameWriter for LineWriter<W> {
    async fn send(&mut self, frame: String) -> io::Result<()> {
        let mut line = frame.into_bytes();
        line.push(b'\n');
        self.0.write_all(&line).await?;
        self.0.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.0.shutdown().await
    }
}

#[async_trait::async_trait]
impl<R: AsyncRead + Unpin + Send> FrameReader for LineReader<R> {
    async fn recv(&mut self) -> Option<io::Result<String>> {
        self.0.next_line().await.transpose()
    }
}
