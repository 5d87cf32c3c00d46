//! Byte-level transport to the pool.
//!
//! The pool stream interleaves newline-delimited JSON with binary
//! Ex-Message frames, so the transport exposes raw primitives (peek one
//! byte, read a line, read or skip a fixed number of bytes) rather than
//! whole messages. The [`Transport`] trait lets the session run over TCP in
//! production and over in-memory streams in tests.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, trace};

use super::error::{UpstreamError, UpstreamResult};
use super::frame::EX_MESSAGE_HEADER_SIZE;

/// Byte-level I/O toward the pool.
#[async_trait]
pub trait Transport: Send {
    /// Look at the next byte without consuming it.
    async fn peek_byte(&mut self) -> UpstreamResult<u8>;

    /// Read up to and including the next `\n`.
    async fn read_line(&mut self) -> UpstreamResult<Vec<u8>>;

    /// Fill `buf` completely.
    async fn read_exact_into(&mut self, buf: &mut [u8]) -> UpstreamResult<()>;

    /// Read the fixed-size Ex-Message header.
    async fn read_ex_message_header(&mut self) -> UpstreamResult<[u8; EX_MESSAGE_HEADER_SIZE]> {
        let mut raw = [0u8; EX_MESSAGE_HEADER_SIZE];
        self.read_exact_into(&mut raw).await?;
        Ok(raw)
    }

    /// Skip exactly `len` bytes.
    async fn discard(&mut self, len: usize) -> UpstreamResult<()>;

    /// Write one complete line and flush it.
    async fn write_line(&mut self, line: &[u8]) -> UpstreamResult<()>;

    /// Shut down the write side. Errors are ignored.
    async fn shutdown(&mut self);

    /// Address of the remote peer, if the transport has one.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Buffered connection to a pool.
pub struct Connection<R = OwnedReadHalf, W = OwnedWriteHalf> {
    reader: BufReader<R>,
    writer: BufWriter<W>,
    peer: Option<SocketAddr>,
}

impl Connection {
    /// Dial `addr` (`host:port`), giving up after `dial_timeout`.
    pub async fn connect(addr: &str, dial_timeout: Duration) -> UpstreamResult<Self> {
        debug!(server = %addr, "Connecting to pool");

        let stream = tokio::time::timeout(dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| UpstreamError::ConnectTimeout {
                addr: addr.to_string(),
                timeout: dial_timeout,
            })?
            .map_err(|e| UpstreamError::ConnectionFailed(e.to_string()))?;

        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        debug!(server = %addr, "Connected to pool");

        Ok(Self::from_parts(read_half, write_half, peer))
    }
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Wrap already-open read and write halves.
    pub fn from_parts(reader: R, writer: W, peer: Option<SocketAddr>) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            peer,
        }
    }
}

#[async_trait]
impl<R, W> Transport for Connection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn peek_byte(&mut self) -> UpstreamResult<u8> {
        let buf = self.reader.fill_buf().await?;
        buf.first().copied().ok_or(UpstreamError::Disconnected)
    }

    async fn read_line(&mut self) -> UpstreamResult<Vec<u8>> {
        let mut line = Vec::with_capacity(512);
        self.reader.read_until(b'\n', &mut line).await?;

        // EOF before the delimiter means the peer went away mid-line
        if line.last() != Some(&b'\n') {
            return Err(UpstreamError::Disconnected);
        }

        trace!(rx = %String::from_utf8_lossy(&line).trim_end(), "Received line");
        Ok(line)
    }

    async fn read_exact_into(&mut self, buf: &mut [u8]) -> UpstreamResult<()> {
        self.reader.read_exact(buf).await?;
        Ok(())
    }

    async fn discard(&mut self, len: usize) -> UpstreamResult<()> {
        let skipped =
            tokio::io::copy(&mut (&mut self.reader).take(len as u64), &mut tokio::io::sink())
                .await?;
        if skipped < len as u64 {
            return Err(UpstreamError::Disconnected);
        }
        Ok(())
    }

    async fn write_line(&mut self, line: &[u8]) -> UpstreamResult<()> {
        trace!(tx = %String::from_utf8_lossy(line).trim_end(), "Sending line");

        self.writer.write_all(line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// Connection over an in-memory stream, for tests.
#[cfg(test)]
pub(crate) type DuplexConnection = Connection<
    tokio::io::ReadHalf<tokio::io::DuplexStream>,
    tokio::io::WriteHalf<tokio::io::DuplexStream>,
>;

/// Create a connection wired to an in-memory stream.
///
/// The returned stream is the pool's side: bytes written to it are read by
/// the connection, and lines the connection writes can be read from it.
#[cfg(test)]
pub(crate) fn duplex_pair() -> (DuplexConnection, tokio::io::DuplexStream) {
    let (ours, theirs) = tokio::io::duplex(4096);
    let (r, w) = tokio::io::split(ours);
    (Connection::from_parts(r, w, None), theirs)
}
