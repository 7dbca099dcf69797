//! The client side of a session: a line-oriented stream that can be
//! upgraded to TLS in place.

use std::io;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf,
};
use tokio::time;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::backend::Transport;
use crate::reply::MAX_LINE;
use crate::utils::Logger;

pub enum ClientStream {
    Plain(Box<dyn Transport>),
    Tls(Box<TlsStream<Box<dyn Transport>>>),
    /// Left behind while the stream is handed to the TLS handshake.
    Closed,
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            ClientStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            ClientStream::Closed => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            ClientStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            ClientStream::Closed => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            ClientStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            ClientStream::Closed => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            ClientStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            ClientStream::Closed => Poll::Ready(Ok(())),
        }
    }
}

/// Whether [`ClientConn::read_line`] stopped at [`MAX_LINE`] bytes before
/// reaching the end of the line.
pub fn is_overlong(line: &[u8]) -> bool {
    line.len() >= MAX_LINE && !line.ends_with(b"\n")
}

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("client {} timed out", what))
}

pub struct ClientConn {
    reader: BufReader<ClientStream>,
    timeout: Duration,
    tag: String,
    logger: Arc<Logger>,
}

impl ClientConn {
    pub fn new(
        stream: impl Transport + 'static,
        timeout: Duration,
        tag: impl Into<String>,
        logger: Arc<Logger>,
    ) -> Self {
        let stream: Box<dyn Transport> = Box::new(stream);
        Self {
            reader: BufReader::new(ClientStream::Plain(stream)),
            timeout,
            tag: tag.into(),
            logger,
        }
    }

    /// Bytes the client sent that have not been consumed yet.
    pub fn has_pending_input(&self) -> bool {
        !self.reader.buffer().is_empty()
    }

    /// Writes a complete (CRLF terminated) reply, logging each line.
    pub async fn send(&mut self, reply: &str) -> io::Result<()> {
        for line in reply.lines() {
            self.logger.debug(&self.tag, &format!("< {}", line)).await;
        }

        let stream = self.reader.get_mut();
        let write = async {
            stream.write_all(reply.as_bytes()).await?;
            stream.flush().await
        };

        time::timeout(self.timeout, write)
            .await
            .map_err(|_| timed_out("write"))?
    }

    /// Reads one line, terminator included, into `buf` (cleared first).
    /// Returns 0 at end of stream. Stops after [`MAX_LINE`] bytes; the rest
    /// of such a line is returned by the following calls.
    pub async fn read_line(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        buf.clear();
        let mut limited = (&mut self.reader).take(MAX_LINE as u64);
        time::timeout(self.timeout, limited.read_until(b'\n', buf))
            .await
            .map_err(|_| timed_out("read"))?
    }

    /// Discards input up to and including the next newline.
    pub async fn skip_line(&mut self) -> io::Result<()> {
        let mut buf = Vec::new();
        loop {
            if self.read_line(&mut buf).await? == 0 || buf.ends_with(b"\n") {
                return Ok(());
            }
        }
    }

    /// Runs the server side TLS handshake on the current plain stream.
    ///
    /// On failure the stream is gone and the connection is unusable.
    pub async fn start_tls(&mut self, acceptor: &TlsAcceptor) -> io::Result<()> {
        let reader = mem::replace(&mut self.reader, BufReader::new(ClientStream::Closed));
        let plain = match reader.into_inner() {
            ClientStream::Plain(stream) => stream,
            other => {
                self.reader = BufReader::new(other);
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "TLS already active",
                ));
            }
        };

        let tls = time::timeout(self.timeout, acceptor.accept(plain))
            .await
            .map_err(|_| timed_out("TLS handshake"))??;

        self.reader = BufReader::new(ClientStream::Tls(Box::new(tls)));
        Ok(())
    }

    pub async fn close(&mut self) {
        let _ = time::timeout(self.timeout, self.reader.get_mut().shutdown()).await;
    }
}
