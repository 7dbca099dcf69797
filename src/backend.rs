//! Connections to the downstream SMTP servers.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time;

use crate::reply::{self, Reply, ReplyError};

pub const SMTP_PORT: u16 = 25;

/// Any byte stream a session can talk SMTP over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> Transport for T {}

/// Where a backend lives: `host[:port]` or a local socket path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendAddr {
    Inet { host: String, port: u16 },
    Local(PathBuf),
}

impl FromStr for BackendAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty server address".to_string());
        }

        if s.starts_with('/') {
            return Ok(BackendAddr::Local(PathBuf::from(s)));
        }

        // "[::1]:2525", "[::1]", "host,port" and "host:port"
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| format!("unterminated IPv6 address in '{}'", s))?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(format!("garbage after IPv6 address in '{}'", s)),
            }
        } else if let Some((host, port)) = s.split_once(',') {
            (host, Some(port))
        } else if s.matches(':').count() == 1 {
            let (host, port) = s.split_once(':').unwrap_or((s, ""));
            (host, Some(port))
        } else {
            (s, None)
        };

        if host.is_empty() {
            return Err(format!("missing host in '{}'", s));
        }

        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .map_err(|e| format!("invalid port in '{}': {}", s, e))?,
            None => SMTP_PORT,
        };

        Ok(BackendAddr::Inet {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendAddr::Inet { host, port } if host.contains(':') => {
                write!(f, "[{}]:{}", host, port)
            }
            BackendAddr::Inet { host, port } => write!(f, "{}:{}", host, port),
            BackendAddr::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("connection to {addr} failed: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("write error: {0}")]
    Write(io::Error),

    #[error(transparent)]
    Read(ReplyError),

    #[error("not connected")]
    Disconnected,
}

/// One slot in a session's backend list.
///
/// A link that failed to connect, or was disconnected later, stays in its
/// slot with no stream; it is never reconnected.
pub struct BackendLink {
    index: usize,
    name: String,
    stream: Option<BufReader<Box<dyn Transport>>>,
    timeout: Duration,
}

impl BackendLink {
    /// Opens the transport to `addr`, bounded by `connect_timeout`.
    /// Replies are later read with `timeout`.
    pub async fn connect(
        index: usize,
        addr: &BackendAddr,
        connect_timeout: Duration,
        timeout: Duration,
    ) -> Result<Self, LinkError> {
        let name = addr.to_string();
        let stream: Box<dyn Transport> = match time::timeout(connect_timeout, open(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(LinkError::Connect { addr: name, source }),
            Err(_) => return Err(LinkError::Timeout(connect_timeout)),
        };

        Ok(Self {
            index,
            name,
            stream: Some(BufReader::new(stream)),
            timeout,
        })
    }

    pub fn from_stream(
        index: usize,
        name: impl Into<String>,
        stream: impl Transport + 'static,
        timeout: Duration,
    ) -> Self {
        let stream: Box<dyn Transport> = Box::new(stream);
        Self {
            index,
            name: name.into(),
            stream: Some(BufReader::new(stream)),
            timeout,
        }
    }

    /// A slot for a backend that could not be reached.
    pub fn unreachable(index: usize, name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            index,
            name: name.into(),
            stream: None,
            timeout,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Writes `line` exactly as given; the caller supplies the CRLF.
    pub async fn send_line(&mut self, line: &[u8]) -> Result<(), LinkError> {
        let timeout = self.timeout;
        let stream = self.stream.as_mut().ok_or(LinkError::Disconnected)?.get_mut();

        let write = async {
            stream.write_all(line).await?;
            stream.flush().await
        };

        match time::timeout(timeout, write).await {
            Ok(result) => result.map_err(LinkError::Write),
            Err(_) => Err(LinkError::Timeout(timeout)),
        }
    }

    /// Reads one reply. A reply too short to carry a status code counts
    /// as a temporary failure rather than a broken link.
    pub async fn read_reply(&mut self) -> Result<Reply, LinkError> {
        let timeout = self.timeout;
        let stream = self.stream.as_mut().ok_or(LinkError::Disconnected)?;

        match time::timeout(timeout, reply::read_reply(stream)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(ReplyError::ShortLine(line))) => Ok(Reply::malformed(line + "\r\n")),
            Ok(Err(e)) => Err(LinkError::Read(e)),
            Err(_) => Err(LinkError::Timeout(timeout)),
        }
    }

    /// Closes the transport. Returns whether the link was still connected.
    pub async fn disconnect(&mut self) -> bool {
        match self.stream.take() {
            Some(mut stream) => {
                let _ = time::timeout(self.timeout, stream.get_mut().shutdown()).await;
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for BackendLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendLink")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn open(addr: &BackendAddr) -> io::Result<Box<dyn Transport>> {
    match addr {
        BackendAddr::Inet { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        BackendAddr::Local(path) => Ok(Box::new(tokio::net::UnixStream::connect(path).await?)),
        #[cfg(not(unix))]
        BackendAddr::Local(path) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("local sockets not supported: {}", path.display()),
        )),
    }
}

/// The ordered backend slots of one session plus the count of live ones.
#[derive(Debug, Default)]
pub struct BackendSet {
    links: Vec<BackendLink>,
    live: usize,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, link: BackendLink) {
        if link.is_connected() {
            self.live += 1;
        }
        self.links.push(link);
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn get(&self, index: usize) -> Option<&BackendLink> {
        self.links.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut BackendLink> {
        self.links.get_mut(index)
    }

    /// Indices of connected links, in slot order.
    pub fn live_indices(&self) -> Vec<usize> {
        self.links
            .iter()
            .filter(|link| link.is_connected())
            .map(BackendLink::index)
            .collect()
    }

    /// Disconnects one link. The live count drops only the first time.
    pub async fn disconnect(&mut self, index: usize) -> bool {
        let dropped = match self.links.get_mut(index) {
            Some(link) => link.disconnect().await,
            None => false,
        };
        if dropped {
            self.live -= 1;
        }
        dropped
    }

    pub async fn disconnect_all(&mut self) {
        for index in 0..self.links.len() {
            self.disconnect(index).await;
        }
    }
}
