//! Stream transports for the command and event channels.
//!
//! - **Tcp**: `tcp://host:port`, the default. Works across network namespaces.
//! - **Ipc**: `ipc:///path/to.sock`, a unix domain socket on a shared volume.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::error::TransportError;

/// Where an endpoint lives. Resolved once, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelAddress {
    Tcp { host: String, port: u16 },
    Ipc { path: PathBuf },
}

impl ChannelAddress {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn ipc(path: impl Into<PathBuf>) -> Self {
        Self::Ipc { path: path.into() }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Tcp { .. } => "tcp",
            Self::Ipc { .. } => "ipc",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TransportError> {
        let invalid = |reason: &str| TransportError::InvalidAddress {
            address: s.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| invalid("expected scheme://"))?;

        match scheme {
            "tcp" => {
                let (host, port) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| invalid("expected host:port"))?;
                let host = host
                    .strip_prefix('[')
                    .and_then(|h| h.strip_suffix(']'))
                    .unwrap_or(host);
                if host.is_empty() {
                    return Err(invalid("empty host"));
                }
                let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
                Ok(Self::tcp(host, port))
            }
            "ipc" => {
                if rest.is_empty() {
                    return Err(invalid("empty socket path"));
                }
                Ok(Self::ipc(rest))
            }
            other => Err(invalid(&format!("unsupported scheme '{other}'"))),
        }
    }
}

impl FromStr for ChannelAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } if host.contains(':') => write!(f, "tcp://[{host}]:{port}"),
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::Ipc { path } => write!(f, "ipc://{}", path.display()),
        }
    }
}

/// Transport used when building addresses from a host and port pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TransportKind {
    #[default]
    Tcp,
    /// Unix sockets in `dir`, one per port: `{dir}/agentlink-{port}.ipc`.
    Ipc { dir: PathBuf },
}

impl TransportKind {
    pub fn address(&self, host: &str, port: u16) -> ChannelAddress {
        match self {
            Self::Tcp => ChannelAddress::tcp(host, port),
            Self::Ipc { dir } => ChannelAddress::ipc(dir.join(format!("agentlink-{port}.ipc"))),
        }
    }
}

/// A connected byte stream on either transport.
pub enum ChannelStream {
    Tcp(TcpStream),
    Ipc(UnixStream),
}

impl ChannelStream {
    pub fn transport(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "tcp",
            Self::Ipc(_) => "ipc",
        }
    }
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Self::Ipc(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Self::Ipc(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            Self::Ipc(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Self::Ipc(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Dial an address.
pub async fn connect(address: &ChannelAddress) -> Result<ChannelStream, TransportError> {
    match address {
        ChannelAddress::Tcp { host, port } => {
            tracing::trace!(%address, "Dialing tcp endpoint");
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            stream.set_nodelay(true)?;
            Ok(ChannelStream::Tcp(stream))
        }
        ChannelAddress::Ipc { path } => {
            tracing::trace!(%address, "Dialing ipc endpoint");
            let stream = UnixStream::connect(path).await?;
            Ok(ChannelStream::Ipc(stream))
        }
    }
}

/// Listening side of a channel address (agent end).
pub enum ChannelListener {
    Tcp(TcpListener),
    Ipc { listener: UnixListener, path: PathBuf },
}

impl ChannelListener {
    /// Bind an address. For ipc a stale socket file is replaced.
    pub async fn bind(address: &ChannelAddress) -> Result<Self, TransportError> {
        match address {
            ChannelAddress::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                tracing::debug!(%address, "Bound tcp listener");
                Ok(Self::Tcp(listener))
            }
            ChannelAddress::Ipc { path } => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                tracing::debug!(%address, "Bound ipc listener");
                Ok(Self::Ipc {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }

    pub async fn accept(&self) -> Result<ChannelStream, TransportError> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                tracing::trace!(%peer, "Accepted tcp connection");
                Ok(ChannelStream::Tcp(stream))
            }
            Self::Ipc { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                tracing::trace!("Accepted ipc connection");
                Ok(ChannelStream::Ipc(stream))
            }
        }
    }

    /// Actual bound address (resolves port 0).
    pub fn local_address(&self) -> Result<ChannelAddress, TransportError> {
        match self {
            Self::Tcp(listener) => {
                let addr = listener.local_addr()?;
                Ok(ChannelAddress::tcp(addr.ip().to_string(), addr.port()))
            }
            Self::Ipc { path, .. } => Ok(ChannelAddress::ipc(path.clone())),
        }
    }

    fn socket_path(&self) -> Option<&Path> {
        match self {
            Self::Tcp(_) => None,
            Self::Ipc { path, .. } => Some(path),
        }
    }
}

impl Drop for ChannelListener {
    fn drop(&mut self) {
        if let Some(path) = self.socket_path()
            && path.exists()
            && let Err(e) = std::fs::remove_file(path)
        {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove socket file");
        }
    }
}
