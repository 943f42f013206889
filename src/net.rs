//! Listen addresses and stream splitting.

use serde::Deserialize;
use std::{
    convert::Infallible,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream, UnixListener, UnixStream, tcp, unix},
};

/// A client-facing endpoint: either a TCP address or a Unix socket path.
#[derive(Debug, Clone)]
pub enum Address {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => addr.fmt(f),
            Self::Unix(path) => path.display().fmt(f),
        }
    }
}

impl FromStr for Address {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if let Ok(addr) = s.parse() {
            Self::Tcp(addr)
        } else {
            Self::Unix(s.into())
        })
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(String::deserialize(deserializer)?.parse().unwrap())
    }
}

impl Address {
    pub async fn bind(&self) -> std::io::Result<ListenerKind> {
        match self {
            Self::Tcp(addr) => Ok(ListenerKind::Tcp(TcpListener::bind(addr).await?)),
            Self::Unix(path) => {
                let _ = std::fs::remove_file(path);
                Ok(ListenerKind::Unix(UnixListener::bind(path)?))
            }
        }
    }
}

pub enum ListenerKind {
    Tcp(TcpListener),
    Unix(UnixListener),
}

pub trait Listener {
    type Stream: IntoSplit + Send + 'static;

    fn accept(&self) -> impl Future<Output = std::io::Result<Self::Stream>> + Send;
}

impl Listener for TcpListener {
    type Stream = TcpStream;

    fn accept(&self) -> impl Future<Output = std::io::Result<Self::Stream>> + Send {
        async {
            let (stream, _) = TcpListener::accept(self).await?;
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
    }
}

impl Listener for UnixListener {
    type Stream = UnixStream;

    fn accept(&self) -> impl Future<Output = std::io::Result<Self::Stream>> + Send {
        async {
            let (stream, _) = UnixListener::accept(self).await?;
            Ok(stream)
        }
    }
}

pub trait IntoSplit {
    type ReadHalf: AsyncRead + Unpin + Send + 'static;
    type WriteHalf: AsyncWrite + Unpin + Send + 'static;

    fn into_split(self) -> (Self::ReadHalf, Self::WriteHalf);
}

impl IntoSplit for TcpStream {
    type ReadHalf = tcp::OwnedReadHalf;
    type WriteHalf = tcp::OwnedWriteHalf;

    fn into_split(self) -> (Self::ReadHalf, Self::WriteHalf) {
        self.into_split()
    }
}

impl IntoSplit for UnixStream {
    type ReadHalf = unix::OwnedReadHalf;
    type WriteHalf = unix::OwnedWriteHalf;

    fn into_split(self) -> (Self::ReadHalf, Self::WriteHalf) {
        self.into_split()
    }
}
