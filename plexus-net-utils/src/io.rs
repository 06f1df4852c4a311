//! Async listener and stream types over either socket family.

use std::io::Result;
use std::pin::Pin;
use std::task::{Context, Poll};

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::address::{NodeAddress, PeerAddress};

/// A wrapper for [`UnixListener`] that removes the socket file from the
/// filesystem on drop.
///
/// See [`UnixListener`] for API docs.
#[derive(Debug)]
pub struct UnixSocketListener {
    path: Utf8PathBuf,
    inner: UnixListener,
}

impl Drop for UnixSocketListener {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_file(&self.path)
            && error.kind() != std::io::ErrorKind::NotFound
        {
            tracing::error!(?error, ?self.path, "error removing unix socket");
        }
    }
}

impl UnixSocketListener {
    /// Binds to a Unix domain socket path.
    pub fn bind(path: impl AsRef<Utf8Path>) -> Result<Self> {
        let path = path.as_ref();
        let inner = UnixListener::bind(path.as_std_path())?;
        Ok(Self {
            path: path.to_owned(),
            inner,
        })
    }

    /// Accepts an incoming connection.
    pub async fn accept(&self) -> Result<(UnixStream, tokio::net::unix::SocketAddr)> {
        self.inner.accept().await
    }
}

/// Async listener bound to a [`NodeAddress`].
#[derive(Debug)]
pub enum NodeListener {
    /// Unix domain socket listener.
    Unix(UnixSocketListener),

    /// TCP socket listener.
    Tcp(TcpListener),
}

/// Async stream connected to (or accepted from) a peer node.
#[derive(Debug)]
pub enum NodeStream {
    /// Unix domain socket stream.
    Unix(UnixStream),

    /// TCP socket stream.
    Tcp(TcpStream),
}

impl NodeAddress {
    /// Binds this address as an async listener.
    pub async fn bind(&self) -> Result<NodeListener> {
        match self {
            NodeAddress::Unix(path) => {
                let listener = UnixSocketListener::bind(path)?;
                Ok(NodeListener::Unix(listener))
            }
            NodeAddress::Tcp { .. } => {
                let address = self
                    .as_tcp_socket_addrs()
                    .expect("checked to be a tcp address");
                let listener = TcpListener::bind(address).await?;
                Ok(NodeListener::Tcp(listener))
            }
        }
    }

    /// Connects to this address.
    pub async fn connect(&self) -> Result<NodeStream> {
        match self {
            NodeAddress::Unix(path) => {
                let stream = UnixStream::connect(path).await?;
                Ok(NodeStream::Unix(stream))
            }
            NodeAddress::Tcp { .. } => {
                let address = self
                    .as_tcp_socket_addrs()
                    .expect("checked to be a tcp address");
                let stream = TcpStream::connect(address).await?;
                Ok(NodeStream::Tcp(stream))
            }
        }
    }
}

impl NodeListener {
    /// Accepts an incoming connection.
    pub async fn accept(&self) -> Result<(NodeStream, PeerAddress)> {
        match self {
            NodeListener::Unix(listener) => {
                let (stream, address) = listener.accept().await?;
                Ok((NodeStream::Unix(stream), PeerAddress::Unix(address.into())))
            }
            NodeListener::Tcp(listener) => {
                let (stream, address) = listener.accept().await?;
                Ok((NodeStream::Tcp(stream), PeerAddress::Tcp(address)))
            }
        }
    }

    /// Returns the local address this listener is bound to.
    pub fn local_address(&self) -> Result<PeerAddress> {
        match self {
            NodeListener::Unix(listener) => {
                Ok(PeerAddress::Unix(listener.inner.local_addr()?.into()))
            }
            NodeListener::Tcp(listener) => Ok(PeerAddress::Tcp(listener.local_addr()?)),
        }
    }

    /// Returns the bound address as a connectable [`NodeAddress`].
    ///
    /// Mostly interesting for TCP listeners bound to port 0.
    pub fn local_node_address(&self) -> Result<NodeAddress> {
        match self.local_address()? {
            PeerAddress::Tcp(address) => Ok(NodeAddress::Tcp {
                host: address.ip().to_string(),
                is_v6: address.is_ipv6(),
                port: address.port(),
            }),
            PeerAddress::Unix(address) => {
                let path = address.as_pathname().ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "unnamed unix socket")
                })?;
                let path = Utf8Path::from_path(path).ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "non-utf8 socket path")
                })?;
                Ok(NodeAddress::Unix(path.to_owned()))
            }
        }
    }
}

impl AsyncRead for NodeStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        context: &mut Context<'_>,
        buffer: &mut ReadBuf<'_>,
    ) -> Poll<Result<()>> {
        match &mut *self {
            NodeStream::Unix(stream) => Pin::new(stream).poll_read(context, buffer),
            NodeStream::Tcp(stream) => Pin::new(stream).poll_read(context, buffer),
        }
    }
}

impl AsyncWrite for NodeStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        context: &mut Context<'_>,
        buffer: &[u8],
    ) -> Poll<Result<usize>> {
        match &mut *self {
            NodeStream::Unix(stream) => Pin::new(stream).poll_write(context, buffer),
            NodeStream::Tcp(stream) => Pin::new(stream).poll_write(context, buffer),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Result<()>> {
        match &mut *self {
            NodeStream::Unix(stream) => Pin::new(stream).poll_flush(context),
            NodeStream::Tcp(stream) => Pin::new(stream).poll_flush(context),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Result<()>> {
        match &mut *self {
            NodeStream::Unix(stream) => Pin::new(stream).poll_shutdown(context),
            NodeStream::Tcp(stream) => Pin::new(stream).poll_shutdown(context),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use camino::Utf8PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::NodeAddress;

    #[tokio::test]
    async fn node_stream_io_traits_tcp() {
        let listener = NodeAddress::from_str("127.0.0.1:0")
            .unwrap()
            .bind()
            .await
            .unwrap();
        let crate::PeerAddress::Tcp(address) = listener.local_address().unwrap() else {
            panic!("expected a tcp listener");
        };
        let address = NodeAddress::from_str(&address.to_string()).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buffer = [0u8; 5];
            stream.read_exact(&mut buffer).await.unwrap();
            assert_eq!(&buffer, b"hello");
            stream.write_all(b"world").await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let mut stream = address.connect().await.unwrap();

        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();
        let mut buffer = [0u8; 5];
        stream.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"world");
        stream.shutdown().await.unwrap();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn node_stream_io_traits_unix() {
        let directory = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(directory.path().join("node.sock")).unwrap();
        let address = NodeAddress::Unix(path);

        let listener = address.bind().await.unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buffer = [0u8; 5];
            stream.read_exact(&mut buffer).await.unwrap();
            assert_eq!(&buffer, b"hello");
            stream.write_all(b"world").await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let mut stream = address.connect().await.unwrap();

        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();
        let mut buffer = [0u8; 5];
        stream.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"world");
        stream.shutdown().await.unwrap();

        server.await.unwrap();
    }
}
