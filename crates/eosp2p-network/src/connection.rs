//! Transport connections.

use crate::{NetworkError, NetworkResult};
use futures::future::BoxFuture;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Disable Nagle's algorithm on TCP sockets.
    pub nodelay: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            nodelay: true,
        }
    }
}

/// Byte stream a peer talks over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A live transport handle.
pub type Connection = Box<dyn AsyncStream>;

/// Opens transports to remote addresses.
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self, address: &str) -> BoxFuture<'static, NetworkResult<Connection>>;
}

/// Dials plain TCP.
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    config: ConnectionConfig,
}

impl TcpDialer {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }
}

impl Dialer for TcpDialer {
    fn dial(&self, address: &str) -> BoxFuture<'static, NetworkResult<Connection>> {
        let address = address.to_string();
        let config = self.config.clone();
        Box::pin(async move { connect_tcp(&address, &config).await })
    }
}

#[instrument(skip(config))]
async fn connect_tcp(address: &str, config: &ConnectionConfig) -> NetworkResult<Connection> {
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| NetworkError::Timeout(format!("connect to {}", address)))?
        .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", address, e)))?;

    if config.nodelay {
        stream.set_nodelay(true)?;
    }

    debug!("Connected to {}", address);
    Ok(Box::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_connection_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.nodelay);
    }

    #[tokio::test]
    async fn test_tcp_dialer_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dialer = TcpDialer::default();
        let mut conn = dialer.dial(&addr.to_string()).await.unwrap();
        let (_accepted, _) = listener.accept().await.unwrap();
        conn.write_all(b"ping").await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_dialer_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dialer = TcpDialer::default();
        let result = dialer.dial(&addr.to_string()).await;
        assert!(matches!(result, Err(NetworkError::ConnectionFailed(_))));
    }
}
