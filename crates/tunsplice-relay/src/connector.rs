//! Outbound connection seam
//!
//! Relays never dial sockets directly; they go through a [`Connector`], so
//! the engine can be pointed at a redirecting upstream or a test listener.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::net::TcpStream;

/// Future returned by [`Connector::connect`]
pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send + 'a>>;

/// Opens the outbound socket of a relay
pub trait Connector: Send + Sync + 'static {
    /// Dial `addr`. Timeouts and retries are applied by the caller.
    fn connect(&self, addr: SocketAddr) -> ConnectFuture<'_>;
}

/// Dials the flow's real destination
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectConnector;

impl Connector for DirectConnector {
    fn connect(&self, addr: SocketAddr) -> ConnectFuture<'_> {
        Box::pin(async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(stream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_direct_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (stream, accepted) = tokio::join!(DirectConnector.connect(addr), listener.accept());
        let stream = stream.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
        assert!(stream.nodelay().unwrap());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn test_direct_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(DirectConnector.connect(addr).await.is_err());
    }
}
