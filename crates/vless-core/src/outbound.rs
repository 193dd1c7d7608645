//! Outbound connection seam and the plain TCP connector.

use crate::error::{RelayError, RelayResult};
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

pub type OutboundReader = Box<dyn AsyncRead + Send + Unpin>;
pub type OutboundWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Both halves of an established outbound byte stream.
pub struct OutboundStream {
    pub reader: OutboundReader,
    pub writer: OutboundWriter,
}

/// Opens raw byte streams to `host:port`. TLS, if any, is carried inside
/// the relayed bytes and is invisible here.
pub trait OutboundConnector: Send + Sync {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = RelayResult<OutboundStream>> + Send + 'a>>;
}

/// Direct TCP connector.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector;

impl OutboundConnector for TcpConnector {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = RelayResult<OutboundStream>> + Send + 'a>> {
        Box::pin(async move {
            let stream = TcpStream::connect((host, port))
                .await
                .map_err(|e| RelayError::Connect {
                    host: host.to_string(),
                    port,
                    reason: e.to_string(),
                })?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "failed to set TCP_NODELAY");
            }
            let (reader, writer) = stream.into_split();
            Ok(OutboundStream {
                reader: Box::new(reader),
                writer: Box::new(writer),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_connector_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let mut out = TcpConnector
            .connect("127.0.0.1", addr.port())
            .await
            .unwrap();
        out.writer.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        out.reader.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
    }

    #[tokio::test]
    async fn tcp_connector_refused() {
        // Bind then drop to get a port with nothing listening.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = TcpConnector.connect("127.0.0.1", port).await.err().unwrap();
        assert!(matches!(err, RelayError::Connect { port: p, .. } if p == port));
    }
}
