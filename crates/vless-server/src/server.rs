//! Core server: accepts WebSocket connections and hands each to the relay.

use crate::config::ServerConfig;
use crate::dns::DnsBackend;
use crate::transport::websocket::{self, WebSocketConnection};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, info_span, warn, Instrument};
use vless_core::{DestinationResolver, Relay, RelayResult, TcpConnector};

/// The relay server instance.
pub struct RelayServer {
    config: ServerConfig,
    relay: Relay<TcpConnector, DnsBackend>,
    next_conn_id: AtomicU64,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> RelayResult<Self> {
        let backend = DnsBackend::from_settings(&config.dns)?;
        let destinations =
            DestinationResolver::with_fallback(backend, config.dns.fallback_host.clone());
        let relay = Relay::new(config.relay.clone(), TcpConnector, destinations);

        info!(
            path = %config.path,
            dns = ?config.dns.mode,
            fallback = %config.dns.fallback_host,
            "relay configured"
        );

        Ok(Self {
            config,
            relay,
            next_conn_id: AtomicU64::new(1),
        })
    }

    /// Bind the listener and serve until it closes.
    pub async fn run(self, tls_config: Option<Arc<rustls::ServerConfig>>) -> RelayResult<()> {
        let bind_addr = SocketAddr::new(self.config.listen, self.config.port);
        let acceptor = tls_config.map(TlsAcceptor::from);
        let (local_addr, rx) =
            websocket::start_listener(bind_addr, acceptor, self.config.path.clone()).await?;

        info!(addr = %local_addr, "vless-server ready");

        Arc::new(self).serve(rx).await;
        Ok(())
    }

    /// Relay every connection the listener yields, each on its own task.
    pub async fn serve(self: Arc<Self>, mut rx: mpsc::Receiver<WebSocketConnection>) {
        while let Some(conn) = rx.recv().await {
            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
            let span = info_span!("conn", id = conn_id, remote = %conn.remote_addr);
            let srv = self.clone();
            tokio::spawn(async move { srv.handle_websocket(conn).await }.instrument(span));
        }
        info!("listener closed, shutting down");
    }

    async fn handle_websocket(&self, conn: WebSocketConnection) {
        debug!(early_data = conn.early_data.is_some(), "handling WebSocket connection");
        let (inbound, sink) = websocket::into_relay_halves(conn);
        match self.relay.handle(inbound, sink).await {
            Ok(()) => {}
            Err(e) if e.is_handshake_rejection() => {
                warn!(error = %e, "rejected VLESS request");
            }
            Err(e) if e.is_transport_failure() => {
                debug!(error = %e, "connection ended by transport");
            }
            Err(e) => {
                warn!(error = %e, "relay error");
            }
        }
    }
}
