//! Per-connection relay: handshake, outbound connect, and the two copy loops.
//!
//! ```text
//! AwaitingHandshake ──► Connecting ──► Relaying ──► Closed
//!        │                  │              │
//!        └──────────────────┴──────────────┴──────► Closed (error)
//! ```
//!
//! The uplink (inbound → outbound) parses the first chunk, resolves the
//! destination, connects, writes the leftover payload, and then hands the
//! outbound read half to the downlink through a oneshot gate. The downlink
//! (outbound → inbound) never reads before the gate opens.
//!
//! Either loop finishing raises a shared closing signal. Every await in both
//! loops races that signal, so a loop parked on a stalled write is abandoned
//! and teardown always runs. With an idle timeout set, a watchdog raises the
//! same signal once no data has moved in either direction for that long.

use crate::error::{RelayError, RelayResult};
use crate::handshake::{parse_handshake, DNS_PORT};
use crate::outbound::{OutboundConnector, OutboundReader, OutboundWriter};
use crate::resolver::{DestinationResolver, ResolveA};
use crate::stream::InboundStream;
use crate::teardown::safe_close;
use crate::transport::{InboundSink, ReadyState};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, field, info, info_span, Instrument, Span};
use uuid::Uuid;

/// Outbound chunks relayed before every further send is delayed.
pub const DEFAULT_BACKPRESSURE_THRESHOLD: u64 = 20_000;

/// Delay inserted before each send once the threshold is passed.
pub const DEFAULT_BACKPRESSURE_PAUSE: Duration = Duration::from_millis(1);

const DOWNLINK_BUFFER_SIZE: usize = 8192;

/// Relay settings shared by all connections.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// The only accepted VLESS user id.
    pub identity: Uuid,
    pub backpressure_threshold: u64,
    pub backpressure_pause: Duration,
    /// Upper bound on the outbound connect. `None` waits indefinitely.
    pub connect_timeout: Option<Duration>,
    /// Longest stretch with no data relayed in either direction.
    /// `None` waits indefinitely.
    pub idle_timeout: Option<Duration>,
}

impl RelayConfig {
    pub fn new(identity: Uuid) -> Self {
        Self {
            identity,
            backpressure_threshold: DEFAULT_BACKPRESSURE_THRESHOLD,
            backpressure_pause: DEFAULT_BACKPRESSURE_PAUSE,
            connect_timeout: None,
            idle_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    AwaitingHandshake,
    Connecting,
    Relaying,
    Closed,
}

/// Mutable state of one relayed connection.
pub struct ConnectionContext {
    /// Requested destination host, for diagnostics.
    pub address: String,
    /// Requested destination port, for diagnostics.
    pub port: String,
    pub state: RelayState,
    pub outbound: Option<OutboundWriter>,
    pub response_header_sent: bool,
    /// Outbound reads relayed so far.
    pub chunk_count: u64,
}

impl ConnectionContext {
    pub fn new() -> Self {
        Self {
            address: String::new(),
            port: String::new(),
            state: RelayState::AwaitingHandshake,
            outbound: None,
            response_header_sent: false,
            chunk_count: 0,
        }
    }
}

impl Default for ConnectionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Handed from uplink to downlink once the outbound connection is usable.
struct OutboundReady {
    reader: OutboundReader,
    response_header: [u8; 2],
}

/// Time of the last chunk relayed in either direction.
struct ActivityClock {
    start: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.last_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Resolves once nothing has been relayed for `limit`.
    async fn idle_for(&self, limit: Duration) {
        loop {
            let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
            let deadline = self.start + last + limit;
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

/// Closing signal and activity clock, as seen by one copy loop.
struct LoopControl<'a> {
    closing: watch::Receiver<bool>,
    activity: &'a ActivityClock,
}

impl LoopControl<'_> {
    /// Drive `fut` unless the closing signal fires first (`None`).
    async fn guard<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = closing_signal(&mut self.closing) => None,
            out = fut => Some(out),
        }
    }

    fn touch(&self) {
        self.activity.touch();
    }
}

/// Relay engine. One instance serves every connection; it holds no
/// per-connection state.
pub struct Relay<C, R> {
    config: RelayConfig,
    connector: C,
    destinations: DestinationResolver<R>,
}

impl<C: OutboundConnector, R: ResolveA> Relay<C, R> {
    pub fn new(config: RelayConfig, connector: C, destinations: DestinationResolver<R>) -> Self {
        Self {
            config,
            connector,
            destinations,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Relay one inbound connection until both directions are done.
    pub async fn handle<S: InboundSink>(&self, inbound: InboundStream, sink: S) -> RelayResult<()> {
        let mut ctx = ConnectionContext::new();
        self.relay(&mut ctx, inbound, sink).await
    }

    /// Like [`Relay::handle`], with the caller owning the context.
    pub async fn relay<S: InboundSink>(
        &self,
        ctx: &mut ConnectionContext,
        mut inbound: InboundStream,
        mut sink: S,
    ) -> RelayResult<()> {
        let span = info_span!(
            "relay",
            address = field::Empty,
            port = field::Empty,
            network = field::Empty
        );

        async {
            let (gate_tx, gate_rx) = oneshot::channel();
            let (closing_tx, closing_rx) = watch::channel(false);
            let activity = ActivityClock::new();

            let ConnectionContext {
                address,
                port,
                state,
                outbound,
                response_header_sent,
                chunk_count,
            } = ctx;

            let uplink = async {
                let control = LoopControl {
                    closing: closing_rx.clone(),
                    activity: &activity,
                };
                let result = self
                    .uplink(
                        &mut inbound,
                        &mut *address,
                        &mut *port,
                        &mut *state,
                        &mut *outbound,
                        gate_tx,
                        control,
                    )
                    .await;
                closing_tx.send_replace(true);
                result
            };
            let downlink = async {
                let control = LoopControl {
                    closing: closing_rx.clone(),
                    activity: &activity,
                };
                let result = self
                    .downlink(
                        &mut sink,
                        gate_rx,
                        &mut *response_header_sent,
                        &mut *chunk_count,
                        control,
                    )
                    .await;
                closing_tx.send_replace(true);
                result
            };
            let watchdog = async {
                let limit = match self.config.idle_timeout {
                    Some(limit) => limit,
                    None => return Ok(()),
                };
                let mut closing = closing_rx.clone();
                tokio::select! {
                    biased;
                    _ = closing_signal(&mut closing) => Ok(()),
                    _ = activity.idle_for(limit) => {
                        debug!(idle = ?limit, "no traffic in either direction");
                        closing_tx.send_replace(true);
                        Err(RelayError::Timeout)
                    }
                }
            };
            let (up, down, idle) = tokio::join!(uplink, downlink, watchdog);

            *state = RelayState::Closed;
            safe_close(&mut sink).await;
            outbound.take();

            match (&up, &down, &idle) {
                (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                    debug!(error = %e, "relay closed with error")
                }
                _ => info!(chunks = *chunk_count, "relay closed"),
            }
            up.and(down).and(idle)
        }
        .instrument(span)
        .await
    }

    /// Inbound → outbound: handshake, connect, then raw forwarding.
    ///
    /// Returns `Ok` early whenever the closing signal wins a race; the error
    /// that raised it is reported by whoever raised it.
    async fn uplink(
        &self,
        inbound: &mut InboundStream,
        address: &mut String,
        port: &mut String,
        state: &mut RelayState,
        outbound: &mut Option<OutboundWriter>,
        gate: oneshot::Sender<OutboundReady>,
        mut control: LoopControl<'_>,
    ) -> RelayResult<()> {
        *state = RelayState::AwaitingHandshake;
        let Some(first) = control.guard(inbound.next_chunk()).await else {
            return Ok(());
        };
        let first = match first? {
            Some(chunk) => chunk,
            None => {
                debug!("inbound closed before handshake");
                return Ok(());
            }
        };
        control.touch();

        let request = parse_handshake(&first, &self.config.identity)?;
        *address = request.host.clone();
        *port = request.port.to_string();
        let span = Span::current();
        span.record("address", request.host.as_str());
        span.record("port", request.port);
        span.record("network", request.network());

        if request.is_udp && request.port != DNS_PORT {
            return Err(RelayError::UnsupportedUdpPort(request.port));
        }

        *state = RelayState::Connecting;
        let Some(target) = control.guard(self.destinations.resolve(&request.host)).await else {
            return Ok(());
        };
        let connect = self.connector.connect(&target.hostname, request.port);
        let connect = async {
            match self.config.connect_timeout {
                Some(limit) => tokio::time::timeout(limit, connect)
                    .await
                    .unwrap_or_else(|_| Err(RelayError::Timeout)),
                None => connect.await,
            }
        };
        let Some(stream) = control.guard(connect).await else {
            return Ok(());
        };
        let stream = stream?;
        info!(outbound_host = %target.hostname, "connected");

        let writer = outbound.insert(stream.writer);
        // Usually the TLS ClientHello.
        let Some(written) = control.guard(writer.write_all(&first[request.payload_offset..])).await else {
            return Ok(());
        };
        written?;
        let Some(flushed) = control.guard(writer.flush()).await else {
            return Ok(());
        };
        flushed?;

        let ready = OutboundReady {
            reader: stream.reader,
            response_header: request.response_header(),
        };
        if gate.send(ready).is_err() {
            return Ok(());
        }

        *state = RelayState::Relaying;
        loop {
            let Some(chunk) = control.guard(inbound.next_chunk()).await else {
                return Ok(());
            };
            match chunk? {
                Some(data) => {
                    control.touch();
                    let Some(written) = control.guard(writer.write_all(&data)).await else {
                        debug!("closing with an outbound write pending");
                        return Ok(());
                    };
                    written?;
                }
                None => {
                    debug!("inbound stream ended");
                    break;
                }
            }
        }

        if let Some(Err(e)) = control.guard(writer.shutdown()).await {
            debug!(error = %e, "outbound shutdown failed");
        }
        Ok(())
    }

    /// Outbound → inbound: response header once, then chunks with threshold backpressure.
    async fn downlink<S: InboundSink>(
        &self,
        sink: &mut S,
        gate: oneshot::Receiver<OutboundReady>,
        header_sent: &mut bool,
        chunk_count: &mut u64,
        mut control: LoopControl<'_>,
    ) -> RelayResult<()> {
        let OutboundReady {
            mut reader,
            response_header,
        } = match control.guard(gate).await {
            Some(Ok(ready)) => ready,
            // Closing, or no outbound connection was established.
            _ => return Ok(()),
        };

        let mut buf = vec![0u8; DOWNLINK_BUFFER_SIZE];
        loop {
            let Some(read) = control.guard(reader.read(&mut buf)).await else {
                break;
            };
            let n = read?;
            if n == 0 {
                debug!("outbound stream ended");
                break;
            }
            control.touch();

            if sink.ready_state() != ReadyState::Open {
                return Err(RelayError::TransportSend(
                    "inbound transport is not open".into(),
                ));
            }

            let count = *chunk_count;
            *chunk_count += 1;
            if count > self.config.backpressure_threshold
                && control
                    .guard(tokio::time::sleep(self.config.backpressure_pause))
                    .await
                    .is_none()
            {
                break;
            }

            let mut message = Vec::with_capacity(n + response_header.len());
            if !*header_sent {
                message.extend_from_slice(&response_header);
                *header_sent = true;
            }
            message.extend_from_slice(&buf[..n]);
            let Some(sent) = control.guard(sink.send(message)).await else {
                break;
            };
            sent?;
        }
        Ok(())
    }
}

/// Resolves once the closing flag is set (or its sender is gone).
async fn closing_signal(closing: &mut watch::Receiver<bool>) {
    while !*closing.borrow_and_update() {
        if closing.changed().await.is_err() {
            return;
        }
    }
}
