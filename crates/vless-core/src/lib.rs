//! vless-core: VLESS-over-WebSocket relay engine.
//!
//! Parses the VLESS request header from the first inbound chunk, rewrites
//! destinations that resolve into the edge network, connects outbound over
//! TCP, and relays bytes in both directions with threshold backpressure.
//! Transports are abstracted behind [`InboundSink`], [`TransportEvent`],
//! [`OutboundConnector`], and [`ResolveA`].

pub mod cidr;
pub mod cursor;
pub mod error;
pub mod handshake;
pub mod outbound;
pub mod relay;
pub mod resolver;
pub mod stream;
pub mod teardown;
pub mod transport;

// Re-export commonly used items at crate root.
pub use error::{RelayError, RelayResult};
pub use handshake::{parse_handshake, HandshakeRequest};
pub use outbound::{OutboundConnector, OutboundStream, TcpConnector};
pub use relay::{ConnectionContext, Relay, RelayConfig, RelayState};
pub use resolver::{DestinationResolver, ResolveA, ResolvedTarget, EDGE_FALLBACK_HOST};
pub use stream::{InboundStream, EVENT_QUEUE_CAPACITY};
pub use teardown::safe_close;
pub use transport::{InboundSink, ReadyState, TransportEvent};
