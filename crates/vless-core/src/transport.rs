//! Inbound transport seam.
//!
//! The receive side of the inbound transport is delivered as
//! [`TransportEvent`]s over a channel (see [`crate::stream::InboundStream`]);
//! the send side is anything implementing [`InboundSink`].

use crate::error::RelayResult;
use std::future::Future;
use std::pin::Pin;

/// WebSocket-style ready state of the inbound transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

/// Event pushed by the inbound transport's receive side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(Vec<u8>),
    Close,
    Error(String),
}

/// Send side of the inbound transport.
pub trait InboundSink: Send {
    fn ready_state(&self) -> ReadyState;

    /// Send one message.
    fn send(&mut self, data: Vec<u8>) -> Pin<Box<dyn Future<Output = RelayResult<()>> + Send + '_>>;

    /// Start closing the transport.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = RelayResult<()>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_state_round_trip() {
        for state in [
            ReadyState::Connecting,
            ReadyState::Open,
            ReadyState::Closing,
            ReadyState::Closed,
        ] {
            assert_eq!(ReadyState::from_u8(state as u8), state);
        }
        assert_eq!(ReadyState::from_u8(200), ReadyState::Closed);
    }
}
