use thiserror::Error;

/// Errors produced while parsing, connecting, or relaying a VLESS connection.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("read of {wanted} bytes at offset {offset} exceeds buffer length {len}")]
    OutOfBounds {
        offset: usize,
        wanted: usize,
        len: usize,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("UDP is only supported for DNS (port 53), got port {0}")]
    UnsupportedUdpPort(u16),

    #[error("connect to {host}:{port} failed: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("transport send failed: {0}")]
    TransportSend(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid early data: {0}")]
    EarlyData(String),

    #[error("dns error: {0}")]
    Dns(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Whether the connection was refused before any outbound side effect.
    pub fn is_handshake_rejection(&self) -> bool {
        matches!(
            self,
            RelayError::Protocol(_) | RelayError::UnsupportedUdpPort(_) | RelayError::EarlyData(_)
        )
    }

    /// Whether the inbound transport failed (receive, send, or early data).
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            RelayError::Transport(_) | RelayError::TransportSend(_) | RelayError::EarlyData(_)
        )
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let err = RelayError::UnsupportedUdpPort(443);
        assert_eq!(
            err.to_string(),
            "UDP is only supported for DNS (port 53), got port 443"
        );

        let err = RelayError::OutOfBounds {
            offset: 17,
            wanted: 2,
            len: 18,
        };
        assert_eq!(
            err.to_string(),
            "read of 2 bytes at offset 17 exceeds buffer length 18"
        );
    }

    #[test]
    fn classification() {
        assert!(RelayError::Protocol("invalid identity".into()).is_handshake_rejection());
        assert!(RelayError::UnsupportedUdpPort(80).is_handshake_rejection());
        assert!(!RelayError::Timeout.is_handshake_rejection());
        assert!(RelayError::TransportSend("closed".into()).is_transport_failure());
        assert!(!RelayError::Dns("nxdomain".into()).is_transport_failure());
    }
}
