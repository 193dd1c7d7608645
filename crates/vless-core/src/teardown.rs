//! Idempotent teardown of the inbound transport.

use crate::transport::{InboundSink, ReadyState};
use tracing::warn;

/// Close the inbound transport unless it is already closed.
///
/// Close failures are logged and swallowed; calling this repeatedly is fine.
pub async fn safe_close<S: InboundSink + ?Sized>(sink: &mut S) {
    if sink.ready_state() == ReadyState::Closed {
        return;
    }
    if let Err(e) = sink.close().await {
        warn!(error = %e, "safe close of inbound transport failed");
    }
}
