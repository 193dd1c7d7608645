//! Pull-based byte stream over push-based transport events.
//!
//! The transport's receive side pushes [`TransportEvent`]s into a bounded
//! channel; [`InboundStream`] hands them out one chunk at a time, after the
//! optional early data carried in the upgrade request. Because the channel is
//! bounded, a slow consumer stalls the producer instead of buffering.

use crate::error::{RelayError, RelayResult};
use crate::transport::TransportEvent;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use tokio::sync::mpsc;
use tracing::debug;

/// Capacity of the event channel between transport and stream.
pub const EVENT_QUEUE_CAPACITY: usize = 64;

/// Decode early data in either base64 alphabet, padded or not.
///
/// Returns `Ok(None)` for an empty header or an empty payload.
pub fn decode_early_data(header: &str) -> RelayResult<Option<Vec<u8>>> {
    let normalized: String = header
        .trim()
        .chars()
        .filter(|c| *c != '=')
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    if normalized.is_empty() {
        return Ok(None);
    }
    let data = URL_SAFE_NO_PAD
        .decode(normalized.as_bytes())
        .map_err(|e| RelayError::EarlyData(e.to_string()))?;
    Ok(if data.is_empty() { None } else { Some(data) })
}

/// Finite, non-restartable sequence of inbound chunks.
///
/// Dropping the stream closes the receiver, which tells the producer to stop
/// reading from the transport.
pub struct InboundStream {
    early: Option<RelayResult<Vec<u8>>>,
    events: mpsc::Receiver<TransportEvent>,
    finished: bool,
}

impl InboundStream {
    pub fn new(early_data: Option<&str>, events: mpsc::Receiver<TransportEvent>) -> Self {
        let early = early_data.and_then(|header| decode_early_data(header).transpose());
        Self {
            early,
            events,
            finished: false,
        }
    }

    /// Next chunk, `Ok(None)` at end of stream.
    ///
    /// A transport error is returned once; after that the stream is finished.
    pub async fn next_chunk(&mut self) -> RelayResult<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }

        if let Some(early) = self.early.take() {
            return match early {
                Ok(data) => {
                    debug!(len = data.len(), "emitting early data");
                    Ok(Some(data))
                }
                Err(e) => {
                    self.finish();
                    Err(e)
                }
            };
        }

        match self.events.recv().await {
            Some(TransportEvent::Message(data)) => Ok(Some(data)),
            Some(TransportEvent::Close) | None => {
                debug!("inbound stream closed");
                self.finish();
                Ok(None)
            }
            Some(TransportEvent::Error(reason)) => {
                self.finish();
                Err(RelayError::Transport(reason))
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn finish(&mut self) {
        self.finished = true;
        self.events.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_both_alphabets() {
        // 0xfb 0xff 0xbf encodes to "+/+/" (standard) and "-_-_" (url-safe).
        let expected = vec![0xfb, 0xff, 0xbf];
        assert_eq!(decode_early_data("+/+/").unwrap(), Some(expected.clone()));
        assert_eq!(decode_early_data("-_-_").unwrap(), Some(expected));

        assert_eq!(decode_early_data("aGk=").unwrap(), Some(b"hi".to_vec()));
        assert_eq!(decode_early_data("aGk").unwrap(), Some(b"hi".to_vec()));
        assert_eq!(decode_early_data("").unwrap(), None);
    }

    #[test]
    fn invalid_early_data() {
        assert!(matches!(
            decode_early_data("not base64!"),
            Err(RelayError::EarlyData(_))
        ));
    }

    #[tokio::test]
    async fn early_data_comes_first() {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        tx.send(TransportEvent::Message(b"second".to_vec())).await.unwrap();
        tx.send(TransportEvent::Close).await.unwrap();

        let mut stream = InboundStream::new(Some("Zmlyc3Q"), rx);
        assert_eq!(stream.next_chunk().await.unwrap(), Some(b"first".to_vec()));
        assert_eq!(stream.next_chunk().await.unwrap(), Some(b"second".to_vec()));
        assert_eq!(stream.next_chunk().await.unwrap(), None);
        assert!(stream.is_finished());
        assert_eq!(stream.next_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn messages_in_order_then_producer_drop_ends() {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        for i in 0..5u8 {
            tx.send(TransportEvent::Message(vec![i])).await.unwrap();
        }
        drop(tx);

        let mut stream = InboundStream::new(None, rx);
        for i in 0..5u8 {
            assert_eq!(stream.next_chunk().await.unwrap(), Some(vec![i]));
        }
        assert_eq!(stream.next_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn transport_error_propagates_once() {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        tx.send(TransportEvent::Error("connection reset".into())).await.unwrap();

        let mut stream = InboundStream::new(None, rx);
        match stream.next_chunk().await {
            Err(RelayError::Transport(reason)) => assert_eq!(reason, "connection reset"),
            other => panic!("expected transport error, got {other:?}"),
        }
        assert_eq!(stream.next_chunk().await.unwrap(), None);
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn invalid_early_data_ends_stream() {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        tx.send(TransportEvent::Message(b"ignored".to_vec())).await.unwrap();

        let mut stream = InboundStream::new(Some("%%%"), rx);
        assert!(matches!(stream.next_chunk().await, Err(RelayError::EarlyData(_))));
        assert_eq!(stream.next_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_early_data_is_skipped() {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        tx.send(TransportEvent::Message(b"only".to_vec())).await.unwrap();

        let mut stream = InboundStream::new(Some(""), rx);
        assert_eq!(stream.next_chunk().await.unwrap(), Some(b"only".to_vec()));
    }

    #[tokio::test]
    async fn dropping_stream_signals_producer() {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let stream = InboundStream::new(None, rx);
        assert!(!tx.is_closed());
        drop(stream);
        assert!(tx.is_closed());
        assert!(tx.send(TransportEvent::Message(vec![1])).await.is_err());
    }
}
