//! Per-session bookkeeping of in-flight requests.
//!
//! Each authenticated session owns one [`InflightTable`] mapping correlation
//! ids to response sinks. The session reader is the only producer into the
//! sinks; the HTTP handler owning the request is the only consumer. A record
//! lives from the moment the handler writes its REQUEST frame until a
//! terminal frame, a cancellation, a deadline, or the loss of the session.

use std::collections::HashMap;

use parking_lot::Mutex;
use relay_types::FrameId;
use relay_types::frame::{ErrorPayload, ResponsePayload};
use tokio::sync::{mpsc, oneshot};

use crate::metrics::METRICS_ID_BROKER_REQUESTS_INFLIGHT;

/// Outcome delivered to a non-streaming request handler.
#[derive(Debug)]
pub(crate) enum UnaryOutcome {
    /// The connector answered with a complete RESPONSE frame.
    Response(ResponsePayload),
    /// The request failed on either leg.
    Error(ErrorPayload),
}

/// One event delivered to a streaming request handler.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    /// One chunk of response bytes, relayed in arrival order.
    Chunk(Vec<u8>),
    /// The stream ended cleanly.
    End,
    /// The stream failed; no further events follow.
    Error(ErrorPayload),
}

/// The per-request sink the session reader delivers into.
pub(crate) enum ResponseSink {
    /// Single-shot slot for `stream:false` requests.
    Unary(oneshot::Sender<UnaryOutcome>),
    /// Bounded chunk channel for `stream:true` requests.
    Stream(mpsc::Sender<StreamEvent>),
}

impl ResponseSink {
    /// Delivers a terminal error to whichever sink variant this is.
    ///
    /// Streaming sinks are served from a spawned task so a full chunk buffer
    /// cannot stall the caller.
    pub(crate) fn fail(self, error: ErrorPayload) {
        match self {
            ResponseSink::Unary(slot) => {
                let _ = slot.send(UnaryOutcome::Error(error));
            }
            ResponseSink::Stream(chunks) => {
                tokio::spawn(async move {
                    let _ = chunks.send(StreamEvent::Error(error)).await;
                });
            }
        }
    }
}

/// Correlation-id indexed table of the session's active requests.
#[derive(Default)]
pub(crate) struct InflightTable(Mutex<HashMap<FrameId, ResponseSink>>);

impl InflightTable {
    /// Registers a new in-flight request.
    pub(crate) fn insert(&self, id: FrameId, sink: ResponseSink) {
        self.0.lock().insert(id, sink);
        ::metrics::gauge!(METRICS_ID_BROKER_REQUESTS_INFLIGHT).increment(1);
    }

    /// Removes and returns the sink for `id`, if the request is still live.
    pub(crate) fn remove(&self, id: &FrameId) -> Option<ResponseSink> {
        let sink = self.0.lock().remove(id);
        if sink.is_some() {
            ::metrics::gauge!(METRICS_ID_BROKER_REQUESTS_INFLIGHT).decrement(1);
        }
        sink
    }

    /// Returns a clone of the streaming sender for `id`.
    ///
    /// `None` if the id is unknown or belongs to a non-streaming request.
    pub(crate) fn stream_sender(&self, id: &FrameId) -> Option<mpsc::Sender<StreamEvent>> {
        match self.0.lock().get(id) {
            Some(ResponseSink::Stream(chunks)) => Some(chunks.clone()),
            _ => None,
        }
    }

    /// Returns `true` iff `id` is registered, regardless of sink kind.
    pub(crate) fn contains(&self, id: &FrameId) -> bool {
        self.0.lock().contains_key(id)
    }

    /// Number of currently in-flight requests.
    pub(crate) fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Fails every in-flight request with the same error and empties the table.
    pub(crate) fn fail_all(&self, error: &ErrorPayload) {
        let drained = {
            let mut table = self.0.lock();
            table.drain().collect::<Vec<_>>()
        };
        ::metrics::gauge!(METRICS_ID_BROKER_REQUESTS_INFLIGHT).decrement(drained.len() as f64);
        for (_, sink) in drained {
            sink.fail(error.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::error_code::ErrorCode;

    fn session_lost() -> ErrorPayload {
        ErrorPayload {
            status: 503,
            error: "connector session lost".to_owned(),
            code: ErrorCode::SessionLost,
        }
    }

    #[tokio::test]
    async fn remove_is_terminal_for_an_id() {
        let table = InflightTable::default();
        let (tx, _rx) = oneshot::channel();
        let id = FrameId::fresh();
        table.insert(id.clone(), ResponseSink::Unary(tx));

        assert!(table.remove(&id).is_some());
        // a second terminator for the same id finds nothing
        assert!(table.remove(&id).is_none());
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn fail_all_reaches_every_sink() {
        let table = InflightTable::default();
        let (unary_tx, unary_rx) = oneshot::channel();
        let (stream_tx, mut stream_rx) = mpsc::channel(8);
        table.insert(FrameId::fresh(), ResponseSink::Unary(unary_tx));
        table.insert(FrameId::fresh(), ResponseSink::Stream(stream_tx));

        table.fail_all(&session_lost());
        assert_eq!(table.len(), 0);

        match unary_rx.await.expect("outcome delivered") {
            UnaryOutcome::Error(err) => assert_eq!(err.code, ErrorCode::SessionLost),
            UnaryOutcome::Response(_) => panic!("expected error"),
        }
        match stream_rx.recv().await.expect("event delivered") {
            StreamEvent::Error(err) => assert_eq!(err.code, ErrorCode::SessionLost),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_sender_ignores_unary_records() {
        let table = InflightTable::default();
        let (tx, _rx) = oneshot::channel();
        let id = FrameId::fresh();
        table.insert(id.clone(), ResponseSink::Unary(tx));

        assert!(table.stream_sender(&id).is_none());
        assert!(table.stream_sender(&FrameId::fresh()).is_none());
    }
}
