//! Live connector sessions and their outbound frame queues.
//!
//! A [`ConnectorHandle`] is created when a connector authenticates and
//! destroyed when its transport dies; it must not outlive the transport.
//! The handle owns the session's bounded outbound queue (the session writer
//! task is the sole consumer and therefore the only producer of bytes on the
//! socket) and the session's [`InflightTable`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use relay_types::frame::{ErrorPayload, Frame, Payload};
use relay_types::{FrameId, SessionId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::metrics::METRICS_ID_BROKER_CONNECTORS;
use crate::services::inflight::InflightTable;

/// The session's transport is gone; no further frames can be written.
#[derive(Debug, thiserror::Error)]
#[error("connector session is gone")]
pub(crate) struct SessionGone;

/// One authenticated connector session as seen by the rest of the broker.
pub(crate) struct ConnectorHandle {
    session_id: SessionId,
    models: Vec<String>,
    outbound: mpsc::Sender<Frame>,
    inflight: InflightTable,
    cancel: CancellationToken,
}

impl ConnectorHandle {
    /// Creates a handle and the receiving half of its outbound queue.
    pub(crate) fn new(
        session_id: SessionId,
        models: Vec<String>,
        outbound_queue: usize,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (outbound, outbound_rx) = mpsc::channel(outbound_queue);
        let handle = Arc::new(Self {
            session_id,
            models,
            outbound,
            inflight: InflightTable::default(),
            cancel,
        });
        (handle, outbound_rx)
    }

    /// The broker-assigned id of this session.
    pub(crate) fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// The models this session declared at AUTH, in declaration order.
    pub(crate) fn models(&self) -> &[String] {
        &self.models
    }

    /// The session's in-flight request table.
    pub(crate) fn inflight(&self) -> &InflightTable {
        &self.inflight
    }

    /// Cancelled when the session tears down.
    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Enqueues a frame for the session writer.
    ///
    /// Fails iff the session writer is gone, i.e. the transport died.
    pub(crate) async fn send(&self, frame: Frame) -> Result<(), SessionGone> {
        self.outbound.send(frame).await.map_err(|_| SessionGone)
    }

    /// Best-effort CANCEL for `id`, usable from synchronous drop paths.
    ///
    /// A full queue or a dead session both mean the cancel is moot: the
    /// session either drains its queue soon or fails every in-flight anyway.
    pub(crate) fn enqueue_cancel(&self, id: FrameId) {
        let _ = self.outbound.try_send(Frame::new(id, Payload::Cancel {}));
    }
}

/// Broker-global table of live connector sessions.
#[derive(Default, Clone)]
pub(crate) struct ConnectorRegistry(Arc<Mutex<HashMap<SessionId, Arc<ConnectorHandle>>>>);

impl ConnectorRegistry {
    /// Registers an authenticated session.
    pub(crate) fn insert(&self, handle: Arc<ConnectorHandle>) {
        self.0.lock().insert(handle.session_id(), handle);
        ::metrics::gauge!(METRICS_ID_BROKER_CONNECTORS).increment(1);
    }

    /// Removes a session, returning its handle if it was still registered.
    pub(crate) fn remove(&self, session_id: SessionId) -> Option<Arc<ConnectorHandle>> {
        let handle = self.0.lock().remove(&session_id);
        if handle.is_some() {
            ::metrics::gauge!(METRICS_ID_BROKER_CONNECTORS).decrement(1);
        }
        handle
    }

    /// Looks up a live session by id.
    pub(crate) fn get(&self, session_id: SessionId) -> Option<Arc<ConnectorHandle>> {
        self.0.lock().get(&session_id).cloned()
    }

    /// Number of live sessions.
    pub(crate) fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Snapshot of all live session handles.
    pub(crate) fn handles(&self) -> Vec<Arc<ConnectorHandle>> {
        self.0.lock().values().cloned().collect()
    }

    /// Total number of in-flight requests across all sessions.
    pub(crate) fn inflight_total(&self) -> usize {
        self.handles().iter().map(|h| h.inflight().len()).sum()
    }

    /// Fails every in-flight request on every session with the same error.
    pub(crate) fn fail_all_inflight(&self, error: &ErrorPayload) {
        for handle in self.handles() {
            handle.inflight().fail_all(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_fails_once_the_writer_is_gone() {
        let (handle, outbound_rx) = ConnectorHandle::new(
            SessionId::fresh(),
            vec!["llama3.2".to_owned()],
            4,
            CancellationToken::new(),
        );
        drop(outbound_rx);
        let frame = Frame::new(FrameId::fresh(), Payload::Cancel {});
        handle.send(frame).await.expect_err("writer is gone");
    }

    #[tokio::test]
    async fn registry_insert_get_remove() {
        let registry = ConnectorRegistry::default();
        let (handle, _rx) = ConnectorHandle::new(
            SessionId::fresh(),
            vec!["llama3.2".to_owned()],
            4,
            CancellationToken::new(),
        );
        let id = handle.session_id();

        registry.insert(handle);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(id).is_some());

        registry.remove(id).expect("was registered");
        assert!(registry.get(id).is_none());
        assert!(registry.remove(id).is_none());
    }
}
