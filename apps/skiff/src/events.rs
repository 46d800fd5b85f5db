use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::signaling::PeerId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// The relay assigned our identity; `connect` is usable from now on.
    Open { identity: PeerId },
    Connected { remote: PeerId },
    Message { remote: PeerId, payload: Bytes },
    Closed { remote: PeerId },
    /// An inbound offer, answer or candidate from `remote` was rejected.
    /// Other sessions are unaffected.
    NegotiationError { remote: PeerId, reason: String },
    /// The relay link hit a fatal error or went away. Nothing further will be
    /// negotiated on this instance.
    LinkFailed { reason: String },
}

/// Dispatch side of the consumer event stream. Holds no negotiation state;
/// ordering is whatever order the owning actor calls it in.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<PeerEvent>,
    opened: Arc<AtomicBool>,
}

impl EventSink {
    pub fn channel() -> (Self, Events) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                opened: Arc::new(AtomicBool::new(false)),
            },
            Events { rx },
        )
    }

    /// Fires at most once per sink, however often it is called.
    pub fn on_open(&self, identity: &PeerId) {
        if self.opened.swap(true, Ordering::SeqCst) {
            return;
        }
        self.dispatch(PeerEvent::Open {
            identity: identity.clone(),
        });
    }

    pub fn on_connected(&self, remote: &PeerId) {
        self.dispatch(PeerEvent::Connected {
            remote: remote.clone(),
        });
    }

    pub fn on_message(&self, remote: &PeerId, payload: Bytes) {
        self.dispatch(PeerEvent::Message {
            remote: remote.clone(),
            payload,
        });
    }

    pub fn on_closed(&self, remote: &PeerId) {
        self.dispatch(PeerEvent::Closed {
            remote: remote.clone(),
        });
    }

    pub fn on_negotiation_error(&self, remote: &PeerId, reason: impl Into<String>) {
        self.dispatch(PeerEvent::NegotiationError {
            remote: remote.clone(),
            reason: reason.into(),
        });
    }

    pub fn on_link_failed(&self, reason: impl Into<String>) {
        self.dispatch(PeerEvent::LinkFailed {
            reason: reason.into(),
        });
    }

    fn dispatch(&self, event: PeerEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!(target = "skiff::events", "event receiver dropped");
        }
    }
}

#[derive(Debug)]
pub struct Events {
    rx: mpsc::UnboundedReceiver<PeerEvent>,
}

impl Events {
    pub async fn next(&mut self) -> Option<PeerEvent> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<PeerEvent> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_fires_once() {
        let (sink, mut events) = EventSink::channel();
        let identity = PeerId::new("a1").unwrap();
        sink.on_open(&identity);
        sink.clone().on_open(&identity);
        assert_eq!(events.try_next(), Some(PeerEvent::Open { identity }));
        assert_eq!(events.try_next(), None);
    }

    #[test]
    fn events_keep_dispatch_order() {
        let (sink, mut events) = EventSink::channel();
        let remote = PeerId::new("b1").unwrap();
        sink.on_connected(&remote);
        sink.on_message(&remote, Bytes::from_static(b"one"));
        sink.on_message(&remote, Bytes::from_static(b"two"));
        sink.on_closed(&remote);

        assert!(matches!(events.try_next(), Some(PeerEvent::Connected { .. })));
        assert!(matches!(
            events.try_next(),
            Some(PeerEvent::Message { payload, .. }) if payload == "one"
        ));
        assert!(matches!(
            events.try_next(),
            Some(PeerEvent::Message { payload, .. }) if payload == "two"
        ));
        assert!(matches!(events.try_next(), Some(PeerEvent::Closed { .. })));
    }
}
