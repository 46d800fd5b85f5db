//! In-memory transport. Endpoints created from the same [`MockNetwork`] find
//! each other by `(local, remote)` and "connect" once both sides have applied
//! both descriptions and received at least one remote candidate, which is the
//! same ordering a real ICE agent needs.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{
    DataChannel, IceCandidate, PeerTransport, SdpKind, SessionDescription, TransportError,
    TransportEventKind, TransportEvents, TransportFactory,
};
use crate::signaling::PeerId;

type EndpointKey = (PeerId, PeerId);

#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<EndpointKey, Endpoint>,
}

struct Endpoint {
    events: TransportEvents,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
    channels: Vec<Arc<MockChannel>>,
    connected: bool,
    closed: bool,
}

/// What one side of a mock connection has seen so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSnapshot {
    pub local: Option<SessionDescription>,
    pub remote: Option<SessionDescription>,
    pub remote_candidates: Vec<IceCandidate>,
    pub connected: bool,
    pub closed: bool,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> Arc<dyn TransportFactory> {
        Arc::new(MockFactory {
            network: self.clone(),
        })
    }

    pub fn snapshot(&self, local: &PeerId, remote: &PeerId) -> Option<EndpointSnapshot> {
        let state = self.inner.lock();
        state
            .endpoints
            .get(&(local.clone(), remote.clone()))
            .map(|endpoint| EndpointSnapshot {
                local: endpoint.local.clone(),
                remote: endpoint.remote.clone(),
                remote_candidates: endpoint.remote_candidates.clone(),
                connected: endpoint.connected,
                closed: endpoint.closed,
            })
    }

    /// Simulates the connectivity checks giving up on `local`'s side.
    pub fn fail_connection(&self, local: &PeerId, remote: &PeerId) {
        let state = self.inner.lock();
        if let Some(endpoint) = state.endpoints.get(&(local.clone(), remote.clone())) {
            endpoint.events.emit(TransportEventKind::ConnectionFailed);
        }
    }

    /// A channel that belongs to no endpoint; sends on it always fail.
    pub fn detached_channel(label: &str) -> Arc<dyn DataChannel> {
        Arc::new(MockChannel {
            label: label.to_string(),
            network: MockNetwork::new(),
            route: None,
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn with_endpoint<T>(
        &self,
        key: &EndpointKey,
        f: impl FnOnce(&mut Endpoint) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut state = self.inner.lock();
        let endpoint = state
            .endpoints
            .get_mut(key)
            .ok_or(TransportError::ChannelClosed)?;
        if endpoint.closed {
            return Err(TransportError::ChannelClosed);
        }
        f(endpoint)
    }

    fn try_connect(&self, key: &EndpointKey) {
        let mut state = self.inner.lock();
        let mirror_key = (key.1.clone(), key.0.clone());
        let ready = |endpoint: Option<&Endpoint>| {
            endpoint.is_some_and(|endpoint| {
                !endpoint.closed
                    && !endpoint.connected
                    && endpoint.local.is_some()
                    && endpoint.remote.is_some()
                    && !endpoint.remote_candidates.is_empty()
            })
        };
        if !ready(state.endpoints.get(key)) || !ready(state.endpoints.get(&mirror_key)) {
            return;
        }

        for (from, to) in [(key.clone(), mirror_key.clone()), (mirror_key, key.clone())] {
            let outbound = match state.endpoints.get_mut(&from) {
                Some(endpoint) => {
                    endpoint.connected = true;
                    endpoint.channels.clone()
                }
                None => continue,
            };
            for channel in outbound {
                channel.open.store(true, Ordering::SeqCst);
                let mirror = Arc::new(MockChannel {
                    label: channel.label.clone(),
                    network: self.clone(),
                    route: Some(to.clone()),
                    open: AtomicBool::new(true),
                    closed: AtomicBool::new(false),
                });
                if let Some(endpoint) = state.endpoints.get(&to) {
                    endpoint
                        .events
                        .emit(TransportEventKind::IncomingChannel(mirror));
                    endpoint.events.emit(TransportEventKind::ChannelOpen);
                }
                if let Some(endpoint) = state.endpoints.get(&from) {
                    endpoint.events.emit(TransportEventKind::ChannelOpen);
                }
            }
        }
    }

    fn deliver(&self, to: &EndpointKey, kind: TransportEventKind) -> Result<(), TransportError> {
        let state = self.inner.lock();
        match state.endpoints.get(to) {
            Some(endpoint) if !endpoint.closed => {
                endpoint.events.emit(kind);
                Ok(())
            }
            _ => Err(TransportError::ChannelClosed),
        }
    }
}

struct MockFactory {
    network: MockNetwork,
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn create(
        &self,
        local: &PeerId,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let key = (local.clone(), events.remote().clone());
        let mut state = self.network.inner.lock();
        if state
            .endpoints
            .get(&key)
            .is_some_and(|endpoint| !endpoint.closed)
        {
            return Err(TransportError::Setup(format!(
                "endpoint {} -> {} already exists",
                key.0, key.1
            )));
        }
        state.endpoints.insert(
            key.clone(),
            Endpoint {
                events,
                local: None,
                remote: None,
                remote_candidates: Vec::new(),
                channels: Vec::new(),
                connected: false,
                closed: false,
            },
        );
        Ok(Arc::new(MockTransport {
            network: self.network.clone(),
            key,
        }))
    }
}

pub struct MockTransport {
    network: MockNetwork,
    key: EndpointKey,
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.network.with_endpoint(&self.key, |endpoint| {
            Ok(SessionDescription::offer(format!(
                "mock-offer from={} channels={}",
                self.key.0,
                endpoint.channels.len()
            )))
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.network.with_endpoint(&self.key, |endpoint| {
            match &endpoint.remote {
                Some(remote) if remote.kind == SdpKind::Offer => Ok(SessionDescription::answer(
                    format!("mock-answer from={}", self.key.0),
                )),
                _ => Err(TransportError::NotReady(
                    "answer requires a remote offer".into(),
                )),
            }
        })
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        let applied = self.network.with_endpoint(&self.key, |endpoint| {
            endpoint.local = Some(description.clone());
            endpoint.events.emit(TransportEventKind::LocalCandidate(IceCandidate {
                candidate: format!("candidate:mock 1 udp 1 {} 9 typ host", self.key.0),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }));
            Ok(description)
        })?;
        self.network.try_connect(&self.key);
        Ok(applied)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.network.with_endpoint(&self.key, |endpoint| {
            if description.kind == SdpKind::Answer && endpoint.local.is_none() {
                return Err(TransportError::NotReady(
                    "answer applied without a local offer".into(),
                ));
            }
            endpoint.remote = Some(description);
            Ok(())
        })?;
        self.network.try_connect(&self.key);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.network.with_endpoint(&self.key, |endpoint| {
            if endpoint.remote.is_none() {
                return Err(TransportError::NotReady(
                    "remote description not set".into(),
                ));
            }
            endpoint.remote_candidates.push(candidate);
            Ok(())
        })?;
        self.network.try_connect(&self.key);
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let channel = Arc::new(MockChannel {
            label: label.to_string(),
            network: self.network.clone(),
            route: Some(self.key.clone()),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.network.with_endpoint(&self.key, |endpoint| {
            endpoint.channels.push(Arc::clone(&channel));
            Ok(())
        })?;
        Ok(channel)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let channels = {
            let mut state = self.network.inner.lock();
            match state.endpoints.get_mut(&self.key) {
                Some(endpoint) if !endpoint.closed => {
                    endpoint.closed = true;
                    std::mem::take(&mut endpoint.channels)
                }
                _ => return Ok(()),
            }
        };
        for channel in channels {
            let _ = channel.close().await;
        }
        Ok(())
    }
}

/// One end of a mock data channel. `route` is the `(owner, remote)` key of
/// the endpoint that owns it; payloads are delivered to the mirrored key.
pub struct MockChannel {
    label: String,
    network: MockNetwork,
    route: Option<EndpointKey>,
    open: AtomicBool,
    closed: AtomicBool,
}

impl MockChannel {
    fn peer_key(&self) -> Option<EndpointKey> {
        self.route
            .as_ref()
            .map(|(owner, remote)| (remote.clone(), owner.clone()))
    }
}

#[async_trait]
impl DataChannel for MockChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::NotReady("data channel not open".into()));
        }
        let peer = self.peer_key().ok_or(TransportError::ChannelClosed)?;
        self.network
            .deliver(&peer, TransportEventKind::ChannelMessage(payload))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(peer) = self.peer_key() {
            let _ = self.network.deliver(&peer, TransportEventKind::ChannelClosed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportEvent;
    use tokio::sync::mpsc;

    fn peer(id: &str) -> PeerId {
        PeerId::new(id).unwrap()
    }

    async fn endpoint(
        network: &MockNetwork,
        local: &str,
        remote: &str,
    ) -> (Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = network
            .factory()
            .create(&peer(local), TransportEvents::new(peer(remote), tx))
            .await
            .unwrap();
        (transport, rx)
    }

    #[tokio::test]
    async fn candidate_before_remote_description_faults() {
        let network = MockNetwork::new();
        let (transport, _rx) = endpoint(&network, "a1", "b1").await;
        let err = transport
            .add_ice_candidate(IceCandidate::new("c"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotReady(_)));
    }

    #[tokio::test]
    async fn full_exchange_opens_both_sides() {
        let network = MockNetwork::new();
        let (offerer, mut offer_rx) = endpoint(&network, "a1", "b1").await;
        let (answerer, mut answer_rx) = endpoint(&network, "b1", "a1").await;

        let channel = offerer.create_data_channel("DATACHANNEL").await.unwrap();
        let offer = offerer.create_offer().await.unwrap();
        let offer = offerer.set_local_description(offer).await.unwrap();
        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        let answer = answerer.set_local_description(answer).await.unwrap();
        offerer.set_remote_description(answer).await.unwrap();
        offerer
            .add_ice_candidate(IceCandidate::new("from-b"))
            .await
            .unwrap();
        assert!(!network.snapshot(&peer("a1"), &peer("b1")).unwrap().connected);
        answerer
            .add_ice_candidate(IceCandidate::new("from-a"))
            .await
            .unwrap();
        assert!(network.snapshot(&peer("b1"), &peer("a1")).unwrap().connected);

        let mut incoming = None;
        while let Ok(event) = answer_rx.try_recv() {
            if let TransportEventKind::IncomingChannel(channel) = event.kind {
                incoming = Some(channel);
            }
        }
        let incoming = incoming.expect("incoming channel");
        assert_eq!(incoming.label(), "DATACHANNEL");

        channel.send(Bytes::from_static(b"hi")).await.unwrap();
        let received = loop {
            let event = answer_rx.recv().await.unwrap();
            if let TransportEventKind::ChannelMessage(payload) = event.kind {
                break payload;
            }
        };
        assert_eq!(received, Bytes::from_static(b"hi"));

        incoming.send(Bytes::from_static(b"back")).await.unwrap();
        let received = loop {
            let event = offer_rx.recv().await.unwrap();
            if let TransportEventKind::ChannelMessage(payload) = event.kind {
                break payload;
            }
        };
        assert_eq!(received, Bytes::from_static(b"back"));
    }
}
