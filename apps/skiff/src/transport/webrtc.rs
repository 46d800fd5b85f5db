use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{
    DataChannel, IceCandidate, PeerTransport, SdpKind, SessionDescription, TransportError,
    TransportEventKind, TransportEvents, TransportFactory,
};
use crate::signaling::PeerId;

/// Builds one `RTCPeerConnection` per remote, all sharing a single API
/// instance and ICE server list.
pub struct WebRtcTransportFactory {
    api: API,
    configuration: RTCConfiguration,
}

impl WebRtcTransportFactory {
    pub fn new(stun_urls: &[String]) -> Result<Self, TransportError> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(Duration::from_secs(3)),
            Some(Duration::from_secs(10)),
            Some(Duration::from_millis(500)),
        );
        Self::with_setting_engine(setting, stun_urls)
    }

    /// For callers that need their own network setup, e.g. a virtual network
    /// in tests.
    pub fn with_setting_engine(
        setting: SettingEngine,
        stun_urls: &[String],
    ) -> Result<Self, TransportError> {
        let ice_servers = if stun_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: stun_urls.to_vec(),
                ..Default::default()
            }]
        };
        Ok(Self {
            api: build_api(setting)?,
            configuration: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
        })
    }
}

fn build_api(setting: SettingEngine) -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        local: &PeerId,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.configuration.clone())
                .await
                .map_err(to_setup_error)?,
        );
        tracing::debug!(
            target = "skiff::transport::webrtc",
            local = %local,
            remote = %events.remote(),
            "peer connection created"
        );

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    tracing::trace!(
                        target = "skiff::transport::webrtc",
                        remote = %events.remote(),
                        "candidate gathering complete"
                    );
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        events.emit(TransportEventKind::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "skiff::transport::webrtc",
                            remote = %events.remote(),
                            error = %err,
                            "failed to serialize local candidate"
                        );
                    }
                }
            })
        }));

        let channel_events = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let events = channel_events.clone();
            Box::pin(async move {
                tracing::debug!(
                    target = "skiff::transport::webrtc",
                    remote = %events.remote(),
                    label = dc.label(),
                    "incoming data channel"
                );
                let channel = WebRtcDataChannel::attach(Arc::clone(&dc), events.clone());
                events.emit(TransportEventKind::IncomingChannel(Arc::new(channel)));
                // on_open may already have fired before the handler was set.
                if dc.ready_state() == RTCDataChannelState::Open {
                    events.emit(TransportEventKind::ChannelOpen);
                }
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                tracing::debug!(
                    target = "skiff::transport::webrtc",
                    remote = %events.remote(),
                    ?state,
                    "peer connection state changed"
                );
                if state == RTCPeerConnectionState::Failed {
                    events.emit(TransportEventKind::ConnectionFailed);
                }
            })
        }));

        Ok(Arc::new(WebRtcTransport { pc, events }))
    }
}

struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    events: TransportEvents,
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(to_setup_error)?;
        Ok(description_to_payload(&offer, SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(to_setup_error)?;
        Ok(description_to_payload(&answer, SdpKind::Answer))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        let kind = description.kind;
        let rtc = description_from_payload(&description)?;
        self.pc
            .set_local_description(rtc)
            .await
            .map_err(to_setup_error)?;
        let applied = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Setup("missing local description".into()))?;
        Ok(description_to_payload(&applied, kind))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let rtc = description_from_payload(&description)?;
        self.pc
            .set_remote_description(rtc)
            .await
            .map_err(to_setup_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if self.pc.remote_description().await.is_none() {
            return Err(TransportError::NotReady(
                "remote description not set".into(),
            ));
        }
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(to_setup_error)
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(to_setup_error)?;
        Ok(Arc::new(WebRtcDataChannel::attach(dc, self.events.clone())))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await.map_err(to_setup_error)
    }
}

struct WebRtcDataChannel {
    inner: Arc<RTCDataChannel>,
    label: String,
}

impl WebRtcDataChannel {
    /// Wires the channel's callbacks into `events`. Handlers are registered
    /// before the wrapper is handed out so no open or message is missed.
    fn attach(dc: Arc<RTCDataChannel>, events: TransportEvents) -> Self {
        let open_events = events.clone();
        dc.on_open(Box::new(move || {
            let events = open_events.clone();
            Box::pin(async move {
                tracing::debug!(
                    target = "skiff::transport::webrtc",
                    remote = %events.remote(),
                    "data channel opened"
                );
                events.emit(TransportEventKind::ChannelOpen);
            })
        }));

        let message_events = events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = message_events.clone();
            Box::pin(async move {
                tracing::trace!(
                    target = "skiff::transport::webrtc",
                    remote = %events.remote(),
                    frame_len = msg.data.len(),
                    "received frame"
                );
                events.emit(TransportEventKind::ChannelMessage(msg.data));
            })
        }));

        let error_events = events.clone();
        dc.on_error(Box::new(move |err| {
            let events = error_events.clone();
            Box::pin(async move {
                tracing::warn!(
                    target = "skiff::transport::webrtc",
                    remote = %events.remote(),
                    error = %err,
                    "data channel error"
                );
            })
        }));

        let close_events = events;
        dc.on_close(Box::new(move || {
            let events = close_events.clone();
            Box::pin(async move {
                tracing::debug!(
                    target = "skiff::transport::webrtc",
                    remote = %events.remote(),
                    "data channel closed"
                );
                events.emit(TransportEventKind::ChannelClosed);
            })
        }));

        let label = dc.label().to_string();
        Self { inner: dc, label }
    }
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        match self.inner.ready_state() {
            RTCDataChannelState::Open => {}
            RTCDataChannelState::Closing | RTCDataChannelState::Closed => {
                return Err(TransportError::ChannelClosed);
            }
            state => {
                return Err(TransportError::NotReady(format!("data channel {state}")));
            }
        }
        let sent = match outbound_frame(payload) {
            OutboundFrame::Text(text) => self.inner.send_text(text).await,
            OutboundFrame::Binary(bytes) => self.inner.send(&bytes).await,
        };
        sent.map(|_| ()).map_err(to_setup_error)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await.map_err(to_setup_error)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum OutboundFrame {
    Text(String),
    Binary(Bytes),
}

/// Browser peers read string messages from `onmessage`, so UTF-8 payloads go
/// out as text frames.
fn outbound_frame(payload: Bytes) -> OutboundFrame {
    match String::from_utf8(payload.to_vec()) {
        Ok(text) => OutboundFrame::Text(text),
        Err(_) => OutboundFrame::Binary(payload),
    }
}

fn description_to_payload(desc: &RTCSessionDescription, kind: SdpKind) -> SessionDescription {
    SessionDescription {
        kind,
        sdp: desc.sdp.clone(),
    }
}

fn description_from_payload(
    payload: &SessionDescription,
) -> Result<RTCSessionDescription, TransportError> {
    let description = match payload.kind {
        SdpKind::Offer => RTCSessionDescription::offer(payload.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(payload.sdp.clone()),
    };
    description.map_err(|err| TransportError::Setup(err.to_string()))
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_sdp_is_a_setup_error() {
        let err = description_from_payload(&SessionDescription::offer("not sdp")).unwrap_err();
        assert!(matches!(err, TransportError::Setup(_)));
    }

    #[test]
    fn utf8_payloads_go_out_as_text() {
        assert_eq!(
            outbound_frame(Bytes::from_static("héllo".as_bytes())),
            OutboundFrame::Text("héllo".to_string())
        );
        assert_eq!(
            outbound_frame(Bytes::from_static(&[0xff, 0x00])),
            OutboundFrame::Binary(Bytes::from_static(&[0xff, 0x00]))
        );
    }

    #[test]
    fn empty_stun_list_means_host_candidates_only() {
        let factory = WebRtcTransportFactory::new(&[]).unwrap();
        assert!(factory.configuration.ice_servers.is_empty());

        let factory =
            WebRtcTransportFactory::new(&["stun:127.0.0.1:3478".to_string()]).unwrap();
        assert_eq!(
            factory.configuration.ice_servers[0].urls,
            vec!["stun:127.0.0.1:3478".to_string()]
        );
    }
}
