//! The seam between negotiation and whatever actually moves bytes between
//! peers. Negotiation only ever talks to these traits; `webrtc` is the real
//! implementation and `mock` is an in-memory one for tests.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::signaling::PeerId;

pub mod mock;
pub mod webrtc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("transport not ready: {0}")]
    NotReady(String),
    #[error("channel closed")]
    ChannelClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// `{"type":"offer","sdp":"..."}`, the shape browsers produce for
/// `JSON.stringify(description)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_payload(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_payload(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

pub enum TransportEventKind {
    /// Connectivity candidate gathered locally; must be relayed to the remote.
    LocalCandidate(IceCandidate),
    /// The remote opened a data channel towards us.
    IncomingChannel(Arc<dyn DataChannel>),
    ChannelOpen,
    ChannelMessage(Bytes),
    ChannelClosed,
    ConnectionFailed,
}

impl fmt::Debug for TransportEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEventKind::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            TransportEventKind::IncomingChannel(channel) => f
                .debug_tuple("IncomingChannel")
                .field(&channel.label())
                .finish(),
            TransportEventKind::ChannelOpen => f.write_str("ChannelOpen"),
            TransportEventKind::ChannelMessage(payload) => f
                .debug_tuple("ChannelMessage")
                .field(&payload.len())
                .finish(),
            TransportEventKind::ChannelClosed => f.write_str("ChannelClosed"),
            TransportEventKind::ConnectionFailed => f.write_str("ConnectionFailed"),
        }
    }
}

#[derive(Debug)]
pub struct TransportEvent {
    pub remote: PeerId,
    pub kind: TransportEventKind,
}

/// Handed to each transport at creation; tags everything it reports with the
/// remote the transport was created for.
#[derive(Clone, Debug)]
pub struct TransportEvents {
    remote: PeerId,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportEvents {
    pub fn new(remote: PeerId, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { remote, tx }
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    /// Returns false once nobody is listening any more.
    pub fn emit(&self, kind: TransportEventKind) -> bool {
        self.tx
            .send(TransportEvent {
                remote: self.remote.clone(),
                kind,
            })
            .is_ok()
    }
}

/// One negotiated connection to one remote.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    /// Applies `description` locally and returns the description to send to
    /// the remote, which may differ once the transport has filled it in.
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn create_data_channel(&self, label: &str)
    -> Result<Arc<dyn DataChannel>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    async fn send(&self, payload: Bytes) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        local: &PeerId,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptions_use_browser_field_names() {
        let payload = SessionDescription::offer("v=0").to_payload().unwrap();
        assert_eq!(payload, r#"{"type":"offer","sdp":"v=0"}"#);
        let parsed = SessionDescription::from_payload(r#"{"sdp":"v=0","type":"answer"}"#).unwrap();
        assert_eq!(parsed, SessionDescription::answer("v=0"));
    }

    #[test]
    fn candidates_accept_browser_json() {
        let browser = r#"{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"abcd"}"#;
        let candidate = IceCandidate::from_payload(browser).unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert_eq!(candidate.username_fragment.as_deref(), Some("abcd"));

        let minimal = IceCandidate::from_payload(r#"{"candidate":"c"}"#).unwrap();
        assert_eq!(minimal, IceCandidate::new("c"));
    }
}
