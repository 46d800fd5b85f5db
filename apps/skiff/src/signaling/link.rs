use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

use super::wire::{FrameError, PeerId, SignalingMessage};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("relay connect failed: {0}")]
    Connect(String),
    #[error("relay link closed")]
    Closed,
    #[error("first relay frame is not a peer identity: {0:?}")]
    IdentityMalformed(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug)]
pub enum LinkEvent {
    /// The relay's first frame: our identifier for the lifetime of the link.
    Identity(PeerId),
    Message(SignalingMessage),
    /// A protocol error. The link stops reading after reporting one.
    Failed(LinkError),
    Closed,
}

/// Outbound half of a relay link. Cheap to clone; every clone feeds the same
/// writer so frames leave in the order `send` was called.
#[derive(Clone, Debug)]
pub struct LinkSender {
    tx: mpsc::UnboundedSender<String>,
}

impl LinkSender {
    pub fn send(&self, message: &SignalingMessage) -> Result<(), LinkError> {
        tracing::trace!(
            target = "skiff::signaling",
            verb = %message.verb,
            dest = %message.dest,
            len = message.payload.len(),
            "ws_out"
        );
        self.tx
            .send(message.to_string())
            .map_err(|_| LinkError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Inbound half of a relay link: parsed frames in arrival order.
#[derive(Debug)]
pub struct LinkEvents {
    rx: mpsc::UnboundedReceiver<LinkEvent>,
}

impl LinkEvents {
    pub async fn next(&mut self) -> Option<LinkEvent> {
        self.rx.recv().await
    }
}

/// Turns raw relay frames into link events. The first frame is the identity
/// assignment; everything after it must parse as a signaling message.
#[derive(Debug, Default)]
struct FrameDecoder {
    identified: bool,
    failed: bool,
}

impl FrameDecoder {
    fn decode(&mut self, frame: &str) -> Option<LinkEvent> {
        if self.failed {
            return None;
        }
        let event = if !self.identified {
            match PeerId::new(frame.trim()) {
                Ok(identity) => {
                    self.identified = true;
                    LinkEvent::Identity(identity)
                }
                Err(_) => LinkEvent::Failed(LinkError::IdentityMalformed(frame.to_string())),
            }
        } else {
            match SignalingMessage::parse(frame) {
                Ok(message) => LinkEvent::Message(message),
                Err(err) => LinkEvent::Failed(LinkError::Frame(err)),
            }
        };
        if matches!(event, LinkEvent::Failed(_)) {
            self.failed = true;
        }
        Some(event)
    }
}

pub struct SignalingLink;

impl SignalingLink {
    /// Connects to the relay and starts the reader and writer tasks. The
    /// identity arrives later as the first [`LinkEvent`].
    pub async fn open(
        url: &Url,
        keepalive: Option<Duration>,
    ) -> Result<(LinkSender, LinkEvents), LinkError> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| LinkError::Connect(format!("{url}: {err}")))?;
        tracing::debug!(target = "skiff::signaling", url = %url, "relay websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<LinkEvent>();

        tokio::spawn(async move {
            let mut ticker = keepalive.map(|period| {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker
            });
            loop {
                tokio::select! {
                    outbound = send_rx.recv() => {
                        let Some(text) = outbound else {
                            let _ = ws_write.close().await;
                            break;
                        };
                        if let Err(err) = ws_write.send(Message::Text(text)).await {
                            tracing::debug!(target = "skiff::signaling", error = %err, "relay write failed");
                            break;
                        }
                    }
                    _ = keepalive_tick(ticker.as_mut()) => {
                        if ws_write.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        tokio::spawn(async move {
            let mut decoder = FrameDecoder::default();
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::warn!(target = "skiff::signaling", "dropping non-utf8 relay frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target = "skiff::signaling", "relay websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target = "skiff::signaling", "relay websocket error: {err}");
                            }
                        }
                        break;
                    }
                };
                tracing::trace!(target = "skiff::signaling", len = text.len(), "ws_in");
                let Some(event) = decoder.decode(&text) else {
                    continue;
                };
                let fatal = matches!(event, LinkEvent::Failed(_));
                if event_tx.send(event).is_err() || fatal {
                    return;
                }
            }
            let _ = event_tx.send(LinkEvent::Closed);
        });

        Ok((LinkSender { tx: send_tx }, LinkEvents { rx: event_rx }))
    }

    /// An in-process link with no socket behind it. The returned [`RelayEnd`]
    /// plays the relay: it injects raw frames and observes what was sent.
    pub fn local() -> (LinkSender, LinkEvents, RelayEnd) {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            LinkSender { tx: send_tx },
            LinkEvents { rx: event_rx },
            RelayEnd {
                decoder: FrameDecoder::default(),
                events: event_tx,
                sent: send_rx,
            },
        )
    }
}

async fn keepalive_tick(ticker: Option<&mut tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

pub struct RelayEnd {
    decoder: FrameDecoder,
    events: mpsc::UnboundedSender<LinkEvent>,
    sent: mpsc::UnboundedReceiver<String>,
}

impl RelayEnd {
    /// Delivers a raw frame exactly as the relay would put it on the socket.
    pub fn push(&mut self, frame: impl AsRef<str>) {
        if let Some(event) = self.decoder.decode(frame.as_ref()) {
            let _ = self.events.send(event);
        }
    }

    pub fn close(&self) {
        let _ = self.events.send(LinkEvent::Closed);
    }

    pub async fn next_sent(&mut self) -> Option<String> {
        self.sent.recv().await
    }

    pub fn try_next_sent(&mut self) -> Option<String> {
        self.sent.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::wire::Verb;

    #[test]
    fn first_frame_is_identity() {
        let mut decoder = FrameDecoder::default();
        match decoder.decode("a1\n") {
            Some(LinkEvent::Identity(id)) => assert_eq!(id.as_str(), "a1"),
            other => panic!("unexpected event {other:?}"),
        }
        match decoder.decode("OFFER b1 a1 {}") {
            Some(LinkEvent::Message(message)) => assert_eq!(message.verb, Verb::Offer),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn structured_first_frame_is_a_protocol_error() {
        let mut decoder = FrameDecoder::default();
        assert!(matches!(
            decoder.decode("OFFER b1 a1 {}"),
            Some(LinkEvent::Failed(LinkError::IdentityMalformed(_)))
        ));
        assert!(decoder.decode("a1").is_none());
    }

    #[test]
    fn malformed_frame_stops_decoding() {
        let mut decoder = FrameDecoder::default();
        decoder.decode("a1");
        assert!(matches!(
            decoder.decode("OFFER"),
            Some(LinkEvent::Failed(LinkError::Frame(FrameError::Malformed(_))))
        ));
        assert!(decoder.decode("OFFER b1 a1 {}").is_none());
    }

    #[tokio::test]
    async fn local_link_round_trips_frames() {
        let (sender, mut events, mut relay) = SignalingLink::local();
        relay.push("a1");
        relay.push("ICE b1 a1 {\"candidate\":\"c\"}");
        assert!(matches!(events.next().await, Some(LinkEvent::Identity(_))));
        assert!(matches!(events.next().await, Some(LinkEvent::Message(_))));

        let message = SignalingMessage::new(
            Verb::Answer,
            PeerId::new("a1").unwrap(),
            PeerId::new("b1").unwrap(),
            "{}",
        );
        sender.send(&message).unwrap();
        assert_eq!(relay.next_sent().await.as_deref(), Some("ANSWER a1 b1 {}"));

        drop(relay);
        assert!(matches!(sender.send(&message), Err(LinkError::Closed)));
    }
}
