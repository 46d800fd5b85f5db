use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{EventSink, Events};
use crate::negotiation::{EngineOptions, NegotiationEngine};
use crate::signaling::{LinkError, LinkEvent, LinkEvents, LinkSender, PeerId, SignalingLink};
use crate::transport::{TransportEvent, TransportFactory};

enum Command {
    Connect {
        target: PeerId,
        reply: oneshot::Sender<Result<()>>,
    },
    Send {
        target: Option<PeerId>,
        payload: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        target: PeerId,
        reply: oneshot::Sender<Result<()>>,
    },
    Identity {
        reply: oneshot::Sender<Option<PeerId>>,
    },
}

/// Handle to a running peer. Clones share one actor; the actor stops and
/// closes every transport once the last handle is dropped.
#[derive(Clone, Debug)]
pub struct Peer {
    commands: mpsc::UnboundedSender<Command>,
}

impl Peer {
    /// Connects to the relay described by `config` and starts the actor.
    /// `PeerEvent::Open` follows once the relay assigns an identity.
    pub async fn open(config: &Config, factory: Arc<dyn TransportFactory>) -> Result<(Peer, Events)> {
        let url = config
            .relay_url()
            .map_err(|err| LinkError::Connect(err.to_string()))?;
        let (link, link_events) = SignalingLink::open(&url, config.keepalive).await?;
        Ok(Self::attach(
            link,
            link_events,
            factory,
            config.engine_options(),
        ))
    }

    /// Starts the actor on an already open link. Must be called from within
    /// a tokio runtime.
    pub fn attach(
        link: LinkSender,
        link_events: LinkEvents,
        factory: Arc<dyn TransportFactory>,
        options: EngineOptions,
    ) -> (Peer, Events) {
        let (sink, events) = EventSink::channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let engine = NegotiationEngine::new(link, factory, sink.clone(), options, transport_tx);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let actor = PeerActor {
            engine,
            sink,
            link_events: Some(link_events),
        };
        tokio::spawn(actor.run(command_rx, transport_rx));
        (Peer { commands }, events)
    }

    pub async fn connect(&self, target: &PeerId) -> Result<()> {
        self.request(|reply| Command::Connect {
            target: target.clone(),
            reply,
        })
        .await?
    }

    /// Sends on the only open channel.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        self.request(|reply| Command::Send {
            target: None,
            payload,
            reply,
        })
        .await?
    }

    pub async fn send_to(&self, target: &PeerId, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        self.request(|reply| Command::Send {
            target: Some(target.clone()),
            payload,
            reply,
        })
        .await?
    }

    pub async fn close(&self, target: &PeerId) -> Result<()> {
        self.request(|reply| Command::Close {
            target: target.clone(),
            reply,
        })
        .await?
    }

    /// `None` until the relay has assigned one.
    pub async fn identity(&self) -> Result<Option<PeerId>> {
        self.request(|reply| Command::Identity { reply }).await
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| Error::Shutdown)?;
        response.await.map_err(|_| Error::Shutdown)
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Connect { target, .. } => f.debug_struct("Connect").field("target", target).finish(),
            Command::Send { target, payload, .. } => f
                .debug_struct("Send")
                .field("target", target)
                .field("len", &payload.len())
                .finish(),
            Command::Close { target, .. } => f.debug_struct("Close").field("target", target).finish(),
            Command::Identity { .. } => f.write_str("Identity"),
        }
    }
}

/// Single consumer of consumer commands, relay events and transport events.
/// Each is handled to completion before the next is taken.
struct PeerActor {
    engine: NegotiationEngine,
    sink: EventSink,
    /// `None` once the link has closed or failed.
    link_events: Option<LinkEvents>,
}

impl PeerActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    self.handle_command(command).await;
                }
                event = next_link_event(self.link_events.as_mut()) => {
                    self.handle_link_event(event).await;
                }
                Some(event) = transport_rx.recv() => {
                    let remote = event.remote.clone();
                    if let Err(err) = self.engine.handle_transport_event(event).await {
                        if err.is_fatal() {
                            self.fail_link(err);
                        } else {
                            tracing::warn!(target = "skiff::peer", remote = %remote, error = %err, "transport event failed");
                        }
                    }
                }
            }
        }
        tracing::debug!(target = "skiff::peer", "all handles dropped; shutting down");
        self.engine.shutdown().await;
    }

    async fn handle_command(&mut self, command: Command) {
        tracing::trace!(target = "skiff::peer", ?command, "command");
        match command {
            Command::Connect { target, reply } => {
                let _ = reply.send(self.engine.connect(&target).await);
            }
            Command::Send {
                target,
                payload,
                reply,
            } => {
                let result = match target {
                    Some(target) => self.engine.send_to(&target, payload).await,
                    None => self.engine.send(payload).await,
                };
                let _ = reply.send(result);
            }
            Command::Close { target, reply } => {
                let _ = reply.send(self.engine.close(&target).await);
            }
            Command::Identity { reply } => {
                let _ = reply.send(self.engine.identity().cloned());
            }
        }
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Identity(identity) => {
                if let Err(err) = self.engine.assign_identity(identity) {
                    self.fail_link(err);
                }
            }
            LinkEvent::Message(message) => {
                let source = message.source.clone();
                match self.engine.handle_message(message).await {
                    Ok(()) => {}
                    Err(err) if err.is_fatal() => self.fail_link(err),
                    Err(err) => {
                        tracing::warn!(target = "skiff::peer", remote = %source, error = %err, "rejected signaling message");
                        self.sink.on_negotiation_error(&source, err.to_string());
                    }
                }
            }
            LinkEvent::Failed(err) => self.fail_link(link_failure(err)),
            LinkEvent::Closed => self.fail_link(Error::Link(LinkError::Closed)),
        }
    }

    fn fail_link(&mut self, err: Error) {
        if self.link_events.take().is_none() {
            return;
        }
        tracing::warn!(target = "skiff::peer", error = %err, "relay link lost");
        self.engine.link_lost();
        self.sink.on_link_failed(err.to_string());
    }
}

fn link_failure(err: LinkError) -> Error {
    match err {
        LinkError::Frame(frame) => Error::MalformedFrame(frame),
        other => Error::Link(other),
    }
}

async fn next_link_event(events: Option<&mut LinkEvents>) -> LinkEvent {
    match events {
        Some(events) => events.next().await.unwrap_or(LinkEvent::Closed),
        None => std::future::pending().await,
    }
}
