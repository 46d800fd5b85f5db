//! Per-remote offer/answer state machine.
//!
//! The engine owns no tasks. Its owner feeds it relay messages, transport
//! events and consumer requests one at a time and awaits each handler to
//! completion, so every mutation below happens with exclusive access.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::channel::{ChannelManager, ChannelState};
use crate::config::{AddressingPolicy, DEFAULT_CHANNEL_LABEL};
use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::signaling::{LinkSender, PeerId, SignalingMessage, Verb};
use crate::transport::{
    IceCandidate, PeerTransport, SessionDescription, TransportEvent, TransportEventKind,
    TransportEvents, TransportFactory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    OfferCreated,
    OfferSent,
    RemoteDescriptionSet,
    OfferReceived,
    AnswerCreated,
    AnswerSent,
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    pub channel_label: String,
    pub addressing: AddressingPolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            addressing: AddressingPolicy::Drop,
        }
    }
}

pub struct NegotiationSession {
    remote: PeerId,
    role: Role,
    state: SessionState,
    transport: Arc<dyn PeerTransport>,
    local_set: bool,
    remote_set: bool,
    /// Remote candidates that arrived before both descriptions were applied.
    pending_candidates: Vec<IceCandidate>,
}

impl NegotiationSession {
    fn new(remote: PeerId, role: Role, state: SessionState, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            remote,
            role,
            state,
            transport,
            local_set: false,
            remote_set: false,
            pending_candidates: Vec::new(),
        }
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn queued_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    fn descriptions_applied(&self) -> bool {
        self.local_set && self.remote_set
    }

    fn is_live(&self) -> bool {
        self.state != SessionState::Closed
    }
}

pub struct NegotiationEngine {
    identity: Option<PeerId>,
    link: LinkSender,
    link_up: bool,
    factory: Arc<dyn TransportFactory>,
    sessions: HashMap<PeerId, NegotiationSession>,
    channels: ChannelManager,
    sink: EventSink,
    addressing: AddressingPolicy,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl NegotiationEngine {
    /// Transport events for every session are reported on `transport_tx`;
    /// the owner routes them back through
    /// [`NegotiationEngine::handle_transport_event`].
    pub fn new(
        link: LinkSender,
        factory: Arc<dyn TransportFactory>,
        sink: EventSink,
        options: EngineOptions,
        transport_tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            identity: None,
            link,
            link_up: true,
            factory,
            sessions: HashMap::new(),
            channels: ChannelManager::new(options.channel_label, sink.clone()),
            sink,
            addressing: options.addressing,
            transport_tx,
        }
    }

    pub fn identity(&self) -> Option<&PeerId> {
        self.identity.as_ref()
    }

    pub fn session(&self, remote: &PeerId) -> Option<&NegotiationSession> {
        self.sessions.get(remote)
    }

    pub fn session_state(&self, remote: &PeerId) -> Option<SessionState> {
        self.sessions.get(remote).map(NegotiationSession::state)
    }

    pub fn channel_state(&self, remote: &PeerId) -> Option<ChannelState> {
        self.channels.state(remote)
    }

    pub fn open_remotes(&self) -> Vec<PeerId> {
        self.channels.open_remotes()
    }

    /// The relay link is gone. Open channels keep working; nothing new can
    /// be negotiated.
    pub fn link_lost(&mut self) {
        self.link_up = false;
    }

    pub fn assign_identity(&mut self, identity: PeerId) -> Result<()> {
        if let Some(current) = &self.identity {
            if *current == identity {
                return Ok(());
            }
            return Err(Error::IdentityReassigned {
                current: current.clone(),
                attempted: identity,
            });
        }
        tracing::info!(target = "skiff::negotiation", identity = %identity, "identity assigned");
        self.sink.on_open(&identity);
        self.identity = Some(identity);
        Ok(())
    }

    pub async fn connect(&mut self, target: &PeerId) -> Result<()> {
        let local = self.negotiable_identity()?;
        self.ensure_new_session(target)?;

        let transport = self.create_transport(&local, target).await?;
        self.sessions.insert(
            target.clone(),
            NegotiationSession::new(
                target.clone(),
                Role::Initiator,
                SessionState::OfferCreated,
                Arc::clone(&transport),
            ),
        );
        tracing::debug!(target = "skiff::negotiation", remote = %target, role = ?Role::Initiator, "session started");

        if let Err(err) = self.send_offer(&local, target, transport).await {
            self.abort(target, &err).await;
            return Err(err);
        }
        Ok(())
    }

    async fn send_offer(
        &mut self,
        local: &PeerId,
        target: &PeerId,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<()> {
        // The offer only describes channels that already exist.
        self.channels
            .create_outbound(target, transport.as_ref())
            .await?;
        let offer = transport.create_offer().await?;
        self.set_state(target, SessionState::OfferCreated);
        let offer = transport.set_local_description(offer).await?;
        self.descriptions_changed(target, true, false).await;

        let payload = offer.to_payload().map_err(Error::Encode)?;
        self.link.send(&SignalingMessage::new(
            Verb::Offer,
            local.clone(),
            target.clone(),
            payload,
        ))?;
        self.set_state(target, SessionState::OfferSent);
        Ok(())
    }

    /// Entry point for every relay message after identity assignment.
    pub async fn handle_message(&mut self, message: SignalingMessage) -> Result<()> {
        let Some(local) = self.identity.clone() else {
            return Err(Error::LinkUnavailable);
        };
        if message.dest != local {
            return match self.addressing {
                AddressingPolicy::Drop => {
                    tracing::warn!(
                        target = "skiff::negotiation",
                        verb = %message.verb,
                        source = %message.source,
                        dest = %message.dest,
                        "dropping misaddressed frame"
                    );
                    Ok(())
                }
                AddressingPolicy::Fatal => Err(Error::Addressing {
                    dest: message.dest,
                    local,
                }),
            };
        }

        tracing::trace!(
            target = "skiff::negotiation",
            verb = %message.verb,
            source = %message.source,
            "inbound signaling message"
        );
        match message.verb {
            Verb::Offer => self.on_offer(&local, message.source, &message.payload).await,
            Verb::Answer => self.on_answer(message.source, &message.payload).await,
            Verb::Candidate => self.on_candidate(message.source, &message.payload).await,
            Verb::Unknown(verb) => {
                tracing::debug!(target = "skiff::negotiation", verb = %verb, "ignoring unknown verb");
                Ok(())
            }
        }
    }

    async fn on_offer(&mut self, local: &PeerId, source: PeerId, payload: &str) -> Result<()> {
        self.ensure_new_session(&source)?;
        let offer = SessionDescription::from_payload(payload).map_err(|err| Error::Payload {
            verb: "OFFER",
            remote: source.clone(),
            source: err,
        })?;
        if !self.link_up {
            return Err(Error::LinkUnavailable);
        }

        let transport = self.create_transport(local, &source).await?;
        self.sessions.insert(
            source.clone(),
            NegotiationSession::new(
                source.clone(),
                Role::Responder,
                SessionState::OfferReceived,
                Arc::clone(&transport),
            ),
        );
        tracing::debug!(target = "skiff::negotiation", remote = %source, role = ?Role::Responder, "session started");

        if let Err(err) = self.send_answer(local, &source, offer, transport).await {
            self.abort(&source, &err).await;
            return Err(err);
        }
        Ok(())
    }

    async fn send_answer(
        &mut self,
        local: &PeerId,
        source: &PeerId,
        offer: SessionDescription,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<()> {
        transport.set_remote_description(offer).await?;
        self.channels.prepare_inbound(source);
        self.descriptions_changed(source, false, true).await;

        let answer = transport.create_answer().await?;
        self.set_state(source, SessionState::AnswerCreated);
        let answer = transport.set_local_description(answer).await?;
        self.descriptions_changed(source, true, false).await;

        let payload = answer.to_payload().map_err(Error::Encode)?;
        self.link.send(&SignalingMessage::new(
            Verb::Answer,
            local.clone(),
            source.clone(),
            payload,
        ))?;
        self.set_state(source, SessionState::AnswerSent);
        Ok(())
    }

    async fn on_answer(&mut self, source: PeerId, payload: &str) -> Result<()> {
        let transport = match self.sessions.get(&source) {
            Some(session) if session.state == SessionState::OfferSent => {
                Arc::clone(&session.transport)
            }
            _ => return Err(Error::UnexpectedAnswer { remote: source }),
        };
        let answer = SessionDescription::from_payload(payload).map_err(|err| Error::Payload {
            verb: "ANSWER",
            remote: source.clone(),
            source: err,
        })?;

        if let Err(err) = transport.set_remote_description(answer).await {
            let err = Error::from(err);
            self.abort(&source, &err).await;
            return Err(err);
        }
        self.set_state(&source, SessionState::RemoteDescriptionSet);
        self.descriptions_changed(&source, false, true).await;
        Ok(())
    }

    async fn on_candidate(&mut self, source: PeerId, payload: &str) -> Result<()> {
        let Some(session) = self
            .sessions
            .get_mut(&source)
            .filter(|session| session.is_live())
        else {
            tracing::debug!(
                target = "skiff::negotiation",
                remote = %source,
                "dropping candidate with no live session"
            );
            return Ok(());
        };
        let candidate = IceCandidate::from_payload(payload).map_err(|err| Error::Payload {
            verb: "ICE",
            remote: source.clone(),
            source: err,
        })?;
        if !session.descriptions_applied() {
            session.pending_candidates.push(candidate);
            tracing::debug!(
                target = "skiff::negotiation",
                remote = %source,
                queued = session.pending_candidates.len(),
                "queued remote candidate"
            );
            return Ok(());
        }
        let transport = Arc::clone(&session.transport);
        transport.add_ice_candidate(candidate).await?;
        Ok(())
    }

    /// Records which descriptions are now applied and replays queued
    /// candidates once both are.
    async fn descriptions_changed(&mut self, remote: &PeerId, local: bool, remote_side: bool) {
        let Some(session) = self.sessions.get_mut(remote) else {
            return;
        };
        session.local_set |= local;
        session.remote_set |= remote_side;
        if !session.descriptions_applied() || session.pending_candidates.is_empty() {
            return;
        }
        let queued = std::mem::take(&mut session.pending_candidates);
        let transport = Arc::clone(&session.transport);
        tracing::debug!(
            target = "skiff::negotiation",
            remote = %remote,
            count = queued.len(),
            "replaying queued candidates"
        );
        for candidate in queued {
            if let Err(err) = transport.add_ice_candidate(candidate).await {
                tracing::warn!(
                    target = "skiff::negotiation",
                    remote = %remote,
                    error = %err,
                    "queued candidate rejected"
                );
            }
        }
    }

    pub async fn handle_transport_event(&mut self, event: TransportEvent) -> Result<()> {
        let TransportEvent { remote, kind } = event;
        match kind {
            TransportEventKind::LocalCandidate(candidate) => {
                self.send_local_candidate(&remote, candidate)
            }
            TransportEventKind::IncomingChannel(channel) => {
                if self.channels.bind_inbound(&remote, channel) {
                    self.sync_open(&remote);
                }
                Ok(())
            }
            TransportEventKind::ChannelOpen => {
                if self.channels.mark_open(&remote) {
                    self.sync_open(&remote);
                }
                Ok(())
            }
            TransportEventKind::ChannelMessage(payload) => {
                self.channels.deliver(&remote, payload);
                Ok(())
            }
            TransportEventKind::ChannelClosed => {
                self.channels.mark_closed(&remote);
                self.finish(&remote).await;
                Ok(())
            }
            TransportEventKind::ConnectionFailed => {
                tracing::warn!(target = "skiff::negotiation", remote = %remote, "peer connection failed");
                self.channels.mark_closed(&remote);
                self.finish(&remote).await;
                Ok(())
            }
        }
    }

    fn send_local_candidate(&mut self, remote: &PeerId, candidate: IceCandidate) -> Result<()> {
        let live = self.sessions.get(remote).is_some_and(NegotiationSession::is_live);
        let (Some(local), true) = (self.identity.clone(), live) else {
            tracing::debug!(
                target = "skiff::negotiation",
                remote = %remote,
                "discarding local candidate with no session"
            );
            return Ok(());
        };
        if !self.link_up {
            return Ok(());
        }
        let payload = candidate.to_payload().map_err(Error::Encode)?;
        self.link.send(&SignalingMessage::new(
            Verb::Candidate,
            local,
            remote.clone(),
            payload,
        ))?;
        Ok(())
    }

    /// Sends to the only open channel.
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        let open = self.channels.open_remotes();
        match open.as_slice() {
            [] => Err(Error::ChannelNotReady("no open channel".into())),
            [remote] => self.channels.send(remote, payload).await,
            _ => Err(Error::AmbiguousRemote(open.len())),
        }
    }

    pub async fn send_to(&self, remote: &PeerId, payload: Bytes) -> Result<()> {
        self.channels.send(remote, payload).await
    }

    pub async fn close(&mut self, remote: &PeerId) -> Result<()> {
        self.channels.close(remote).await?;
        self.finish(remote).await;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        self.channels.close_all().await;
        for (remote, session) in self.sessions.drain() {
            if let Err(err) = session.transport.close().await {
                tracing::debug!(target = "skiff::negotiation", remote = %remote, error = %err, "transport close failed");
            }
        }
    }

    /// One session per remote for the lifetime of the engine. A closed
    /// session keeps its entry, so the remote cannot be negotiated again.
    fn ensure_new_session(&self, remote: &PeerId) -> Result<()> {
        match self.sessions.get(remote) {
            None => Ok(()),
            Some(session) if session.is_live() => Err(Error::ConcurrentNegotiation {
                remote: remote.clone(),
            }),
            Some(_) => Err(Error::SessionEnded {
                remote: remote.clone(),
            }),
        }
    }

    fn negotiable_identity(&self) -> Result<PeerId> {
        match &self.identity {
            Some(identity) if self.link_up && !self.link.is_closed() => Ok(identity.clone()),
            _ => Err(Error::LinkUnavailable),
        }
    }

    async fn create_transport(
        &self,
        local: &PeerId,
        remote: &PeerId,
    ) -> Result<Arc<dyn PeerTransport>> {
        let events = TransportEvents::new(remote.clone(), self.transport_tx.clone());
        Ok(self.factory.create(local, events).await?)
    }

    fn set_state(&mut self, remote: &PeerId, state: SessionState) {
        if let Some(session) = self.sessions.get_mut(remote) {
            if session.state != state {
                tracing::debug!(
                    target = "skiff::negotiation",
                    remote = %remote,
                    from = ?session.state,
                    to = ?state,
                    "session state"
                );
                session.state = state;
            }
        }
    }

    fn sync_open(&mut self, remote: &PeerId) {
        if self.channels.state(remote) == Some(ChannelState::Open) {
            self.set_state(remote, SessionState::Open);
        }
    }

    /// Marks the session closed and releases its transport. The entry stays
    /// so late events for it are recognised as stale.
    async fn finish(&mut self, remote: &PeerId) {
        let transport = match self.sessions.get(remote) {
            Some(session) if session.is_live() => Arc::clone(&session.transport),
            _ => return,
        };
        self.set_state(remote, SessionState::Closed);
        if let Err(err) = transport.close().await {
            tracing::debug!(target = "skiff::negotiation", remote = %remote, error = %err, "transport close failed");
        }
    }

    async fn abort(&mut self, remote: &PeerId, err: &Error) {
        tracing::warn!(target = "skiff::negotiation", remote = %remote, error = %err, "negotiation failed");
        self.channels.mark_closed(remote);
        self.finish(remote).await;
    }
}
