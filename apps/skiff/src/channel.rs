use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::signaling::PeerId;
use crate::transport::{DataChannel, PeerTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Created,
    Open,
    Closed,
}

struct ManagedChannel {
    state: ChannelState,
    channel: Option<Arc<dyn DataChannel>>,
    inbound_expected: bool,
    /// The transport reported open before the inbound channel was bound.
    open_signalled: bool,
    /// Payloads that beat the open signal through the event queue.
    pending: Vec<Bytes>,
}

impl ManagedChannel {
    fn created(channel: Option<Arc<dyn DataChannel>>, inbound_expected: bool) -> Self {
        Self {
            state: ChannelState::Created,
            channel,
            inbound_expected,
            open_signalled: false,
            pending: Vec::new(),
        }
    }
}

/// Owns the data channel of every session, whichever side created it, and
/// turns the transport's open/close/message signals into consumer events.
pub struct ChannelManager {
    label: String,
    channels: HashMap<PeerId, ManagedChannel>,
    sink: EventSink,
}

impl ChannelManager {
    pub fn new(label: impl Into<String>, sink: EventSink) -> Self {
        Self {
            label: label.into(),
            channels: HashMap::new(),
            sink,
        }
    }

    pub fn state(&self, remote: &PeerId) -> Option<ChannelState> {
        self.channels.get(remote).map(|managed| managed.state)
    }

    pub fn open_remotes(&self) -> Vec<PeerId> {
        let mut remotes: Vec<PeerId> = self
            .channels
            .iter()
            .filter(|(_, managed)| managed.state == ChannelState::Open)
            .map(|(remote, _)| remote.clone())
            .collect();
        remotes.sort();
        remotes
    }

    /// Initiator side: must run before the offer is created, since the offer
    /// only describes channels that already exist.
    pub async fn create_outbound(
        &mut self,
        remote: &PeerId,
        transport: &dyn PeerTransport,
    ) -> Result<()> {
        let channel = transport.create_data_channel(&self.label).await?;
        tracing::debug!(
            target = "skiff::channel",
            remote = %remote,
            label = channel.label(),
            "created outbound data channel"
        );
        self.channels
            .insert(remote.clone(), ManagedChannel::created(Some(channel), false));
        Ok(())
    }

    /// Responder side: the channel itself shows up later through
    /// [`ChannelManager::bind_inbound`].
    pub fn prepare_inbound(&mut self, remote: &PeerId) {
        self.channels
            .insert(remote.clone(), ManagedChannel::created(None, true));
    }

    /// Returns false when nothing was waiting for this channel.
    pub fn bind_inbound(&mut self, remote: &PeerId, channel: Arc<dyn DataChannel>) -> bool {
        let Some(managed) = self.channels.get_mut(remote) else {
            tracing::warn!(
                target = "skiff::channel",
                remote = %remote,
                label = channel.label(),
                "incoming data channel without a session"
            );
            return false;
        };
        if !managed.inbound_expected || managed.channel.is_some() {
            tracing::warn!(
                target = "skiff::channel",
                remote = %remote,
                label = channel.label(),
                "ignoring extra incoming data channel"
            );
            return false;
        }
        tracing::debug!(
            target = "skiff::channel",
            remote = %remote,
            label = channel.label(),
            "bound incoming data channel"
        );
        managed.channel = Some(channel);
        if managed.open_signalled {
            self.mark_open(remote);
        }
        true
    }

    /// Moves `Created` to `Open` and fires `on_connected`; later calls are
    /// no-ops so duplicate open signals never reach the consumer.
    pub fn mark_open(&mut self, remote: &PeerId) -> bool {
        let Some(managed) = self.channels.get_mut(remote) else {
            return false;
        };
        if managed.state != ChannelState::Created {
            return false;
        }
        if managed.channel.is_none() {
            managed.open_signalled = true;
            return false;
        }
        managed.state = ChannelState::Open;
        let pending = std::mem::take(&mut managed.pending);
        tracing::info!(target = "skiff::channel", remote = %remote, "data channel open");
        self.sink.on_connected(remote);
        for payload in pending {
            self.sink.on_message(remote, payload);
        }
        true
    }

    pub fn deliver(&mut self, remote: &PeerId, payload: Bytes) {
        match self.channels.get_mut(remote) {
            Some(managed) if managed.state == ChannelState::Open => {
                self.sink.on_message(remote, payload);
            }
            Some(managed) if managed.state == ChannelState::Created => {
                managed.pending.push(payload);
            }
            _ => {
                tracing::debug!(
                    target = "skiff::channel",
                    remote = %remote,
                    len = payload.len(),
                    "dropping payload for closed channel"
                );
            }
        }
    }

    pub async fn send(&self, remote: &PeerId, payload: Bytes) -> Result<()> {
        let channel = match self.channels.get(remote) {
            Some(ManagedChannel {
                state: ChannelState::Open,
                channel: Some(channel),
                ..
            }) => Arc::clone(channel),
            _ => return Err(Error::ChannelNotReady(remote.to_string())),
        };
        tracing::trace!(
            target = "skiff::channel",
            remote = %remote,
            len = payload.len(),
            "sending payload"
        );
        channel.send(payload).await?;
        Ok(())
    }

    /// Local close. Further sends fail with `ChannelNotReady`.
    pub async fn close(&mut self, remote: &PeerId) -> Result<()> {
        let Some(channel) = self.transition_closed(remote) else {
            return Err(Error::ChannelNotReady(remote.to_string()));
        };
        if let Some(channel) = channel {
            if let Err(err) = channel.close().await {
                tracing::debug!(
                    target = "skiff::channel",
                    remote = %remote,
                    error = %err,
                    "data channel close failed"
                );
            }
        }
        Ok(())
    }

    /// Remote or transport-initiated close.
    pub fn mark_closed(&mut self, remote: &PeerId) {
        self.transition_closed(remote);
    }

    pub async fn close_all(&mut self) {
        let remotes: Vec<PeerId> = self.channels.keys().cloned().collect();
        for remote in remotes {
            let _ = self.close(&remote).await;
        }
    }

    /// `None` if there is no channel for `remote` or it was already closed.
    fn transition_closed(&mut self, remote: &PeerId) -> Option<Option<Arc<dyn DataChannel>>> {
        let managed = self.channels.get_mut(remote)?;
        let previous = managed.state;
        if previous == ChannelState::Closed {
            return None;
        }
        managed.state = ChannelState::Closed;
        managed.pending.clear();
        tracing::info!(target = "skiff::channel", remote = %remote, "data channel closed");
        if previous == ChannelState::Open {
            self.sink.on_closed(remote);
        }
        Some(managed.channel.clone())
    }
}
