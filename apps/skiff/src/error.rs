use thiserror::Error;

use crate::signaling::{FrameError, LinkError, PeerId};
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("frame addressed to {dest}, local identity is {local}")]
    Addressing { dest: PeerId, local: PeerId },
    #[error("a negotiation with {remote} is already in progress")]
    ConcurrentNegotiation { remote: PeerId },
    #[error("no open data channel to {0}")]
    ChannelNotReady(String),
    #[error("the session with {remote} has ended and cannot be negotiated again")]
    SessionEnded { remote: PeerId },
    #[error("relay link is not open")]
    LinkUnavailable,
    #[error(transparent)]
    MalformedFrame(#[from] FrameError),
    #[error("identity already assigned as {current}, relay tried {attempted}")]
    IdentityReassigned { current: PeerId, attempted: PeerId },
    #[error("answer from {remote} does not match a pending offer")]
    UnexpectedAnswer { remote: PeerId },
    #[error("{0} channels are open; name the remote to send to")]
    AmbiguousRemote(usize),
    #[error("bad {verb} payload from {remote}: {source}")]
    Payload {
        verb: &'static str,
        remote: PeerId,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not encode signaling payload: {0}")]
    Encode(#[source] serde_json::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("peer has shut down")]
    Shutdown,
}

impl Error {
    /// Errors after which the relay link cannot safely keep going.
    /// `Addressing` is only ever returned under `AddressingPolicy::Fatal`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Addressing { .. }
                | Error::MalformedFrame(_)
                | Error::IdentityReassigned { .. }
                | Error::Link(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
