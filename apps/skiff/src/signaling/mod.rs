//! Relay link: text framing, identity assignment, and the socket tasks that
//! carry `VERB SOURCE DEST PAYLOAD` frames to and from the relay.

pub mod link;
pub mod wire;

pub use link::{LinkError, LinkEvent, LinkEvents, LinkSender, RelayEnd, SignalingLink};
pub use wire::{FrameError, PeerId, SignalingMessage, Verb};
