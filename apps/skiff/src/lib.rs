//! Relayed-bootstrap peer-to-peer data channels.
//!
//! A [`Peer`] connects to a relay, is assigned an identity, and negotiates a
//! direct data channel with any other identity on the same relay by trading
//! `OFFER`, `ANSWER` and `ICE` frames through it.

pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod negotiation;
pub mod peer;
pub mod signaling;
pub mod telemetry;
pub mod transport;

pub use config::{AddressingPolicy, Config};
pub use error::{Error, Result};
pub use events::{Events, PeerEvent};
pub use peer::Peer;
pub use signaling::PeerId;
