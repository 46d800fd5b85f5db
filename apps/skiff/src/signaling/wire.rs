use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed frame: expected `VERB SOURCE DEST PAYLOAD`, got {0:?}")]
    Malformed(String),
    #[error("invalid peer id {0:?}")]
    InvalidPeerId(String),
}

/// Opaque identifier assigned by the relay. Never empty, never contains
/// whitespace, since it travels as a single token on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Result<Self, FrameError> {
        let id = id.into();
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(FrameError::InvalidPeerId(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PeerId {
    type Error = FrameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PeerId::new(value)
    }
}

impl From<PeerId> for String {
    fn from(value: PeerId) -> Self {
        value.0
    }
}

impl std::str::FromStr for PeerId {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PeerId::new(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verb {
    Offer,
    Answer,
    Candidate,
    /// Verbs this build does not understand. Parsed so that addressing can
    /// still be validated, then ignored by negotiation.
    Unknown(String),
}

impl Verb {
    pub fn as_str(&self) -> &str {
        match self {
            Verb::Offer => "OFFER",
            Verb::Answer => "ANSWER",
            Verb::Candidate => "ICE",
            Verb::Unknown(verb) => verb,
        }
    }

    fn from_token(token: &str) -> Self {
        match token {
            "OFFER" => Verb::Offer,
            "ANSWER" => Verb::Answer,
            "ICE" => Verb::Candidate,
            other => Verb::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One relayed frame: `VERB SOURCE DEST PAYLOAD`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingMessage {
    pub verb: Verb,
    pub source: PeerId,
    pub dest: PeerId,
    pub payload: String,
}

impl SignalingMessage {
    pub fn new(verb: Verb, source: PeerId, dest: PeerId, payload: impl Into<String>) -> Self {
        Self {
            verb,
            source,
            dest,
            payload: payload.into(),
        }
    }

    /// Only the first three single spaces delimit fields; whatever follows the
    /// destination token is the payload, whitespace included.
    pub fn parse(frame: &str) -> Result<Self, FrameError> {
        let mut tokens = frame.splitn(4, ' ');
        let (Some(verb), Some(source), Some(dest)) = (tokens.next(), tokens.next(), tokens.next())
        else {
            return Err(FrameError::Malformed(frame.to_string()));
        };
        if verb.is_empty() {
            return Err(FrameError::Malformed(frame.to_string()));
        }
        let source = PeerId::new(source).map_err(|_| FrameError::Malformed(frame.to_string()))?;
        let dest = PeerId::new(dest).map_err(|_| FrameError::Malformed(frame.to_string()))?;
        let payload = tokens.next().unwrap_or_default();
        Ok(Self {
            verb: Verb::from_token(verb),
            source,
            dest,
            payload: payload.to_string(),
        })
    }
}

impl fmt::Display for SignalingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.verb, self.source, self.dest, self.payload
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(value: &str) -> PeerId {
        PeerId::new(value).unwrap()
    }

    #[test]
    fn payload_keeps_embedded_spaces() {
        let frame = r#"OFFER a1 b1 {"type":"offer","sdp":"v=0 o=- 1 2 IN IP4 0.0.0.0"}"#;
        let message = SignalingMessage::parse(frame).unwrap();
        assert_eq!(message.verb, Verb::Offer);
        assert_eq!(message.source, id("a1"));
        assert_eq!(message.dest, id("b1"));
        assert_eq!(
            message.payload,
            r#"{"type":"offer","sdp":"v=0 o=- 1 2 IN IP4 0.0.0.0"}"#
        );
        assert_eq!(message.to_string(), frame);
    }

    #[test]
    fn three_tokens_yield_empty_payload() {
        let message = SignalingMessage::parse("ICE a1 b1").unwrap();
        assert_eq!(message.verb, Verb::Candidate);
        assert!(message.payload.is_empty());
    }

    #[test]
    fn fewer_than_three_tokens_is_malformed() {
        for frame in ["", "OFFER", "OFFER a1"] {
            assert!(matches!(
                SignalingMessage::parse(frame),
                Err(FrameError::Malformed(_))
            ));
        }
    }

    #[test]
    fn empty_address_tokens_are_malformed() {
        assert!(SignalingMessage::parse("OFFER  b1 {}").is_err());
        assert!(SignalingMessage::parse(" a1 b1 {}").is_err());
    }

    #[test]
    fn unknown_verbs_parse() {
        let message = SignalingMessage::parse("BYE a1 b1").unwrap();
        assert_eq!(message.verb, Verb::Unknown("BYE".into()));
        assert_eq!(message.verb.as_str(), "BYE");
    }

    #[test]
    fn peer_ids_reject_whitespace() {
        assert!(PeerId::new("").is_err());
        assert!(PeerId::new("a b").is_err());
        assert!(PeerId::new("a\n").is_err());
        assert_eq!(id("3f2a").as_str(), "3f2a");
    }
}
