use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Verbs the relay forwards. Anything else is dropped.
pub const FORWARDED_VERBS: &[&str] = &["OFFER", "ANSWER", "ICE"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Forwarded { dest: String },
    /// The frame's source token is not the sender's own id.
    Spoofed { claimed: String },
    UnknownDest { dest: String },
    IgnoredVerb { verb: String },
    Malformed,
}

/// Registered connections, keyed by the id handed out at connect time.
#[derive(Clone, Default)]
pub struct RelayState {
    peers: Arc<DashMap<String, mpsc::UnboundedSender<String>>>,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns a fresh id. The id is also the first frame queued for the
    /// connection, ahead of anything routed to it.
    pub fn register(&self) -> (String, mpsc::UnboundedReceiver<String>) {
        let id = Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(id.clone());
        self.peers.insert(id.clone(), tx);
        (id, rx)
    }

    pub fn unregister(&self, id: &str) {
        self.peers.remove(id);
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Forwards `frame` verbatim to its dest if `from` is its source.
    pub fn route(&self, from: &str, frame: &str) -> RouteOutcome {
        let mut tokens = frame.splitn(4, ' ');
        let (Some(verb), Some(source), Some(dest)) = (tokens.next(), tokens.next(), tokens.next())
        else {
            return RouteOutcome::Malformed;
        };
        if source != from {
            return RouteOutcome::Spoofed {
                claimed: source.to_string(),
            };
        }
        if !FORWARDED_VERBS.contains(&verb) {
            return RouteOutcome::IgnoredVerb {
                verb: verb.to_string(),
            };
        }
        // Clone the sender so no map guard is held while sending.
        let target = self.peers.get(dest).map(|entry| entry.value().clone());
        match target {
            Some(tx) if tx.send(frame.to_string()).is_ok() => RouteOutcome::Forwarded {
                dest: dest.to_string(),
            },
            _ => RouteOutcome::UnknownDest {
                dest: dest.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_queues_the_id_first() {
        let state = RelayState::new();
        let (id, mut rx) = state.register();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(rx.try_recv().unwrap(), id);
        assert!(state.is_registered(&id));
    }

    #[test]
    fn forwards_to_dest_verbatim() {
        let state = RelayState::new();
        let (a, _a_rx) = state.register();
        let (b, mut b_rx) = state.register();
        b_rx.try_recv().unwrap();

        let frame = format!("OFFER {a} {b} {{\"type\":\"offer\",\"sdp\":\"v=0 x\"}}");
        assert_eq!(state.route(&a, &frame), RouteOutcome::Forwarded { dest: b.clone() });
        assert_eq!(b_rx.try_recv().unwrap(), frame);
    }

    #[test]
    fn rejects_spoofed_source() {
        let state = RelayState::new();
        let (a, _a_rx) = state.register();
        let (b, mut b_rx) = state.register();
        b_rx.try_recv().unwrap();

        let frame = format!("ICE someone-else {b} {{}}");
        assert_eq!(
            state.route(&a, &frame),
            RouteOutcome::Spoofed {
                claimed: "someone-else".into()
            }
        );
        assert!(b_rx.try_recv().is_err());
    }

    #[test]
    fn ignores_unknown_verbs_and_short_frames() {
        let state = RelayState::new();
        let (a, _a_rx) = state.register();
        let (b, mut b_rx) = state.register();
        b_rx.try_recv().unwrap();

        assert_eq!(
            state.route(&a, &format!("HELLO {a} {b} hi")),
            RouteOutcome::IgnoredVerb {
                verb: "HELLO".into()
            }
        );
        assert_eq!(state.route(&a, "OFFER"), RouteOutcome::Malformed);
        assert!(b_rx.try_recv().is_err());
    }

    #[test]
    fn unregistered_dest_is_reported() {
        let state = RelayState::new();
        let (a, _a_rx) = state.register();
        let (b, _b_rx) = state.register();
        state.unregister(&b);
        assert_eq!(
            state.route(&a, &format!("ANSWER {a} {b} {{}}")),
            RouteOutcome::UnknownDest { dest: b }
        );
        assert_eq!(state.len(), 1);
    }
}
