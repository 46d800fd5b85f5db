use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, trace, warn};

use crate::relay::{RelayState, RouteOutcome};

pub async fn relay_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let (id, mut rx) = state.register();
    let (mut sender, mut receiver) = socket.split();
    info!(peer = %id, peers = state.len(), "peer connected");

    let writer_id = id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        debug!(peer = %writer_id, "writer task ended");
    });

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    warn!(peer = %id, "dropping non-utf8 frame");
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(peer = %id, error = %err, "websocket error");
                break;
            }
        };

        match state.route(&id, &text) {
            RouteOutcome::Forwarded { dest } => {
                trace!(peer = %id, dest = %dest, len = text.len(), "forwarded frame");
            }
            RouteOutcome::Spoofed { claimed } => {
                warn!(peer = %id, claimed = %claimed, "ignoring frame with foreign source");
            }
            RouteOutcome::UnknownDest { dest } => {
                debug!(peer = %id, dest = %dest, "no peer registered for dest");
            }
            RouteOutcome::IgnoredVerb { verb } => {
                debug!(peer = %id, verb = %verb, "ignoring unsupported verb");
            }
            RouteOutcome::Malformed => {
                warn!(peer = %id, frame = %text, "ignoring malformed frame");
            }
        }
    }

    state.unregister(&id);
    writer.abort();
    info!(peer = %id, peers = state.len(), "peer disconnected");
}
