//! Bootstrap relay: hands each websocket connection an id, then forwards
//! `OFFER`/`ANSWER`/`ICE` frames to the connection named as their dest.
//! A STUN binding server can run alongside it.

pub mod config;
pub mod relay;
pub mod stun;
pub mod websocket;

use std::net::SocketAddr;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

pub use relay::{RelayState, RouteOutcome};
pub use stun::StunServer;

pub fn app(state: RelayState) -> Router {
    Router::new()
        .route("/", get(websocket::relay_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(listener: TcpListener, state: RelayState) -> std::io::Result<()> {
    axum::serve(listener, app(state)).await
}

/// Binds `addr` and serves in the background. Handy with port 0.
pub async fn spawn(addr: &str) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        if let Err(err) = serve(listener, RelayState::new()).await {
            tracing::error!(error = %err, "relay server stopped");
        }
    });
    Ok((local_addr, handle))
}
