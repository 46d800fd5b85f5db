use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(addr: SocketAddr) -> (Client, String) {
    let (mut ws, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
    let id = next_text(&mut ws).await.expect("id frame");
    (ws, id)
}

async fn next_text(ws: &mut Client) -> Option<String> {
    loop {
        match ws.next().await? {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

async fn expect_silence(ws: &mut Client) {
    assert!(timeout(Duration::from_millis(200), next_text(ws)).await.is_err());
}

#[test_timeout::tokio_timeout_test(10)]
async fn forwards_frames_between_registered_peers() {
    let (addr, _server) = skiff_relay::spawn("127.0.0.1:0").await.unwrap();
    let (mut a, a_id) = connect(addr).await;
    let (mut b, b_id) = connect(addr).await;
    assert_ne!(a_id, b_id);
    assert_eq!(a_id.len(), 32);

    let offer = format!("OFFER {a_id} {b_id} {{\"type\":\"offer\",\"sdp\":\"v=0 o=- 1\"}}");
    a.send(Message::Text(offer.clone())).await.unwrap();
    assert_eq!(next_text(&mut b).await.as_deref(), Some(offer.as_str()));

    let answer = format!("ANSWER {b_id} {a_id} {{}}");
    b.send(Message::Text(answer.clone())).await.unwrap();
    assert_eq!(next_text(&mut a).await.as_deref(), Some(answer.as_str()));
}

#[test_timeout::tokio_timeout_test(10)]
async fn drops_spoofed_and_unknown_frames() {
    let (addr, _server) = skiff_relay::spawn("127.0.0.1:0").await.unwrap();
    let (mut a, a_id) = connect(addr).await;
    let (mut b, b_id) = connect(addr).await;

    a.send(Message::Text(format!("ICE {b_id} {b_id} {{}}")))
        .await
        .unwrap();
    a.send(Message::Text(format!("CHAT {a_id} {b_id} hello")))
        .await
        .unwrap();
    a.send(Message::Text("garbage".into())).await.unwrap();
    expect_silence(&mut b).await;

    // The connection survives all of the above.
    let ice = format!("ICE {a_id} {b_id} {{\"candidate\":\"c\"}}");
    a.send(Message::Text(ice.clone())).await.unwrap();
    assert_eq!(next_text(&mut b).await.as_deref(), Some(ice.as_str()));
}

#[test_timeout::tokio_timeout_test(10)]
async fn disconnected_peer_is_unregistered() {
    let (addr, _server) = skiff_relay::spawn("127.0.0.1:0").await.unwrap();
    let (mut a, a_id) = connect(addr).await;
    let (b, b_id) = connect(addr).await;
    drop(b);

    let (mut c, c_id) = connect(addr).await;
    a.send(Message::Text(format!("OFFER {a_id} {b_id} {{}}")))
        .await
        .unwrap();
    a.send(Message::Text(format!("OFFER {a_id} {c_id} {{}}")))
        .await
        .unwrap();
    assert_eq!(
        next_text(&mut c).await,
        Some(format!("OFFER {a_id} {c_id} {{}}"))
    );
}
