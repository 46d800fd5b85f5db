use std::time::Duration;

use skiff_relay::StunServer;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use webrtc::stun::message::{
    Getter, Message, BINDING_REQUEST, CLASS_SUCCESS_RESPONSE, METHOD_BINDING,
};
use webrtc::stun::xoraddr::XorMappedAddress;

#[test_timeout::tokio_timeout_test(10)]
async fn binding_request_reports_the_client_address() {
    let server = StunServer::bind("127.0.0.1:0").await.unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_addr = client.local_addr().unwrap();

    // Non-STUN traffic is ignored rather than killing the server.
    client.send_to(b"hello", server.local_addr()).await.unwrap();

    let mut request = Message::new();
    request.typ = BINDING_REQUEST;
    request.new_transaction_id().unwrap();
    request.encode();
    client.send_to(&request.raw, server.local_addr()).await.unwrap();

    let mut buf = vec![0u8; 1500];
    let (len, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("binding response")
        .unwrap();

    let mut response = Message::new();
    response.raw = buf[..len].to_vec();
    response.decode().unwrap();
    assert_eq!(response.typ.method, METHOD_BINDING);
    assert_eq!(response.typ.class, CLASS_SUCCESS_RESPONSE);
    assert_eq!(response.transaction_id, request.transaction_id);

    let mut mapped = XorMappedAddress::default();
    mapped.get_from(&response).unwrap();
    assert_eq!(mapped.ip, client_addr.ip());
    assert_eq!(mapped.port, client_addr.port());

    server.shutdown();
}
