//! STUN binding server run next to the relay so peers can learn their
//! server-reflexive address from the same host they signal through.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use webrtc::stun::message::{
    BINDING_REQUEST, CLASS_SUCCESS_RESPONSE, METHOD_BINDING, Message, MessageType, Setter,
};
use webrtc::stun::xoraddr::XorMappedAddress;

const MAX_DATAGRAM: usize = 1500;

pub struct StunServer {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl StunServer {
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let addr = socket.local_addr()?;
        tracing::info!(target = "skiff_relay::stun", %addr, "stun server listening");
        let task = tokio::spawn(serve(socket));
        Ok(Self { addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

async fn serve(socket: UdpSocket) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                tracing::warn!(target = "skiff_relay::stun", error = %err, "udp receive failed");
                continue;
            }
        };
        let Some(response) = binding_response(&buf[..len], from) else {
            continue;
        };
        if let Err(err) = socket.send_to(&response, from).await {
            tracing::debug!(target = "skiff_relay::stun", %from, error = %err, "binding response not sent");
        }
    }
}

/// Answers a binding request with the sender's address as XOR-MAPPED-ADDRESS.
/// Anything else, STUN or not, gets no reply.
pub fn binding_response(datagram: &[u8], from: SocketAddr) -> Option<Vec<u8>> {
    let mut request = Message::new();
    request.raw = datagram.to_vec();
    if let Err(err) = request.decode() {
        tracing::trace!(target = "skiff_relay::stun", %from, error = %err, "ignoring non-stun datagram");
        return None;
    }
    if request.typ != BINDING_REQUEST {
        tracing::debug!(target = "skiff_relay::stun", %from, typ = ?request.typ, "ignoring stun message");
        return None;
    }

    let mut response = Message::new();
    response.typ = MessageType {
        method: METHOD_BINDING,
        class: CLASS_SUCCESS_RESPONSE,
    };
    response.transaction_id = request.transaction_id;
    let mapped = XorMappedAddress {
        ip: from.ip(),
        port: from.port(),
    };
    if let Err(err) = mapped.add_to(&mut response) {
        tracing::warn!(target = "skiff_relay::stun", %from, error = %err, "cannot encode mapped address");
        return None;
    }
    response.encode();
    tracing::debug!(target = "skiff_relay::stun", %from, "binding response");
    Some(response.raw)
}
