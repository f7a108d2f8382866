use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;
use webrtc::stun::agent::TransactionId;
use webrtc::stun::message::{BINDING_REQUEST, Getter, Message};
use webrtc::stun::xoraddr::XorMappedAddress;

const MAX_DATAGRAM: usize = 1500;

/// One binding reply: which server answered and the mapping it saw.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindingReply {
    pub server: SocketAddr,
    pub mapped: SocketAddr,
    pub rtt: Duration,
}

fn binding_request() -> Option<Message> {
    let mut message = Message::new();
    message
        .build(&[Box::new(TransactionId::new()), Box::new(BINDING_REQUEST)])
        .ok()?;
    Some(message)
}

fn parse_reply(datagram: &[u8]) -> Option<(TransactionId, SocketAddr)> {
    let mut message = Message::new();
    message.raw = datagram.to_vec();
    message.decode().ok()?;
    let mut xor = XorMappedAddress::default();
    xor.get_from(&message).ok()?;
    Some((message.transaction_id, SocketAddr::new(xor.ip, xor.port)))
}

/// Sends one binding request to every server from `socket` and collects the
/// replies that arrive before `wait` elapses. Replies are matched by
/// transaction id, so stray datagrams are ignored.
pub async fn probe_all(
    socket: &UdpSocket,
    servers: &[SocketAddr],
    wait: Duration,
) -> Vec<BindingReply> {
    let started = Instant::now();
    let mut pending: HashMap<TransactionId, SocketAddr> = HashMap::new();
    for server in servers {
        let Some(request) = binding_request() else {
            continue;
        };
        match socket.send_to(&request.raw, server).await {
            Ok(_) => {
                pending.insert(request.transaction_id, *server);
            }
            Err(err) => tracing::debug!(
                target = "peerlink::nat",
                %server,
                error = %err,
                "stun probe send failed"
            ),
        }
    }

    let mut replies = Vec::new();
    let deadline = started + wait;
    let mut buf = vec![0u8; MAX_DATAGRAM];
    while !pending.is_empty() {
        let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
        let (len, _from) = match received {
            Ok(Ok(received)) => received,
            Ok(Err(err)) => {
                tracing::debug!(target = "peerlink::nat", error = %err, "stun receive failed");
                continue;
            }
            Err(_) => break,
        };
        let Some((transaction, mapped)) = parse_reply(&buf[..len]) else {
            continue;
        };
        if let Some(server) = pending.remove(&transaction) {
            replies.push(BindingReply {
                server,
                mapped,
                rtt: started.elapsed(),
            });
        }
    }
    replies
}
