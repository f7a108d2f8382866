//! TCP over data channels.
//!
//! A [`ServerProxy`] listens locally for one LAN server the remote peer
//! advertised and opens a `tunnel` channel labeled with the remote port for
//! every accepted socket. The remote side connects that port on its LAN
//! target host and both ends pump bytes until either the socket or the
//! channel closes.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OnceCell, mpsc};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, trace, warn};

use crate::error::TransportError;
use crate::rtc::{ChannelEvent, ChannelInit, ChannelMessage, RtcDataChannel};

pub const TUNNEL_PROTOCOL: &str = "tunnel";

/// Opens data channels on whatever connection currently backs a session.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    async fn open_channel(
        &self,
        label: &str,
        init: ChannelInit,
    ) -> Result<Arc<dyn RtcDataChannel>, TransportError>;
}

/// Live tunnels of one session. Closing the set closes every channel and
/// drops every socket.
#[derive(Default)]
pub struct TunnelSet {
    next_id: AtomicU64,
    active: Mutex<HashMap<u64, (Arc<dyn RtcDataChannel>, AbortHandle)>>,
}

impl TunnelSet {
    pub fn spawn(
        self: &Arc<Self>,
        stream: TcpStream,
        channel: Arc<dyn RtcDataChannel>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        chunk: usize,
    ) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let set = Arc::clone(self);
        let mut active = self.active.lock();
        let pumped = Arc::clone(&channel);
        let task = tokio::spawn(async move {
            pump(stream, pumped, events, chunk).await;
            set.active.lock().remove(&id);
        });
        active.insert(id, (channel, task.abort_handle()));
    }

    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn close_all(&self) {
        let drained: Vec<_> = self.active.lock().drain().map(|(_, tunnel)| tunnel).collect();
        if !drained.is_empty() {
            debug!(target = "peerlink::tunnel", count = drained.len(), "closing tunnels");
        }
        for (channel, task) in drained {
            task.abort();
            channel.close().await;
        }
    }
}

/// Moves bytes both ways. Socket reads that happen before the channel opens
/// are held and flushed on open.
async fn pump(
    stream: TcpStream,
    channel: Arc<dyn RtcDataChannel>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    chunk: usize,
) {
    let label = channel.label();
    let (mut reader, mut writer) = stream.into_split();
    let mut open = channel.is_open();
    let mut held: Vec<Bytes> = Vec::new();
    let mut buf = vec![0u8; chunk.max(1)];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    trace!(target = "peerlink::tunnel", %label, "socket closed");
                    break;
                }
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    if !open {
                        held.push(data);
                    } else if channel.send(ChannelMessage::Binary(data)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(target = "peerlink::tunnel", %label, error = %err, "socket read failed");
                    break;
                }
            },
            event = events.recv() => match event {
                Some(ChannelEvent::Open) => {
                    open = true;
                    let mut failed = false;
                    for data in held.drain(..) {
                        if channel.send(ChannelMessage::Binary(data)).await.is_err() {
                            failed = true;
                            break;
                        }
                    }
                    if failed {
                        break;
                    }
                }
                Some(ChannelEvent::Message(message)) => {
                    let written = match message {
                        ChannelMessage::Binary(data) => writer.write_all(&data).await,
                        ChannelMessage::Text(text) => writer.write_all(text.as_bytes()).await,
                    };
                    if let Err(err) = written {
                        debug!(target = "peerlink::tunnel", %label, error = %err, "socket write failed");
                        break;
                    }
                }
                Some(ChannelEvent::Close) | None => {
                    trace!(target = "peerlink::tunnel", %label, "channel closed");
                    break;
                }
            },
        }
    }
    channel.close().await;
}

/// Answers a remote `tunnel` channel by connecting the labeled port on the
/// LAN target host.
pub async fn connect_remote(
    channel: Arc<dyn RtcDataChannel>,
    target_host: IpAddr,
    tunnels: Arc<TunnelSet>,
    chunk: usize,
) {
    let label = channel.label();
    let Ok(port) = label.parse::<u16>() else {
        warn!(target = "peerlink::tunnel", %label, "tunnel label is not a port");
        channel.close().await;
        return;
    };
    let Some(events) = channel.take_events() else {
        channel.close().await;
        return;
    };
    match TcpStream::connect((target_host, port)).await {
        Ok(stream) => {
            debug!(target = "peerlink::tunnel", port, "remote tunnel connected");
            tunnels.spawn(stream, channel, events, chunk);
        }
        Err(err) => {
            warn!(target = "peerlink::tunnel", port, error = %err, "LAN target unreachable");
            channel.close().await;
        }
    }
}

/// Local listener standing in for one remote LAN server.
pub struct ServerProxy {
    pub remote_port: u16,
    pub local_port: u16,
    accept: JoinHandle<()>,
}

impl ServerProxy {
    /// Binds the remote port number when it is free locally, any port
    /// otherwise.
    pub async fn bind(
        host: IpAddr,
        remote_port: u16,
        opener: Weak<dyn ChannelOpener>,
        tunnels: Arc<TunnelSet>,
        chunk: usize,
    ) -> io::Result<Self> {
        let listener = match TcpListener::bind((host, remote_port)).await {
            Ok(listener) => listener,
            Err(_) => TcpListener::bind((host, 0)).await?,
        };
        let local_port = listener.local_addr()?.port();
        info!(target = "peerlink::tunnel", remote_port, local_port, "proxy listening");
        let accept = tokio::spawn(accept_loop(listener, remote_port, opener, tunnels, chunk));
        Ok(Self {
            remote_port,
            local_port,
            accept,
        })
    }
}

impl Drop for ServerProxy {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    remote_port: u16,
    opener: Weak<dyn ChannelOpener>,
    tunnels: Arc<TunnelSet>,
    chunk: usize,
) {
    let label = remote_port.to_string();
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(target = "peerlink::tunnel", remote_port, error = %err, "accept failed");
                continue;
            }
        };
        let Some(opener) = opener.upgrade() else {
            break;
        };
        debug!(target = "peerlink::tunnel", remote_port, %addr, "local client connected");
        let channel = match opener
            .open_channel(&label, ChannelInit::ordered(TUNNEL_PROTOCOL))
            .await
        {
            Ok(channel) => channel,
            Err(err) => {
                warn!(target = "peerlink::tunnel", remote_port, error = %err, "tunnel channel failed");
                continue;
            }
        };
        match channel.take_events() {
            Some(events) => tunnels.spawn(stream, channel, events, chunk),
            None => channel.close().await,
        }
    }
}

/// Proxies keyed by remote port. The entry for a port is claimed before the
/// listener is bound, so concurrent advertisements share one listener.
#[derive(Default)]
pub struct ProxyPool {
    entries: Mutex<HashMap<u16, Arc<OnceCell<ServerProxy>>>>,
}

impl ProxyPool {
    pub async fn get_or_bind<F, Fut>(&self, remote_port: u16, bind: F) -> io::Result<u16>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = io::Result<ServerProxy>>,
    {
        let cell = Arc::clone(self.entries.lock().entry(remote_port).or_default());
        let proxy = cell.get_or_try_init(bind).await?;
        Ok(proxy.local_port)
    }

    /// `(remote_port, local_port)` for every bound proxy.
    pub fn ports(&self) -> Vec<(u16, u16)> {
        let mut ports: Vec<_> = self
            .entries
            .lock()
            .values()
            .filter_map(|cell| cell.get().map(|proxy| (proxy.remote_port, proxy.local_port)))
            .collect();
        ports.sort_unstable();
        ports
    }

    pub fn close_all(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use super::*;
    use crate::rtc::loopback::LoopbackNetwork;
    use crate::rtc::{RtcConnection, RtcEvent, RtcFactory};

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    struct Opener(Arc<dyn RtcConnection>);

    #[async_trait]
    impl ChannelOpener for Opener {
        async fn open_channel(
            &self,
            label: &str,
            init: ChannelInit,
        ) -> Result<Arc<dyn RtcDataChannel>, TransportError> {
            self.0.create_data_channel(label, init).await
        }
    }

    async fn connected_pair() -> (Arc<dyn RtcConnection>, Arc<dyn RtcConnection>) {
        let net = LoopbackNetwork::new();
        let a = net.create_connection(&[], None).await.expect("a");
        let b = net.create_connection(&[], None).await.expect("b");
        let offer = a.create_offer().await.expect("offer");
        b.set_remote_description(offer).await.expect("offer applied");
        let answer = b.create_answer().await.expect("answer");
        a.set_remote_description(answer).await.expect("answer applied");
        (a, b)
    }

    #[test_timeout::tokio_timeout_test]
    async fn concurrent_binds_for_one_port_share_a_listener() {
        let pool = ProxyPool::default();
        let binds = Arc::new(AtomicU64::new(0));
        let (_a, b) = connected_pair().await;
        let opener: Arc<dyn ChannelOpener> = Arc::new(Opener(b));
        let tunnels = Arc::new(TunnelSet::default());
        let bind = || {
            let binds = Arc::clone(&binds);
            let opener = Arc::downgrade(&opener);
            let tunnels = Arc::clone(&tunnels);
            move || async move {
                binds.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                ServerProxy::bind(LOCALHOST, 25565, opener, tunnels, 1024).await
            }
        };
        let (first, second) = tokio::join!(
            pool.get_or_bind(25565, bind()),
            pool.get_or_bind(25565, bind())
        );
        let first = first.expect("first");
        assert_eq!(first, second.expect("second"));
        assert_eq!(binds.load(Ordering::SeqCst), 1);
        assert_eq!(pool.ports(), vec![(25565, first)]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn proxied_bytes_reach_lan_server_and_back() {
        let lan = TcpListener::bind((LOCALHOST, 0)).await.expect("lan");
        let lan_port = lan.local_addr().expect("addr").port();
        tokio::spawn(async move {
            let (mut socket, _) = lan.accept().await.expect("accept");
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.expect("read");
            socket.write_all(&buf).await.expect("echo");
        });

        let (a, b) = connected_pair().await;
        let remote_tunnels = Arc::new(TunnelSet::default());
        let mut b_events = b.take_events().expect("events");
        let answering = Arc::clone(&remote_tunnels);
        tokio::spawn(async move {
            while let Some(event) = b_events.recv().await {
                if let RtcEvent::DataChannel(channel) = event {
                    connect_remote(channel, LOCALHOST, Arc::clone(&answering), 1024).await;
                }
            }
        });

        let opener: Arc<dyn ChannelOpener> = Arc::new(Opener(a));
        let local_tunnels = Arc::new(TunnelSet::default());
        let proxy = ServerProxy::bind(
            LOCALHOST,
            lan_port,
            Arc::downgrade(&opener),
            Arc::clone(&local_tunnels),
            1024,
        )
        .await
        .expect("proxy");

        let mut client = TcpStream::connect((LOCALHOST, proxy.local_port))
            .await
            .expect("client");
        client.write_all(b"hello").await.expect("write");
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.expect("reply");
        assert_eq!(&reply, b"hello");
        assert_eq!(local_tunnels.len(), 1);

        local_tunnels.close_all().await;
        let mut rest = Vec::new();
        let read = client.read_to_end(&mut rest).await;
        assert!(read.map(|n| n == 0).unwrap_or(true));
        assert!(local_tunnels.is_empty());
    }
}
