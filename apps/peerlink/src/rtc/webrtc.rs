use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{
    ChannelEvent, ChannelInit, ChannelMessage, ConnectionState, IceCandidate, IceServer,
    RtcConnection, RtcDataChannel, RtcEvent, RtcFactory, SdpKind, SessionDescription,
};
use crate::error::{TransportError, to_negotiation_error, to_setup_error};

/// [`RtcFactory`] backed by webrtc-rs.
#[derive(Clone, Debug, Default)]
pub struct WebRtcFactory;

impl WebRtcFactory {
    pub fn new() -> Self {
        Self
    }
}

fn to_rtc_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: vec![server.url.clone()],
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn map_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn from_rtc_description(description: &RTCSessionDescription) -> Option<SessionDescription> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        _ => return None,
    };
    Some(SessionDescription {
        sdp: description.sdp.clone(),
        kind,
    })
}

#[async_trait]
impl RtcFactory for WebRtcFactory {
    async fn create_connection(
        &self,
        servers: &[IceServer],
        port_hint: Option<u16>,
    ) -> Result<Arc<dyn RtcConnection>, TransportError> {
        let mut setting = SettingEngine::default();
        if let Some(port) = port_hint {
            match EphemeralUDP::new(port, port) {
                Ok(range) => setting.set_udp_network(UDPNetwork::Ephemeral(range)),
                Err(err) => tracing::debug!(
                    target = "peerlink::rtc",
                    port,
                    error = %err,
                    "ignoring local port hint"
                ),
            }
        }
        let api = APIBuilder::new().with_setting_engine(setting).build();
        let config = RTCConfiguration {
            ice_servers: to_rtc_servers(servers),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(to_setup_error)?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let candidate_tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sender = candidate_tx.clone();
            Box::pin(async move {
                match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => {
                            let _ = sender.send(RtcEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                mid: init.sdp_mid.unwrap_or_default(),
                            }));
                        }
                        Err(err) => tracing::warn!(
                            target = "peerlink::rtc",
                            error = %err,
                            "failed to serialize local candidate"
                        ),
                    },
                    None => {
                        let _ = sender.send(RtcEvent::GatheringComplete);
                    }
                }
            })
        }));

        let state_tx = events_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sender = state_tx.clone();
            Box::pin(async move {
                tracing::trace!(target = "peerlink::rtc", state = %state, "peer connection state");
                let _ = sender.send(RtcEvent::StateChanged(map_state(state)));
            })
        }));

        let channel_tx = events_tx.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let sender = channel_tx.clone();
            Box::pin(async move {
                let channel = WebRtcDataChannel::wrap(dc);
                let _ = sender.send(RtcEvent::DataChannel(channel));
            })
        }));

        Ok(Arc::new(WebRtcConnection {
            pc,
            events_rx: Mutex::new(Some(events_rx)),
            closed: AtomicBool::new(false),
        }))
    }
}

struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<RtcEvent>>>,
    closed: AtomicBool,
}

#[async_trait]
impl RtcConnection for WebRtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(to_negotiation_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(to_negotiation_error)?;
        Ok(SessionDescription {
            sdp: offer.sdp,
            kind: SdpKind::Offer,
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_negotiation_error)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(to_negotiation_error)?;
        Ok(SessionDescription {
            sdp: answer.sdp,
            kind: SdpKind::Answer,
        })
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let remote = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(to_negotiation_error)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(to_negotiation_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: (!candidate.mid.is_empty()).then_some(candidate.mid),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(to_negotiation_error)
    }

    async fn create_data_channel(
        &self,
        label: &str,
        init: ChannelInit,
    ) -> Result<Arc<dyn RtcDataChannel>, TransportError> {
        let dc_init = RTCDataChannelInit {
            ordered: Some(init.ordered),
            protocol: Some(init.protocol),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(dc_init))
            .await
            .map_err(to_setup_error)?;
        Ok(WebRtcDataChannel::wrap(dc))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc
            .local_description()
            .await
            .as_ref()
            .and_then(from_rtc_description)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RtcEvent>> {
        self.events_rx.lock().take()
    }

    fn state(&self) -> ConnectionState {
        map_state(self.pc.connection_state())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target = "peerlink::rtc", error = %err, "peer connection close failed");
        }
    }
}

struct WebRtcDataChannel {
    dc: Arc<RTCDataChannel>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    closed: AtomicBool,
}

impl WebRtcDataChannel {
    fn wrap(dc: Arc<RTCDataChannel>) -> Arc<dyn RtcDataChannel> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let open_tx = events_tx.clone();
        dc.on_open(Box::new(move || {
            let sender = open_tx.clone();
            Box::pin(async move {
                let _ = sender.send(ChannelEvent::Open);
            })
        }));

        let message_tx = events_tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let sender = message_tx.clone();
            Box::pin(async move {
                let message = if msg.is_string {
                    ChannelMessage::Text(String::from_utf8_lossy(&msg.data).into_owned())
                } else {
                    ChannelMessage::Binary(msg.data)
                };
                let _ = sender.send(ChannelEvent::Message(message));
            })
        }));

        let close_tx = events_tx.clone();
        dc.on_close(Box::new(move || {
            let sender = close_tx.clone();
            Box::pin(async move {
                let _ = sender.send(ChannelEvent::Close);
            })
        }));

        if dc.ready_state() == RTCDataChannelState::Open {
            let _ = events_tx.send(ChannelEvent::Open);
        }

        Arc::new(WebRtcDataChannel {
            dc,
            events_rx: Mutex::new(Some(events_rx)),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl RtcDataChannel for WebRtcDataChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn protocol(&self) -> String {
        self.dc.protocol().to_string()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, message: ChannelMessage) -> Result<(), TransportError> {
        let result = match message {
            ChannelMessage::Text(text) => self.dc.send_text(text).await,
            ChannelMessage::Binary(bytes) => self.dc.send(&bytes).await,
        };
        result.map(|_| ()).map_err(|err| {
            tracing::debug!(
                target = "peerlink::rtc",
                label = %self.dc.label(),
                error = %err,
                "data channel send failed"
            );
            TransportError::ChannelClosed
        })
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.dc.close().await {
            tracing::debug!(target = "peerlink::rtc", error = %err, "data channel close failed");
        }
    }
}
