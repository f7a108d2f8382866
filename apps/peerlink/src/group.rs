//! Group membership on top of the relay: who is present, and which side of
//! each pair makes the offer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PeerConfig;
use crate::error::SignalingError;
use crate::identity::{LocalIdentity, PeerId, PeerProfile, should_initiate};
use crate::signaling::{Descriptor, RelayEvent, RelayState, SignalingRelay};

#[derive(Debug)]
pub enum GroupSignal {
    /// Sent for every heartbeat; `initiate` is the local side of the
    /// election for this pair and never changes for a given peer.
    Heartbeat { peer: PeerId, initiate: bool },
    Descriptor(Descriptor),
    Profile { peer: PeerId, profile: PeerProfile },
    State(RelayState),
    Ping(Duration),
    Error(String),
}

/// `<name>@<random u16>`, used when a group is joined without an id.
pub fn generate_group_id(name: &str) -> String {
    let suffix: u16 = rand::random();
    format!("{name}@{suffix}")
}

pub struct GroupCoordinator {
    group: String,
    relay: Arc<SignalingRelay>,
    pump: JoinHandle<()>,
}

impl GroupCoordinator {
    pub fn join(
        config: &PeerConfig,
        identity: Arc<LocalIdentity>,
        group: &str,
        signals: mpsc::UnboundedSender<GroupSignal>,
    ) -> Result<Self, SignalingError> {
        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
        let relay = SignalingRelay::connect(config, group, identity.id(), relay_tx)?;
        info!(target = "peerlink::group", %group, local = %identity.id(), "joined group");

        let responder = Arc::clone(&relay);
        let group_name = group.to_string();
        let pump = tokio::spawn(async move {
            let local = identity.id();
            while let Some(event) = relay_rx.recv().await {
                let signal = match event {
                    RelayEvent::Heartbeat { peer } => GroupSignal::Heartbeat {
                        peer,
                        initiate: should_initiate(&local, &peer),
                    },
                    RelayEvent::Descriptor(descriptor) => GroupSignal::Descriptor(descriptor),
                    RelayEvent::Who { sender } => {
                        debug!(target = "peerlink::group", group = %group_name, ?sender, "answering WHO");
                        if let Err(err) = responder.send_me(identity.profile()) {
                            warn!(target = "peerlink::group", error = %err, "failed to answer WHO");
                        }
                        continue;
                    }
                    RelayEvent::Profile { peer, profile } => GroupSignal::Profile { peer, profile },
                    RelayEvent::State(state) => GroupSignal::State(state),
                    RelayEvent::Ping(rtt) => GroupSignal::Ping(rtt),
                    RelayEvent::Error(error) => GroupSignal::Error(error),
                };
                if signals.send(signal).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            group: group.to_string(),
            relay,
            pump,
        })
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn relay(&self) -> &Arc<SignalingRelay> {
        &self.relay
    }

    /// Closes the relay. Sessions created through this group are untouched.
    pub async fn leave(self) {
        self.relay.close().await;
        self.pump.abort();
        info!(target = "peerlink::group", group = %self.group, "left group");
    }
}
