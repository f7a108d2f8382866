use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::protocol::{Descriptor, RelayFrame};
use crate::error::SignalingError;
use crate::identity::PeerId;

/// What descriptor delivery needs from the relay.
pub trait RelayLink: Send + Sync {
    fn next_message_id(&self) -> u64;
    fn send_frame(&self, frame: &RelayFrame) -> Result<(), SignalingError>;
    /// Returns the notifier fired when `DESCRIPTOR-ECHO` for `id` arrives.
    fn register_echo(&self, id: u64) -> Arc<Notify>;
    fn forget_echo(&self, id: u64);
    /// When `peer`'s heartbeat was last observed.
    fn last_seen(&self, peer: &PeerId) -> Option<Instant>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Delivered { attempts: u32 },
    /// `should_continue` asked to stop, usually because the session no
    /// longer needs this descriptor.
    Abandoned { attempts: u32 },
}

/// Sends `descriptor` every `interval` until its echo arrives. Gives up with
/// `NoResponse` once the receiver's heartbeat has been absent for `cutoff`,
/// counting from the start of delivery when it was never seen.
pub async fn deliver_with_retry<L, F>(
    link: &L,
    mut descriptor: Descriptor,
    interval: Duration,
    cutoff: Duration,
    mut should_continue: F,
) -> Result<Delivery, SignalingError>
where
    L: RelayLink + ?Sized,
    F: FnMut() -> bool,
{
    let started = Instant::now();
    descriptor.id = link.next_message_id();
    let id = descriptor.id;
    let receiver = descriptor.receiver;
    let echo = link.register_echo(id);
    let frame = RelayFrame::Descriptor(descriptor);
    let mut attempts = 0u32;

    let outcome = loop {
        if !should_continue() {
            break Ok(Delivery::Abandoned { attempts });
        }
        let silent_since = link.last_seen(&receiver).unwrap_or(started);
        if silent_since.elapsed() >= cutoff {
            warn!(
                target = "peerlink::relay",
                %receiver,
                id,
                attempts,
                "receiver silent past cutoff"
            );
            break Err(SignalingError::NoResponse {
                receiver: receiver.to_string(),
                attempts,
            });
        }
        if let Err(err) = link.send_frame(&frame) {
            break Err(err);
        }
        attempts += 1;
        debug!(target = "peerlink::relay", %receiver, id, attempts, "descriptor sent");
        tokio::select! {
            _ = echo.notified() => break Ok(Delivery::Delivered { attempts }),
            _ = tokio::time::sleep(interval) => {}
        }
    };
    link.forget_echo(id);
    outcome
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// Records sent frames; echoes are fired by the test.
    #[derive(Default)]
    pub struct RecordingLink {
        pub sent: Mutex<Vec<RelayFrame>>,
        pub echoes: Mutex<HashMap<u64, Arc<Notify>>>,
        pub seen: Mutex<HashMap<PeerId, Instant>>,
        pub echo_on_send: Mutex<Option<u32>>,
        next_id: AtomicU64,
    }

    impl RelayLink for RecordingLink {
        fn next_message_id(&self) -> u64 {
            self.next_id.fetch_add(1, Ordering::Relaxed)
        }

        fn send_frame(&self, frame: &RelayFrame) -> Result<(), SignalingError> {
            let mut sent = self.sent.lock();
            sent.push(frame.clone());
            if let (RelayFrame::Descriptor(descriptor), Some(nth)) = (frame, *self.echo_on_send.lock()) {
                if sent.len() as u32 >= nth {
                    if let Some(notify) = self.echoes.lock().get(&descriptor.id) {
                        notify.notify_one();
                    }
                }
            }
            Ok(())
        }

        fn register_echo(&self, id: u64) -> Arc<Notify> {
            Arc::clone(self.echoes.lock().entry(id).or_default())
        }

        fn forget_echo(&self, id: u64) {
            self.echoes.lock().remove(&id);
        }

        fn last_seen(&self, peer: &PeerId) -> Option<Instant> {
            self.seen.lock().get(peer).copied()
        }
    }
}
