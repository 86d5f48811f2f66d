use crate::defs::BROADCAST_SUBMIT_TIMEOUT_MS;
use crate::errors::{BroadcastError, ServerError};
use crate::protocol::Reply;
use crate::registry::ConnectionRegistry;
use crate::session::Session;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, select};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A formatted chat line waiting for delivery.
///
/// The recipients are not fixed at submission: the worker delivers to
/// whoever is subscribed when it dequeues the message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BroadcastMessage(String);

impl BroadcastMessage {
    /// Wraps an already formatted chat line.
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// The chat line.
    pub fn text(&self) -> &str {
        &self.0
    }
}

/// Submitting side of the broadcast queue. Cheap to clone.
#[derive(Clone, Debug)]
pub struct BroadcastHandle {
    tx: Sender<BroadcastMessage>,
    submit_timeout: Duration,
}

impl BroadcastHandle {
    /// Queues a message for delivery.
    ///
    /// Waits for room in a full queue for a bounded time.
    pub fn submit(&self, message: BroadcastMessage) -> Result<(), BroadcastError> {
        self.tx
            .send_timeout(message, self.submit_timeout)
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => BroadcastError::QueueFull,
                SendTimeoutError::Disconnected(_) => BroadcastError::Closed,
            })
    }
}

/// Starts the broadcaster worker.
///
/// The single worker serializes delivery, so every subscriber observes
/// messages in submission order. It exits when `stop` is signalled
/// (its sender dropped) or when every [`BroadcastHandle`] is gone.
pub fn spawn(
    registry: Arc<ConnectionRegistry<Session>>,
    capacity: usize,
    stop: Receiver<()>,
) -> Result<(BroadcastHandle, JoinHandle<()>), ServerError> {
    let (tx, rx) = crossbeam_channel::bounded::<BroadcastMessage>(capacity);

    let handle = thread::Builder::new()
        .name("broadcaster".into())
        .spawn(move || {
            log::info!("Broadcaster started (queue capacity {})", capacity);
            loop {
                select! {
                    recv(stop) -> _ => break,
                    recv(rx) -> message => match message {
                        Ok(message) => {
                            deliver(&registry, &message);
                        }
                        Err(_) => break,
                    },
                }
            }
            log::info!("Broadcaster stopped");
        })
        .map_err(|e| ServerError::ThreadSpawn(e.to_string()))?;

    Ok((
        BroadcastHandle {
            tx,
            submit_timeout: Duration::from_millis(BROADCAST_SUBMIT_TIMEOUT_MS),
        },
        handle,
    ))
}

/// Writes `message` to every open, subscribed session in a registry
/// snapshot. Returns the number of sessions that received it.
///
/// A failed write closes that session only; delivery to the rest goes on.
pub fn deliver(registry: &ConnectionRegistry<Session>, message: &BroadcastMessage) -> usize {
    let reply = Reply::Chat(message.text().to_string());
    let mut delivered = 0;

    for session in registry.snapshot() {
        if !session.is_open() || !session.is_subscribed() {
            continue;
        }
        match session.send(&reply) {
            Ok(()) => delivered += 1,
            Err(e) => log::warn!("Failed to deliver chat to {}: {}", session.label(), e),
        }
    }

    log::trace!("Delivered chat message to {} session(s)", delivered);
    delivered
}
