use crossbeam_channel::Sender;
use std::net::SocketAddr;

/// Operator-facing notifications emitted by the server.
///
/// Front-ends consume these through an [`EventSink`]; the default sink
/// writes them to the log.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerEvent {
    /// The listener is bound and accepting.
    Started(SocketAddr),
    /// The server finished shutting down.
    Stopped,
    /// A TCP connection was accepted.
    ClientJoined(SocketAddr),
    /// A session registered a card.
    Registered {
        /// Card id, `name_apartment`.
        id: String,
        /// Peer address.
        peer: SocketAddr,
    },
    /// A session joined the chat channel.
    Subscribed(String),
    /// A session left the chat channel.
    Unsubscribed(String),
    /// A chat message was queued for broadcast.
    ChatQueued(String),
    /// A session was removed from the registry.
    ClientLeft(String),
    /// A session was closed because of repeated malformed frames.
    ForceClosed {
        /// Identity or address of the session.
        who: String,
        /// Number of consecutive frame errors.
        errors: usize,
    },
    /// New weather data was pushed to all sessions.
    WeatherUpdated,
    /// New currency data was pushed to all sessions.
    CurrencyUpdated,
    /// A data source failed; the previous snapshot stays in place.
    FetchFailed {
        /// `"weather"` or `"currency"`.
        source: &'static str,
        /// Error text.
        reason: String,
    },
    /// The refresh interval changed.
    UpdateRateChanged(u64),
}

/// Receiver of [`ServerEvent`]s.
pub trait EventSink: Send + Sync {
    /// Handles one event. Must not block for long.
    fn report(&self, event: ServerEvent);
}

/// Writes every event through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn report(&self, event: ServerEvent) {
        match event {
            ServerEvent::Started(addr) => log::info!("Server successfully started on [{}]", addr),
            ServerEvent::Stopped => log::info!("Server stopped"),
            ServerEvent::ClientJoined(peer) => log::info!("New TCP connection from {}", peer),
            ServerEvent::Registered { id, peer } => {
                log::info!("{} ({}) scanned their card and entered the apartment", id, peer)
            }
            ServerEvent::Subscribed(who) => log::info!("{} subscribed to the message channel", who),
            ServerEvent::Unsubscribed(who) => {
                log::info!("{} unsubscribed from the message channel", who)
            }
            ServerEvent::ChatQueued(who) => log::debug!("{} sent a message to the group chat", who),
            ServerEvent::ClientLeft(who) => log::info!("{} has left the apartment", who),
            ServerEvent::ForceClosed { who, errors } => {
                log::warn!("Closed {} after {} malformed frames", who, errors)
            }
            ServerEvent::WeatherUpdated => log::info!("UPDATED WEATHER | weather data refreshed"),
            ServerEvent::CurrencyUpdated => log::info!("UPDATED CURRENCY | currency data refreshed"),
            ServerEvent::FetchFailed { source, reason } => {
                log::warn!("Failed to refresh {} data, keeping previous: {}", source, reason)
            }
            ServerEvent::UpdateRateChanged(secs) => {
                log::info!("Update rate changed to {} seconds", secs)
            }
        }
    }
}

/// Forwards events to a channel, for a front-end to drain.
///
/// Events are dropped silently once the receiving side is gone.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<ServerEvent>,
}

impl ChannelSink {
    /// Wraps the sending half of a channel.
    pub fn new(tx: Sender<ServerEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn report(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }
}
