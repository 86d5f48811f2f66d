//! # Resident Hub
//!
//! This crate implements a multi-client notification and chat server for
//! the residents of an apartment building. Residents connect over **TCP**,
//! register with their name and apartment number, opt in to a building-wide
//! chat, and query the latest weather and exchange-rate data, which the
//! server refreshes in the background.
//!
//! ## Features
//!
//! - One reader thread per connection; replies in strict arrival order.
//! - Chat fan-out through a bounded queue drained by a single worker.
//! - Periodic weather/currency refresh pushed into every live session.
//! - Operator control surface: start, stop, list connections, change rate.
//! - Bounded tolerance of malformed frames.
//! - Graceful shutdown with a bounded wait on every thread.
//! - TOML configuration and `env_logger` based logging.
//!
//! ## Architecture Overview
//!
//! - [`server`](crate::server) — Acceptor, server lifecycle and [`ServerController`](crate::server::ServerController).
//! - [`session`](crate::session) — Per-connection state and the request loop.
//! - [`registry`](crate::registry) — Thread-safe set of live connections.
//! - [`broadcaster`](crate::broadcaster) — Chat queue and delivery worker.
//! - [`refresher`](crate::refresher) — Weather and currency refresh threads.
//! - [`feed`](crate::feed) — Data source trait and a simulated feed.
//! - [`protocol`](crate::protocol) — Wire frames, requests and replies.
//! - [`card`](crate::card) — Resident identity.
//! - [`snapshot`](crate::snapshot) — Weather/currency snapshots and their store.
//! - [`events`](crate::events) — Operator-facing event reporting.
//! - [`config`](crate::config) — Server configuration.
//! - [`defs`](crate::defs) — Shared constants and timing parameters.
//! - [`errors`](crate::errors) — Error types used across modules.
//!
//! ## Wire Protocol
//!
//! Every message is one line, `TAG[|field]*\n`. Requests:
//!
//! - `REG|name|apartment` — register; answered with `REG|name_apartment`.
//! - `SUB` / `USB` — subscribe to / unsubscribe from the chat.
//! - `MSG|text` — send a chat line to every subscriber.
//! - `WTH` / `CUR` — latest weather / exchange rates as JSON.
//!
//! Failures are answered with `ERR|reason`; the connection stays open.
//!
//! ## Example: Running the Server
//!
//! ```no_run
//! use std::sync::Arc;
//! use resident_hub::config::ServerConfig;
//! use resident_hub::events::LogSink;
//! use resident_hub::feed::SimulatedFeed;
//! use resident_hub::server::Server;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let feed = Arc::new(SimulatedFeed::new(0.2)?);
//!     let server = Server::start(ServerConfig::new("127.0.0.1", 9000), feed, Arc::new(LogSink))?;
//!     println!("listening on {}", server.local_addr());
//!
//!     // ... later
//!     server.stop()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![deny(unreachable_pub)]

pub mod broadcaster;
pub mod card;
pub mod config;
pub mod defs;
pub mod errors;
pub mod events;
pub mod feed;
pub mod protocol;
pub mod refresher;
pub mod registry;
pub mod server;
pub mod session;
pub mod snapshot;
