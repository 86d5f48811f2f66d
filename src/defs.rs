/// Lowest accepted refresh interval for weather and currency data, in seconds.
pub const MIN_UPDATE_INTERVAL_SEC: u64 = 10;

/// Highest accepted refresh interval, in seconds (one day).
pub const MAX_UPDATE_INTERVAL_SEC: u64 = 86_400;

/// Refresh interval used when no configuration overrides it, in seconds.
pub const DEFAULT_UPDATE_INTERVAL_SEC: u64 = 60;

/// Default listen host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default listen port.
pub const DEFAULT_PORT: u16 = 9000;

/// Capacity of the chat hand-off queue between sessions and the broadcaster.
pub const DEFAULT_BROADCAST_QUEUE_CAPACITY: usize = 256;

/// How long a session waits for room in a full broadcast queue
/// before rejecting the chat message.
pub const BROADCAST_SUBMIT_TIMEOUT_MS: u64 = 500;

/// Longest accepted frame in bytes, excluding the terminating newline.
pub const DEFAULT_MAX_FRAME_LEN: usize = 4096;

/// Consecutive malformed frames tolerated before a session is force-closed.
pub const DEFAULT_MAX_CONSECUTIVE_FRAME_ERRORS: usize = 3;

/// Upper bound on how long `stop` waits for worker threads to finish.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 3000;

/// Period of the connection reaper sweep.
pub const DEFAULT_REAP_INTERVAL_MS: u64 = 500;

/// Polling period of the non-blocking accept loop.
///
/// Bounds how long the acceptor takes to notice a shutdown request.
pub const ACCEPT_TICK_PERIOD_MSEC: u64 = 50;

/// Polling period used while waiting for threads to finish during shutdown.
pub const JOIN_POLL_PERIOD_MSEC: u64 = 10;

/// Size of the per-session socket read buffer.
pub const READ_CHUNK_SIZE: usize = 1024;

/// Text of the unsolicited greeting frame sent right after accept.
pub const GREETING_TEXT: &str = "Welcome to the apartment! Register with your name and apartment number.";

/// Write timeout applied to every session socket, in milliseconds.
///
/// A peer that stops reading is closed instead of stalling broadcasts.
pub const SESSION_WRITE_TIMEOUT_MS: u64 = 2000;
