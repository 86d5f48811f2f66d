use thiserror::Error;

/// Errors produced while decoding a single wire frame.
///
/// A frame error is recoverable: the session reports it to the peer and
/// keeps reading, up to a bounded number of consecutive failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The frame contained no bytes at all.
    #[error("empty frame")]
    Empty,

    /// The frame exceeded the configured maximum length (in bytes).
    #[error("frame exceeds {0} bytes")]
    TooLong(usize),

    /// The frame was not valid UTF-8 text.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    /// A backslash was followed by a character that is not a known escape.
    #[error("invalid escape sequence '\\{0}'")]
    InvalidEscape(char),

    /// The frame ended in the middle of an escape sequence.
    #[error("dangling escape at end of field")]
    DanglingEscape,

    /// The command tag is empty, too long or not ASCII alphanumeric.
    #[error("invalid command tag '{0}'")]
    InvalidTag(String),
}

/// Errors raised when handing a chat message to the broadcaster.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    /// The queue stayed full for longer than the submit timeout.
    #[error("broadcast queue is full")]
    QueueFull,

    /// The broadcaster worker is gone (server stopping).
    #[error("broadcaster is not running")]
    Closed,
}

/// Per-request failures.
///
/// Every variant is answered with an `ERR` frame carrying the `Display`
/// text; the connection stays open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Arguments failed validation (empty name, non-positive apartment, ...).
    #[error("{0}")]
    Validation(String),

    /// The command requires a registered identity.
    #[error("not registered")]
    NotRegistered,

    /// Chat requires an active subscription.
    #[error("not subscribed")]
    NotSubscribed,

    /// The session already carries an identity; it cannot be replaced.
    #[error("already registered")]
    AlreadyRegistered,

    /// The command tag is well-formed but not one the server knows.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// The frame itself could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),

    /// The chat message could not be queued for delivery.
    #[error("broadcast failed: {0}")]
    Broadcast(#[from] BroadcastError),
}

/// Errors that end a session.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The socket failed on read or write; the peer is gone.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The peer kept sending undecodable frames.
    #[error("closed after {0} consecutive malformed frames")]
    TooManyFrameErrors(usize),
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::ConnectionLost(err.to_string())
    }
}

/// Errors returned by weather/currency data sources.
///
/// The refresher keeps its previous snapshot and retries on the next tick.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The source could not be reached.
    #[error("data source unavailable: {0}")]
    Unavailable(String),

    /// The source answered with data that does not fit the snapshot schema.
    #[error("malformed data: {0}")]
    Malformed(String),
}

/// Errors returned from the server control surface.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The TCP listener failed to bind to the specified address/port.
    ///
    /// This is the only condition that aborts startup.
    #[error("Failed to bind TCP listener: {0}")]
    BindError(String),

    /// `start_server` was called while a server is running.
    #[error("Server is already running")]
    AlreadyRunning,

    /// A control operation needs a running server.
    #[error("Server is not running")]
    NotRunning,

    /// Requested refresh interval is outside the allowed range.
    #[error(
        "Update interval of {0}s must be between {min}s and {max}s",
        min = crate::defs::MIN_UPDATE_INTERVAL_SEC,
        max = crate::defs::MAX_UPDATE_INTERVAL_SEC
    )]
    InvalidUpdateRate(u64),

    /// The configuration failed validation.
    #[error("Invalid server config: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// A background worker thread could not be spawned.
    #[error("Failed to spawn worker thread: {0}")]
    ThreadSpawn(String),

    /// Some threads were still running when the shutdown deadline passed.
    #[error("{0} worker thread(s) did not stop before the shutdown deadline")]
    ShutdownTimeout(usize),
}

/// Errors produced while loading [`ServerConfig`](crate::config::ServerConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config: {0}")]
    Io(String),

    /// The file is not valid TOML or does not match the expected keys.
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// A value is outside its allowed range.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// High-level errors returned by the server and client binaries.
#[derive(Error, Debug)]
pub enum CliError {
    /// General wrapper around any textual failure.
    #[error("Cli failed with error: {0}")]
    GeneralError(String),
}

impl From<ServerError> for CliError {
    fn from(err: ServerError) -> Self {
        CliError::GeneralError(err.to_string())
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        CliError::GeneralError(err.to_string())
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::GeneralError(err.to_string())
    }
}
