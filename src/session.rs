use crate::broadcaster::{BroadcastHandle, BroadcastMessage};
use crate::card::Card;
use crate::defs::READ_CHUNK_SIZE;
use crate::errors::{RequestError, SessionError};
use crate::events::{EventSink, ServerEvent};
use crate::protocol::{FrameDecoder, Reply, Request};
use crate::registry::ConnectionRegistry;
use crate::snapshot::{CurrencySnapshot, SnapshotStore, WeatherSnapshot, WirePayload};

use chrono::{DateTime, Local};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Server-side state of one client connection.
///
/// A `Session` is shared between its own reader thread, the broadcaster,
/// the data refreshers and the registry. Writes to the socket are
/// serialized through an internal lock so a reply and a broadcast never
/// interleave on the wire.
#[derive(Debug)]
pub struct Session {
    id: u64,
    peer: SocketAddr,
    /// Unlocked handle, only used to shut the socket down.
    socket: TcpStream,
    writer: Mutex<TcpStream>,
    identity: OnceLock<Card>,
    subscribed: AtomicBool,
    open: AtomicBool,
    weather: SnapshotStore<WeatherSnapshot>,
    currency: SnapshotStore<CurrencySnapshot>,
}

impl Session {
    /// Wraps an accepted stream.
    ///
    /// The session keeps its own handles to the socket; the caller keeps
    /// `stream` for reading. `weather` and `currency` seed the cached
    /// snapshots served to this client until the next refresh.
    pub fn new(
        id: u64,
        stream: &TcpStream,
        weather: Arc<WeatherSnapshot>,
        currency: Arc<CurrencySnapshot>,
    ) -> std::io::Result<Self> {
        let peer = stream.peer_addr()?;
        let socket = stream.try_clone()?;
        let writer = stream.try_clone()?;

        let session = Self {
            id,
            peer,
            socket,
            writer: Mutex::new(writer),
            identity: OnceLock::new(),
            subscribed: AtomicBool::new(false),
            open: AtomicBool::new(true),
            weather: SnapshotStore::default(),
            currency: SnapshotStore::default(),
        };
        session.weather.replace_shared(weather);
        session.currency.replace_shared(currency);
        Ok(session)
    }

    /// Registry key of this session.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Registered card, if any.
    pub fn identity(&self) -> Option<&Card> {
        self.identity.get()
    }

    /// Whether this session receives chat broadcasts.
    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    /// `false` once the session reached its terminal state.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Card id when registered, otherwise the peer address.
    pub fn label(&self) -> String {
        match self.identity() {
            Some(card) => card.id().to_string(),
            None => self.peer.to_string(),
        }
    }

    /// Operator listing entry: `name - apartment -> [addr]` or `[addr]`.
    pub fn describe(&self) -> String {
        match self.identity() {
            Some(card) => format!("{} -> [{}]", card, self.peer),
            None => format!("[{}]", self.peer),
        }
    }

    /// Cached weather snapshot served to `WTH` queries.
    pub fn cached_weather(&self) -> Arc<WeatherSnapshot> {
        self.weather.get()
    }

    /// Cached currency snapshot served to `CUR` queries.
    pub fn cached_currency(&self) -> Arc<CurrencySnapshot> {
        self.currency.get()
    }

    /// Replaces the cached weather snapshot.
    pub fn update_weather(&self, weather: Arc<WeatherSnapshot>) {
        self.weather.replace_shared(weather);
    }

    /// Replaces the cached currency snapshot.
    pub fn update_currency(&self, currency: Arc<CurrencySnapshot>) {
        self.currency.replace_shared(currency);
    }

    /// Writes one frame to the peer.
    ///
    /// A failed write closes the session.
    pub fn send(&self, reply: &Reply) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::ConnectionLost("session closed".into()));
        }

        let bytes = reply.encode();
        let result = {
            let mut writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
            writer.write_all(&bytes).and_then(|_| writer.flush())
        };

        result.map_err(|e| {
            log::debug!("Write to {} failed: {}", self.peer, e);
            self.close();
            SessionError::from(e)
        })
    }

    /// Moves the session to its terminal state and shuts the socket down.
    ///
    /// Unblocks the reader thread. Idempotent.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            log::debug!("Closing session {} ({})", self.id, self.peer);
            let _ = self.socket.shutdown(Shutdown::Both);
        }
    }

    fn require_identity(&self) -> Result<&Card, RequestError> {
        self.identity().ok_or(RequestError::NotRegistered)
    }
}

/// Everything a session reader needs besides its own socket.
#[derive(Clone)]
pub struct SessionContext {
    /// Registry the session is listed in.
    pub registry: Arc<ConnectionRegistry<Session>>,
    /// Hand-off to the broadcaster worker.
    pub broadcaster: BroadcastHandle,
    /// Operator-facing reporting sink.
    pub events: Arc<dyn EventSink>,
    /// Longest accepted frame, in bytes.
    pub max_frame_len: usize,
    /// Consecutive malformed frames tolerated before a forced close.
    pub max_frame_errors: usize,
}

/// Formats a chat line as relayed to subscribers:
/// `[HH:MM:SS][apartment] name: text`.
pub fn format_chat_line(card: &Card, text: &str, at: DateTime<Local>) -> String {
    format!(
        "[{}][{}] {}: {}",
        at.format("%H:%M:%S"),
        card.apartment_no(),
        card.name(),
        text
    )
}

/// Applies one request to the session and produces the reply.
pub fn handle_request(
    session: &Session,
    request: Request,
    ctx: &SessionContext,
) -> Result<Reply, RequestError> {
    match request {
        Request::Register { name, apartment_no } => {
            if session.identity().is_some() {
                return Err(RequestError::AlreadyRegistered);
            }
            let card = Card::new(&name, &apartment_no)?;
            let id = card.id().to_string();
            session
                .identity
                .set(card)
                .map_err(|_| RequestError::AlreadyRegistered)?;

            ctx.events.report(ServerEvent::Registered {
                id: id.clone(),
                peer: session.peer(),
            });
            Ok(Reply::Registered(id))
        }
        Request::Subscribe => {
            let card = session.require_identity()?;
            session.subscribed.store(true, Ordering::SeqCst);
            ctx.events.report(ServerEvent::Subscribed(card.id().to_string()));
            Ok(Reply::Ok)
        }
        Request::Unsubscribe => {
            let card = session.require_identity()?;
            if session.subscribed.swap(false, Ordering::SeqCst) {
                ctx.events.report(ServerEvent::Unsubscribed(card.id().to_string()));
            }
            Ok(Reply::Ok)
        }
        Request::Chat(text) => {
            let card = session.require_identity()?;
            if !session.is_subscribed() {
                return Err(RequestError::NotSubscribed);
            }
            let line = format_chat_line(card, &text, Local::now());
            ctx.broadcaster.submit(BroadcastMessage::new(line))?;
            ctx.events.report(ServerEvent::ChatQueued(card.id().to_string()));
            Ok(Reply::Ok)
        }
        Request::WeatherQuery => Ok(Reply::Weather(session.cached_weather().to_payload())),
        Request::CurrencyQuery => Ok(Reply::Currency(session.cached_currency().to_payload())),
    }
}

/// Runs the read loop of one session until EOF, socket failure, explicit
/// close, or too many malformed frames.
///
/// Frames are processed strictly in arrival order. On exit the session is
/// closed and removed from the registry.
pub fn run_session(session: Arc<Session>, mut stream: TcpStream, ctx: SessionContext) {
    let result = read_loop(&session, &mut stream, &ctx);

    match &result {
        Ok(()) => log::debug!("Session {} ({}) ended", session.id(), session.peer()),
        Err(SessionError::TooManyFrameErrors(errors)) => {
            ctx.events.report(ServerEvent::ForceClosed {
                who: session.label(),
                errors: *errors,
            });
        }
        Err(e) => log::info!("Session {} ({}) lost: {}", session.id(), session.peer(), e),
    }

    session.close();
    if ctx.registry.remove(session.id()).is_some() {
        ctx.events.report(ServerEvent::ClientLeft(session.label()));
    }
}

fn read_loop(
    session: &Session,
    stream: &mut TcpStream,
    ctx: &SessionContext,
) -> Result<(), SessionError> {
    let mut decoder = FrameDecoder::new(ctx.max_frame_len);
    let mut buf = [0u8; READ_CHUNK_SIZE];
    let mut frame_errors = 0usize;

    while session.is_open() {
        let n = match stream.read(&mut buf) {
            Ok(0) => {
                log::info!("Client {} closed connection", session.peer());
                return Ok(());
            }
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            // Our own close() shut the socket down under the reader.
            Err(_) if !session.is_open() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        decoder.push(&buf[..n]);

        while let Some(next) = decoder.next_frame() {
            let reply = match next {
                Ok(frame) => {
                    frame_errors = 0;
                    log::debug!("Received from {}: '{}'", session.peer(), frame);
                    Request::from_frame(frame)
                        .and_then(|request| handle_request(session, request, ctx))
                        .unwrap_or_else(|e| {
                            log::debug!("Request from {} rejected: {}", session.peer(), e);
                            Reply::from(&e)
                        })
                }
                Err(e) => {
                    frame_errors += 1;
                    log::warn!(
                        "Malformed frame from {} ({}/{}): {}",
                        session.peer(),
                        frame_errors,
                        ctx.max_frame_errors,
                        e
                    );
                    session.send(&Reply::from(&RequestError::Protocol(e)))?;
                    if frame_errors >= ctx.max_frame_errors {
                        return Err(SessionError::TooManyFrameErrors(frame_errors));
                    }
                    continue;
                }
            };
            session.send(&reply)?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::broadcaster;
    use crate::events::ChannelSink;
    use crate::protocol::{Frame, decode};
    use chrono::TimeZone;
    use crossbeam_channel::{Receiver, Sender};
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    /// Returns a connected (server side, client side) pair of streams.
    pub(crate) fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        (server, client)
    }

    pub(crate) fn new_session(id: u64, stream: &TcpStream) -> Arc<Session> {
        Arc::new(
            Session::new(
                id,
                stream,
                Arc::new(WeatherSnapshot::default()),
                Arc::new(CurrencySnapshot::default()),
            )
            .unwrap(),
        )
    }

    pub(crate) fn read_frame(reader: &mut BufReader<TcpStream>) -> Frame {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        decode(line.trim_end_matches('\n').as_bytes()).unwrap()
    }

    struct Harness {
        ctx: SessionContext,
        events: Receiver<ServerEvent>,
        _stop: Sender<()>,
    }

    fn harness(max_frame_errors: usize) -> Harness {
        let registry = Arc::new(ConnectionRegistry::new());
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(0);
        let (handle, _worker) =
            broadcaster::spawn(Arc::clone(&registry), 16, stop_rx).unwrap();
        let (events_tx, events) = crossbeam_channel::unbounded();

        Harness {
            ctx: SessionContext {
                registry,
                broadcaster: handle,
                events: Arc::new(ChannelSink::new(events_tx)),
                max_frame_len: 256,
                max_frame_errors,
            },
            events,
            _stop: stop_tx,
        }
    }

    fn register(session: &Session, ctx: &SessionContext, name: &str, apt: &str) -> Reply {
        let request = Request::Register {
            name: name.into(),
            apartment_no: apt.into(),
        };
        handle_request(session, request, ctx).unwrap()
    }

    #[test]
    fn test_register_replies_with_id() {
        let h = harness(3);
        let (server, _client) = socket_pair();
        let session = new_session(1, &server);

        let reply = register(&session, &h.ctx, "Ada", "101");

        assert_eq!(reply, Reply::Registered("Ada_101".into()));
        assert_eq!(session.identity().unwrap().id(), "Ada_101");
        assert_eq!(session.label(), "Ada_101");
        assert!(matches!(h.events.try_recv(), Ok(ServerEvent::Registered { .. })));
    }

    #[test]
    fn test_register_validation_and_immutability() {
        let h = harness(3);
        let (server, _client) = socket_pair();
        let session = new_session(1, &server);

        let bad = Request::Register {
            name: "".into(),
            apartment_no: "101".into(),
        };
        assert!(matches!(
            handle_request(&session, bad, &h.ctx),
            Err(RequestError::Validation(_))
        ));
        assert!(session.identity().is_none());

        register(&session, &h.ctx, "Ada", "101");
        let again = Request::Register {
            name: "Eve".into(),
            apartment_no: "666".into(),
        };
        assert_eq!(
            handle_request(&session, again, &h.ctx),
            Err(RequestError::AlreadyRegistered)
        );
        assert_eq!(session.identity().unwrap().id(), "Ada_101");
    }

    #[test]
    fn test_subscribe_requires_registration() {
        let h = harness(3);
        let (server, _client) = socket_pair();
        let session = new_session(1, &server);

        assert_eq!(
            handle_request(&session, Request::Subscribe, &h.ctx),
            Err(RequestError::NotRegistered)
        );
        assert!(!session.is_subscribed());
    }

    #[test]
    fn test_subscription_follows_last_command() {
        let h = harness(3);
        let (server, _client) = socket_pair();
        let session = new_session(1, &server);
        register(&session, &h.ctx, "Ada", "101");

        let sequence = [
            (Request::Subscribe, true),
            (Request::Unsubscribe, false),
            (Request::Unsubscribe, false),
            (Request::Subscribe, true),
            (Request::Subscribe, true),
            (Request::Unsubscribe, false),
        ];
        for (request, expected) in sequence {
            assert_eq!(handle_request(&session, request, &h.ctx), Ok(Reply::Ok));
            assert_eq!(session.is_subscribed(), expected);
        }
    }

    #[test]
    fn test_chat_requires_registration_then_subscription() {
        let h = harness(3);
        let (server, _client) = socket_pair();
        let session = new_session(1, &server);

        assert_eq!(
            handle_request(&session, Request::Chat("hi".into()), &h.ctx),
            Err(RequestError::NotRegistered)
        );

        register(&session, &h.ctx, "Ada", "101");
        assert_eq!(
            handle_request(&session, Request::Chat("hi".into()), &h.ctx),
            Err(RequestError::NotSubscribed)
        );

        handle_request(&session, Request::Subscribe, &h.ctx).unwrap();
        assert_eq!(
            handle_request(&session, Request::Chat("hi".into()), &h.ctx),
            Ok(Reply::Ok)
        );
    }

    #[test]
    fn test_queries_serve_cached_snapshots() {
        let h = harness(3);
        let (server, _client) = socket_pair();
        let session = new_session(1, &server);

        session.update_weather(Arc::new(WeatherSnapshot {
            temperature: 18.5,
            ..WeatherSnapshot::default()
        }));

        let Ok(Reply::Weather(json)) = handle_request(&session, Request::WeatherQuery, &h.ctx)
        else {
            panic!("expected weather reply");
        };
        assert_eq!(WeatherSnapshot::from_payload(&json).unwrap().temperature, 18.5);

        let Ok(Reply::Currency(json)) = handle_request(&session, Request::CurrencyQuery, &h.ctx)
        else {
            panic!("expected currency reply");
        };
        assert_eq!(
            CurrencySnapshot::from_payload(&json).unwrap(),
            CurrencySnapshot::default()
        );
    }

    #[test]
    fn test_format_chat_line() {
        let card = Card::new("Ada", "101").unwrap();
        let at = Local.with_ymd_and_hms(2024, 5, 1, 9, 5, 3).unwrap();
        assert_eq!(
            format_chat_line(&card, "hello | world", at),
            "[09:05:03][101] Ada: hello | world"
        );
    }

    #[test]
    fn test_describe() {
        let h = harness(3);
        let (server, _client) = socket_pair();
        let session = new_session(1, &server);
        let peer = session.peer();

        assert_eq!(session.describe(), format!("[{}]", peer));
        register(&session, &h.ctx, "Ada", "101");
        assert_eq!(session.describe(), format!("Ada - 101 -> [{}]", peer));
    }

    #[test]
    fn test_read_loop_replies_in_order_and_survives_unknown() {
        let h = harness(3);
        let (server, mut client) = socket_pair();
        let session = new_session(7, &server);
        h.ctx.registry.insert(7, Arc::clone(&session));

        let ctx = h.ctx.clone();
        let worker = {
            let session = Arc::clone(&session);
            thread::spawn(move || run_session(session, server, ctx))
        };

        // Split across writes and coalesced in one write.
        client.write_all(b"REG|Ad").unwrap();
        thread::sleep(Duration::from_millis(20));
        client.write_all(b"a|101\nFOO|bar\nSUB\n").unwrap();

        let mut reader = BufReader::new(client.try_clone().unwrap());
        assert_eq!(read_frame(&mut reader), Frame::new("REG", ["Ada_101"]));
        assert_eq!(
            read_frame(&mut reader),
            Frame::new("ERR", ["unknown command: FOO|bar"])
        );
        assert_eq!(read_frame(&mut reader), Frame::bare("OK"));

        drop(reader);
        drop(client);
        worker.join().unwrap();

        assert!(!session.is_open());
        assert!(h.ctx.registry.is_empty());
    }

    #[test]
    fn test_read_loop_force_closes_after_repeated_frame_errors() {
        let h = harness(2);
        let (server, mut client) = socket_pair();
        let session = new_session(3, &server);
        h.ctx.registry.insert(3, Arc::clone(&session));

        let ctx = h.ctx.clone();
        let worker = thread::spawn(move || run_session(session, server, ctx));

        client.write_all(b"MSG|bad\\x\nSUB\n").unwrap();
        let mut reader = BufReader::new(client.try_clone().unwrap());
        assert_eq!(read_frame(&mut reader).tag, "ERR");
        // A good frame in between resets the counter.
        assert_eq!(read_frame(&mut reader), Frame::new("ERR", ["not registered"]));

        client.write_all(b"hello world\n|x\nWTH\n").unwrap();
        assert_eq!(read_frame(&mut reader).tag, "ERR");
        assert_eq!(read_frame(&mut reader).tag, "ERR");

        let mut rest = String::new();
        assert_eq!(reader.read_line(&mut rest).unwrap(), 0);

        worker.join().unwrap();
        assert!(h.ctx.registry.is_empty());

        let forced = h
            .events
            .try_iter()
            .any(|e| matches!(e, ServerEvent::ForceClosed { errors: 2, .. }));
        assert!(forced);
    }

    #[test]
    fn test_send_after_close_fails() {
        let (server, _client) = socket_pair();
        let session = new_session(1, &server);
        session.close();
        session.close();
        assert!(session.send(&Reply::Ok).is_err());
    }
}
