use crate::broadcaster;
use crate::config::ServerConfig;
use crate::defs::{
    ACCEPT_TICK_PERIOD_MSEC, GREETING_TEXT, JOIN_POLL_PERIOD_MSEC, SESSION_WRITE_TIMEOUT_MS,
};
use crate::errors::ServerError;
use crate::events::{EventSink, ServerEvent};
use crate::feed::DataSource;
use crate::protocol::Reply;
use crate::refresher::{DataRefresher, validate_interval};
use crate::registry::ConnectionRegistry;
use crate::session::{Session, SessionContext, run_session};

use crossbeam_channel::{Receiver, Sender, TryRecvError, select};
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type ThreadList = Arc<Mutex<Vec<JoinHandle<()>>>>;

/// A running server.
///
/// Created by [`Server::start`], which binds the listener and launches the
/// acceptor, the broadcaster, both data refreshers and the connection
/// reaper. [`Server::stop`] tears everything down again; dropping a running
/// server stops it as well.
pub struct Server {
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry<Session>>,
    refresher: Arc<DataRefresher>,
    events: Arc<dyn EventSink>,
    stop_tx: Mutex<Option<Sender<()>>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    session_threads: ThreadList,
    shutdown_timeout: Duration,
}

impl Server {
    /// Binds `config.host:config.port` and starts all worker threads.
    ///
    /// # Errors
    /// - [`ServerError::BindError`] if the address cannot be bound.
    /// - [`ServerError::InvalidConfig`] if `config` fails validation.
    /// - [`ServerError::ThreadSpawn`] if a worker cannot be started; any
    ///   worker already running is stopped before returning.
    pub fn start(
        config: ServerConfig,
        source: Arc<dyn DataSource>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let addr = config.bind_addr();
        log::info!("Binding TCP server to address: {}", addr);
        let listener = TcpListener::bind(&addr)
            .and_then(|l| l.set_nonblocking(true).map(|_| l))
            .map_err(|e| ServerError::BindError(format!("{}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::BindError(e.to_string()))?;

        let registry = Arc::new(ConnectionRegistry::new());
        let refresher = Arc::new(DataRefresher::new(
            source,
            Arc::clone(&registry),
            Arc::clone(&events),
            config.update_interval_secs,
        )?);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);

        let server = Self {
            local_addr,
            registry,
            refresher,
            events,
            stop_tx: Mutex::new(Some(stop_tx)),
            acceptor: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            session_threads: Arc::new(Mutex::new(Vec::new())),
            shutdown_timeout: config.shutdown_timeout(),
        };

        if let Err(e) = server.launch(listener, &config, &stop_rx) {
            log::error!("Server startup failed: {}", e);
            let _ = server.stop();
            return Err(e);
        }

        server.events.report(ServerEvent::Started(local_addr));
        Ok(server)
    }

    fn launch(
        &self,
        listener: TcpListener,
        config: &ServerConfig,
        stop: &Receiver<()>,
    ) -> Result<(), ServerError> {
        let (broadcast, broadcaster) = broadcaster::spawn(
            Arc::clone(&self.registry),
            config.broadcast_queue_capacity,
            stop.clone(),
        )?;
        lock(&self.workers).push(broadcaster);

        let refreshers = self.refresher.start(stop)?;
        lock(&self.workers).extend(refreshers);

        let reaper = {
            let registry = Arc::clone(&self.registry);
            let threads = Arc::clone(&self.session_threads);
            let events = Arc::clone(&self.events);
            let stop = stop.clone();
            let period = config.reap_interval();
            thread::Builder::new()
                .name("reaper".into())
                .spawn(move || reap_loop(&registry, &threads, events.as_ref(), &stop, period))
                .map_err(|e| ServerError::ThreadSpawn(e.to_string()))?
        };
        lock(&self.workers).push(reaper);

        let acceptor = Acceptor {
            listener,
            ctx: SessionContext {
                registry: Arc::clone(&self.registry),
                broadcaster: broadcast,
                events: Arc::clone(&self.events),
                max_frame_len: config.max_frame_len,
                max_frame_errors: config.max_consecutive_frame_errors,
            },
            refresher: Arc::clone(&self.refresher),
            session_threads: Arc::clone(&self.session_threads),
            stop: stop.clone(),
            next_id: 0,
        };
        let handle = thread::Builder::new()
            .name("acceptor".into())
            .spawn(move || acceptor.run())
            .map_err(|e| ServerError::ThreadSpawn(e.to_string()))?;
        *lock(&self.acceptor) = Some(handle);

        Ok(())
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `true` until [`stop`](Self::stop) is called.
    pub fn is_running(&self) -> bool {
        lock(&self.stop_tx).is_some()
    }

    /// Identity-or-address of every live session.
    pub fn list_open_connections(&self) -> Vec<String> {
        let mut listing: Vec<String> = self
            .registry
            .snapshot()
            .iter()
            .filter(|s| s.is_open())
            .map(|s| s.describe())
            .collect();
        listing.sort();
        listing
    }

    /// Number of sessions in the registry.
    pub fn open_connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Changes the weather/currency refresh interval.
    ///
    /// # Errors
    /// [`ServerError::InvalidUpdateRate`] below the minimum interval.
    pub fn change_update_rate(&self, secs: u64) -> Result<(), ServerError> {
        self.refresher.change_update_rate(secs)
    }

    /// Stops the server.
    ///
    /// In order: stop accepting, signal every worker, close every session
    /// socket, then wait for all threads up to the shutdown timeout.
    ///
    /// # Errors
    /// - [`ServerError::NotRunning`] if already stopped.
    /// - [`ServerError::ShutdownTimeout`] if some threads outlived the
    ///   deadline. The server is stopped either way.
    pub fn stop(&self) -> Result<(), ServerError> {
        let Some(stop_tx) = lock(&self.stop_tx).take() else {
            return Err(ServerError::NotRunning);
        };
        log::info!("Initiating server shutdown");
        let deadline = Instant::now() + self.shutdown_timeout;

        drop(stop_tx);
        let mut stragglers = 0;
        if let Some(acceptor) = lock(&self.acceptor).take() {
            stragglers += join_until(vec![acceptor], deadline);
        }

        let sessions = self.registry.drain();
        log::info!("Closing {} open connection(s)", sessions.len());
        for session in &sessions {
            session.close();
            self.events.report(ServerEvent::ClientLeft(session.label()));
        }

        let mut threads: Vec<JoinHandle<()>> = lock(&self.session_threads).drain(..).collect();
        threads.extend(lock(&self.workers).drain(..));
        stragglers += join_until(threads, deadline);

        self.events.report(ServerEvent::Stopped);
        if stragglers > 0 {
            log::warn!("{} thread(s) still running after shutdown deadline", stragglers);
            return Err(ServerError::ShutdownTimeout(stragglers));
        }
        log::info!("Server shutdown complete");
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.is_running() {
            log::debug!("Server dropped while running, initiating shutdown");
            let _ = self.stop();
        }
    }
}

/// Accept loop. Runs on its own thread until the stop signal.
struct Acceptor {
    listener: TcpListener,
    ctx: SessionContext,
    refresher: Arc<DataRefresher>,
    session_threads: ThreadList,
    stop: Receiver<()>,
    next_id: u64,
}

impl Acceptor {
    fn run(mut self) {
        log::info!("Acceptor waiting for connections");
        let tick = Duration::from_millis(ACCEPT_TICK_PERIOD_MSEC);

        while !stop_requested(&self.stop) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.admit(stream, peer) {
                        log::warn!("Failed to set up session for {}: {}", peer, e);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(tick),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("Failed to accept TCP connection: {}", e);
                    thread::sleep(tick);
                }
            }
        }
        log::info!("Acceptor stopped, listener closed");
    }

    /// Greets the peer, registers the session and starts its reader thread.
    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) -> std::io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_write_timeout(Some(Duration::from_millis(SESSION_WRITE_TIMEOUT_MS)))?;

        self.next_id += 1;
        let id = self.next_id;
        let session = Arc::new(Session::new(
            id,
            &stream,
            self.refresher.latest_weather(),
            self.refresher.latest_currency(),
        )?);

        session
            .send(&Reply::Greeting(GREETING_TEXT.to_string()))
            .map_err(|e| std::io::Error::new(ErrorKind::BrokenPipe, e.to_string()))?;

        self.ctx.registry.insert(id, Arc::clone(&session));
        self.ctx.events.report(ServerEvent::ClientJoined(peer));

        let ctx = self.ctx.clone();
        let spawned = thread::Builder::new()
            .name(format!("session-{}", id))
            .spawn(move || run_session(session, stream, ctx));

        match spawned {
            Ok(handle) => {
                lock(&self.session_threads).push(handle);
                Ok(())
            }
            Err(e) => {
                if let Some(session) = self.ctx.registry.remove(id) {
                    session.close();
                }
                Err(e)
            }
        }
    }
}

/// Periodically drops closed sessions from the registry and joins
/// finished session threads.
fn reap_loop(
    registry: &ConnectionRegistry<Session>,
    threads: &Mutex<Vec<JoinHandle<()>>>,
    events: &dyn EventSink,
    stop: &Receiver<()>,
    period: Duration,
) {
    loop {
        select! {
            recv(stop) -> _ => break,
            default(period) => {
                for session in registry.remove_where(|s| !s.is_open()) {
                    events.report(ServerEvent::ClientLeft(session.label()));
                }

                let finished: Vec<JoinHandle<()>> = {
                    let mut threads = lock(threads);
                    let (finished, running) =
                        std::mem::take(&mut *threads).into_iter().partition(|h| h.is_finished());
                    *threads = running;
                    finished
                };
                for handle in finished {
                    if handle.join().is_err() {
                        log::error!("A session thread panicked");
                    }
                }
            }
        }
    }
    log::debug!("Reaper stopped");
}

/// Control surface for front-ends.
///
/// Wraps at most one [`Server`] and mirrors the start/stop/list/rate
/// operations a GUI or console exposes.
pub struct ServerController {
    config: Mutex<ServerConfig>,
    source: Arc<dyn DataSource>,
    events: Arc<dyn EventSink>,
    server: Mutex<Option<Server>>,
}

impl ServerController {
    /// Creates a stopped controller. `config` supplies everything but
    /// host and port.
    pub fn new(
        config: ServerConfig,
        source: Arc<dyn DataSource>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config: Mutex::new(config),
            source,
            events,
            server: Mutex::new(None),
        }
    }

    /// Starts a server on `host:port` and returns the bound address.
    ///
    /// # Errors
    /// [`ServerError::AlreadyRunning`] if a server is running, otherwise
    /// whatever [`Server::start`] returns.
    pub fn start_server(&self, host: &str, port: u16) -> Result<SocketAddr, ServerError> {
        let mut slot = lock(&self.server);
        if slot.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let config = {
            let mut config = lock(&self.config);
            config.host = host.to_string();
            config.port = port;
            config.clone()
        };
        let server = Server::start(config, Arc::clone(&self.source), Arc::clone(&self.events))?;
        let addr = server.local_addr();
        *slot = Some(server);
        Ok(addr)
    }

    /// Stops the running server; returns once its sessions are cleaned up.
    ///
    /// # Errors
    /// [`ServerError::NotRunning`] if no server is running.
    pub fn stop_server(&self) -> Result<(), ServerError> {
        let server = lock(&self.server).take().ok_or(ServerError::NotRunning)?;
        server.stop()
    }

    /// `true` while a server is running.
    pub fn is_running(&self) -> bool {
        lock(&self.server).is_some()
    }

    /// Identity-or-address of every live session.
    ///
    /// # Errors
    /// [`ServerError::NotRunning`] if no server is running.
    pub fn list_open_connections(&self) -> Result<Vec<String>, ServerError> {
        lock(&self.server)
            .as_ref()
            .map(Server::list_open_connections)
            .ok_or(ServerError::NotRunning)
    }

    /// Changes the refresh interval, for the running server and any later one.
    ///
    /// # Errors
    /// [`ServerError::InvalidUpdateRate`] outside the accepted interval range.
    pub fn change_update_rate(&self, secs: u64) -> Result<(), ServerError> {
        if let Some(server) = lock(&self.server).as_ref() {
            server.change_update_rate(secs)?;
        } else {
            validate_interval(secs)?;
        }
        lock(&self.config).update_interval_secs = secs;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

fn stop_requested(stop: &Receiver<()>) -> bool {
    matches!(stop.try_recv(), Err(TryRecvError::Disconnected))
}

/// Joins every handle that finishes before `deadline`; returns how many
/// were still running when it passed.
fn join_until(mut pending: Vec<JoinHandle<()>>, deadline: Instant) -> usize {
    loop {
        let (finished, running): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|h| h.is_finished());
        for handle in finished {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.join().is_err() {
                log::error!("Thread {} panicked", name);
            }
        }
        pending = running;

        if pending.is_empty() {
            return 0;
        }
        if Instant::now() >= deadline {
            for handle in &pending {
                let name = handle.thread().name().unwrap_or("unnamed");
                log::warn!("Thread {} did not stop in time", name);
            }
            return pending.len();
        }
        thread::sleep(Duration::from_millis(JOIN_POLL_PERIOD_MSEC));
    }
}
