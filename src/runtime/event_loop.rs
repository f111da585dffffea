//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking accept/read/write syscalls. Each readiness
//! notification becomes one or more [`ServerEvent`]s which are dispatched
//! serially on the loop thread.
//!
//! The status reporter has no timer thread; its deadline bounds the poll
//! timeout and it fires between event batches.

use crate::config::Config;
use crate::error::{ServerError, SocketErrorKind};
use crate::protocols::echo;
use crate::runtime::{ClientId, Connection, ConnectionRegistry, IdAllocator, ReadEnd};
use crate::status::{ServerStats, StatusReport, StatusReporter};
use chrono::Local;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Events produced by the I/O layer and handled on the loop thread.
#[derive(Debug)]
pub enum ServerEvent {
    /// The listener has pending connections.
    Incoming,
    /// Bytes drained from a client during one readiness notification.
    Data { id: ClientId, data: Vec<u8> },
    /// The client socket can accept queued output.
    Writable(ClientId),
    /// A socket error on an established connection.
    Error { id: ClientId, error: io::Error },
    /// The connection is finished, by peer close or after an error.
    Disconnected(ClientId),
    /// The status interval elapsed.
    StatusTick,
}

/// Readiness flags copied out of `mio::Events` so handlers can borrow the
/// server mutably.
#[derive(Debug, Clone, Copy)]
struct Readiness {
    token: Token,
    readable: bool,
    writable: bool,
    error: bool,
}

impl From<&mio::event::Event> for Readiness {
    fn from(event: &mio::event::Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable(),
            error: event.is_error(),
        }
    }
}

/// Stops a running [`Server`] from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Ask the loop to close every connection and return from `run`.
    pub fn shutdown(&self) -> io::Result<()> {
        self.flag.store(true, Ordering::Release);
        self.waker.wake()
    }
}

/// Single-threaded echo server.
pub struct Server {
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    registry: ConnectionRegistry<TcpStream>,
    ids: IdAllocator,
    reporter: Option<StatusReporter>,
    stats: ServerStats,
    read_buf: Vec<u8>,
    max_outbound: usize,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
    instance_id: u32,
}

impl Server {
    /// Bind the listener and prepare the event loop.
    ///
    /// A bind or listen failure is returned as-is; there is no retry.
    pub fn start(config: &Config) -> Result<Self, ServerError> {
        let addr = resolve(&config.host, config.port)?;

        info!(
            addr = %addr,
            instance = config.instance_id,
            "Starting server"
        );

        let listener = create_listener(addr, config.backlog).map_err(|source| {
            error!(addr = %addr, error = %source, "Failed to start server");
            ServerError::Bind { addr, source }
        })?;
        let mut listener = TcpListener::from_std(listener);
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let now = Instant::now();
        let reporter = config
            .status_interval
            .map(|interval| StatusReporter::new(interval, now));

        info!(
            addr = %local_addr,
            max_connections = config.max_connections,
            status_interval_ms = config.status_interval.map(|d| d.as_millis() as u64),
            "Server listening"
        );

        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity),
            listener: Some(listener),
            local_addr,
            registry: ConnectionRegistry::new(config.max_connections),
            ids: IdAllocator::new(config.first_client_id),
            reporter,
            stats: ServerStats::default(),
            read_buf: vec![0u8; config.read_chunk_size],
            max_outbound: config.max_outbound,
            shutdown: Arc::new(AtomicBool::new(false)),
            waker,
            instance_id: config.instance_id,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry<TcpStream> {
        &self.registry
    }

    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    /// Snapshot of the listener and live connections.
    pub fn status(&self) -> StatusReport {
        let local_addr = self.listener.as_ref().map(|_| self.local_addr);
        StatusReport::capture(&self.registry, local_addr, self.stats)
    }

    /// Run until a [`ShutdownHandle`] fires.
    pub fn run(&mut self) -> io::Result<()> {
        let span = info_span!("server", instance = self.instance_id);
        let _enter = span.enter();

        info!("Event loop started");
        while !self.shutdown.load(Ordering::Acquire) {
            self.turn(None)?;
        }

        self.close_all();
        info!("Event loop stopped");
        Ok(())
    }

    /// Wait for readiness (at most `timeout`, or until the next status tick)
    /// and dispatch everything that became ready.
    pub fn turn(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let until_status = self
            .reporter
            .as_ref()
            .map(|r| r.time_until_due(Instant::now()));
        let timeout = match (timeout, until_status) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let ready: Vec<Readiness> = self.events.iter().map(Readiness::from).collect();
        for readiness in ready {
            match readiness.token {
                LISTENER_TOKEN => self.dispatch(ServerEvent::Incoming),
                WAKER_TOKEN => debug!("Woken"),
                Token(token) => self.connection_ready(token, readiness),
            }
        }

        let due = match self.reporter.as_mut() {
            Some(reporter) => reporter.poll_due(Instant::now()),
            None => false,
        };
        if due {
            self.dispatch(ServerEvent::StatusTick);
        }

        Ok(())
    }

    /// Invoke the handler for one event.
    pub fn dispatch(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Incoming => self.handle_incoming(),
            ServerEvent::Data { id, data } => self.handle_data(id, data),
            ServerEvent::Writable(id) => self.handle_writable(id),
            ServerEvent::Error { id, error } => self.handle_socket_error(id, error),
            ServerEvent::Disconnected(id) => self.handle_disconnected(id),
            ServerEvent::StatusTick => self.status().log(),
        }
    }

    /// Translate readiness on a client token into events.
    fn connection_ready(&mut self, token: usize, readiness: Readiness) {
        let Some(conn) = self.registry.get_mut_by_token(token) else {
            return;
        };
        let id = conn.id;

        if readiness.error {
            if let Ok(Some(error)) = conn.stream.take_error() {
                self.dispatch(ServerEvent::Error { id, error });
                self.dispatch(ServerEvent::Disconnected(id));
                return;
            }
        }

        // Paused connections pick up pending input when reading is re-armed
        if readiness.readable && conn.want_read {
            let mut data = Vec::new();
            let end = conn.drain(&mut self.read_buf, &mut data);

            if !data.is_empty() || matches!(end, ReadEnd::WouldBlock) {
                self.dispatch(ServerEvent::Data { id, data });
            }

            match end {
                ReadEnd::WouldBlock => {}
                ReadEnd::Eof => {
                    self.dispatch(ServerEvent::Disconnected(id));
                    return;
                }
                ReadEnd::Failed(error) => {
                    self.dispatch(ServerEvent::Error { id, error });
                    self.dispatch(ServerEvent::Disconnected(id));
                    return;
                }
            }
        }

        if readiness.writable && self.registry.contains(id) {
            self.dispatch(ServerEvent::Writable(id));
        }
    }

    fn handle_incoming(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };

            match listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    /// Register a freshly accepted socket and greet it.
    ///
    /// The id is taken only once the socket is registered, so a rejected or
    /// failed accept never consumes one.
    fn admit(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        if self.registry.is_full() {
            self.stats.rejected += 1;
            warn!(
                peer = %peer,
                max_connections = self.registry.capacity(),
                "Connection limit reached, rejecting"
            );
            return;
        }

        let token = self.registry.next_token();
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, Token(token), Interest::READABLE)
        {
            self.stats.rejected += 1;
            error!(peer = %peer, error = %e, "Failed to register connection");
            return;
        }

        let Some(id) = self.ids.next_id() else {
            self.stats.rejected += 1;
            warn!(peer = %peer, "Client id space exhausted, rejecting");
            let _ = self.poll.registry().deregister(&mut stream);
            return;
        };

        let mut conn = Connection::new(id, peer, stream);
        conn.queue(&echo::welcome(id.0));
        conn.open();

        match self.registry.add(conn) {
            Ok(added) => debug_assert_eq!(added, token),
            Err(mut conn) => {
                self.stats.rejected += 1;
                warn!(client_id = id.0, peer = %peer, "Registry refused connection");
                let _ = self.poll.registry().deregister(&mut conn.stream);
                return;
            }
        }
        self.stats.accepted += 1;

        info!(
            client_id = id.0,
            peer_addr = %peer.ip(),
            peer_port = peer.port(),
            clients = self.registry.len(),
            "Client connected"
        );

        match self.flush(id) {
            Ok(()) => debug!(client_id = id.0, "Welcome sent"),
            Err(e) => self.fail_connection(id, e),
        }
    }

    /// Echo one unit back with a timestamp preamble.
    fn handle_data(&mut self, id: ClientId, data: Vec<u8>) {
        if data.is_empty() {
            debug!(client_id = id.0, "No data available");
            return;
        }

        self.stats.echo_units += 1;
        self.stats.bytes_in += data.len() as u64;
        debug!(
            client_id = id.0,
            payload = %echo::describe_payload(&data),
            "Received data"
        );

        let response = echo::echo_response(&data, Local::now().time());
        debug!(
            client_id = id.0,
            payload = %echo::describe_payload(&response),
            "Sending response"
        );

        let Some(conn) = self.registry.lookup_mut(id) else {
            return;
        };
        conn.queue(&response);
        if let Err(e) = self.flush(id) {
            self.fail_connection(id, e);
        }
    }

    fn handle_writable(&mut self, id: ClientId) {
        if let Err(e) = self.flush(id) {
            self.fail_connection(id, e);
        }
    }

    fn handle_socket_error(&mut self, id: ClientId, error: io::Error) {
        let category = SocketErrorKind::classify(&error);
        match self.registry.lookup_mut(id) {
            Some(conn) => {
                conn.fail();
                self.stats.socket_errors += 1;
                error!(
                    client_id = id.0,
                    peer = %conn.peer,
                    category = %category,
                    error = %error,
                    "Client socket error"
                );
            }
            None => debug!(client_id = id.0, error = %error, "Error on unknown client ignored"),
        }
    }

    /// Remove the connection, then release its socket. Unknown ids are
    /// ignored so a repeated disconnect is harmless.
    fn handle_disconnected(&mut self, id: ClientId) {
        let Some(mut conn) = self.registry.remove(id) else {
            debug!(client_id = id.0, "Disconnect for unknown client ignored");
            return;
        };
        conn.close();
        let _ = self.poll.registry().deregister(&mut conn.stream);

        if conn.has_pending() {
            let unsent = conn.pending_len();
            self.stats.unsent_dropped += unsent as u64;
            debug!(client_id = id.0, unsent, "Dropping unsent output on close");
        }

        info!(
            client_id = id.0,
            peer_addr = %conn.peer.ip(),
            peer_port = conn.peer.port(),
            clients = self.registry.len(),
            "Client disconnected"
        );
    }

    fn fail_connection(&mut self, id: ClientId, error: io::Error) {
        self.dispatch(ServerEvent::Error { id, error });
        self.dispatch(ServerEvent::Disconnected(id));
    }

    /// Push queued output and keep poll interest in sync with it: writable
    /// while anything is queued, readable while the queue is under
    /// `max_outbound`.
    fn flush(&mut self, id: ClientId) -> io::Result<()> {
        let Some(token) = self.registry.token_of(id) else {
            return Ok(());
        };
        let Some(conn) = self.registry.get_mut_by_token(token) else {
            return Ok(());
        };

        let written = conn.flush()?;
        self.stats.bytes_out += written as u64;

        let want_write = conn.has_pending();
        let want_read = conn.pending_len() < self.max_outbound;
        if want_write != conn.want_write || want_read != conn.want_read {
            let interest = match (want_read, want_write) {
                (true, true) => Interest::READABLE | Interest::WRITABLE,
                (false, _) => Interest::WRITABLE,
                (true, false) => Interest::READABLE,
            };
            if want_read != conn.want_read {
                debug!(
                    client_id = id.0,
                    pending = conn.pending_len(),
                    paused = !want_read,
                    "Outbound limit toggled reading"
                );
            }
            self.poll
                .registry()
                .reregister(&mut conn.stream, Token(token), interest)?;
            conn.want_write = want_write;
            conn.want_read = want_read;
        }
        Ok(())
    }

    /// Close every connection and stop listening.
    fn close_all(&mut self) {
        for id in self.registry.ids() {
            self.dispatch(ServerEvent::Disconnected(id));
        }
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, ServerError> {
    (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ServerError::InvalidAddress(format!("{host}:{port}")))
}

/// Create a non-blocking listener.
///
/// `SO_REUSEADDR` is set so restarts are not blocked by TIME_WAIT, but not
/// `SO_REUSEPORT`: a port already in use must fail to bind.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            status_interval: None,
            ..Config::default()
        }
    }

    /// Turn the loop until `done` holds, failing after ~5s.
    fn pump_until(server: &mut Server, mut done: impl FnMut(&Server) -> bool) {
        for _ in 0..500 {
            if done(server) {
                return;
            }
            server.turn(Some(Duration::from_millis(10))).unwrap();
        }
        panic!("condition not reached");
    }

    fn connect(server: &Server) -> StdTcpStream {
        let stream = StdTcpStream::connect(server.local_addr()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn read_line(stream: &mut StdTcpStream) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = stream.read(&mut byte).unwrap();
            assert!(n > 0, "unexpected EOF after {:?}", line);
            line.push(byte[0]);
            if byte[0] == b'\n' {
                return String::from_utf8(line).unwrap();
            }
        }
    }

    /// `Received data [HH:MM:SS.mmm]: <text>\n`
    fn assert_echo(line: &str, text: &str) {
        let rest = line
            .strip_prefix("Received data [")
            .unwrap_or_else(|| panic!("bad prefix: {line:?}"));
        let (stamp, body) = rest.split_at(12);
        assert!(
            chrono::NaiveTime::parse_from_str(stamp, "%H:%M:%S%.3f").is_ok(),
            "bad timestamp {stamp:?}"
        );
        assert_eq!(stamp.as_bytes()[8], b'.');
        assert_eq!(body, format!("]: {text}\n"));
    }

    #[test]
    fn test_welcome_echo_disconnect() {
        let mut server = Server::start(&test_config()).unwrap();
        let mut client = connect(&server);

        pump_until(&mut server, |s| s.registry().len() == 1);
        assert_eq!(read_line(&mut client), "Welcome, client ID: 1\n");
        assert!(server.registry().lookup(ClientId(1)).is_some());

        client.write_all(b"ping").unwrap();
        pump_until(&mut server, |s| s.stats().echo_units == 1);
        assert_echo(&read_line(&mut client), "ping");

        drop(client);
        pump_until(&mut server, |s| s.registry().is_empty());
        assert!(server.registry().lookup(ClientId(1)).is_none());

        // A second disconnect for the same id is harmless
        server.dispatch(ServerEvent::Disconnected(ClientId(1)));
        assert!(server.registry().is_empty());
    }

    #[test]
    fn test_each_read_event_is_one_echo_unit() {
        let mut server = Server::start(&test_config()).unwrap();
        let mut client = connect(&server);
        pump_until(&mut server, |s| s.registry().len() == 1);
        read_line(&mut client);

        client.write_all(b"  hello \r\n").unwrap();
        pump_until(&mut server, |s| s.stats().echo_units == 1);
        client.write_all(b"world").unwrap();
        pump_until(&mut server, |s| s.stats().echo_units == 2);

        assert_echo(&read_line(&mut client), "hello");
        assert_echo(&read_line(&mut client), "world");
        assert_eq!(server.stats().bytes_in, 15);
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut server = Server::start(&test_config()).unwrap();

        let mut a = connect(&server);
        pump_until(&mut server, |s| s.registry().len() == 1);
        assert_eq!(read_line(&mut a), "Welcome, client ID: 1\n");

        let mut b = connect(&server);
        pump_until(&mut server, |s| s.registry().len() == 2);
        assert_eq!(read_line(&mut b), "Welcome, client ID: 2\n");

        drop(a);
        pump_until(&mut server, |s| !s.registry().contains(ClientId(1)));

        let mut c = connect(&server);
        pump_until(&mut server, |s| s.registry().len() == 2);
        assert_eq!(read_line(&mut c), "Welcome, client ID: 3\n");
        assert_eq!(server.registry().ids(), vec![ClientId(2), ClientId(3)]);
    }

    #[test]
    fn test_first_client_id_seed() {
        let config = Config {
            first_client_id: 100,
            ..test_config()
        };
        let mut server = Server::start(&config).unwrap();
        let mut client = connect(&server);
        pump_until(&mut server, |s| s.registry().len() == 1);
        assert_eq!(read_line(&mut client), "Welcome, client ID: 100\n");
    }

    #[test]
    fn test_bind_to_occupied_port_fails() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = Config {
            port: occupied.local_addr().unwrap().port(),
            ..test_config()
        };

        match Server::start(&config) {
            Err(ServerError::Bind { addr, .. }) => {
                assert_eq!(addr.port(), config.port);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("bind should fail"),
        }
    }

    #[test]
    fn test_connection_limit_does_not_consume_ids() {
        let config = Config {
            max_connections: 1,
            ..test_config()
        };
        let mut server = Server::start(&config).unwrap();

        let mut a = connect(&server);
        pump_until(&mut server, |s| s.registry().len() == 1);
        assert_eq!(read_line(&mut a), "Welcome, client ID: 1\n");

        let mut b = connect(&server);
        pump_until(&mut server, |s| s.stats().rejected == 1);
        let mut buf = [0u8; 16];
        assert_eq!(b.read(&mut buf).unwrap_or(0), 0);

        drop(a);
        pump_until(&mut server, |s| s.registry().is_empty());

        let mut c = connect(&server);
        pump_until(&mut server, |s| s.registry().len() == 1);
        assert_eq!(read_line(&mut c), "Welcome, client ID: 2\n");
    }

    #[test]
    fn test_status_lists_open_connections() {
        let mut server = Server::start(&test_config()).unwrap();
        let _a = connect(&server);
        let _b = connect(&server);
        pump_until(&mut server, |s| s.registry().len() == 2);

        let report = server.status();
        assert!(report.listening);
        assert_eq!(report.local_addr, Some(server.local_addr()));
        let ids: Vec<ClientId> = report.connections.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![ClientId(1), ClientId(2)]);
        assert_eq!(report.stats.accepted, 2);
    }

    #[test]
    fn test_status_tick_fires_from_turn() {
        let config = Config {
            status_interval: Some(Duration::from_millis(1)),
            ..test_config()
        };
        let mut server = Server::start(&config).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        // An overdue report caps the poll timeout, so this returns at once
        let started = Instant::now();
        server.turn(Some(Duration::from_secs(10))).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        let reporter = server.reporter.as_ref().unwrap();
        assert!(reporter.time_until_due(Instant::now()) <= Duration::from_millis(1));
    }

    #[test]
    fn test_shutdown_closes_clients() {
        let server = Server::start(&test_config()).unwrap();
        let handle = server.shutdown_handle();
        let addr = server.local_addr();

        let worker = std::thread::spawn(move || {
            let mut server = server;
            server.run().map(|_| server.status())
        });

        let mut client = StdTcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(read_line(&mut client), "Welcome, client ID: 1\n");

        handle.shutdown().unwrap();
        let report = worker.join().unwrap().unwrap();
        assert!(!report.listening);
        assert!(report.connections.is_empty());

        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
    }

    #[test]
    fn test_socket_error_marks_errored_then_removes() {
        let mut server = Server::start(&test_config()).unwrap();
        let mut client = connect(&server);
        pump_until(&mut server, |s| s.registry().len() == 1);
        read_line(&mut client);

        server.dispatch(ServerEvent::Error {
            id: ClientId(1),
            error: io::Error::from(io::ErrorKind::ConnectionReset),
        });
        let conn = server.registry().lookup(ClientId(1)).unwrap();
        assert_eq!(conn.state, crate::runtime::ConnState::Errored);
        assert_eq!(server.stats().socket_errors, 1);
        assert!(server.status().connections.is_empty());

        server.dispatch(ServerEvent::Disconnected(ClientId(1)));
        assert!(server.registry().is_empty());
        server.dispatch(ServerEvent::Disconnected(ClientId(1)));
        assert!(server.registry().is_empty());
    }

    #[test]
    fn test_peer_reset_removes_connection() {
        let mut server = Server::start(&test_config()).unwrap();
        let mut client = connect(&server);
        pump_until(&mut server, |s| s.registry().len() == 1);
        read_line(&mut client);

        // Zero linger makes close send RST instead of FIN
        socket2::SockRef::from(&client)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(client);

        pump_until(&mut server, |s| s.registry().is_empty());
        assert_eq!(server.stats().socket_errors, 1);
        assert_eq!(server.stats().echo_units, 0);
    }

    #[test]
    fn test_empty_read_is_ignored() {
        let mut server = Server::start(&test_config()).unwrap();
        let mut client = connect(&server);
        pump_until(&mut server, |s| s.registry().len() == 1);
        read_line(&mut client);

        let before = server.stats();
        server.dispatch(ServerEvent::Data {
            id: ClientId(1),
            data: Vec::new(),
        });
        assert_eq!(server.stats(), before);
        assert!(server.registry().contains(ClientId(1)));

        client.write_all(b"after").unwrap();
        pump_until(&mut server, |s| s.stats().echo_units == 1);
        assert_echo(&read_line(&mut client), "after");
    }

    #[test]
    fn test_slow_reader_backpressure_drains_in_order() {
        let config = Config {
            max_outbound: 64 * 1024,
            ..test_config()
        };
        let mut server = Server::start(&config).unwrap();
        let mut client = connect(&server);
        pump_until(&mut server, |s| s.registry().len() == 1);
        let welcome = read_line(&mut client);
        client.set_nonblocking(true).unwrap();

        let paused = |s: &Server| {
            s.registry()
                .lookup(ClientId(1))
                .is_some_and(|c| !c.want_read && c.want_write)
        };

        // Keep writing without reading until the server stops reading us
        let mut sent = Vec::new();
        let mut chunk_no = 0usize;
        while !paused(&server) {
            assert!(sent.len() < 64 * 1024 * 1024, "reading never paused");
            let chunk = vec![b'a' + (chunk_no % 26) as u8; 64 * 1024];
            match client.write(&chunk) {
                Ok(n) => {
                    sent.extend_from_slice(&chunk[..n]);
                    chunk_no += 1;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => panic!("client write failed: {e}"),
            }
            server.turn(Some(Duration::from_millis(1))).unwrap();
        }

        // Now read everything back; reading resumes once the queue drains
        let mut received = welcome.into_bytes();
        let mut buf = vec![0u8; 64 * 1024];
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            server.turn(Some(Duration::from_millis(1))).unwrap();
            match client.read(&mut buf) {
                Ok(0) => panic!("server closed the connection"),
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => panic!("client read failed: {e}"),
            }

            let stats = server.stats();
            let idle = server
                .registry()
                .lookup(ClientId(1))
                .is_some_and(|c| !c.has_pending() && c.want_read);
            if idle
                && stats.bytes_in == sent.len() as u64
                && stats.bytes_out == received.len() as u64
            {
                break;
            }
            assert!(Instant::now() < deadline, "output never drained");
        }

        let text = String::from_utf8(received).unwrap();
        let mut lines = text.split_inclusive('\n');
        assert_eq!(lines.next(), Some("Welcome, client ID: 1\n"));

        let mut echoed = Vec::new();
        for line in lines {
            assert!(line.starts_with("Received data ["), "bad line start");
            assert!(line.ends_with('\n'));
            // "Received data [" + HH:MM:SS.mmm + "]: "
            echoed.extend_from_slice(&line.as_bytes()[30..line.len() - 1]);
        }
        assert!(echoed == sent, "echoed bytes differ from sent bytes");
    }

    #[test]
    fn test_unsent_output_dropped_on_close_is_counted() {
        let config = Config {
            max_outbound: usize::MAX,
            ..test_config()
        };
        let mut server = Server::start(&config).unwrap();
        let _client = connect(&server);
        pump_until(&mut server, |s| s.registry().len() == 1);

        // The client never reads, so the kernel buffers fill and output queues
        for _ in 0..64 {
            if server.registry().lookup(ClientId(1)).unwrap().has_pending() {
                break;
            }
            server.dispatch(ServerEvent::Data {
                id: ClientId(1),
                data: vec![b'x'; 1024 * 1024],
            });
        }
        let pending = server.registry().lookup(ClientId(1)).unwrap().pending_len();
        assert!(pending > 0);

        server.dispatch(ServerEvent::Disconnected(ClientId(1)));
        assert!(server.registry().is_empty());
        assert_eq!(server.stats().unsent_dropped, pending as u64);
    }
}
