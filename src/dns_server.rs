//! The single-threaded reactor that drives every port, and a daemon thread to run it on.
//!
//! All readiness events are serviced on one thread:
//!```text
//!  ServerDaemon     <channel>      reactor thread (DnsServer)
//!    |                                | poll sockets with the earliest deadline
//!    |                                | UDP datagram -> Request -> handler -> send_to
//!    |                                | TCP accept -> read frame -> handler -> write frame
//!    |                                | drop connections past their deadline
//!    |       --- Status -->           |
//!    |       <-- ServerStatus --      |
//!    |       --- Shutdown -->         | close every port
//!    |       <-- Shutdown --          |
//!```
//! Sockets are non-blocking. EAGAIN and EINTR just return control to the
//! poll loop; nothing in the reactor blocks apart from the poll itself.

#[cfg(feature = "logging")]
use crate::log::{debug, error, trace};
use crate::{
    error::{e_fmt, Error, Result},
    port::{
        is_retryable, new_tcp_listener, new_udp_socket, ConnectionPhase, FrameWriter, Port,
        PortId, PortSocket, ReadOutcome, TcpConnection,
    },
    request::{ConnectionId, Origin, Request, RequestHandler, Response},
};
use flume::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use mio::{net::TcpStream as MioTcpStream, Events, Interest, Poll, Token, Waker};
use socket2::Socket;
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    fmt,
    net::SocketAddr,
    sync::Arc,
    thread,
    time::{Duration, SystemTime},
};

/// The default timeout for reading a TCP request and for writing its response.
pub const TCP_TIMEOUT_DEFAULT: Duration = Duration::from_secs(10);

/// The default receive buffer size for UDP datagrams.
pub const MAX_UDP_PACKET_DEFAULT: usize = 1500;

/// Datagrams shorter than this are dropped without a response.
pub const MIN_UDP_PACKET_DEFAULT: usize = 16;

const LISTEN_BACKLOG_DEFAULT: i32 = 128;

/// Token reserved for the daemon's waker.
const WAKER_TOKEN: Token = Token(0);

/// Tunables of a [DnsServer].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    tcp_timeout: Duration,
    max_udp_packet: usize,
    min_udp_packet: usize,
    listen_backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_timeout: TCP_TIMEOUT_DEFAULT,
            max_udp_packet: MAX_UDP_PACKET_DEFAULT,
            min_udp_packet: MIN_UDP_PACKET_DEFAULT,
            listen_backlog: LISTEN_BACKLOG_DEFAULT,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idle timeout for a TCP connection, both while reading and while writing.
    pub fn tcp_timeout(mut self, timeout: Duration) -> Self {
        self.tcp_timeout = timeout;
        self
    }

    pub fn max_udp_packet(mut self, size: usize) -> Self {
        self.max_udp_packet = size;
        self
    }

    pub fn min_udp_packet(mut self, size: usize) -> Self {
        self.min_udp_packet = size;
        self
    }

    pub fn listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    pub fn get_tcp_timeout(&self) -> Duration {
        self.tcp_timeout
    }
}

/// Counts reported by [ServerDaemon::status].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStatus {
    pub ports: usize,
    pub connections: usize,
}

/// Status code for the server daemon.
#[derive(Debug, PartialEq, Clone, Eq)]
#[non_exhaustive]
pub enum DaemonStatus {
    /// The daemon is running as normal.
    Running,

    /// The daemon has been shutdown.
    Shutdown,
}

/// Commands supported by the daemon.
#[derive(Debug)]
enum Command {
    Status(Sender<ServerStatus>),
    Shutdown(Sender<DaemonStatus>),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(_) => write!(f, "Command Status"),
            Self::Shutdown(_) => write!(f, "Command Shutdown"),
        }
    }
}

/// The reactor: owns the poller, the ports, and every in-flight TCP connection.
pub struct DnsServer {
    poller: Poll,
    config: ServerConfig,
    ports: HashMap<usize, Port>,
    connections: HashMap<usize, TcpConnection>,

    /// Next token to hand out. Token 0 is the waker.
    next_token: usize,

    /// Connection deadlines as (UNIX millis, token). Entries whose
    /// connection is gone or has a later deadline are skipped.
    timers: BinaryHeap<Reverse<(u64, usize)>>,
}

impl fmt::Debug for DnsServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsServer")
            .field("config", &self.config)
            .field("ports", &self.ports)
            .field("connections", &self.connections.len())
            .finish()
    }
}

impl DnsServer {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let poller = Poll::new().map_err(|e| e_fmt!("failed to create mio Poll: {}", e))?;
        Ok(Self {
            poller,
            config,
            ports: HashMap::new(),
            connections: HashMap::new(),
            next_token: WAKER_TOKEN.0 + 1,
            timers: BinaryHeap::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Starts serving `socket`, which must already be bound.
    ///
    /// A TCP socket is put into listening state. Every request arriving on
    /// the port goes to `handler`.
    pub fn open_port<H>(&mut self, socket: Socket, is_tcp: bool, handler: H) -> Result<PortId>
    where
        H: RequestHandler + Send + 'static,
    {
        if is_tcp {
            socket
                .listen(self.config.listen_backlog)
                .map_err(|e| e_fmt!("listen failed: {}", e))?;
        }

        let mut port = Port::new(socket, is_tcp, Box::new(handler))?;
        let key = self.add_token();
        let registry = self.poller.registry();
        let result = match &mut port.socket {
            PortSocket::Udp(sock) => registry.register(sock, Token(key), Interest::READABLE),
            PortSocket::Tcp(listener) => {
                registry.register(listener, Token(key), Interest::READABLE)
            }
        };
        result.map_err(|e| e_fmt!("add {:?} to poller: {}", &port, e))?;

        debug!("open port {} {:?}", key, &port);
        self.ports.insert(key, port);
        Ok(PortId(key))
    }

    /// Binds a new UDP socket on `addr` and opens a port on it.
    pub fn open_udp<H>(&mut self, addr: SocketAddr, handler: H) -> Result<PortId>
    where
        H: RequestHandler + Send + 'static,
    {
        let socket = new_udp_socket(addr)?;
        self.open_port(socket, false, handler)
    }

    /// Binds a new TCP listener on `addr` and opens a port on it.
    pub fn open_tcp<H>(&mut self, addr: SocketAddr, handler: H) -> Result<PortId>
    where
        H: RequestHandler + Send + 'static,
    {
        let socket = new_tcp_listener(addr, self.config.listen_backlog)?;
        self.open_port(socket, true, handler)
    }

    /// Stops serving a port and drops every connection it accepted.
    pub fn close_port(&mut self, id: PortId) -> Result<()> {
        let mut port = self
            .ports
            .remove(&id.0)
            .ok_or_else(|| e_fmt!("no such port: {}", id.0))?;

        let registry = self.poller.registry();
        let result = match &mut port.socket {
            PortSocket::Udp(sock) => registry.deregister(sock),
            PortSocket::Tcp(listener) => registry.deregister(listener),
        };
        if let Err(e) = result {
            debug!("failed to remove port {:?} from poller: {}", &port, e);
        }

        let accepted: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.port == id)
            .map(|(key, _)| *key)
            .collect();
        for key in accepted {
            self.remove_connection(key);
        }

        debug!("closed port {} {:?}", id.0, &port);
        Ok(())
    }

    pub fn local_addr(&self, id: PortId) -> Result<SocketAddr> {
        let port = self
            .ports
            .get(&id.0)
            .ok_or_else(|| e_fmt!("no such port: {}", id.0))?;
        port.local_addr()
            .map_err(|e| e_fmt!("local_addr of port {}: {}", id.0, e))
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            ports: self.ports.len(),
            connections: self.connections.len(),
        }
    }

    /// Runs the event loop on the current thread.
    ///
    /// Only returns if polling itself fails.
    pub fn run(&mut self) -> Result<()> {
        loop {
            self.run_once(None)?;
        }
    }

    /// Services one round of readiness events, then drops connections past
    /// their deadline.
    ///
    /// Waits at most `timeout`, or until the earliest connection deadline.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<()> {
        let now = current_time_millis();
        let until_timer = self.peek_earliest_timer().map(|timer| {
            // If `timer` already passed, set `timeout` to be 1ms.
            let millis = if timer > now { timer - now } else { 1 };
            Duration::from_millis(millis)
        });
        let timeout = match (timeout, until_timer) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let mut events = Events::with_capacity(1024);
        match self.poller.poll(&mut events, timeout) {
            Ok(_) => self.handle_poller_events(&events),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e_fmt!("failed to poll sockets: {}", e)),
        }

        self.expire_connections(current_time_millis());
        Ok(())
    }

    fn add_token(&mut self) -> usize {
        let key = self.next_token;
        self.next_token += 1;
        key
    }

    fn add_timer(&mut self, deadline: u64, key: usize) {
        self.timers.push(Reverse((deadline, key)));
    }

    fn peek_earliest_timer(&self) -> Option<u64> {
        self.timers.peek().map(|Reverse((deadline, _))| *deadline)
    }

    fn next_deadline(&self) -> u64 {
        current_time_millis() + self.config.tcp_timeout.as_millis() as u64
    }

    fn handle_poller_events(&mut self, events: &Events) {
        for ev in events.iter() {
            let key = ev.token().0;
            trace!("event received with key {:?}", ev.token());
            if ev.token() == WAKER_TOKEN {
                continue; // Commands are drained by the daemon loop.
            }

            if let Some(is_tcp) = self.ports.get(&key).map(|port| port.is_tcp()) {
                if is_tcp {
                    self.handle_accept(key);
                } else {
                    self.handle_udp_read(key);
                }
                self.rearm_port(key);
            } else if self.connections.contains_key(&key) {
                self.handle_connection(key);
            } else {
                trace!("stale event for key {}", key);
            }
        }
    }

    /// Re-registers a drained port socket so the next datagram or connection fires again.
    fn rearm_port(&mut self, key: usize) {
        if let Some(port) = self.ports.get_mut(&key) {
            let registry = self.poller.registry();
            let result = match &mut port.socket {
                PortSocket::Udp(sock) => registry.reregister(sock, Token(key), Interest::READABLE),
                PortSocket::Tcp(listener) => {
                    registry.reregister(listener, Token(key), Interest::READABLE)
                }
            };
            if let Err(e) = result {
                debug!("modify poller for port {:?}: {}", &port, e);
            }
        }
    }

    /// Reads datagrams until none remain.
    fn handle_udp_read(&mut self, key: usize) {
        loop {
            let mut buf = vec![0u8; self.config.max_udp_packet];
            let sock = match self.ports.get(&key).map(|port| &port.socket) {
                Some(PortSocket::Udp(sock)) => sock,
                _ => return,
            };

            let (sz, peer) = match sock.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) => {
                    if !is_retryable(&e) {
                        error!("error while reading UDP request: {}", e);
                    }
                    return;
                }
            };

            trace!("received {} bytes from {}", sz, peer);
            if sz < self.config.min_udp_packet {
                debug!("drop {} byte datagram from {}: too short", sz, peer);
                continue;
            }
            buf.truncate(sz);

            match Request::parse(&buf, Origin::Udp { peer }, PortId(key)) {
                Ok(request) => self.dispatch(request),
                Err(e) => debug!("drop malformed UDP request from {}: {}", peer, e),
            }
        }
    }

    /// Accepts every pending connection on a TCP port.
    fn handle_accept(&mut self, key: usize) {
        let mut accepted: Vec<(MioTcpStream, SocketAddr)> = Vec::new();
        if let Some(PortSocket::Tcp(listener)) = self.ports.get(&key).map(|port| &port.socket) {
            loop {
                match listener.accept() {
                    Ok(conn) => accepted.push(conn),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        error!("accept on port {} failed: {}", key, e);
                        break;
                    }
                }
            }
        }

        for (mut stream, peer) in accepted {
            let conn_key = self.add_token();
            if let Err(e) =
                self.poller
                    .registry()
                    .register(&mut stream, Token(conn_key), Interest::READABLE)
            {
                error!("add TCP connection from {} to poller: {}", peer, e);
                continue;
            }

            let deadline = self.next_deadline();
            debug!("accepted TCP connection {} from {}", conn_key, peer);
            self.connections.insert(
                conn_key,
                TcpConnection::new(stream, peer, PortId(key), deadline),
            );
            self.add_timer(deadline, conn_key);
        }
    }

    /// Reads from or writes to a connection, depending on its phase.
    fn handle_connection(&mut self, key: usize) {
        let deadline = self.next_deadline();
        let conn = match self.connections.get_mut(&key) {
            Some(conn) => conn,
            None => return,
        };

        match &mut conn.phase {
            ConnectionPhase::Reading(reader) => match reader.read_from(&mut conn.stream) {
                ReadOutcome::Pending => {
                    conn.deadline = deadline;
                    if let Err(e) = self.poller.registry().reregister(
                        &mut conn.stream,
                        Token(key),
                        Interest::READABLE,
                    ) {
                        debug!("modify poller for connection {}: {}", key, e);
                    }
                    self.add_timer(deadline, key);
                }
                ReadOutcome::Frame(frame) => {
                    if let Err(e) = self.poller.registry().deregister(&mut conn.stream) {
                        debug!("failed to remove connection {} from poller: {}", key, e);
                    }
                    conn.phase = ConnectionPhase::Handling;
                    let origin = Origin::Tcp {
                        peer: conn.peer,
                        connection: ConnectionId(key),
                    };
                    match Request::parse(frame.data(), origin, conn.port) {
                        Ok(request) => self.dispatch(request),
                        Err(e) => {
                            debug!("drop malformed TCP request from {}: {}", origin.peer(), e);
                            self.remove_connection(key);
                        }
                    }
                }
                ReadOutcome::Closed => {
                    debug!("TCP connection {} closed before a full request", key);
                    self.remove_connection(key);
                }
                ReadOutcome::Failed(e) => {
                    debug!("TCP connection {}: {}", key, e);
                    self.remove_connection(key);
                }
            },
            ConnectionPhase::Writing(writer) => match writer.write_to(&mut conn.stream) {
                Ok(true) => {
                    trace!("sent {} bytes on TCP connection {}", writer.sent(), key);
                    self.remove_connection(key);
                }
                Ok(false) => {
                    conn.deadline = deadline;
                    if let Err(e) = self.poller.registry().reregister(
                        &mut conn.stream,
                        Token(key),
                        Interest::WRITABLE,
                    ) {
                        debug!("modify poller for connection {}: {}", key, e);
                    }
                    self.add_timer(deadline, key);
                }
                Err(e) => {
                    debug!("TCP connection {}: {}", key, e);
                    self.remove_connection(key);
                }
            },
            ConnectionPhase::Handling => {
                trace!("event for connection {} while handling", key);
            }
        }
    }

    /// Runs the port's handler for `request` and sends the response, if any.
    ///
    /// The request is dropped once the handler returns.
    fn dispatch(&mut self, request: Request) {
        let response = match self.ports.get_mut(&request.port().0) {
            Some(port) => port.handler.on_request(&request),
            None => None,
        };

        match (response, request.origin()) {
            (Some(response), _) => self.finish(response),
            (None, Origin::Tcp { connection, .. }) => {
                trace!("no response for TCP connection {}", connection.0);
                self.remove_connection(connection.0);
            }
            (None, Origin::Udp { peer }) => trace!("no response for {}", peer),
        }
    }

    /// Encodes and sends `response` back over the transport its request came in on.
    ///
    /// UDP is a single `send_to`. TCP queues a length-prefixed frame and
    /// writes it as the connection becomes writable.
    fn finish(&mut self, response: Response) {
        let port_key = response.port().0;
        let origin = *response.origin();
        match origin {
            Origin::Udp { peer } => {
                let datagram = match response.into_datagram() {
                    Ok(datagram) => datagram,
                    Err(e) => {
                        error!("failed to encode response to {}: {}", peer, e);
                        return;
                    }
                };
                let sock = match self.ports.get(&port_key).map(|port| &port.socket) {
                    Some(PortSocket::Udp(sock)) => sock,
                    _ => {
                        debug!("port {} is gone, drop response to {}", port_key, peer);
                        return;
                    }
                };
                match sock.send_to(datagram.data(), peer) {
                    Ok(sz) if sz < datagram.len() => {
                        error!("short write to {}: {} of {} bytes", peer, sz, datagram.len())
                    }
                    Ok(sz) => trace!("sent {} bytes to {}", sz, peer),
                    Err(e) => error!("failed to send response to {}: {}", peer, e),
                }
            }
            Origin::Tcp { peer, connection } => {
                let key = connection.0;
                let frame = match response.into_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("failed to encode response to {}: {}", peer, e);
                        self.remove_connection(key);
                        return;
                    }
                };

                let deadline = self.next_deadline();
                let conn = match self.connections.get_mut(&key) {
                    Some(conn) => conn,
                    None => {
                        debug!("TCP connection {} is gone, drop response to {}", key, peer);
                        return;
                    }
                };
                match conn.phase {
                    ConnectionPhase::Handling => {}
                    ConnectionPhase::Writing(_) => {
                        panic!("response for TCP connection {} finished twice", key)
                    }
                    ConnectionPhase::Reading(_) => {
                        debug!("TCP connection {} has no complete request, drop response", key);
                        return;
                    }
                }

                conn.phase = ConnectionPhase::Writing(FrameWriter::new(frame));
                conn.deadline = deadline;
                if let Err(e) = self.poller.registry().register(
                    &mut conn.stream,
                    Token(key),
                    Interest::WRITABLE,
                ) {
                    error!("add TCP connection {} to poller for writing: {}", key, e);
                    self.remove_connection(key);
                    return;
                }
                self.add_timer(deadline, key);
            }
        }
    }

    /// Deregisters and closes a connection.
    fn remove_connection(&mut self, key: usize) {
        if let Some(mut conn) = self.connections.remove(&key) {
            if !matches!(conn.phase, ConnectionPhase::Handling) {
                if let Err(e) = self.poller.registry().deregister(&mut conn.stream) {
                    debug!("failed to remove connection {} from poller: {}", key, e);
                }
            }
            trace!("closed TCP connection {} from {}", key, conn.peer);
        }
    }

    /// Drops every connection whose deadline is at or before `now`.
    fn expire_connections(&mut self, now: u64) {
        while let Some(Reverse((deadline, key))) = self.timers.peek().copied() {
            if deadline > now {
                break;
            }
            self.timers.pop();

            let expired = match self.connections.get_mut(&key) {
                Some(conn) if conn.deadline <= now => {
                    if let ConnectionPhase::Reading(reader) = &mut conn.phase {
                        reader.time_out();
                    }
                    true
                }
                _ => false,
            };
            if expired {
                debug!("TCP connection {} timed out", key);
                self.remove_connection(key);
            }
        }
    }

    /// Closes every port and connection.
    fn shutdown(&mut self) {
        let keys: Vec<usize> = self.ports.keys().copied().collect();
        for key in keys {
            if let Err(e) = self.close_port(PortId(key)) {
                debug!("shutdown: {}", e);
            }
        }
    }
}

/// A handle to a [DnsServer] running on its own thread.
///
/// The handle can be cloned and passed around between threads.
#[derive(Clone)]
pub struct ServerDaemon {
    sender: Sender<Command>,
    waker: Arc<Waker>,
}

impl fmt::Debug for ServerDaemon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerDaemon").finish()
    }
}

impl ServerDaemon {
    /// Moves `server` onto a new thread and runs its event loop there.
    pub fn spawn(server: DnsServer) -> Result<Self> {
        let waker = Waker::new(server.poller.registry(), WAKER_TOKEN)
            .map_err(|e| e_fmt!("failed to create mio Waker: {}", e))?;
        let (sender, receiver) = bounded(100);

        thread::Builder::new()
            .name("dns_server".to_string())
            .spawn(move || Self::daemon_thread(server, receiver))
            .map_err(|e| e_fmt!("thread builder failed to spawn: {}", e))?;

        Ok(Self {
            sender,
            waker: Arc::new(waker),
        })
    }

    /// Sends `cmd` to the daemon via its channel, and wakes up its poller.
    fn send_cmd(&self, cmd: Command) -> Result<()> {
        let cmd_name = cmd.to_string();

        self.sender.try_send(cmd).map_err(|e| match e {
            TrySendError::Full(_) => Error::Again,
            e => e_fmt!("flume::channel::send failed: {}", e),
        })?;

        self.waker
            .wake()
            .map_err(|e| e_fmt!("failed to wake the daemon for {}: {}", cmd_name, e))
    }

    /// Returns a channel receiver for the current [ServerStatus].
    pub fn status(&self) -> Result<Receiver<ServerStatus>> {
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::Status(resp_s))?;
        Ok(resp_r)
    }

    /// Closes every port and stops the daemon thread.
    ///
    /// When an error is returned, the caller should retry only when
    /// the error is `Error::Again`, otherwise should log and move on.
    pub fn shutdown(&self) -> Result<Receiver<DaemonStatus>> {
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::Shutdown(resp_s))?;
        Ok(resp_r)
    }

    fn daemon_thread(mut server: DnsServer, receiver: Receiver<Command>) {
        loop {
            if let Err(e) = server.run_once(None) {
                error!("daemon event loop: {}", e);
                server.shutdown();
                return;
            }

            // process commands from the command channel
            loop {
                match receiver.try_recv() {
                    Ok(Command::Status(resp_s)) => {
                        if let Err(e) = resp_s.send(server.status()) {
                            debug!("failed to send status: {}", e);
                        }
                    }
                    Ok(Command::Shutdown(resp_s)) => {
                        server.shutdown();
                        if let Err(e) = resp_s.send(DaemonStatus::Shutdown) {
                            debug!("shutdown: failed to send response: {}", e);
                        }
                        return;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        debug!("all daemon handles dropped, shutting down");
                        server.shutdown();
                        return;
                    }
                }
            }
        }
    }
}

/// Returns UNIX time in millis
fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
