//! The [`Network`]: one poll, many sockets, one thread.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry};
use tidewire_core::error::{ConnectionError, ConnectionErrorKind, UsageError, UsageErrorKind};
use tidewire_core::{Error, Result};

use crate::connection::{Conn, Connection, ConnectionId, Deferred, Handshake, Received, Step};
use crate::handler::{DynHandler, Handler};
use crate::tls::{ClientTls, ServerTls, tls_error};

const EVENT_CAPACITY: usize = 256;

/// Handle to a listening socket returned by [`Network::add_server`].
#[derive(Debug, Clone, Copy)]
pub struct Listener {
    id: ConnectionId,
    local_addr: SocketAddr,
}

impl Listener {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Bound address; useful after binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }
}

type Factory = Box<dyn FnMut() -> Box<dyn DynHandler>>;

struct ListenerEntry {
    socket: TcpListener,
    factory: Factory,
    tls: Option<Arc<rustls::ServerConfig>>,
}

struct ConnectionEntry {
    conn: Connection,
    handler: Box<dyn DynHandler>,
}

enum Entry {
    Listener(ListenerEntry),
    Connection(Box<ConnectionEntry>),
}

#[derive(Debug, Clone, Copy)]
enum Readiness {
    Event { readable: bool, writable: bool },
    /// Re-poll queued by the reactor itself (buffered TLS data, accept backlog).
    Pending,
}

impl ConnectionEntry {
    /// Run one handler hook, then any hooks it queued.
    fn call<R>(
        &mut self,
        registry: &Registry,
        pending: &mut VecDeque<ConnectionId>,
        f: impl FnOnce(&mut dyn DynHandler, &mut Conn<'_>) -> R,
    ) -> R {
        let result = {
            let mut conn = Conn::new(&mut self.conn, registry, pending);
            f(self.handler.as_mut(), &mut conn)
        };
        self.drain(registry, pending);
        result
    }

    fn drain(&mut self, registry: &Registry, pending: &mut VecDeque<ConnectionId>) {
        while let Some(event) = self.conn.deferred.pop_front() {
            let mut conn = Conn::new(&mut self.conn, registry, pending);
            match event {
                Deferred::SendComplete => self.handler.on_send_complete(&mut conn),
                Deferred::SendError(message) => self.handler.on_send_error(&mut conn, &message),
                Deferred::Close(reason) => self.handler.on_close(&mut conn, reason.as_deref()),
            }
        }
    }

    fn close(&mut self, registry: &Registry, pending: &mut VecDeque<ConnectionId>, reason: &str) {
        self.conn.close(registry, Some(reason.to_string()));
        self.drain(registry, pending);
    }
}

/// Readiness reactor owning every listener and connection.
///
/// All handler callbacks run inside [`service`](Self::service) (or the
/// `add_*` / [`with_handler`](Self::with_handler) call that triggered them),
/// on the calling thread.
pub struct Network {
    poll: Poll,
    events: Events,
    entries: HashMap<ConnectionId, Entry>,
    next_id: u64,
    pending: VecDeque<ConnectionId>,
    is_open: bool,
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("entries", &self.entries.len())
            .field("pending", &self.pending.len())
            .field("is_open", &self.is_open)
            .finish_non_exhaustive()
    }
}

impl Network {
    pub fn new() -> Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
            entries: HashMap::new(),
            next_id: 0,
            pending: VecDeque::new(),
            is_open: true,
        })
    }

    fn next_id(&mut self) -> ConnectionId {
        self.next_id += 1;
        ConnectionId(self.next_id)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open {
            Ok(())
        } else {
            Err(Error::Usage(UsageError {
                kind: UsageErrorKind::Closed,
                message: "network is closed".to_string(),
            }))
        }
    }

    /// Listen on `port` on all interfaces.
    ///
    /// `factory` builds one handler per accepted connection; anything it
    /// captures (an `Arc` of shared configuration, say) is the context every
    /// handler sees. Bind failures are returned immediately.
    pub fn add_server<H, F>(
        &mut self,
        port: u16,
        mut factory: F,
        tls: Option<&ServerTls>,
    ) -> Result<Listener>
    where
        H: Handler,
        F: FnMut() -> H + 'static,
    {
        self.ensure_open()?;
        let tls = tls.map(ServerTls::build).transpose()?;
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let mut socket = TcpListener::bind(addr).map_err(|e| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Bind,
                message: format!("failed to bind port {}: {}", port, e),
                source: Some(Box::new(e)),
            })
        })?;
        let local_addr = socket.local_addr()?;
        let is_tls = tls.is_some();
        let id = self.next_id();
        self.poll
            .registry()
            .register(&mut socket, id.token(), Interest::READABLE)?;
        self.entries.insert(
            id,
            Entry::Listener(ListenerEntry {
                socket,
                factory: Box::new(move || Box::new(factory()) as Box<dyn DynHandler>),
                tls,
            }),
        );
        tracing::debug!(lid = %id, %local_addr, tls = is_tls, "listening");
        Ok(Listener { id, local_addr })
    }

    /// Open an outbound connection driven by `handler`.
    ///
    /// The connect completes asynchronously. Resolution or connect failures
    /// are reported through `on_fail` followed by `on_close`, never as an
    /// `Err`; only TLS configuration problems are returned directly.
    pub fn add_connection<H: Handler>(
        &mut self,
        host: &str,
        port: u16,
        handler: H,
        tls: Option<&ClientTls>,
    ) -> Result<ConnectionId> {
        self.ensure_open()?;
        let tls = match tls {
            Some(tls) => {
                let config = tls.build()?;
                let client = rustls::ClientConnection::new(config, tls.sni(host)?).map_err(|e| {
                    tls_error(format!("Failed to create TLS connection: {}", e))
                })?;
                Some(rustls::Connection::Client(client))
            }
            None => None,
        };

        let id = self.next_id();
        let connect = resolve(host, port)
            .and_then(|addr| TcpStream::connect(addr).map_err(|e| e.to_string()));
        let (stream, failure) = match connect {
            Ok(stream) => (Some(stream), None),
            Err(reason) => (None, Some(reason)),
        };
        let mut entry = Box::new(ConnectionEntry {
            conn: Connection::new(id, stream, tls, true, Some(host.to_string())),
            handler: Box::new(handler),
        });
        tracing::debug!(cid = %id, host, port, "connecting");

        match failure {
            Some(reason) => self.fail_connect(&mut entry, &reason),
            None => {
                let registry = self.poll.registry();
                entry.conn.update_interest(registry);
                entry.drain(registry, &mut self.pending);
            }
        }
        if !entry.conn.closed {
            self.entries.insert(id, Entry::Connection(entry));
        }
        Ok(id)
    }

    /// Wait up to `timeout` for readiness and dispatch it.
    ///
    /// Keeps polling (without waiting) while events keep arriving or
    /// queued work remains, at most `max_iterations` times, then returns
    /// whether anything happened.
    pub fn service(&mut self, timeout: Duration, max_iterations: usize) -> Result<bool> {
        let mut processed = false;
        let mut timeout = timeout;
        for _ in 0..max_iterations.max(1) {
            if !self.service_once(timeout)? {
                break;
            }
            processed = true;
            timeout = Duration::ZERO;
        }
        Ok(processed)
    }

    fn service_once(&mut self, timeout: Duration) -> Result<bool> {
        if !self.is_open {
            return Ok(false);
        }
        let timeout = if self.pending.is_empty() {
            timeout
        } else {
            Duration::ZERO
        };
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let ready: Vec<(ConnectionId, Readiness)> = self
            .events
            .iter()
            .map(|event| {
                let readiness = Readiness::Event {
                    readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                    writable: event.is_writable() || event.is_write_closed(),
                };
                (ConnectionId(event.token().0 as u64), readiness)
            })
            .collect();
        for &(id, readiness) in &ready {
            self.dispatch(id, readiness);
        }

        // work queued by this batch waits for the next round
        let batch: Vec<ConnectionId> = self.pending.drain(..).collect();
        for &id in &batch {
            self.dispatch(id, Readiness::Pending);
        }
        Ok(!ready.is_empty() || !batch.is_empty())
    }

    fn dispatch(&mut self, id: ConnectionId, readiness: Readiness) {
        let Some(entry) = self.entries.remove(&id) else {
            return;
        };
        match entry {
            Entry::Listener(mut listener) => {
                self.accept(id, &mut listener);
                self.entries.insert(id, Entry::Listener(listener));
            }
            Entry::Connection(mut entry) => {
                self.drive(&mut entry, readiness);
                if !entry.conn.closed {
                    self.entries.insert(id, Entry::Connection(entry));
                }
            }
        }
    }

    fn accept(&mut self, lid: ConnectionId, listener: &mut ListenerEntry) {
        let (stream, peer) = match listener.socket.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                self.pending.push_back(lid);
                return;
            }
            Err(e) => {
                tracing::warn!(lid = %lid, error = %e, "accept failed");
                return;
            }
        };
        // Edge-triggered: keep accepting until the backlog is empty.
        self.pending.push_back(lid);

        let tls = match &listener.tls {
            Some(config) => match rustls::ServerConnection::new(Arc::clone(config)) {
                Ok(server) => Some(rustls::Connection::Server(server)),
                Err(e) => {
                    tracing::warn!(lid = %lid, error = %e, "failed to create TLS session");
                    return;
                }
            },
            None => None,
        };
        let id = self.next_id();
        let mut entry = Box::new(ConnectionEntry {
            conn: Connection::new(id, Some(stream), tls, false, None),
            handler: (listener.factory)(),
        });
        entry.conn.peer_addr = Some(peer);
        tracing::debug!(lid = %lid, cid = %id, %peer, "accepted connection");

        let registry = self.poll.registry();
        let accepted = entry.call(registry, &mut self.pending, |h, c| h.on_accept(c));
        if entry.conn.closed {
            return;
        }
        if !accepted {
            entry.close(registry, &mut self.pending, "connection not accepted");
            return;
        }
        self.open(&mut entry);
        if !entry.conn.closed {
            self.entries.insert(id, Entry::Connection(entry));
        }
    }

    fn drive(&mut self, entry: &mut ConnectionEntry, readiness: Readiness) {
        match entry.conn.step {
            Step::Connect => {
                if matches!(readiness, Readiness::Event { .. }) {
                    self.finish_connect(entry);
                }
            }
            Step::Handshake => self.handshake(entry),
            Step::Ready => {
                let (readable, writable) = match readiness {
                    Readiness::Event { readable, writable } => (readable, writable),
                    Readiness::Pending => (true, false),
                };
                if writable {
                    let registry = self.poll.registry();
                    entry.conn.on_writable(registry);
                    entry.drain(registry, &mut self.pending);
                }
                if readable && !entry.conn.closed && !entry.conn.quiesced {
                    self.read(entry);
                }
            }
        }
    }

    /// Write readiness after a non-blocking connect: success or failure.
    fn finish_connect(&mut self, entry: &mut ConnectionEntry) {
        let status = match entry.conn.stream() {
            Some(stream) => match stream.take_error() {
                Ok(Some(e)) | Err(e) => Err(e.to_string()),
                Ok(None) => match stream.peer_addr() {
                    Ok(addr) => Ok(Some(addr)),
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(None),
                    Err(e) => Err(e.to_string()),
                },
            },
            None => Err("socket closed".to_string()),
        };
        match status {
            // Spurious wakeup; still connecting.
            Ok(None) => {}
            Ok(Some(addr)) => {
                entry.conn.peer_addr = Some(addr);
                self.open(entry);
            }
            Err(reason) => self.fail_connect(entry, &reason),
        }
    }

    fn fail_connect(&mut self, entry: &mut ConnectionEntry, reason: &str) {
        tracing::debug!(cid = %entry.conn.id, reason, "connect failed");
        let registry = self.poll.registry();
        entry.call(registry, &mut self.pending, |h, c| h.on_fail(c, reason));
        entry.close(registry, &mut self.pending, "failed to connect");
    }

    /// TCP is up, in either direction.
    fn open(&mut self, entry: &mut ConnectionEntry) {
        entry.conn.t_open = Some(Instant::now());
        if let Some(stream) = entry.conn.stream() {
            let _ = stream.set_nodelay(true);
        }
        let registry = self.poll.registry();
        entry.call(registry, &mut self.pending, |h, c| h.on_open(c));
        if entry.conn.closed {
            return;
        }
        if entry.conn.tls.is_some() {
            entry.conn.step = Step::Handshake;
            self.handshake(entry);
        } else {
            self.ready(entry);
        }
    }

    fn handshake(&mut self, entry: &mut ConnectionEntry) {
        let registry = self.poll.registry();
        match entry.conn.drive_handshake() {
            Handshake::Blocked => {
                entry.conn.update_interest(registry);
                entry.drain(registry, &mut self.pending);
            }
            Handshake::Failed(reason) => {
                entry.call(registry, &mut self.pending, |h, c| {
                    h.on_failed_handshake(c, &reason);
                });
                entry.close(registry, &mut self.pending, "failed ssl handshake");
            }
            Handshake::Done => {
                let cert = entry.conn.peer_certificate();
                let accepted = entry.call(registry, &mut self.pending, |h, c| {
                    h.on_handshake(c, cert.as_deref())
                });
                if entry.conn.closed {
                    return;
                }
                if !accepted {
                    entry.close(registry, &mut self.pending, "failed ssl certificate check");
                    return;
                }
                self.ready(entry);
            }
        }
    }

    fn ready(&mut self, entry: &mut ConnectionEntry) {
        let registry = self.poll.registry();
        entry.conn.t_ready = Some(Instant::now());
        entry.conn.step = Step::Ready;
        entry.conn.update_interest(registry);
        if entry.conn.closed {
            entry.drain(registry, &mut self.pending);
            return;
        }
        tracing::debug!(cid = %entry.conn.id, "connection ready");
        entry.call(registry, &mut self.pending, |h, c| h.on_ready(c));
        if entry.conn.has_buffered_plaintext() {
            self.pending.push_back(entry.conn.id);
        }
    }

    fn read(&mut self, entry: &mut ConnectionEntry) {
        let registry = self.poll.registry();
        match entry.conn.receive() {
            Received::Nothing => {}
            Received::Data(data, more) => {
                tracing::trace!(cid = %entry.conn.id, len = data.len(), "recv");
                entry.call(registry, &mut self.pending, |h, c| h.on_data(c, &data));
                if (more && !entry.conn.closed && !entry.conn.quiesced)
                    || entry.conn.has_buffered_plaintext()
                {
                    self.pending.push_back(entry.conn.id);
                }
            }
            Received::Eof => entry.close(registry, &mut self.pending, "remote close"),
            Received::Interrupted => {
                entry.call(registry, &mut self.pending, |h, c| {
                    h.on_recv_error(c, "interrupted");
                });
                self.pending.push_back(entry.conn.id);
            }
            Received::Error(message) => entry.close(
                registry,
                &mut self.pending,
                &format!("recv error on socket: {}", message),
            ),
        }
    }

    /// Run `f` against the handler of connection `id`, if it is still open
    /// and its handler is an `H`.
    pub fn with_handler<H, R, F>(&mut self, id: ConnectionId, f: F) -> Option<R>
    where
        H: Handler,
        F: FnOnce(&mut H, &mut Conn<'_>) -> R,
    {
        let mut entry = match self.entries.remove(&id)? {
            Entry::Connection(entry) => entry,
            other => {
                self.entries.insert(id, other);
                return None;
            }
        };
        let registry = self.poll.registry();
        let result = match entry.handler.as_any_mut().downcast_mut::<H>() {
            Some(handler) => {
                let mut conn = Conn::new(&mut entry.conn, registry, &mut self.pending);
                Some(f(handler, &mut conn))
            }
            None => None,
        };
        entry.drain(registry, &mut self.pending);
        if !entry.conn.closed {
            self.entries.insert(id, Entry::Connection(entry));
        }
        result
    }

    /// Whether connection `id` is registered and not closed.
    pub fn is_open(&self, id: ConnectionId) -> bool {
        matches!(self.entries.get(&id), Some(Entry::Connection(e)) if !e.conn.closed)
    }

    /// Whether the network itself still accepts work.
    pub fn is_running(&self) -> bool {
        self.is_open
    }

    pub fn connection_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| matches!(entry, Entry::Connection(_)))
            .count()
    }

    /// Stop listening on `id`. Returns `false` if it was not a listener.
    pub fn close_listener(&mut self, id: ConnectionId) -> bool {
        match self.entries.remove(&id) {
            Some(Entry::Listener(mut listener)) => {
                let _ = self.poll.registry().deregister(&mut listener.socket);
                tracing::debug!(lid = %id, "listener closed");
                true
            }
            Some(other) => {
                self.entries.insert(id, other);
                false
            }
            None => false,
        }
    }

    /// Close every listener and connection. Idempotent.
    ///
    /// Each open connection gets `on_close` with reason `network closed`.
    pub fn close(&mut self) {
        if !self.is_open {
            return;
        }
        self.is_open = false;
        let registry = self.poll.registry();
        let mut entries: Vec<(ConnectionId, Entry)> = self.entries.drain().collect();
        entries.sort_by_key(|(id, _)| *id);
        for (_, entry) in entries {
            match entry {
                Entry::Listener(mut listener) => {
                    let _ = registry.deregister(&mut listener.socket);
                }
                Entry::Connection(mut entry) => {
                    entry.close(registry, &mut self.pending, "network closed");
                }
            }
        }
        self.pending.clear();
        tracing::debug!("network closed");
    }
}

/// Resolve `host:port`, preferring IPv4 to match the listener's bind address.
fn resolve(host: &str, port: u16) -> std::result::Result<SocketAddr, String> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| format!("failed to resolve {}: {}", host, e))?
        .collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| format!("no addresses for {}", host))
}
