//! Per-connection socket state and the [`Conn`] handle given to handlers.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::Instant;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tidewire_core::Result;

use crate::tls::{ClientTls, ServerTls};

/// Default number of bytes requested per socket read.
pub const DEFAULT_RECV_LEN: usize = 1024;

/// Identifier the [`Network`](crate::Network) assigns to every socket it owns.
///
/// Ids increase monotonically and are never reused within one network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn token(self) -> Token {
        Token(self.0 as usize)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the next readiness event on this socket means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Connect,
    Handshake,
    Ready,
}

/// Work queued by a handler call, dispatched once that call returns.
#[derive(Debug)]
pub(crate) enum Deferred {
    SendComplete,
    SendError(String),
    Close(Option<String>),
}

pub(crate) enum Received {
    /// Bytes read, and whether more may be immediately available.
    Data(Vec<u8>, bool),
    Nothing,
    Eof,
    Interrupted,
    Error(String),
}

pub(crate) enum Handshake {
    Done,
    Blocked,
    Failed(String),
}

/// One socket plus reactor bookkeeping. Owned by the network.
pub struct Connection {
    pub(crate) id: ConnectionId,
    stream: Option<TcpStream>,
    pub(crate) tls: Option<rustls::Connection>,
    pub(crate) step: Step,
    interest: Option<Interest>,
    sending: Vec<u8>,
    awaiting_send_complete: bool,
    pub(crate) deferred: VecDeque<Deferred>,
    is_outbound: bool,
    host: Option<String>,
    pub(crate) peer_addr: Option<SocketAddr>,
    pub(crate) quiesced: bool,
    pub(crate) closed: bool,
    recv_len: usize,
    rx_count: u64,
    tx_count: u64,
    t_init: Instant,
    pub(crate) t_open: Option<Instant>,
    pub(crate) t_ready: Option<Instant>,
    t_close: Option<Instant>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("step", &self.step)
            .field("is_outbound", &self.is_outbound)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.closed)
            .field("rx_count", &self.rx_count)
            .field("tx_count", &self.tx_count)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        stream: Option<TcpStream>,
        tls: Option<rustls::Connection>,
        is_outbound: bool,
        host: Option<String>,
    ) -> Self {
        let mut tls = tls;
        if let Some(tls) = tls.as_mut() {
            tls.set_buffer_limit(None);
        }
        Self {
            id,
            stream,
            tls,
            step: if is_outbound { Step::Connect } else { Step::Ready },
            interest: None,
            sending: Vec::new(),
            awaiting_send_complete: false,
            deferred: VecDeque::new(),
            is_outbound,
            host,
            peer_addr: None,
            quiesced: false,
            closed: false,
            recv_len: DEFAULT_RECV_LEN,
            rx_count: 0,
            tx_count: 0,
            t_init: Instant::now(),
            t_open: None,
            t_ready: None,
            t_close: None,
        }
    }

    pub(crate) fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    fn has_output(&self) -> bool {
        !self.sending.is_empty() || self.tls.as_ref().is_some_and(|tls| tls.wants_write())
    }

    /// Plaintext that rustls decrypted but nobody has read yet.
    pub(crate) fn has_buffered_plaintext(&mut self) -> bool {
        if self.quiesced || self.closed {
            return false;
        }
        match self.tls.as_mut() {
            Some(tls) => tls
                .process_new_packets()
                .is_ok_and(|state| state.plaintext_bytes_to_read() > 0),
            None => false,
        }
    }

    /// Register, re-register, or deregister to match the current step.
    ///
    /// Re-registering re-arms edge-triggered readiness, so a socket that
    /// still has data queued reports it again on the next poll.
    pub(crate) fn update_interest(&mut self, registry: &Registry) {
        if self.closed {
            return;
        }
        let desired = match self.step {
            Step::Connect => Some(Interest::WRITABLE),
            Step::Handshake => {
                if self.has_output() {
                    Some(Interest::WRITABLE)
                } else {
                    Some(Interest::READABLE)
                }
            }
            Step::Ready => {
                if self.has_output() {
                    Some(Interest::WRITABLE)
                } else if self.quiesced {
                    None
                } else {
                    Some(Interest::READABLE)
                }
            }
        };
        let token = self.id.token();
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let result = match (self.interest, desired) {
            (None, Some(interest)) => registry.register(stream, token, interest),
            (Some(_), Some(interest)) => registry.reregister(stream, token, interest),
            (Some(_), None) => registry.deregister(stream),
            (None, None) => Ok(()),
        };
        match result {
            Ok(()) => self.interest = desired,
            Err(e) => {
                tracing::warn!(cid = %self.id, error = %e, "failed to update readiness interest");
                self.close(registry, Some(format!("register error on socket: {}", e)));
            }
        }
    }

    /// Queue bytes and write as much as the socket accepts.
    fn send(&mut self, registry: &Registry, data: &[u8]) {
        if self.closed {
            tracing::warn!(cid = %self.id, len = data.len(), "send on closed connection discarded");
            return;
        }
        match self.tls.as_mut() {
            // Buffer limit is lifted, so rustls holds everything until the
            // handshake is done.
            Some(tls) => {
                if let Err(e) = tls.writer().write_all(data) {
                    self.close(registry, Some(format!("send error on socket: {}", e)));
                    return;
                }
            }
            None => self.sending.extend_from_slice(data),
        }
        if self.awaiting_send_complete || self.step != Step::Ready {
            self.awaiting_send_complete = true;
            return;
        }
        match self.flush() {
            Ok(true) => self.deferred.push_back(Deferred::SendComplete),
            Ok(false) => {
                self.awaiting_send_complete = true;
                self.deferred
                    .push_back(Deferred::SendError("socket would block; send buffered".into()));
                self.update_interest(registry);
            }
            Err(e) => self.close(registry, Some(format!("send error on socket: {}", e))),
        }
    }

    /// Write buffered output. Returns `Ok(true)` once everything is out.
    pub(crate) fn flush(&mut self) -> io::Result<bool> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };
        while !self.sending.is_empty() {
            match stream.write(&self.sending) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    self.tx_count += n as u64;
                    self.sending.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        if let Some(tls) = self.tls.as_mut() {
            while tls.wants_write() {
                match tls.write_tls(stream) {
                    Ok(n) => self.tx_count += n as u64,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(true)
    }

    /// Flush after a write-readiness event.
    pub(crate) fn on_writable(&mut self, registry: &Registry) {
        match self.flush() {
            Ok(true) => {
                if self.awaiting_send_complete {
                    self.awaiting_send_complete = false;
                    self.deferred.push_back(Deferred::SendComplete);
                }
                self.update_interest(registry);
            }
            Ok(false) => {}
            Err(e) => self.close(registry, Some(format!("send error on socket: {}", e))),
        }
    }

    /// Perform one non-blocking read of up to `recv_len` bytes.
    pub(crate) fn receive(&mut self) -> Received {
        let recv_len = self.recv_len.max(1);
        let Some(stream) = self.stream.as_mut() else {
            return Received::Nothing;
        };
        let mut buf = vec![0u8; recv_len];

        let Some(tls) = self.tls.as_mut() else {
            return match stream.read(&mut buf) {
                Ok(0) => Received::Eof,
                Ok(n) => {
                    buf.truncate(n);
                    self.rx_count += n as u64;
                    Received::Data(buf, n == recv_len)
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Received::Nothing,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => Received::Interrupted,
                Err(e) => Received::Error(e.to_string()),
            };
        };

        let mut socket_eof = false;
        match tls.read_tls(stream) {
            Ok(0) => socket_eof = true,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Received::Interrupted,
            Err(e) => return Received::Error(e.to_string()),
        }
        if let Err(e) = tls.process_new_packets() {
            let _ = tls.write_tls(stream);
            return Received::Error(e.to_string());
        }
        let result = match tls.reader().read(&mut buf) {
            Ok(0) => Received::Eof,
            Ok(n) => {
                buf.truncate(n);
                self.rx_count += n as u64;
                let more = tls
                    .process_new_packets()
                    .is_ok_and(|state| state.plaintext_bytes_to_read() > 0);
                Received::Data(buf, more || n == recv_len)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if socket_eof {
                    Received::Eof
                } else {
                    Received::Nothing
                }
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Received::Eof,
            Err(e) => Received::Error(e.to_string()),
        };
        // Key updates and alerts produced while reading.
        while tls.wants_write() {
            if tls.write_tls(stream).is_err() {
                break;
            }
        }
        result
    }

    /// Advance the TLS handshake as far as the socket allows.
    pub(crate) fn drive_handshake(&mut self) -> Handshake {
        match self.flush() {
            Ok(_) => {}
            Err(e) => return Handshake::Failed(e.to_string()),
        }
        let Some(stream) = self.stream.as_mut() else {
            return Handshake::Failed("socket closed".into());
        };
        let Some(tls) = self.tls.as_mut() else {
            return Handshake::Done;
        };
        loop {
            while tls.wants_write() {
                match tls.write_tls(stream) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Handshake::Blocked,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Handshake::Failed(e.to_string()),
                }
            }
            if !tls.is_handshaking() {
                return Handshake::Done;
            }
            match tls.read_tls(stream) {
                Ok(0) => return Handshake::Failed("connection closed during handshake".into()),
                Ok(_) => {
                    if let Err(e) = tls.process_new_packets() {
                        let _ = tls.write_tls(stream);
                        return Handshake::Failed(e.to_string());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Handshake::Blocked,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Handshake::Failed(e.to_string()),
            }
        }
    }

    pub(crate) fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.tls
            .as_ref()
            .and_then(|tls| tls.peer_certificates())
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec())
    }

    /// Release the socket. Idempotent; queues `on_close` on first call.
    pub(crate) fn close(&mut self, registry: &Registry, reason: Option<String>) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.t_close = Some(Instant::now());
        tracing::debug!(cid = %self.id, reason = reason.as_deref().unwrap_or(""), "closing connection");
        if let Some(mut stream) = self.stream.take() {
            if let Some(tls) = self.tls.as_mut() {
                if !tls.is_handshaking() {
                    tls.send_close_notify();
                    let _ = tls.write_tls(&mut stream);
                }
            }
            if self.interest.take().is_some() {
                let _ = registry.deregister(&mut stream);
            }
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.sending.clear();
        self.deferred.push_back(Deferred::Close(reason));
    }
}

/// A handler's view of its connection during a callback.
///
/// Operations take effect immediately on the socket; the resulting
/// `on_send_complete` / `on_close` hooks run after the current callback
/// returns.
pub struct Conn<'a> {
    pub(crate) inner: &'a mut Connection,
    pub(crate) registry: &'a Registry,
    pub(crate) pending: &'a mut VecDeque<ConnectionId>,
}

impl<'a> Conn<'a> {
    pub(crate) fn new(
        inner: &'a mut Connection,
        registry: &'a Registry,
        pending: &'a mut VecDeque<ConnectionId>,
    ) -> Self {
        Self {
            inner,
            registry,
            pending,
        }
    }

    /// Shorter-lived handle to the same connection.
    pub fn reborrow(&mut self) -> Conn<'_> {
        Conn {
            inner: &mut *self.inner,
            registry: self.registry,
            pending: &mut *self.pending,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Send bytes to the peer; anything the socket will not take now is
    /// buffered and flushed on write readiness.
    pub fn send(&mut self, data: &[u8]) {
        self.inner.send(self.registry, data);
    }

    /// Close the connection. Later calls are no-ops.
    pub fn close(&mut self, reason: Option<&str>) {
        self.inner.close(self.registry, reason.map(str::to_string));
    }

    /// Stop delivering read readiness until [`unquiesce`](Self::unquiesce).
    pub fn quiesce(&mut self) {
        if !self.inner.quiesced {
            self.inner.quiesced = true;
            self.inner.update_interest(self.registry);
        }
    }

    pub fn unquiesce(&mut self) {
        if self.inner.closed || !self.inner.quiesced {
            return;
        }
        self.inner.quiesced = false;
        self.inner.update_interest(self.registry);
        if self.inner.step == Step::Ready {
            // Data may already sit in kernel or TLS buffers.
            self.pending.push_back(self.inner.id);
        }
    }

    /// Upgrade an established plaintext connection to TLS as a client.
    ///
    /// The handshake runs on subsequent readiness events; `on_handshake`
    /// and then `on_ready` fire again once it completes.
    pub fn start_tls(&mut self, tls: &ClientTls, host: &str) -> Result<()> {
        let config = tls.build()?;
        let name = tls.sni(host)?;
        let client = rustls::ClientConnection::new(config, name)
            .map_err(|e| crate::tls::tls_error(format!("Failed to create TLS connection: {}", e)))?;
        self.begin_handshake(rustls::Connection::Client(client));
        Ok(())
    }

    /// Upgrade an established plaintext connection to TLS as the server.
    ///
    /// Bytes already handed to `on_data` are not replayed into the TLS
    /// session; keep `recv_len` at the size of the upgrade request if the
    /// peer may send its ClientHello right behind it.
    pub fn accept_tls(&mut self, tls: &ServerTls) -> Result<()> {
        let config = tls.build()?;
        let server = rustls::ServerConnection::new(config)
            .map_err(|e| crate::tls::tls_error(format!("Failed to create TLS session: {}", e)))?;
        self.begin_handshake(rustls::Connection::Server(server));
        Ok(())
    }

    fn begin_handshake(&mut self, mut tls: rustls::Connection) {
        tls.set_buffer_limit(None);
        self.inner.tls = Some(tls);
        self.inner.step = Step::Handshake;
        self.inner.update_interest(self.registry);
        // the peer's first flight may already be queued on the socket
        self.pending.push_back(self.inner.id);
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed
    }

    pub fn is_quiesced(&self) -> bool {
        self.inner.quiesced
    }

    pub fn is_outbound(&self) -> bool {
        self.inner.is_outbound
    }

    pub fn is_inbound(&self) -> bool {
        !self.inner.is_outbound
    }

    pub fn is_tls(&self) -> bool {
        self.inner.tls.is_some()
    }

    /// Host given to `add_connection`; `None` for inbound connections.
    pub fn host(&self) -> Option<&str> {
        self.inner.host.as_deref()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.stream().and_then(|s| s.local_addr().ok())
    }

    pub fn recv_len(&self) -> usize {
        self.inner.recv_len
    }

    pub fn set_recv_len(&mut self, len: usize) {
        self.inner.recv_len = len.max(1);
    }

    /// Application bytes read from the peer.
    pub fn rx_count(&self) -> u64 {
        self.inner.rx_count
    }

    /// Bytes written to the socket.
    pub fn tx_count(&self) -> u64 {
        self.inner.tx_count
    }

    pub fn t_init(&self) -> Instant {
        self.inner.t_init
    }

    /// When TCP was established; `None` if it never was.
    pub fn t_open(&self) -> Option<Instant> {
        self.inner.t_open
    }

    pub fn t_ready(&self) -> Option<Instant> {
        self.inner.t_ready
    }

    pub fn t_close(&self) -> Option<Instant> {
        self.inner.t_close
    }
}
