//! The reactor handler that speaks MySQL on one connection.
//!
//! [`MySqlClient`] glues a [`Session`] to a [`Conn`]: bytes from the socket
//! are fed to the session, its output is written back, and finished
//! requests are handed to their callbacks together with a [`Cursor`] so the
//! callback can issue the next statement.

use std::rc::Rc;

use tidewire_core::error::{ConnectionError, ConnectionErrorKind};
use tidewire_core::{Error, Result};
use tidewire_net::{Conn, ConnectionId, Handler, Network};

use crate::config::MySqlContext;
use crate::cursor::Cursor;
use crate::session::{Progress, QueryResult, Session, State};

/// Completion callback for a statement.
///
/// Runs exactly once, either with the outcome of the statement or with the
/// error that closed the connection.
pub type Callback = Box<dyn FnOnce(&mut Cursor<'_>, Result<QueryResult>)>;

/// MySQL protocol handler for a [`Network`] connection.
pub struct MySqlClient {
    pub(crate) session: Session<Callback>,
    /// Nesting level of cursor transactions
    pub(crate) depth: usize,
    /// An inner rollback happened; the outermost commit must roll back
    pub(crate) rollback_only: bool,
    /// Statement as given by the caller, before substitution
    pub(crate) statement: Option<String>,
    /// Statement as sent
    pub(crate) executed: Option<String>,
    /// Why the connection is going away, for the pending callback
    error: Option<Error>,
}

impl MySqlClient {
    pub fn new(context: Rc<MySqlContext>) -> Self {
        Self {
            session: Session::new(context),
            depth: 0,
            rollback_only: false,
            statement: None,
            executed: None,
            error: None,
        }
    }

    /// Open a connection to the configured server.
    ///
    /// The connect and login run on later calls to [`Network::service`].
    /// Statements may be issued right away through [`MySqlClient::with_cursor`];
    /// they are held until the session is ready.
    pub fn connect(network: &mut Network, context: Rc<MySqlContext>) -> Result<ConnectionId> {
        let host = context.config.host.clone();
        let port = context.config.port;
        // TLS is negotiated in-band after the greeting, not at connect
        network.add_connection(&host, port, Self::new(context), None)
    }

    /// Run `f` with a [`Cursor`] for connection `id`.
    ///
    /// Returns `None` if the connection is gone or is not a MySQL client.
    pub fn with_cursor<R>(
        network: &mut Network,
        id: ConnectionId,
        f: impl FnOnce(&mut Cursor<'_>) -> R,
    ) -> Option<R> {
        network.with_handler::<Self, _, _>(id, |client, conn| {
            let mut cursor = Cursor::new(client, conn.reborrow());
            f(&mut cursor)
        })
    }

    pub fn session(&self) -> &Session<Callback> {
        &self.session
    }

    pub(crate) fn flush(&mut self, conn: &mut Conn<'_>) {
        if self.session.has_output() {
            let output = self.session.take_output();
            tracing::trace!(cid = %conn.id(), len = output.len(), "send");
            conn.send(&output);
        }
    }

    /// Drive the session until it has nothing more to report.
    fn pump(&mut self, conn: &mut Conn<'_>) {
        loop {
            let progress = self.session.advance();
            self.flush(conn);
            match progress {
                Progress::Idle => return,
                Progress::Deliver(callback, outcome) => {
                    let mut cursor = Cursor::new(self, conn.reborrow());
                    callback(&mut cursor, outcome);
                }
                Progress::StartTls => {
                    let Some(tls) = self.session.context().config.tls.clone() else {
                        let error = connection_error(ConnectionErrorKind::Ssl, "TLS is not configured");
                        self.abort(conn, error);
                        return;
                    };
                    let host = conn.host().unwrap_or_default().to_string();
                    if let Err(e) = conn.start_tls(&tls, &host) {
                        self.abort(conn, e);
                    }
                    return;
                }
                Progress::Fatal(error) => {
                    self.abort(conn, error);
                    return;
                }
            }
        }
    }

    fn abort(&mut self, conn: &mut Conn<'_>, error: Error) {
        let reason = error.to_string();
        tracing::debug!(cid = %conn.id(), error = %reason, "closing connection");
        self.error.get_or_insert(error);
        conn.close(Some(&reason));
    }
}

impl Handler for MySqlClient {
    fn on_open(&mut self, conn: &mut Conn<'_>) {
        if let Some(len) = self.session.context().config.recv_len {
            conn.set_recv_len(len);
        }
        tracing::debug!(cid = %conn.id(), host = conn.host().unwrap_or_default(), "mysql connection open");
    }

    fn on_ready(&mut self, conn: &mut Conn<'_>) {
        // second readiness after the in-band TLS upgrade
        if self.session.state() == State::Tls {
            self.session.tls_established();
            self.flush(conn);
        }
    }

    fn on_failed_handshake(&mut self, conn: &mut Conn<'_>, reason: &str) {
        tracing::warn!(cid = %conn.id(), reason, "TLS handshake with MySQL server failed");
        self.error
            .get_or_insert_with(|| connection_error(ConnectionErrorKind::Ssl, reason));
    }

    fn on_fail(&mut self, conn: &mut Conn<'_>, reason: &str) {
        tracing::debug!(cid = %conn.id(), reason, "mysql connect failed");
        self.error
            .get_or_insert_with(|| connection_error(ConnectionErrorKind::Connect, reason));
    }

    fn on_data(&mut self, conn: &mut Conn<'_>, data: &[u8]) {
        tracing::trace!(cid = %conn.id(), len = data.len(), "recv");
        self.session.feed(data);
        self.pump(conn);
    }

    fn on_close(&mut self, conn: &mut Conn<'_>, reason: Option<&str>) {
        let callback = self.session.close();
        self.depth = 0;
        self.rollback_only = false;
        let error = self.error.take().unwrap_or_else(|| {
            connection_error(
                ConnectionErrorKind::Disconnected,
                reason.unwrap_or("connection closed"),
            )
        });
        tracing::debug!(cid = %conn.id(), reason = reason.unwrap_or(""), "mysql connection closed");
        if let Some(callback) = callback {
            let mut cursor = Cursor::new(self, conn.reborrow());
            callback(&mut cursor, Err(error));
        }
    }
}

fn connection_error(kind: ConnectionErrorKind, message: &str) -> Error {
    Error::Connection(ConnectionError {
        kind,
        message: message.to_string(),
        source: None,
    })
}
