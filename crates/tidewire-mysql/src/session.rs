//! Client-side protocol state machine.
//!
//! [`Session`] is pure protocol: bytes go in through [`Session::feed`],
//! packets to send come out of [`Session::take_output`], and
//! [`Session::advance`] reports what the caller must act on. It never
//! touches a socket, so the whole exchange can be driven from tests.
//!
//! ```text
//! init ─greeting─▶ [tls] ─▶ authenticate ─ok─▶ [autocommit] ─▶ [isolation] ─▶ connected
//! connected ─query─▶ [transaction] ─▶ query ─▶ query_descriptors ─▶ query_rows
//!                                       │                               │
//!                                       └──────ok/err──▶ [transaction_end] ─▶ connected
//! ```
//!
//! Bracketed states are only entered when needed. Any state can fall to
//! `closed` on a framing or authentication failure.

use std::rc::Rc;
use std::sync::Arc;

use tidewire_core::error::{
    ConfigError, ConnectionError, ConnectionErrorKind, ProtocolError, QueryError, QueryErrorKind,
    TypeError, UsageError, UsageErrorKind,
};
use tidewire_core::{ColumnInfo, Error, Result, Row, Value};

use crate::auth::{self, caching_sha2, plugins};
use crate::config::MySqlContext;
use crate::protocol::capabilities::CLIENT_SSL;
use crate::protocol::charset::Encoding;
use crate::protocol::server_status::{
    SERVER_MORE_RESULTS_EXISTS, SERVER_STATUS_AUTOCOMMIT, SERVER_STATUS_NO_BACKSLASH_ESCAPES,
};
use crate::protocol::writer::{HandshakeResponse, command_payload};
use crate::protocol::{
    Command, EofPacket, ErrPacket, Frame, Greeting, OkPacket, Packet, PacketFramer, PacketKind,
    PacketReader,
};
use crate::types::ColumnDef;

/// Protocol state. Names match what the trace hook reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Tls,
    Authenticate,
    Autocommit,
    Isolation,
    Connected,
    Transaction,
    Query,
    QueryDescriptors,
    QueryRows,
    TransactionEnd,
    Closed,
}

impl State {
    pub const fn name(self) -> &'static str {
        match self {
            State::Init => "init",
            State::Tls => "tls",
            State::Authenticate => "authenticate",
            State::Autocommit => "autocommit",
            State::Isolation => "isolation",
            State::Connected => "connected",
            State::Transaction => "transaction",
            State::Query => "query",
            State::QueryDescriptors => "query_descriptors",
            State::QueryRows => "query_rows",
            State::TransactionEnd => "transaction_end",
            State::Closed => "closed",
        }
    }
}

/// How rows are materialized in a [`QueryResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowFormat {
    /// Positional value lists
    #[default]
    Tuples,
    /// [`Row`]s addressable by column name
    Records,
}

/// Statement that closes a transaction opened for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum End {
    /// COMMIT if the statement succeeded, ROLLBACK if it failed
    Commit,
    /// ROLLBACK regardless of the outcome
    Rollback,
}

/// One statement to run, plus what to do with the outcome.
pub struct Request<C> {
    pub sql: String,
    /// Send START TRANSACTION first
    pub begin: bool,
    /// Close the transaction after the statement, before delivering
    pub end: Option<End>,
    pub format: RowFormat,
    pub callback: C,
}

impl<C> Request<C> {
    pub fn new(sql: impl Into<String>, callback: C) -> Self {
        Self {
            sql: sql.into(),
            begin: false,
            end: None,
            format: RowFormat::Tuples,
            callback,
        }
    }
}

/// Status fields from the OK or EOF packet that finished a result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryStatus {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
}

impl From<OkPacket> for QueryStatus {
    fn from(ok: OkPacket) -> Self {
        Self {
            affected_rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
            status_flags: ok.status_flags,
            warnings: ok.warnings,
            info: ok.info,
        }
    }
}

impl From<EofPacket> for QueryStatus {
    fn from(eof: EofPacket) -> Self {
        Self {
            status_flags: eof.status_flags,
            warnings: eof.warnings,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub enum Rows {
    Tuples(Vec<Vec<Value>>),
    Records(Vec<Row>),
}

impl Rows {
    pub fn len(&self) -> usize {
        match self {
            Rows::Tuples(rows) => rows.len(),
            Rows::Records(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of one statement.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Field descriptors; empty for statements without a result set
    pub fields: Vec<ColumnDef>,
    /// Column names, when enabled in the configuration
    pub columns: Option<Vec<String>>,
    pub rows: Rows,
    pub status: QueryStatus,
    /// Further result sets, when the server sent more than one
    pub more: Vec<QueryResult>,
}

impl QueryResult {
    /// A result with no rows and a zeroed status.
    pub(crate) fn empty(format: RowFormat) -> Self {
        Self {
            fields: Vec::new(),
            columns: None,
            rows: match format {
                RowFormat::Tuples => Rows::Tuples(Vec::new()),
                RowFormat::Records => Rows::Records(Vec::new()),
            },
            status: QueryStatus::default(),
            more: Vec::new(),
        }
    }

    fn from_ok(ok: OkPacket, format: RowFormat) -> Self {
        Self {
            status: ok.into(),
            ..Self::empty(format)
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn tuples(&self) -> Option<&[Vec<Value>]> {
        match &self.rows {
            Rows::Tuples(rows) => Some(rows),
            Rows::Records(_) => None,
        }
    }

    pub fn records(&self) -> Option<&[Row]> {
        match &self.rows {
            Rows::Records(rows) => Some(rows),
            Rows::Tuples(_) => None,
        }
    }

    /// First column of the first row.
    pub fn scalar(&self) -> Option<&Value> {
        match &self.rows {
            Rows::Tuples(rows) => rows.first()?.first(),
            Rows::Records(rows) => rows.first()?.get(0),
        }
    }
}

/// What [`Session::advance`] needs the caller to do.
pub enum Progress<C> {
    /// Nothing until more bytes arrive
    Idle,
    /// A request finished; hand the outcome to its callback
    Deliver(C, Result<QueryResult>),
    /// Flush output, then upgrade the transport to TLS and call
    /// [`Session::tls_established`]
    StartTls,
    /// The connection cannot continue and must be closed
    Fatal(Error),
}

impl<C> std::fmt::Debug for Progress<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Progress::Idle => f.write_str("Idle"),
            Progress::Deliver(_, outcome) => f.debug_tuple("Deliver").field(outcome).finish(),
            Progress::StartTls => f.write_str("StartTls"),
            Progress::Fatal(e) => f.debug_tuple("Fatal").field(e).finish(),
        }
    }
}

/// Result set being assembled.
#[derive(Debug)]
struct ResultBuilder {
    column_count: usize,
    fields: Vec<ColumnDef>,
    rows: Vec<Vec<Value>>,
    /// First conversion failure; later rows are still read to stay in sync
    decode_error: Option<Error>,
}

impl ResultBuilder {
    fn new(column_count: usize) -> Self {
        Self {
            column_count,
            fields: Vec::with_capacity(column_count),
            rows: Vec::new(),
            decode_error: None,
        }
    }

    fn push_row(&mut self, payload: &[u8]) -> Result<()> {
        let mut reader = PacketReader::new(payload);
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let raw = reader
                .read_column_value()
                .ok_or_else(|| protocol_error("Truncated row packet", Some(payload.to_vec())))?;
            if self.decode_error.is_some() {
                continue;
            }
            match raw.map(|data| field.decode(data)).transpose() {
                Ok(value) => values.push(value.unwrap_or(Value::Null)),
                Err(e) => self.decode_error = Some(e),
            }
        }
        if !reader.is_empty() {
            return Err(protocol_error(
                "Row packet has more values than columns",
                Some(payload.to_vec()),
            ));
        }
        if self.decode_error.is_none() {
            self.rows.push(values);
        }
        Ok(())
    }

    fn finish(self, status: QueryStatus, format: RowFormat, context: &MySqlContext) -> QueryResult {
        let names: Vec<String> = self
            .fields
            .iter()
            .map(|f| f.display_name(context.config.table_prefix))
            .collect();
        let rows = match format {
            RowFormat::Tuples => Rows::Tuples(self.rows),
            RowFormat::Records => {
                let info = Arc::new(ColumnInfo::new(names.clone()));
                Rows::Records(
                    self.rows
                        .into_iter()
                        .map(|values| Row::with_columns(Arc::clone(&info), values))
                        .collect(),
                )
            }
        };
        QueryResult {
            fields: self.fields,
            columns: context.config.column_names.then_some(names),
            rows,
            status,
            more: Vec::new(),
        }
    }
}

/// The request currently owning the connection.
struct InFlight<C> {
    request: Request<C>,
    /// False while held for the session to become ready
    sent: bool,
    results: Vec<QueryResult>,
    builder: Option<ResultBuilder>,
    failed: Option<Error>,
    /// Statement outcome, parked while COMMIT/ROLLBACK runs
    outcome: Option<Result<QueryResult>>,
}

impl<C> InFlight<C> {
    fn new(request: Request<C>) -> Self {
        Self {
            request,
            sent: false,
            results: Vec::new(),
            builder: None,
            failed: None,
            outcome: None,
        }
    }

    fn take_outcome(&mut self) -> Result<QueryResult> {
        let results = std::mem::take(&mut self.results);
        if let Some(err) = self.failed.take() {
            return Err(err);
        }
        let mut results = results.into_iter();
        let mut first = results
            .next()
            .ok_or_else(|| protocol_error("Statement finished without a result", None))?;
        first.more = results.collect();
        Ok(first)
    }
}

type Step<C> = Result<Option<Progress<C>>>;

/// Protocol state for one connection.
pub struct Session<C> {
    context: Rc<MySqlContext>,
    framer: PacketFramer,
    output: Vec<u8>,
    state: State,
    greeting: Option<Greeting>,
    capabilities: u32,
    auth_plugin: String,
    salt: Vec<u8>,
    tls_active: bool,
    awaiting_public_key: bool,
    status_flags: u16,
    last_status: QueryStatus,
    /// Last statement written, for error reports during session setup
    statement: String,
    pending: Option<InFlight<C>>,
}

impl<C> Session<C> {
    pub fn new(context: Rc<MySqlContext>) -> Self {
        Self {
            context,
            framer: PacketFramer::new(),
            output: Vec::new(),
            state: State::Init,
            greeting: None,
            capabilities: 0,
            auth_plugin: String::new(),
            salt: Vec::new(),
            tls_active: false,
            awaiting_public_key: false,
            status_flags: 0,
            last_status: QueryStatus::default(),
            statement: String::new(),
            pending: None,
        }
    }

    pub fn context(&self) -> &Rc<MySqlContext> {
        &self.context
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Ready for statements (it may still be running one).
    pub fn is_ready(&self) -> bool {
        matches!(
            self.state,
            State::Connected
                | State::Transaction
                | State::Query
                | State::QueryDescriptors
                | State::QueryRows
                | State::TransactionEnd
        )
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Logged in (or logging in) over TLS.
    pub fn is_tls(&self) -> bool {
        self.tls_active
    }

    /// A request is in flight or held.
    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    pub fn status_flags(&self) -> u16 {
        self.status_flags
    }

    pub fn no_backslash_escapes(&self) -> bool {
        self.status_flags & SERVER_STATUS_NO_BACKSLASH_ESCAPES != 0
    }

    /// Text encoding of the connection character set.
    pub fn encoding(&self) -> Encoding {
        Encoding::for_id(u16::from(self.context.config.charset)).unwrap_or(Encoding::Utf8)
    }

    /// Fails if `sql` has characters the connection character set cannot
    /// carry.
    pub fn check_encodable(&self, sql: &str) -> Result<()> {
        if self.encoding().can_encode(sql) {
            return Ok(());
        }
        let preview: String = sql.chars().take(32).collect();
        Err(Error::Type(TypeError {
            expected: "text in the connection character set",
            actual: preview,
            column: None,
        }))
    }

    /// Status of the most recent statement that completed successfully.
    pub fn last_status(&self) -> &QueryStatus {
        &self.last_status
    }

    pub fn server_version(&self) -> Option<&str> {
        self.greeting.as_ref().map(|g| g.server_version.as_str())
    }

    pub fn connection_id(&self) -> Option<u32> {
        self.greeting.as_ref().map(|g| g.connection_id)
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.framer.feed(data);
    }

    /// Framed bytes waiting to be sent.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Queue a request. If the session is still being set up, the request
    /// is held and sent once it is ready.
    pub fn submit(&mut self, request: Request<C>) -> Result<()> {
        if self.state == State::Closed {
            return Err(usage_error(UsageErrorKind::Closed, "connection is closed"));
        }
        if self.pending.is_some() {
            return Err(usage_error(
                UsageErrorKind::Busy,
                "a statement is already in progress on this connection",
            ));
        }
        self.pending = Some(InFlight::new(request));
        if self.state == State::Connected {
            self.dispatch(false);
        }
        Ok(())
    }

    /// The transport finished its TLS handshake; authenticate over it.
    pub fn tls_established(&mut self) {
        if self.state != State::Tls {
            return;
        }
        self.tls_active = true;
        let payload = self.handshake_payload(false);
        self.write_packet(&payload);
        self.transition(State::Authenticate, "tls", false);
    }

    /// Queue COM_QUIT and stop. Before login there is nobody to say
    /// goodbye to, so nothing is queued.
    pub fn quit(&mut self) {
        if self.state == State::Closed {
            return;
        }
        if self.is_ready() {
            let payload = command_payload(Command::Quit, &[]);
            let framed = self.framer.frame_command(&payload);
            self.output.extend_from_slice(&framed);
        }
        self.transition(State::Closed, "close", false);
    }

    /// Mark the session closed and hand back the callback of any request
    /// that will now never complete.
    pub fn close(&mut self) -> Option<C> {
        if self.state != State::Closed {
            self.transition(State::Closed, "close", false);
        }
        self.pending.take().map(|p| p.request.callback)
    }

    /// Process buffered packets until there is something to report.
    pub fn advance(&mut self) -> Progress<C> {
        while self.state != State::Closed {
            let packet = match self.framer.next_frame() {
                Frame::Incomplete => return Progress::Idle,
                Frame::Complete(packet) => packet,
                Frame::Error(reason) => return self.fail(protocol_error(reason, None)),
            };
            match self.handle(packet) {
                Ok(None) => {}
                Ok(Some(progress)) => return progress,
                Err(e) => return self.fail(e),
            }
        }
        Progress::Idle
    }

    fn fail(&mut self, error: Error) -> Progress<C> {
        tracing::warn!(state = self.state.name(), error = %error, "session failed");
        self.transition(State::Closed, "close", true);
        Progress::Fatal(error)
    }

    fn transition(&mut self, next: State, event: &str, internal: bool) {
        let is_default = next == self.state;
        self.state = next;
        tracing::trace!(state = next.name(), event, is_default, internal, "transition");
        self.context.trace_fsm(next.name(), event, is_default, internal);
    }

    fn handle(&mut self, packet: Packet) -> Step<C> {
        let kind = packet.kind();
        let payload = packet.payload;
        match self.state {
            State::Init => self.on_greeting(&payload),
            State::Authenticate => self.on_auth_packet(kind, &payload),
            State::Autocommit | State::Isolation => self.on_setup_reply(kind, &payload),
            State::Transaction => self.on_transaction_started(kind, &payload),
            State::Query => self.on_query_response(kind, &payload),
            State::QueryDescriptors => self.on_descriptor(kind, &payload),
            State::QueryRows => self.on_row(kind, &payload),
            State::TransactionEnd => self.on_transaction_end(kind, &payload),
            State::Tls | State::Connected => Err(unexpected(self.state, payload)),
            State::Closed => Ok(None),
        }
    }

    fn write_packet(&mut self, payload: &[u8]) {
        let framed = self.framer.frame(payload);
        self.output.extend_from_slice(&framed);
    }

    fn write_query(&mut self, sql: &str) {
        self.context.trace_sql(sql);
        tracing::debug!(sql = %sql, "query");
        let bytes = self.encoding().encode_lossy(sql);
        let framed = self
            .framer
            .frame_command(&command_payload(Command::Query, &bytes));
        self.output.extend_from_slice(&framed);
        sql.clone_into(&mut self.statement);
    }

    fn handshake_payload(&self, ssl_only: bool) -> Vec<u8> {
        let config = &self.context.config;
        let scramble = if ssl_only {
            Vec::new()
        } else {
            auth::auth_response(&self.auth_plugin, config.password_str(), &self.salt)
                .unwrap_or_default()
        };
        let response = HandshakeResponse {
            capabilities: self.capabilities,
            max_packet_size: config.max_packet_size,
            charset: config.charset,
            user: &config.user,
            auth_response: &scramble,
            database: config.database.as_deref(),
            auth_plugin: &self.auth_plugin,
        };
        if ssl_only {
            response.ssl_request()
        } else {
            response.encode()
        }
    }

    // ---- connection phase ----

    fn on_greeting(&mut self, payload: &[u8]) -> Step<C> {
        if PacketKind::classify(payload) == PacketKind::Error {
            let message = PacketReader::new(payload)
                .parse_err_packet()
                .map_or_else(|| "server refused the connection".to_string(), |e| e.error_message);
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Refused,
                message,
                source: None,
            }));
        }
        let greeting = PacketReader::new(payload)
            .parse_greeting()
            .ok_or_else(|| protocol_error("Truncated server greeting", Some(payload.to_vec())))?;
        if greeting.protocol_version != 10 {
            return Err(protocol_error(
                format!("Unsupported protocol version {}", greeting.protocol_version),
                None,
            ));
        }
        let charset = self.context.config.charset;
        if Encoding::for_id(u16::from(charset)).is_none() {
            return Err(Error::Config(ConfigError {
                message: format!("Unsupported connection character set {}", charset),
                source: None,
            }));
        }
        tracing::debug!(
            server_version = %greeting.server_version,
            connection_id = greeting.connection_id,
            plugin = %greeting.auth_plugin,
            "server greeting"
        );

        self.status_flags = greeting.status_flags;
        self.salt.clone_from(&greeting.auth_data);
        // an unknown default plugin gets a native answer; the server may
        // then ask to switch
        self.auth_plugin = if greeting.auth_plugin.is_empty() || !auth::is_supported(&greeting.auth_plugin) {
            plugins::MYSQL_NATIVE_PASSWORD.to_string()
        } else {
            greeting.auth_plugin.clone()
        };
        self.capabilities = self.context.config.capability_flags() & greeting.capabilities;
        let wants_tls = self.context.config.tls.is_some();
        self.greeting = Some(greeting);

        if wants_tls {
            if self.capabilities & CLIENT_SSL == 0 {
                return Err(Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Ssl,
                    message: "Server does not support SSL".to_string(),
                    source: None,
                }));
            }
            let request = self.handshake_payload(true);
            self.write_packet(&request);
            self.transition(State::Tls, "packet", false);
            return Ok(Some(Progress::StartTls));
        }

        let response = self.handshake_payload(false);
        self.write_packet(&response);
        self.transition(State::Authenticate, "packet", false);
        Ok(None)
    }

    fn on_auth_packet(&mut self, kind: PacketKind, payload: &[u8]) -> Step<C> {
        match (kind, payload.first().copied()) {
            (PacketKind::Ok, _) => {
                let ok = parse_ok(payload)?;
                self.status_flags = ok.status_flags;
                tracing::debug!(plugin = %self.auth_plugin, "authenticated");
                self.after_auth()
            }
            (PacketKind::Error, _) => {
                let err = parse_err(payload)?;
                Err(auth::auth_error(err.error_message))
            }
            (_, Some(0xFE)) => self.on_auth_switch(payload),
            (_, Some(0x01)) => self.on_auth_more_data(payload),
            _ => Err(unexpected(self.state, payload.to_vec())),
        }
    }

    fn on_auth_switch(&mut self, payload: &[u8]) -> Step<C> {
        let (plugin, salt) = if payload.len() == 1 {
            // pre-4.1 servers asking for the old password hash
            ("mysql_old_password".to_string(), Vec::new())
        } else {
            let mut reader = PacketReader::new(&payload[1..]);
            let plugin = reader.read_null_string();
            let rest = reader.read_rest();
            (plugin, rest.strip_suffix(&[0]).unwrap_or(rest).to_vec())
        };
        if plugin.is_empty() || !auth::is_supported(&plugin) {
            return Err(auth::auth_error(format!(
                "Authentication plugin '{}' not configured",
                plugin
            )));
        }
        tracing::debug!(plugin = %plugin, "auth switch");
        self.auth_plugin = plugin;
        self.salt = salt;
        let response =
            auth::auth_response(&self.auth_plugin, self.context.config.password_str(), &self.salt)
                .unwrap_or_default();
        self.write_packet(&response);
        self.transition(State::Authenticate, "packet", false);
        Ok(None)
    }

    fn on_auth_more_data(&mut self, payload: &[u8]) -> Step<C> {
        if self.auth_plugin != plugins::CACHING_SHA2_PASSWORD {
            return Err(unexpected(self.state, payload.to_vec()));
        }
        let context = Rc::clone(&self.context);
        let password = context.config.password_str();
        if self.awaiting_public_key {
            self.awaiting_public_key = false;
            let encrypted = auth::encrypt_password(password, &self.salt, &payload[1..])?;
            self.write_packet(&encrypted);
        } else {
            match payload.get(1).copied() {
                Some(caching_sha2::FAST_AUTH_SUCCESS) => {
                    tracing::trace!("caching_sha2 fast auth accepted");
                }
                Some(caching_sha2::PERFORM_FULL_AUTH) if self.tls_active => {
                    let cleartext = auth::cleartext_password(password);
                    self.write_packet(&cleartext);
                }
                Some(caching_sha2::PERFORM_FULL_AUTH) => {
                    self.awaiting_public_key = true;
                    self.write_packet(&[caching_sha2::REQUEST_PUBLIC_KEY]);
                }
                _ => return Err(unexpected(self.state, payload.to_vec())),
            }
        }
        self.transition(State::Authenticate, "packet", false);
        Ok(None)
    }

    fn after_auth(&mut self) -> Step<C> {
        let wanted = self.context.config.autocommit;
        let current = self.status_flags & SERVER_STATUS_AUTOCOMMIT != 0;
        if wanted != current {
            self.write_query(&format!("SET AUTOCOMMIT = {}", u8::from(wanted)));
            self.transition(State::Autocommit, "ok", false);
            return Ok(None);
        }
        self.after_autocommit()
    }

    fn after_autocommit(&mut self) -> Step<C> {
        if let Some(level) = self.context.config.isolation {
            self.write_query(&format!(
                "SET SESSION TRANSACTION ISOLATION LEVEL {}",
                level.as_sql()
            ));
            self.transition(State::Isolation, "ok", false);
            return Ok(None);
        }
        self.enter_connected()
    }

    /// Setup finished; send a request held while it ran.
    fn enter_connected(&mut self) -> Step<C> {
        self.transition(State::Connected, "ok", false);
        tracing::debug!(
            connection_id = self.connection_id().unwrap_or(0),
            "session ready"
        );
        if self.pending.as_ref().is_some_and(|p| !p.sent) {
            self.dispatch(true);
        }
        Ok(None)
    }

    fn on_setup_reply(&mut self, kind: PacketKind, payload: &[u8]) -> Step<C> {
        match kind {
            PacketKind::Ok => {
                self.status_flags = parse_ok(payload)?.status_flags;
                if self.state == State::Autocommit {
                    self.after_autocommit()
                } else {
                    self.enter_connected()
                }
            }
            PacketKind::Error => {
                let err = parse_err(payload)?;
                Err(query_error(err, Some(&self.statement)))
            }
            _ => Err(unexpected(self.state, payload.to_vec())),
        }
    }

    // ---- command phase ----

    fn dispatch(&mut self, internal: bool) {
        let Some(in_flight) = self.pending.as_mut() else {
            return;
        };
        in_flight.sent = true;
        if in_flight.request.begin {
            self.write_query("START TRANSACTION");
            self.transition(State::Transaction, "query", internal);
        } else {
            let sql = in_flight.request.sql.clone();
            self.write_query(&sql);
            self.transition(State::Query, "query", internal);
        }
    }

    fn in_flight(&mut self) -> Result<&mut InFlight<C>> {
        self.pending
            .as_mut()
            .ok_or_else(|| protocol_error("Response without a pending statement", None))
    }

    fn on_transaction_started(&mut self, kind: PacketKind, payload: &[u8]) -> Step<C> {
        match kind {
            PacketKind::Ok => {
                self.status_flags = parse_ok(payload)?.status_flags;
                let sql = self.in_flight()?.request.sql.clone();
                self.write_query(&sql);
                self.transition(State::Query, "ok", false);
                Ok(None)
            }
            PacketKind::Error => {
                let err = query_error(parse_err(payload)?, Some("START TRANSACTION"));
                self.deliver(Err(err), "error")
            }
            _ => Err(unexpected(self.state, payload.to_vec())),
        }
    }

    fn on_query_response(&mut self, kind: PacketKind, payload: &[u8]) -> Step<C> {
        match kind {
            PacketKind::Ok => {
                let ok = parse_ok(payload)?;
                self.status_flags = ok.status_flags;
                let more = ok.status_flags & SERVER_MORE_RESULTS_EXISTS != 0;
                let in_flight = self.in_flight()?;
                let result = QueryResult::from_ok(ok, in_flight.request.format);
                in_flight.results.push(result);
                if more {
                    self.transition(State::Query, "ok", false);
                    Ok(None)
                } else {
                    self.finish_statement("ok")
                }
            }
            PacketKind::Error => {
                let err = parse_err(payload)?;
                let in_flight = self.in_flight()?;
                in_flight.failed = Some(query_error(err, Some(&in_flight.request.sql)));
                self.finish_statement("error")
            }
            PacketKind::Data => {
                let count = PacketReader::new(payload)
                    .read_lenenc_int()
                    .and_then(|n| usize::try_from(n).ok())
                    .filter(|&n| n > 0)
                    .ok_or_else(|| {
                        protocol_error("Unsupported statement response", Some(payload.to_vec()))
                    })?;
                self.in_flight()?.builder = Some(ResultBuilder::new(count));
                self.transition(State::QueryDescriptors, "packet", false);
                Ok(None)
            }
            PacketKind::Eof => Err(unexpected(self.state, payload.to_vec())),
        }
    }

    fn on_descriptor(&mut self, kind: PacketKind, payload: &[u8]) -> Step<C> {
        let builder = self
            .in_flight()?
            .builder
            .as_mut()
            .ok_or_else(|| protocol_error("Field descriptor outside a result set", None))?;
        match kind {
            PacketKind::Eof => {
                if builder.fields.len() != builder.column_count {
                    return Err(protocol_error(
                        format!(
                            "Expected {} field descriptors, got {}",
                            builder.column_count,
                            builder.fields.len()
                        ),
                        None,
                    ));
                }
                self.transition(State::QueryRows, "eof", false);
            }
            PacketKind::Data if builder.fields.len() < builder.column_count => {
                let def = ColumnDef::parse(payload).ok_or_else(|| {
                    protocol_error("Truncated field descriptor", Some(payload.to_vec()))
                })?;
                builder.fields.push(def);
                self.transition(State::QueryDescriptors, "packet", false);
            }
            _ => return Err(unexpected(self.state, payload.to_vec())),
        }
        Ok(None)
    }

    fn on_row(&mut self, kind: PacketKind, payload: &[u8]) -> Step<C> {
        match kind {
            PacketKind::Eof => {
                let eof = PacketReader::new(payload)
                    .parse_eof_packet()
                    .ok_or_else(|| protocol_error("Truncated EOF packet", Some(payload.to_vec())))?;
                self.status_flags = eof.status_flags;
                let more = eof.status_flags & SERVER_MORE_RESULTS_EXISTS != 0;
                let context = Rc::clone(&self.context);
                let in_flight = self.in_flight()?;
                let format = in_flight.request.format;
                let mut builder = in_flight
                    .builder
                    .take()
                    .ok_or_else(|| protocol_error("Rows outside a result set", None))?;
                if let Some(err) = builder.decode_error.take() {
                    in_flight.failed.get_or_insert(err);
                }
                in_flight.results.push(builder.finish(eof.into(), format, &context));
                if more {
                    self.transition(State::Query, "eof", false);
                    Ok(None)
                } else {
                    self.finish_statement("eof")
                }
            }
            PacketKind::Error => {
                // e.g. the statement was killed mid-result
                let err = parse_err(payload)?;
                let in_flight = self.in_flight()?;
                in_flight.builder = None;
                in_flight.failed = Some(query_error(err, Some(&in_flight.request.sql)));
                self.finish_statement("error")
            }
            // a row whose first value is an empty string starts with 0x00
            PacketKind::Ok | PacketKind::Data => {
                self.in_flight()?
                    .builder
                    .as_mut()
                    .ok_or_else(|| protocol_error("Rows outside a result set", None))?
                    .push_row(payload)?;
                self.transition(State::QueryRows, "packet", false);
                Ok(None)
            }
        }
    }

    /// The user statement is done: close the transaction if asked, else
    /// deliver.
    fn finish_statement(&mut self, event: &str) -> Step<C> {
        let in_flight = self.in_flight()?;
        let outcome = in_flight.take_outcome();
        let end = in_flight.request.end;
        if let Ok(result) = &outcome {
            self.last_status = result.status.clone();
        }
        let Some(end) = end else {
            return self.deliver(outcome, event);
        };
        let sql = match (end, outcome.is_ok()) {
            (End::Commit, true) => "COMMIT",
            _ => "ROLLBACK",
        };
        self.in_flight()?.outcome = Some(outcome);
        self.write_query(sql);
        self.transition(State::TransactionEnd, event, false);
        Ok(None)
    }

    fn on_transaction_end(&mut self, kind: PacketKind, payload: &[u8]) -> Step<C> {
        let parked = self
            .in_flight()?
            .outcome
            .take()
            .ok_or_else(|| protocol_error("Transaction end without a statement outcome", None))?;
        match kind {
            PacketKind::Ok => {
                self.status_flags = parse_ok(payload)?.status_flags;
                self.deliver(parked, "ok")
            }
            PacketKind::Error => {
                let err = query_error(parse_err(payload)?, Some(&self.statement));
                // a failed statement's own error is the more useful one
                let outcome = match parked {
                    Ok(_) => Err(err),
                    Err(original) => Err(original),
                };
                self.deliver(outcome, "error")
            }
            _ => Err(unexpected(self.state, payload.to_vec())),
        }
    }

    fn deliver(&mut self, outcome: Result<QueryResult>, event: &str) -> Step<C> {
        let in_flight = self
            .pending
            .take()
            .ok_or_else(|| protocol_error("Completion without a pending statement", None))?;
        self.transition(State::Connected, event, false);
        Ok(Some(Progress::Deliver(in_flight.request.callback, outcome)))
    }
}

fn parse_ok(payload: &[u8]) -> Result<OkPacket> {
    PacketReader::new(payload)
        .parse_ok_packet()
        .ok_or_else(|| protocol_error("Truncated OK packet", Some(payload.to_vec())))
}

fn parse_err(payload: &[u8]) -> Result<ErrPacket> {
    PacketReader::new(payload)
        .parse_err_packet()
        .ok_or_else(|| protocol_error("Truncated ERR packet", Some(payload.to_vec())))
}

/// Map a server ERR packet to a query error.
pub fn query_error(err: ErrPacket, sql: Option<&str>) -> Error {
    let kind = match (err.error_code, err.sql_state.as_str()) {
        (1064 | 1149, _) => QueryErrorKind::Syntax,
        (1205 | 1213, _) | (_, "40001") => QueryErrorKind::Deadlock,
        (1044 | 1045 | 1142 | 1143 | 1227, _) => QueryErrorKind::Permission,
        (1046 | 1049 | 1051 | 1054 | 1146, _) | (_, "42S02" | "42S22") => QueryErrorKind::NotFound,
        _ if err.is_duplicate_key() || err.is_foreign_key_violation() => QueryErrorKind::Constraint,
        (_, state) if state.starts_with("23") => QueryErrorKind::Constraint,
        (_, "42000") => QueryErrorKind::Syntax,
        _ => QueryErrorKind::Database,
    };
    Error::Query(QueryError {
        kind,
        sql: sql.map(str::to_string),
        sqlstate: (!err.sql_state.is_empty()).then_some(err.sql_state),
        code: Some(err.error_code),
        message: err.error_message,
    })
}

fn protocol_error(message: impl Into<String>, raw_data: Option<Vec<u8>>) -> Error {
    Error::Protocol(ProtocolError {
        message: message.into(),
        raw_data,
        source: None,
    })
}

fn unexpected(state: State, payload: Vec<u8>) -> Error {
    protocol_error(
        format!("Unexpected packet in state {}", state.name()),
        Some(payload),
    )
}

pub(crate) fn usage_error(kind: UsageErrorKind, message: &str) -> Error {
    Error::Usage(UsageError {
        kind,
        message: message.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::MySqlConfig;
    use crate::protocol::framer::tests::raw_frame;
    use crate::protocol::reader::tests::greeting_payload;
    use crate::types::FieldType;
    use crate::types::tests::column_payload;
    use std::cell::RefCell;
    use tidewire_core::IsolationLevel;

    pub(crate) const SALT: [u8; 20] = *b"abcdefghijklmnopqrst";

    pub(crate) fn ok_payload(affected: u8, insert_id: u8, status: u16) -> Vec<u8> {
        let mut payload = vec![0x00, affected, insert_id];
        payload.extend_from_slice(&status.to_le_bytes());
        payload.extend_from_slice(&[0, 0]);
        payload
    }

    pub(crate) fn eof_payload(status: u16) -> Vec<u8> {
        let mut payload = vec![0xFE, 0, 0];
        payload.extend_from_slice(&status.to_le_bytes());
        payload
    }

    pub(crate) fn err_payload(code: u16, sqlstate: &str, message: &str) -> Vec<u8> {
        let mut payload = vec![0xFF];
        payload.extend_from_slice(&code.to_le_bytes());
        payload.push(b'#');
        payload.extend_from_slice(sqlstate.as_bytes());
        payload.extend_from_slice(message.as_bytes());
        payload
    }

    pub(crate) fn row_payload(values: &[Option<&str>]) -> Vec<u8> {
        let mut payload = Vec::new();
        for value in values {
            match value {
                Some(v) => {
                    payload.push(u8::try_from(v.len()).unwrap());
                    payload.extend_from_slice(v.as_bytes());
                }
                None => payload.push(0xFB),
            }
        }
        payload
    }

    /// Complete response to a one-column, text-typed SELECT.
    pub(crate) fn select_response(name: &str, field_type: FieldType, rows: &[Option<&str>]) -> Vec<u8> {
        let mut out = raw_frame(1, &[1]);
        out.extend(raw_frame(2, &column_payload("t", name, field_type, 63, 0)));
        out.extend(raw_frame(3, &eof_payload(0)));
        let mut seq = 4;
        for row in rows {
            out.extend(raw_frame(seq, &row_payload(&[*row])));
            seq += 1;
        }
        out.extend(raw_frame(seq, &eof_payload(0)));
        out
    }

    fn query_frame(sql: &str) -> Vec<u8> {
        let mut payload = vec![0x03];
        payload.extend_from_slice(sql.as_bytes());
        raw_frame(0, &payload)
    }

    fn session(config: MySqlConfig) -> Session<u32> {
        Session::new(Rc::new(MySqlContext::new(config)))
    }

    /// Greeting and auth OK with autocommit off on both sides.
    fn connected(config: MySqlConfig) -> Session<u32> {
        let mut s = session(config);
        s.feed(&raw_frame(0, &greeting_payload("mysql_native_password", &SALT, 0)));
        assert!(matches!(s.advance(), Progress::Idle));
        s.take_output();
        s.feed(&raw_frame(2, &ok_payload(0, 0, 0)));
        assert!(matches!(s.advance(), Progress::Idle));
        assert_eq!(s.state(), State::Connected);
        assert!(!s.has_output());
        s
    }

    fn expect_deliver(progress: Progress<u32>) -> (u32, Result<QueryResult>) {
        match progress {
            Progress::Deliver(tag, outcome) => (tag, outcome),
            other => panic!("expected a delivery, got {other:?}"),
        }
    }

    #[test]
    fn test_native_handshake() {
        let mut s = session(MySqlConfig::new().user("root").password("secret").database("shop"));
        s.feed(&raw_frame(0, &greeting_payload("mysql_native_password", &SALT, 0)));
        assert!(matches!(s.advance(), Progress::Idle));
        assert_eq!(s.state(), State::Authenticate);
        assert_eq!(s.server_version(), Some("8.0.36"));
        assert_eq!(s.connection_id(), Some(42));

        let out = s.take_output();
        assert_eq!(out[3], 1, "handshake response continues the greeting sequence");
        let payload = &out[4..];
        let mut reader = PacketReader::new(payload);
        let caps = reader.read_u32_le().unwrap();
        assert_ne!(caps & crate::protocol::capabilities::CLIENT_CONNECT_WITH_DB, 0);
        assert_eq!(caps & CLIENT_SSL, 0);
        reader.skip(28);
        assert_eq!(reader.read_null_string(), "root");
        assert_eq!(reader.read_u8(), Some(20));
        assert_eq!(reader.read_bytes(20).unwrap(), auth::scramble("secret", &SALT));
        assert_eq!(reader.read_null_string(), "shop");
        assert_eq!(reader.read_null_string(), "mysql_native_password");

        s.feed(&raw_frame(2, &ok_payload(0, 0, 0)));
        assert!(matches!(s.advance(), Progress::Idle));
        assert!(s.is_ready());
    }

    #[test]
    fn test_session_negotiation_and_trace() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let context = MySqlContext::new(
            MySqlConfig::new().isolation(IsolationLevel::ReadCommitted),
        )
        .fsm_trace(move |state, event, is_default, is_internal| {
            sink.borrow_mut()
                .push(format!("{state}/{event}/{is_default}/{is_internal}"));
        });
        let mut s: Session<u32> = Session::new(Rc::new(context));

        s.feed(&raw_frame(0, &greeting_payload("mysql_native_password", &SALT, 0x0002)));
        s.advance();
        s.take_output();
        // server reports autocommit on; the configuration wants it off
        s.feed(&raw_frame(2, &ok_payload(0, 0, 0x0002)));
        s.advance();
        assert_eq!(s.state(), State::Autocommit);
        assert_eq!(s.take_output(), query_frame("SET AUTOCOMMIT = 0"));

        s.feed(&raw_frame(1, &ok_payload(0, 0, 0)));
        s.advance();
        assert_eq!(s.state(), State::Isolation);
        assert_eq!(
            s.take_output(),
            query_frame("SET SESSION TRANSACTION ISOLATION LEVEL READ COMMITTED")
        );

        s.feed(&raw_frame(1, &ok_payload(0, 0, 0)));
        s.advance();
        assert_eq!(s.state(), State::Connected);
        assert_eq!(
            *seen.borrow(),
            vec![
                "authenticate/packet/false/false",
                "autocommit/ok/false/false",
                "isolation/ok/false/false",
                "connected/ok/false/false",
            ]
        );
    }

    #[test]
    fn test_negotiation_skipped_when_server_matches() {
        let mut s = session(MySqlConfig::new().autocommit(true));
        s.feed(&raw_frame(0, &greeting_payload("mysql_native_password", &SALT, 0x0002)));
        s.advance();
        s.take_output();
        s.feed(&raw_frame(2, &ok_payload(0, 0, 0x0002)));
        s.advance();
        assert_eq!(s.state(), State::Connected);
        assert!(!s.has_output());
    }

    #[test]
    fn test_negotiation_error_is_fatal() {
        let mut s = session(MySqlConfig::new().isolation(IsolationLevel::Serializable));
        s.feed(&raw_frame(0, &greeting_payload("mysql_native_password", &SALT, 0)));
        s.advance();
        s.feed(&raw_frame(2, &ok_payload(0, 0, 0)));
        s.advance();
        s.feed(&raw_frame(1, &err_payload(1227, "42000", "Access denied")));
        assert!(matches!(s.advance(), Progress::Fatal(Error::Query(_))));
        assert!(s.is_closed());
    }

    #[test]
    fn test_autocommit_error_fails_held_request() {
        let mut s = session(MySqlConfig::new());
        s.submit(Request::new("SELECT 1", 3)).unwrap();
        s.feed(&raw_frame(0, &greeting_payload("mysql_native_password", &SALT, 0x0002)));
        s.advance();
        s.take_output();
        s.feed(&raw_frame(2, &ok_payload(0, 0, 0x0002)));
        s.advance();
        assert_eq!(s.take_output(), query_frame("SET AUTOCOMMIT = 0"));

        s.feed(&raw_frame(1, &err_payload(1231, "42000", "Variable can't be set")));
        let Progress::Fatal(Error::Query(err)) = s.advance() else {
            panic!("expected a fatal query error");
        };
        assert_eq!(err.sql.as_deref(), Some("SET AUTOCOMMIT = 0"));
        assert!(s.is_closed());
        // the held statement was never sent; its callback comes back once
        assert_eq!(s.close(), Some(3));
        assert_eq!(s.close(), None);
    }

    #[test]
    fn test_latin1_connection_encodes_statements() {
        let config = MySqlConfig::new().charset(crate::protocol::charset::LATIN1_SWEDISH_CI);
        let mut s = connected(config);
        assert_eq!(s.encoding(), Encoding::Latin1);
        s.submit(Request::new("SELECT 'café'", 1)).unwrap();
        let mut expected = vec![0x03];
        expected.extend_from_slice(b"SELECT 'caf\xe9'");
        assert_eq!(s.take_output(), raw_frame(0, &expected));

        assert!(s.check_encodable("SELECT 'café'").is_ok());
        assert!(matches!(s.check_encodable("SELECT '€'"), Err(Error::Type(_))));
        assert!(connected(MySqlConfig::new()).check_encodable("SELECT '€'").is_ok());
    }

    #[test]
    fn test_unsupported_connection_charset_fails_at_greeting() {
        // sjis
        let mut s = session(MySqlConfig::new().charset(13));
        s.feed(&raw_frame(0, &greeting_payload("mysql_native_password", &SALT, 0)));
        assert!(matches!(s.advance(), Progress::Fatal(Error::Config(_))));
        assert!(s.is_closed());
        assert!(!s.has_output());
    }

    #[test]
    fn test_select_one() {
        let mut s = connected(MySqlConfig::new());
        s.submit(Request::new("SELECT 1", 7)).unwrap();
        assert_eq!(s.take_output(), query_frame("SELECT 1"));
        assert!(s.is_busy());

        s.feed(&select_response("1", FieldType::LongLong, &[Some("1")]));
        let (tag, outcome) = expect_deliver(s.advance());
        assert_eq!(tag, 7);
        let result = outcome.unwrap();
        assert_eq!(result.tuples().unwrap(), &[vec![Value::Int(1)]]);
        assert_eq!(result.columns.as_deref(), Some(&["1".to_string()][..]));
        assert!(!s.is_busy());
        assert_eq!(s.state(), State::Connected);
    }

    #[test]
    fn test_byte_at_a_time_delivery() {
        let mut s = connected(MySqlConfig::new());
        s.submit(Request::new("SELECT name FROM t", 1)).unwrap();
        s.take_output();
        let response = select_response("name", FieldType::VarString, &[Some("a"), None, Some("")]);
        let mut delivered = None;
        for byte in response {
            s.feed(&[byte]);
            if let Progress::Deliver(_, outcome) = s.advance() {
                delivered = Some(outcome.unwrap());
            }
        }
        let result = delivered.unwrap();
        // charset 63 in the helper: string columns come back as bytes
        assert_eq!(
            result.tuples().unwrap(),
            &[
                vec![Value::Bytes(b"a".to_vec())],
                vec![Value::Null],
                vec![Value::Bytes(Vec::new())]
            ]
        );
    }

    #[test]
    fn test_syntax_error_then_recovery() {
        let mut s = connected(MySqlConfig::new());
        s.submit(Request::new("SELEC 1", 1)).unwrap();
        s.take_output();
        s.feed(&raw_frame(
            1,
            &err_payload(1064, "42000", "You have an error in your SQL syntax"),
        ));
        let (_, outcome) = expect_deliver(s.advance());
        let err = outcome.unwrap_err();
        assert_eq!(err.error_code(), Some(1064));
        assert_eq!(err.sqlstate(), Some("42000"));
        assert_eq!(err.sql(), Some("SELEC 1"));
        assert!(matches!(&err, Error::Query(q) if q.kind == QueryErrorKind::Syntax));

        s.submit(Request::new("SELECT 1", 2)).unwrap();
        assert_eq!(s.take_output(), query_frame("SELECT 1"));
        s.feed(&select_response("1", FieldType::LongLong, &[Some("1")]));
        assert_eq!(expect_deliver(s.advance()).1.unwrap().scalar(), Some(&Value::Int(1)));
    }

    #[test]
    fn test_busy_and_closed() {
        let mut s = connected(MySqlConfig::new());
        s.submit(Request::new("SELECT 1", 1)).unwrap();
        let err = s.submit(Request::new("SELECT 2", 2)).unwrap_err();
        assert!(err.is_usage(UsageErrorKind::Busy));

        assert_eq!(s.close(), Some(1));
        assert!(s.submit(Request::new("SELECT 3", 3)).unwrap_err().is_usage(UsageErrorKind::Closed));
        assert_eq!(s.close(), None);
    }

    #[test]
    fn test_request_held_until_ready() {
        let mut s = session(MySqlConfig::new());
        s.submit(Request::new("SELECT 1", 9)).unwrap();
        assert!(!s.has_output());
        s.feed(&raw_frame(0, &greeting_payload("mysql_native_password", &SALT, 0)));
        s.advance();
        s.take_output();
        s.feed(&raw_frame(2, &ok_payload(0, 0, 0)));
        s.advance();
        assert_eq!(s.take_output(), query_frame("SELECT 1"));
        assert_eq!(s.state(), State::Query);
    }

    #[test]
    fn test_insert_status() {
        let mut s = connected(MySqlConfig::new());
        s.submit(Request::new("INSERT INTO t VALUES (1)", 1)).unwrap();
        s.take_output();
        s.feed(&raw_frame(1, &ok_payload(1, 42, 0x0001)));
        let result = expect_deliver(s.advance()).1.unwrap();
        assert_eq!(result.status.affected_rows, 1);
        assert_eq!(result.status.last_insert_id, 42);
        assert!(result.fields.is_empty());
        assert_eq!(s.last_status().last_insert_id, 42);
    }

    #[test]
    fn test_transaction_wrapped_commit() {
        let mut s = connected(MySqlConfig::new());
        let mut request = Request::new("UPDATE t SET a = 1", 5);
        request.begin = true;
        request.end = Some(End::Commit);
        s.submit(request).unwrap();
        assert_eq!(s.take_output(), query_frame("START TRANSACTION"));
        assert_eq!(s.state(), State::Transaction);

        s.feed(&raw_frame(1, &ok_payload(0, 0, 0x0001)));
        assert!(matches!(s.advance(), Progress::Idle));
        assert_eq!(s.take_output(), query_frame("UPDATE t SET a = 1"));

        s.feed(&raw_frame(1, &ok_payload(3, 0, 0x0001)));
        // nothing is delivered until the commit is acknowledged
        assert!(matches!(s.advance(), Progress::Idle));
        assert_eq!(s.take_output(), query_frame("COMMIT"));
        assert_eq!(s.state(), State::TransactionEnd);

        s.feed(&raw_frame(1, &ok_payload(0, 0, 0)));
        let (tag, outcome) = expect_deliver(s.advance());
        assert_eq!(tag, 5);
        assert_eq!(outcome.unwrap().status.affected_rows, 3);
    }

    #[test]
    fn test_transaction_wrapped_failure_rolls_back() {
        let mut s = connected(MySqlConfig::new());
        let mut request = Request::new("INSERT INTO t VALUES (1)", 5);
        request.begin = true;
        request.end = Some(End::Commit);
        s.submit(request).unwrap();
        s.feed(&raw_frame(1, &ok_payload(0, 0, 0x0001)));
        s.advance();
        s.take_output();

        s.feed(&raw_frame(1, &err_payload(1062, "23000", "Duplicate entry '1'")));
        assert!(matches!(s.advance(), Progress::Idle));
        assert_eq!(s.take_output(), query_frame("ROLLBACK"));
        s.feed(&raw_frame(1, &ok_payload(0, 0, 0)));
        let err = expect_deliver(s.advance()).1.unwrap_err();
        assert!(matches!(&err, Error::Query(q) if q.kind == QueryErrorKind::Constraint));
    }

    #[test]
    fn test_start_transaction_failure_skips_statement() {
        let mut s = connected(MySqlConfig::new());
        let mut request = Request::new("SELECT 1", 5);
        request.begin = true;
        s.submit(request).unwrap();
        s.take_output();
        s.feed(&raw_frame(1, &err_payload(1399, "XAE07", "XA state")));
        let err = expect_deliver(s.advance()).1.unwrap_err();
        assert_eq!(err.sql(), Some("START TRANSACTION"));
        assert!(!s.has_output());
    }

    #[test]
    fn test_decode_error_keeps_stream_in_sync() {
        let mut s = connected(MySqlConfig::new());
        s.submit(Request::new("SELECT doc FROM t", 1)).unwrap();
        s.take_output();
        s.feed(&select_response("doc", FieldType::Json, &[Some("{bad"), Some("{}")]));
        let err = expect_deliver(s.advance()).1.unwrap_err();
        assert!(matches!(&err, Error::Type(t) if t.column.as_deref() == Some("doc")));
        assert_eq!(s.state(), State::Connected);

        s.submit(Request::new("SELECT 1", 2)).unwrap();
        assert_eq!(s.take_output(), query_frame("SELECT 1"));
    }

    #[test]
    fn test_records_with_table_prefix() {
        let mut s = connected(MySqlConfig::new().table_prefix(true));
        let mut request = Request::new("SELECT id FROM t", 1);
        request.format = RowFormat::Records;
        s.submit(request).unwrap();
        s.take_output();
        s.feed(&select_response("id", FieldType::Long, &[Some("10")]));
        let result = expect_deliver(s.advance()).1.unwrap();
        let rows = result.records().unwrap();
        assert_eq!(rows[0].get_by_name("t.id"), Some(&Value::Int(10)));
        assert_eq!(result.columns.unwrap(), vec!["t.id".to_string()]);
    }

    #[test]
    fn test_multiple_result_sets() {
        let mut s = connected(MySqlConfig::new());
        s.submit(Request::new("CALL p()", 1)).unwrap();
        s.take_output();
        let mut response = raw_frame(1, &[1]);
        response.extend(raw_frame(2, &column_payload("", "x", FieldType::LongLong, 63, 0)));
        response.extend(raw_frame(3, &eof_payload(0)));
        response.extend(raw_frame(4, &row_payload(&[Some("5")])));
        response.extend(raw_frame(5, &eof_payload(SERVER_MORE_RESULTS_EXISTS)));
        response.extend(raw_frame(6, &ok_payload(0, 0, 0)));
        s.feed(&response);
        let result = expect_deliver(s.advance()).1.unwrap();
        assert_eq!(result.scalar(), Some(&Value::Int(5)));
        assert_eq!(result.more.len(), 1);
        assert_eq!(result.more[0].row_count(), 0);
    }

    #[test]
    fn test_sequence_gap_is_fatal() {
        let mut s = connected(MySqlConfig::new());
        s.submit(Request::new("SELECT 1", 1)).unwrap();
        s.feed(&raw_frame(2, &ok_payload(0, 0, 0)));
        let Progress::Fatal(err) = s.advance() else {
            panic!("expected a fatal error");
        };
        assert!(matches!(err, Error::Protocol(ref p) if p.message.contains("out of sequence")));
        assert!(s.is_closed());
        // the pending request is handed back for a failure callback
        assert_eq!(s.close(), Some(1));
    }

    #[test]
    fn test_auth_switch_to_supported_plugin() {
        let mut s = session(MySqlConfig::new().user("u").password("pw"));
        s.feed(&raw_frame(0, &greeting_payload("caching_sha2_password", &SALT, 0)));
        s.advance();
        s.take_output();

        let new_salt = *b"ABCDEFGHIJKLMNOPQRST";
        let mut switch = vec![0xFE];
        switch.extend_from_slice(b"mysql_native_password\0");
        switch.extend_from_slice(&new_salt);
        switch.push(0);
        s.feed(&raw_frame(2, &switch));
        assert!(matches!(s.advance(), Progress::Idle));
        assert_eq!(s.take_output(), raw_frame(3, &auth::scramble("pw", &new_salt)));

        s.feed(&raw_frame(4, &ok_payload(0, 0, 0)));
        s.advance();
        assert_eq!(s.state(), State::Connected);
    }

    #[test]
    fn test_auth_switch_to_unknown_plugin_is_fatal() {
        let mut s = session(MySqlConfig::new().user("u").password("pw"));
        s.feed(&raw_frame(0, &greeting_payload("mysql_native_password", &SALT, 0)));
        s.advance();
        let mut switch = vec![0xFE];
        switch.extend_from_slice(b"sha256_password\0");
        switch.extend_from_slice(&SALT);
        s.feed(&raw_frame(2, &switch));
        let Progress::Fatal(err) = s.advance() else {
            panic!("expected a fatal error");
        };
        assert_eq!(
            err.to_string(),
            "Connection error: Authentication plugin 'sha256_password' not configured"
        );
    }

    #[test]
    fn test_access_denied_is_fatal() {
        let mut s = session(MySqlConfig::new().user("u").password("wrong"));
        s.feed(&raw_frame(0, &greeting_payload("mysql_native_password", &SALT, 0)));
        s.advance();
        s.feed(&raw_frame(2, &err_payload(1045, "28000", "Access denied for user 'u'")));
        let Progress::Fatal(err) = s.advance() else {
            panic!("expected a fatal error");
        };
        assert!(matches!(
            err,
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Authentication,
                ..
            })
        ));
    }

    #[test]
    fn test_caching_sha2_fast_path() {
        let mut s = session(MySqlConfig::new().user("u").password("pw"));
        s.feed(&raw_frame(0, &greeting_payload("caching_sha2_password", &SALT, 0)));
        s.advance();
        let out = s.take_output();
        assert!(out.ends_with(b"caching_sha2_password\0"));

        s.feed(&raw_frame(2, &[0x01, caching_sha2::FAST_AUTH_SUCCESS]));
        s.feed(&raw_frame(3, &ok_payload(0, 0, 0)));
        s.advance();
        assert_eq!(s.state(), State::Connected);
    }

    #[test]
    fn test_caching_sha2_full_auth_requests_public_key() {
        let mut s = session(MySqlConfig::new().user("u").password("pw"));
        s.feed(&raw_frame(0, &greeting_payload("caching_sha2_password", &SALT, 0)));
        s.advance();
        s.take_output();
        s.feed(&raw_frame(2, &[0x01, caching_sha2::PERFORM_FULL_AUTH]));
        assert!(matches!(s.advance(), Progress::Idle));
        assert_eq!(s.take_output(), raw_frame(3, &[caching_sha2::REQUEST_PUBLIC_KEY]));

        let mut key = vec![0x01];
        key.extend_from_slice(b"-----BEGIN PUBLIC KEY-----\nnot base64\n-----END PUBLIC KEY-----\n");
        s.feed(&raw_frame(4, &key));
        assert!(matches!(s.advance(), Progress::Fatal(Error::Connection(_))));
    }

    #[test]
    fn test_tls_upgrade_requires_server_support() {
        let mut s = session(MySqlConfig::new().tls(tidewire_net::ClientTls::new()));
        s.feed(&raw_frame(0, &greeting_payload("mysql_native_password", &SALT, 0)));
        let Progress::Fatal(err) = s.advance() else {
            panic!("expected a fatal error");
        };
        assert!(matches!(
            err,
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Ssl,
                ..
            })
        ));
    }

    #[test]
    fn test_quit() {
        let mut s = connected(MySqlConfig::new());
        s.quit();
        assert_eq!(s.take_output(), raw_frame(0, &[0x01]));
        assert!(s.is_closed());

        let mut s: Session<u8> = Session::new(Rc::new(MySqlContext::default()));
        s.quit();
        assert!(!s.has_output());
        assert!(s.is_closed());
    }

    #[test]
    fn test_query_error_kinds() {
        let err = |code, state: &str| ErrPacket {
            error_code: code,
            sql_state: state.to_string(),
            error_message: "x".to_string(),
        };
        let kind = |e: Error| match e {
            Error::Query(q) => q.kind,
            other => panic!("{other:?}"),
        };
        assert_eq!(kind(query_error(err(1213, "40001"), None)), QueryErrorKind::Deadlock);
        assert_eq!(kind(query_error(err(1146, "42S02"), None)), QueryErrorKind::NotFound);
        assert_eq!(kind(query_error(err(1142, "42000"), None)), QueryErrorKind::Permission);
        assert_eq!(kind(query_error(err(1452, "23000"), None)), QueryErrorKind::Constraint);
        assert_eq!(kind(query_error(err(1317, "70100"), None)), QueryErrorKind::Database);
    }
}
