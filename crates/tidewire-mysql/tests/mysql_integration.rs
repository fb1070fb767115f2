//! Protocol scenarios against a scripted MySQL server running on the same
//! reactor, plus a live-server check gated on `TIDEWIRE_TEST_MYSQL_URL`.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tidewire_core::error::{TransactionErrorKind, UsageErrorKind};
use tidewire_core::{Error, Result, Value};
use tidewire_mysql::protocol::PacketWriter;
use tidewire_mysql::{
    ExecuteOptions, FieldType, MySqlClient, MySqlConfig, MySqlContext, Params, QueryResult,
};
use tidewire_net::{ClientTls, Conn, ConnectionId, Handler, Network, ServerTls};

const MYSQL_URL_ENV: &str = "TIDEWIRE_TEST_MYSQL_URL";

const TLS_DATA: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../tidewire-net/tests/data");

/// CLIENT_SSL capability bit.
const CLIENT_SSL: u32 = 0x0800;
/// Header plus the 32-byte SSL request.
const SSL_REQUEST_LEN: usize = 36;

// ---- scripted server ----

/// SQL statements the scripted server received, in order.
type Log = Rc<RefCell<Vec<String>>>;

/// Speaks just enough MySQL to log in one client and answer a few
/// statements:
/// - `SELECT 1` returns one BIGINT row
/// - statements starting with `SELEC ` fail with a syntax error
/// - `HANG UP` closes the connection without answering
/// - anything else succeeds with 1 affected row and insert id 7
///
/// With `tls` set it offers CLIENT_SSL and upgrades when the client sends
/// an SSL request.
struct ScriptedServer {
    log: Log,
    buffer: Vec<u8>,
    logged_in: bool,
    greeted: bool,
    tls: Option<ServerTls>,
    upgrades: Rc<RefCell<usize>>,
}

impl ScriptedServer {
    fn reply(conn: &mut Conn<'_>, first_seq: u8, payloads: &[Vec<u8>]) {
        let mut out = Vec::new();
        for (i, payload) in payloads.iter().enumerate() {
            let len = u32::try_from(payload.len()).unwrap().to_le_bytes();
            out.extend_from_slice(&len[..3]);
            out.push(first_seq.wrapping_add(u8::try_from(i).unwrap()));
            out.extend_from_slice(payload);
        }
        conn.send(&out);
    }

    fn on_packet(&mut self, conn: &mut Conn<'_>, seq: u8, payload: &[u8]) {
        if !self.logged_in && payload.len() == 32 && !conn.is_tls() {
            let caps = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
            match &self.tls {
                Some(tls) if caps & CLIENT_SSL != 0 => {
                    conn.accept_tls(tls).unwrap();
                    conn.set_recv_len(16 * 1024);
                    *self.upgrades.borrow_mut() += 1;
                }
                _ => conn.close(Some("unexpected SSL request")),
            }
            return;
        }
        if !self.logged_in {
            self.logged_in = true;
            Self::reply(conn, seq + 1, &[ok_payload(0, 0)]);
            return;
        }
        match payload.first() {
            Some(0x01) => conn.close(Some("quit")),
            Some(0x03) => {
                let sql = String::from_utf8_lossy(&payload[1..]).into_owned();
                self.log.borrow_mut().push(sql.clone());
                if sql == "HANG UP" {
                    conn.close(Some("hang up"));
                } else if sql == "SELECT 1" {
                    Self::reply(
                        conn,
                        seq + 1,
                        &[
                            vec![1],
                            column_payload("1", FieldType::LongLong),
                            eof_payload(),
                            lenenc_row(&["1"]),
                            eof_payload(),
                        ],
                    );
                } else if sql.starts_with("SELEC ") {
                    Self::reply(
                        conn,
                        seq + 1,
                        &[err_payload(
                            1064,
                            "42000",
                            "You have an error in your SQL syntax",
                        )],
                    );
                } else {
                    Self::reply(conn, seq + 1, &[ok_payload(1, 7)]);
                }
            }
            _ => conn.close(Some("unexpected command")),
        }
    }
}

impl Handler for ScriptedServer {
    fn on_open(&mut self, conn: &mut Conn<'_>) {
        if self.tls.is_some() {
            // the ClientHello follows the SSL request without waiting
            conn.set_recv_len(SSL_REQUEST_LEN);
        }
    }

    fn on_ready(&mut self, conn: &mut Conn<'_>) {
        // fires again once TLS is up
        if self.greeted {
            return;
        }
        self.greeted = true;
        Self::reply(conn, 0, &[greeting_payload(self.tls.is_some())]);
    }

    fn on_data(&mut self, conn: &mut Conn<'_>, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        while self.buffer.len() >= 4 {
            let len = usize::from(self.buffer[0])
                | usize::from(self.buffer[1]) << 8
                | usize::from(self.buffer[2]) << 16;
            if self.buffer.len() < 4 + len {
                break;
            }
            let seq = self.buffer[3];
            let payload: Vec<u8> = self.buffer.drain(..4 + len).skip(4).collect();
            self.on_packet(conn, seq, &payload);
        }
    }
}

fn greeting_payload(offer_tls: bool) -> Vec<u8> {
    // protocol 41, secure connection, plugin auth, transactions
    let mut caps: u32 = 0xF7FF | (0x81FF << 16);
    if offer_tls {
        caps |= CLIENT_SSL;
    }
    let salt: Vec<u8> = (1..=20).collect();
    let mut w = PacketWriter::new();
    w.write_u8(10);
    w.write_null_string("8.0.36-scripted");
    w.write_u32_le(7);
    w.write_bytes(&salt[..8]);
    w.write_u8(0);
    w.write_u16_le((caps & 0xFFFF) as u16);
    w.write_u8(255);
    // autocommit off, so no SET AUTOCOMMIT is needed
    w.write_u16_le(0);
    w.write_u16_le((caps >> 16) as u16);
    w.write_u8(21);
    w.write_zeros(10);
    w.write_bytes(&salt[8..]);
    w.write_u8(0);
    w.write_null_string("mysql_native_password");
    w.into_bytes()
}

fn ok_payload(affected: u64, insert_id: u64) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0x00);
    w.write_lenenc_int(affected);
    w.write_lenenc_int(insert_id);
    w.write_u16_le(0);
    w.write_u16_le(0);
    w.into_bytes()
}

fn eof_payload() -> Vec<u8> {
    vec![0xFE, 0, 0, 0, 0]
}

fn err_payload(code: u16, sqlstate: &str, message: &str) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0xFF);
    w.write_u16_le(code);
    w.write_u8(b'#');
    w.write_bytes(sqlstate.as_bytes());
    w.write_bytes(message.as_bytes());
    w.into_bytes()
}

fn column_payload(name: &str, field_type: FieldType) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_lenenc_string("def");
    w.write_lenenc_string("");
    w.write_lenenc_string("");
    w.write_lenenc_string("");
    w.write_lenenc_string(name);
    w.write_lenenc_string("");
    w.write_lenenc_int(0x0c);
    w.write_u16_le(63);
    w.write_u32_le(20);
    w.write_u8(field_type as u8);
    w.write_u16_le(0);
    w.write_u8(0);
    w.write_zeros(2);
    w.into_bytes()
}

fn lenenc_row(values: &[&str]) -> Vec<u8> {
    let mut w = PacketWriter::new();
    for value in values {
        w.write_lenenc_string(value);
    }
    w.into_bytes()
}

// ---- harness ----

type Outcome = Rc<RefCell<Option<Result<QueryResult>>>>;

struct Harness {
    network: Network,
    log: Log,
    upgrades: Rc<RefCell<usize>>,
    id: ConnectionId,
}

impl Harness {
    fn start(context: MySqlContext) -> Self {
        Self::start_with(context, None)
    }

    fn start_with(context: MySqlContext, server_tls: Option<ServerTls>) -> Self {
        let mut network = Network::new().unwrap();
        let log = Log::default();
        let upgrades: Rc<RefCell<usize>> = Rc::default();
        let server_log = Rc::clone(&log);
        let server_upgrades = Rc::clone(&upgrades);
        let listener = network
            .add_server(
                0,
                move || ScriptedServer {
                    log: Rc::clone(&server_log),
                    buffer: Vec::new(),
                    logged_in: false,
                    greeted: false,
                    tls: server_tls.clone(),
                    upgrades: Rc::clone(&server_upgrades),
                },
                None,
            )
            .unwrap();
        let context = MySqlContext {
            config: context.config.host("127.0.0.1").port(listener.port()),
            ..context
        };
        let id = MySqlClient::connect(&mut network, Rc::new(context)).unwrap();
        Self {
            network,
            log,
            upgrades,
            id,
        }
    }

    fn new() -> Self {
        Self::start(MySqlContext::new(MySqlConfig::new().user("app").password("secret")))
    }

    fn run_until(&mut self, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for reactor");
            self.network.service(Duration::from_millis(10), 100).unwrap();
        }
    }

    /// Run `f` with a cursor, then service until `outcome` is filled.
    fn run<R>(
        &mut self,
        outcome: &Outcome,
        f: impl FnOnce(&mut tidewire_mysql::Cursor<'_>) -> R,
    ) -> R {
        let result = MySqlClient::with_cursor(&mut self.network, self.id, f)
            .expect("client connection is open");
        self.run_until(|| outcome.borrow().is_some());
        result
    }

    fn sql_log(&self) -> Vec<String> {
        self.log.borrow().clone()
    }
}

fn sink(outcome: &Outcome) -> impl FnOnce(&mut tidewire_mysql::Cursor<'_>, Result<QueryResult>) + 'static {
    let outcome = Rc::clone(outcome);
    move |_, result| {
        *outcome.borrow_mut() = Some(result);
    }
}

fn take(outcome: &Outcome) -> Result<QueryResult> {
    outcome.borrow_mut().take().expect("callback fired")
}

// ---- scenarios ----

#[test]
fn test_select_one() {
    let mut harness = Harness::new();
    let outcome = Outcome::default();

    // issued before the greeting arrives; held until login completes
    harness
        .run(&outcome, |cursor| cursor.execute("SELECT 1", Params::None, sink(&outcome)))
        .unwrap();

    let result = take(&outcome).unwrap();
    assert_eq!(result.tuples().unwrap(), &[vec![Value::Int(1)]]);
    assert_eq!(result.columns.as_deref(), Some(&["1".to_string()][..]));
    assert_eq!(harness.sql_log(), vec!["SELECT 1"]);
}

#[test]
fn test_select_records() {
    let mut harness = Harness::new();
    let outcome = Outcome::default();

    harness
        .run(&outcome, |cursor| cursor.select("SELECT 1", Params::None, sink(&outcome)))
        .unwrap();

    let result = take(&outcome).unwrap();
    let rows = result.records().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_by_name("1"), Some(&Value::Int(1)));
}

#[test]
fn test_syntax_error_then_recovery() {
    let mut harness = Harness::new();
    let failure: Rc<RefCell<Option<Error>>> = Rc::default();
    let outcome = Outcome::default();

    let seen = Rc::clone(&failure);
    let next = sink(&outcome);
    harness
        .run(&outcome, move |cursor| {
            cursor.execute("SELEC 1", Params::None, move |cursor, result| {
                *seen.borrow_mut() = result.err();
                cursor.execute("SELECT 1", Params::None, next).unwrap();
            })
        })
        .unwrap();

    let err = failure.borrow_mut().take().expect("syntax error reported");
    assert_eq!(err.error_code(), Some(1064));
    assert_eq!(err.sqlstate(), Some("42000"));
    assert_eq!(err.sql(), Some("SELEC 1"));
    assert!(!err.to_string().is_empty());
    assert!(!err.is_connection_error());

    assert_eq!(take(&outcome).unwrap().scalar(), Some(&Value::Int(1)));
    assert_eq!(harness.sql_log(), vec!["SELEC 1", "SELECT 1"]);
}

#[test]
fn test_execute_while_busy_is_rejected() {
    let mut harness = Harness::new();
    let outcome = Outcome::default();

    let second = harness.run(&outcome, |cursor| {
        cursor.execute("SELECT 1", Params::None, sink(&outcome)).unwrap();
        assert!(cursor.is_busy());
        cursor.execute("SELECT 1", Params::None, |_, _| panic!("must not run"))
    });

    assert!(second.unwrap_err().is_usage(UsageErrorKind::Busy));
    assert!(take(&outcome).is_ok());
    assert_eq!(harness.sql_log(), vec!["SELECT 1"]);
}

#[test]
fn test_nested_transactions_hit_the_wire_once() {
    let mut harness = Harness::new();
    let outcome = Outcome::default();
    let depths: Rc<RefCell<Vec<usize>>> = Rc::default();

    let done = sink(&outcome);
    let d = Rc::clone(&depths);
    harness
        .run(&outcome, move |cursor| {
            cursor.start_transaction(move |cursor, started| {
                started.unwrap();
                d.borrow_mut().push(cursor.transaction_depth());
                cursor
                    .start_transaction(move |cursor, joined| {
                        joined.unwrap();
                        d.borrow_mut().push(cursor.transaction_depth());
                        cursor
                            .commit(move |cursor, inner| {
                                inner.unwrap();
                                d.borrow_mut().push(cursor.transaction_depth());
                                cursor.commit(done).unwrap();
                            })
                            .unwrap();
                    })
                    .unwrap();
            })
        })
        .unwrap();

    assert!(take(&outcome).is_ok());
    assert_eq!(*depths.borrow(), vec![1, 2, 1]);
    assert_eq!(harness.sql_log(), vec!["START TRANSACTION", "COMMIT"]);
}

#[test]
fn test_nested_rollback_rolls_back_outer_commit() {
    let mut harness = Harness::new();
    let outcome = Outcome::default();

    let done = sink(&outcome);
    harness
        .run(&outcome, move |cursor| {
            cursor.start_transaction(move |cursor, _| {
                cursor
                    .start_transaction(move |cursor, _| {
                        cursor
                            .rollback(move |cursor, _| cursor.commit(done).unwrap())
                            .unwrap();
                    })
                    .unwrap();
            })
        })
        .unwrap();

    let err = take(&outcome).unwrap_err();
    assert!(matches!(
        err,
        Error::Transaction(ref e) if e.kind == TransactionErrorKind::RolledBack
    ));
    assert_eq!(harness.sql_log(), vec!["START TRANSACTION", "ROLLBACK"]);
}

#[test]
fn test_commit_without_transaction() {
    let mut harness = Harness::new();
    let err = MySqlClient::with_cursor(&mut harness.network, harness.id, |cursor| {
        cursor.commit(|_, _| panic!("must not run"))
    })
    .unwrap()
    .unwrap_err();
    assert!(err.is_usage(UsageErrorKind::NoTransaction));
}

#[test]
fn test_execute_with_own_transaction() {
    let mut harness = Harness::new();
    let outcome = Outcome::default();
    let options = ExecuteOptions::new().start_transaction(true).commit(true);

    let params = Params::positional(["O'Brien"]);
    harness
        .run(&outcome, |cursor| {
            cursor.execute_with("INSERT INTO people (name) VALUES (?)", params, options, sink(&outcome))
        })
        .unwrap();

    let result = take(&outcome).unwrap();
    assert_eq!(result.status.affected_rows, 1);
    assert_eq!(
        harness.sql_log(),
        vec![
            "START TRANSACTION",
            r"INSERT INTO people (name) VALUES ('O\'Brien')",
            "COMMIT",
        ]
    );

    let (lastrowid, affected, statement, executed) =
        MySqlClient::with_cursor(&mut harness.network, harness.id, |cursor| {
            (
                cursor.lastrowid(),
                cursor.rows_affected(),
                cursor.statement().map(str::to_string),
                cursor.executed_statement().map(str::to_string),
            )
        })
        .unwrap();
    assert_eq!(lastrowid, 7);
    assert_eq!(affected, 1);
    assert_eq!(statement.as_deref(), Some("INSERT INTO people (name) VALUES (?)"));
    assert_eq!(
        executed.as_deref(),
        Some(r"INSERT INTO people (name) VALUES ('O\'Brien')")
    );
}

#[test]
fn test_bad_parameter_reaches_callback() {
    let mut harness = Harness::new();
    let outcome = Outcome::default();

    harness
        .run(&outcome, |cursor| {
            cursor.execute("SELECT ?", Params::positional([f64::NAN]), sink(&outcome))
        })
        .unwrap();

    assert!(matches!(take(&outcome), Err(Error::Type(_))));
    assert!(harness.sql_log().is_empty());
}

#[test]
fn test_server_hang_up_fails_pending_statement() {
    let mut harness = Harness::new();
    let outcome = Outcome::default();

    harness
        .run(&outcome, |cursor| cursor.execute("HANG UP", Params::None, sink(&outcome)))
        .unwrap();

    let err = take(&outcome).unwrap_err();
    assert!(err.is_connection_error());
    assert!(!harness.network.is_open(harness.id));
}

#[test]
fn test_cursor_close_fails_pending_statement_once() {
    let mut harness = Harness::new();
    let outcome = Outcome::default();
    let calls = Rc::new(RefCell::new(0));

    let count = Rc::clone(&calls);
    let done = sink(&outcome);
    harness.run(&outcome, move |cursor| {
        cursor
            .execute("SELECT 1", Params::None, move |cursor, result| {
                *count.borrow_mut() += 1;
                done(cursor, result);
            })
            .unwrap();
        cursor.close();
    });

    assert!(take(&outcome).unwrap_err().is_connection_error());
    assert_eq!(*calls.borrow(), 1);
    assert!(!harness.network.is_open(harness.id));
}

#[test]
fn test_sql_and_fsm_trace_hooks() {
    let sql_seen: Log = Log::default();
    let states: Log = Log::default();
    let sql_sink = Rc::clone(&sql_seen);
    let state_sink = Rc::clone(&states);
    let context = MySqlContext::new(MySqlConfig::new().user("app"))
        .sql_trace(move |sql| sql_sink.borrow_mut().push(sql.to_string()))
        .fsm_trace(move |state, _, _, _| state_sink.borrow_mut().push(state.to_string()));
    let mut harness = Harness::start(context);
    let outcome = Outcome::default();

    harness
        .run(&outcome, |cursor| cursor.execute("SELECT 1", Params::None, sink(&outcome)))
        .unwrap();

    assert!(take(&outcome).is_ok());
    assert_eq!(*sql_seen.borrow(), vec!["SELECT 1"]);
    let states = states.borrow();
    assert!(states.contains(&"authenticate".to_string()));
    assert!(states.contains(&"query_rows".to_string()));
    assert_eq!(states.last().map(String::as_str), Some("connected"));
}

#[test]
fn test_in_band_tls_upgrade() {
    let states: Log = Log::default();
    let state_sink = Rc::clone(&states);
    let client_tls = ClientTls::new()
        .ca_cert(format!("{TLS_DATA}/ca.pem"))
        .server_name("localhost");
    let context = MySqlContext::new(MySqlConfig::new().user("app").password("secret").tls(client_tls))
        .fsm_trace(move |state, _, _, _| state_sink.borrow_mut().push(state.to_string()));
    let server_tls = ServerTls::new(
        format!("{TLS_DATA}/server.pem"),
        format!("{TLS_DATA}/server-key.pem"),
    );
    let mut harness = Harness::start_with(context, Some(server_tls));
    let outcome = Outcome::default();

    harness
        .run(&outcome, |cursor| cursor.execute("SELECT 1", Params::None, sink(&outcome)))
        .unwrap();

    assert_eq!(take(&outcome).unwrap().scalar(), Some(&Value::Int(1)));
    assert_eq!(*harness.upgrades.borrow(), 1);
    // the statement reached the server through the TLS session
    assert_eq!(harness.sql_log(), vec!["SELECT 1"]);
    let (conn_tls, session_tls) =
        harness
            .network
            .with_handler::<MySqlClient, _, _>(harness.id, |client, conn| {
                (conn.is_tls(), client.session().is_tls())
            })
            .unwrap();
    assert!(conn_tls);
    assert!(session_tls);

    let states = states.borrow();
    let tls_at = states.iter().position(|s| s == "tls").expect("entered tls");
    let auth_at = states
        .iter()
        .position(|s| s == "authenticate")
        .expect("entered authenticate");
    assert!(tls_at < auth_at);
}

#[test]
fn test_tls_required_but_not_offered() {
    let context = MySqlContext::new(
        MySqlConfig::new()
            .user("app")
            .tls(ClientTls::new().skip_verify(true)),
    );
    let mut harness = Harness::start(context);
    let outcome = Outcome::default();

    harness
        .run(&outcome, |cursor| cursor.execute("SELECT 1", Params::None, sink(&outcome)))
        .unwrap();

    let err = take(&outcome).unwrap_err();
    assert!(err.is_connection_error());
    assert!(err.to_string().contains("SSL"));
    assert_eq!(*harness.upgrades.borrow(), 0);
    assert!(harness.sql_log().is_empty());
}

// ---- live server ----

fn unique_suffix() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_nanos()
}

#[test]
fn mysql_live_round_trip() {
    let Some(url) = std::env::var(MYSQL_URL_ENV).ok().filter(|u| !u.is_empty()) else {
        eprintln!("skipping live MySQL test: set {MYSQL_URL_ENV}");
        return;
    };
    let config = MySqlConfig::from_url(&url).expect("valid MySQL URL");
    if config.database.is_none() {
        eprintln!("skipping live MySQL test: {MYSQL_URL_ENV} must include a database name");
        return;
    }

    let mut network = Network::new().unwrap();
    let id = MySqlClient::connect(&mut network, Rc::new(MySqlContext::new(config))).unwrap();
    let outcome = Outcome::default();
    let table = format!("tidewire_live_{}", unique_suffix());
    let create = format!("CREATE TABLE `{table}` (id BIGINT AUTO_INCREMENT PRIMARY KEY, name TEXT)");
    let insert = format!("INSERT INTO `{table}` (name) VALUES (%s)");
    let select = format!("SELECT id, name FROM `{table}`");
    let drop = format!("DROP TABLE `{table}`");

    let done = sink(&outcome);
    MySqlClient::with_cursor(&mut network, id, move |cursor| {
        cursor.execute(&create, Params::None, move |cursor, created| {
            created.unwrap();
            let options = ExecuteOptions::new().start_transaction(true).commit(true);
            let params = Params::positional(["Alice"]);
            cursor
                .execute_with(&insert, params, options, move |cursor, inserted| {
                    inserted.unwrap();
                    assert!(cursor.lastrowid() > 0);
                    cursor
                        .select(&select, Params::None, move |cursor, rows| {
                            let rows = rows.unwrap();
                            assert_eq!(rows.row_count(), 1);
                            let row = &rows.records().unwrap()[0];
                            assert_eq!(row.get_by_name("name"), Some(&Value::Text("Alice".into())));
                            cursor.execute(&drop, Params::None, done).unwrap();
                        })
                        .unwrap();
                })
                .unwrap();
        })
    })
    .unwrap()
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while outcome.borrow().is_none() {
        assert!(Instant::now() < deadline, "timed out waiting for MySQL");
        network.service(Duration::from_millis(10), 100).unwrap();
    }
    take(&outcome).unwrap();
    network.close();
}
