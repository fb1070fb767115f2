//! Per-connection query surface with nested transactions.
//!
//! A connection runs one statement at a time. [`Cursor::execute`] while a
//! statement is outstanding fails with a `Busy` usage error instead of
//! queueing, so the next statement is normally issued from the previous
//! one's callback.
//!
//! Transactions nest by counting: only the outermost
//! [`start_transaction`](Cursor::start_transaction) sends
//! `START TRANSACTION` and only the matching outermost
//! [`commit`](Cursor::commit) or [`rollback`](Cursor::rollback) ends it.
//! Inner calls complete immediately without touching the wire. An inner
//! rollback marks the whole transaction rollback-only.
//!
//! ```rust,ignore
//! MySqlClient::with_cursor(&mut network, id, |cursor| {
//!     cursor.start_transaction(|cursor, started| {
//!         if started.is_err() {
//!             return;
//!         }
//!         let sql = "INSERT INTO t (a) VALUES (?)";
//!         let _ = cursor.execute(sql, vec![Value::Int(1)], |cursor, inserted| {
//!             let _ = match inserted {
//!                 Ok(_) => cursor.commit(|_, _| {}),
//!                 Err(_) => cursor.rollback(|_, _| {}),
//!             };
//!         });
//!     })
//! });
//! ```

use tidewire_core::error::{TransactionError, TransactionErrorKind, UsageErrorKind};
use tidewire_core::{Error, Result};
use tidewire_net::Conn;

use crate::client::{Callback, MySqlClient};
use crate::escape::{Params, interpolate};
use crate::session::{End, QueryResult, Request, RowFormat, usage_error};

/// Per-statement options for [`Cursor::execute_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Send START TRANSACTION before the statement
    pub start_transaction: bool,
    /// COMMIT after the statement (ROLLBACK if it failed)
    pub commit: bool,
    pub format: RowFormat,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_transaction(mut self, enabled: bool) -> Self {
        self.start_transaction = enabled;
        self
    }

    pub fn commit(mut self, enabled: bool) -> Self {
        self.commit = enabled;
        self
    }

    /// Materialize rows as named records.
    pub fn records(mut self) -> Self {
        self.format = RowFormat::Records;
        self
    }
}

/// Handle for issuing statements on one connection.
///
/// Obtained from [`MySqlClient::with_cursor`] or passed to callbacks.
pub struct Cursor<'a> {
    client: &'a mut MySqlClient,
    conn: Conn<'a>,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(client: &'a mut MySqlClient, conn: Conn<'a>) -> Self {
        Self { client, conn }
    }

    /// Run `sql` with `params` substituted; rows come back as tuples.
    ///
    /// Fails synchronously only for misuse (busy or closed connection).
    /// Everything else, including a parameter that cannot be rendered or
    /// text the connection character set cannot carry, reaches `callback`.
    pub fn execute<F>(&mut self, sql: &str, params: impl Into<Params>, callback: F) -> Result<()>
    where
        F: FnOnce(&mut Cursor<'_>, Result<QueryResult>) + 'static,
    {
        self.execute_with(sql, params, ExecuteOptions::default(), callback)
    }

    /// [`execute`](Self::execute), with rows as named records.
    pub fn select<F>(&mut self, sql: &str, params: impl Into<Params>, callback: F) -> Result<()>
    where
        F: FnOnce(&mut Cursor<'_>, Result<QueryResult>) + 'static,
    {
        self.execute_with(sql, params, ExecuteOptions::new().records(), callback)
    }

    /// Run `sql`, optionally inside its own transaction.
    ///
    /// The transaction options are ignored in autocommit mode, with
    /// transaction control disabled, and inside a cursor transaction.
    pub fn execute_with<F>(
        &mut self,
        sql: &str,
        params: impl Into<Params>,
        options: ExecuteOptions,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut Cursor<'_>, Result<QueryResult>) + 'static,
    {
        self.ensure_idle()?;
        let params = params.into();
        self.client.statement = Some(sql.to_string());
        let session = &self.client.session;
        let executed = match interpolate(sql, &params, session.no_backslash_escapes())
            .and_then(|executed| session.check_encodable(&executed).map(|()| executed))
        {
            Ok(executed) => executed,
            Err(e) => {
                tracing::debug!(error = %e, "statement rejected before sending");
                self.client.executed = None;
                callback(self, Err(e));
                return Ok(());
            }
        };
        self.client.executed = Some(executed.clone());

        let config = &self.client.session.context().config;
        let wrap = !config.autocommit && config.commit_enabled && self.client.depth == 0;
        let mut request = Request::new(executed, Box::new(callback) as Callback);
        request.format = options.format;
        if wrap {
            request.begin = options.start_transaction;
            request.end = options.commit.then_some(End::Commit);
        }
        self.submit(request)
    }

    /// Open a transaction, or join the one already open.
    pub fn start_transaction<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnOnce(&mut Cursor<'_>, Result<QueryResult>) + 'static,
    {
        self.ensure_idle()?;
        self.client.depth += 1;
        if self.client.depth > 1 {
            tracing::trace!(depth = self.client.depth, "joined open transaction");
            return self.complete_now(callback);
        }
        self.client.rollback_only = false;
        self.control("START TRANSACTION", move |cursor, outcome| {
            if outcome.is_err() {
                cursor.client.depth = 0;
            }
            callback(cursor, outcome);
        })
    }

    /// Leave a transaction level; the outermost one sends COMMIT.
    ///
    /// If a nested level rolled back, ROLLBACK is sent instead and the
    /// callback gets a `RolledBack` transaction error.
    pub fn commit<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnOnce(&mut Cursor<'_>, Result<QueryResult>) + 'static,
    {
        self.ensure_idle()?;
        match self.client.depth {
            0 => return Err(no_transaction("commit")),
            1 => {}
            _ => {
                self.client.depth -= 1;
                return self.complete_now(callback);
            }
        }
        self.client.depth = 0;
        if std::mem::take(&mut self.client.rollback_only) {
            return self.control("ROLLBACK", move |cursor, outcome| {
                let outcome = outcome.and_then(|_| {
                    Err(Error::Transaction(TransactionError {
                        kind: TransactionErrorKind::RolledBack,
                        message: "transaction rolled back by a nested rollback".to_string(),
                    }))
                });
                callback(cursor, outcome);
            });
        }
        self.control("COMMIT", callback)
    }

    /// Leave a transaction level; the outermost one sends ROLLBACK.
    pub fn rollback<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnOnce(&mut Cursor<'_>, Result<QueryResult>) + 'static,
    {
        self.ensure_idle()?;
        match self.client.depth {
            0 => return Err(no_transaction("rollback")),
            1 => {}
            _ => {
                self.client.depth -= 1;
                self.client.rollback_only = true;
                return self.complete_now(callback);
            }
        }
        self.client.depth = 0;
        self.client.rollback_only = false;
        self.control("ROLLBACK", callback)
    }

    /// Insert id reported by the last successful statement.
    pub fn lastrowid(&self) -> u64 {
        self.client.session.last_status().last_insert_id
    }

    pub fn rows_affected(&self) -> u64 {
        self.client.session.last_status().affected_rows
    }

    /// Most recent statement as passed in, before substitution.
    pub fn statement(&self) -> Option<&str> {
        self.client.statement.as_deref()
    }

    /// Most recent statement as sent to the server.
    pub fn executed_statement(&self) -> Option<&str> {
        self.client.executed.as_deref()
    }

    pub fn transaction_depth(&self) -> usize {
        self.client.depth
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_open() && !self.client.session.is_closed()
    }

    /// A statement is outstanding.
    pub fn is_busy(&self) -> bool {
        self.client.session.is_busy()
    }

    pub fn client(&self) -> &MySqlClient {
        &*self.client
    }

    /// Send COM_QUIT and close the connection.
    ///
    /// An outstanding statement's callback gets a disconnect error.
    pub fn close(&mut self) {
        self.client.session.quit();
        self.client.flush(&mut self.conn);
        self.conn.close(Some("closed by client"));
    }

    fn ensure_idle(&self) -> Result<()> {
        if !self.is_open() {
            return Err(usage_error(UsageErrorKind::Closed, "connection is closed"));
        }
        if self.is_busy() {
            return Err(usage_error(
                UsageErrorKind::Busy,
                "a statement is already in progress on this connection",
            ));
        }
        Ok(())
    }

    /// Send a transaction control statement, unless control is disabled.
    fn control<F>(&mut self, sql: &str, callback: F) -> Result<()>
    where
        F: FnOnce(&mut Cursor<'_>, Result<QueryResult>) + 'static,
    {
        if !self.client.session.context().config.commit_enabled {
            tracing::trace!(sql, "transaction control disabled");
            return self.complete_now(callback);
        }
        self.client.statement = Some(sql.to_string());
        self.client.executed = Some(sql.to_string());
        self.submit(Request::new(sql, Box::new(callback) as Callback))
    }

    fn complete_now<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnOnce(&mut Cursor<'_>, Result<QueryResult>) + 'static,
    {
        callback(self, Ok(QueryResult::empty(RowFormat::Tuples)));
        Ok(())
    }

    fn submit(&mut self, request: Request<Callback>) -> Result<()> {
        self.client.session.submit(request)?;
        self.client.flush(&mut self.conn);
        Ok(())
    }
}

fn no_transaction(operation: &str) -> Error {
    usage_error(
        UsageErrorKind::NoTransaction,
        &format!("{} without a matching start_transaction", operation),
    )
}
