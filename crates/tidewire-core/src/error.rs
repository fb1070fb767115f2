//! Error types for tidewire operations.
//!
//! Errors fall into four groups with different propagation rules:
//!
//! - transport ([`Error::Connection`], [`Error::Io`]) and framing
//!   ([`Error::Protocol`]) errors are terminal for the connection and surface
//!   through the close path;
//! - server-reported ([`Error::Query`]) and conversion ([`Error::Type`],
//!   [`Error::Transaction`]) errors are delivered to the pending completion
//!   and leave the connection usable;
//! - misuse ([`Error::Usage`]) is returned synchronously to the caller.

use std::fmt;

/// The primary error type for reactor and protocol operations.
#[derive(Debug)]
pub enum Error {
    /// Transport errors (connect, bind, TLS, peer reset)
    Connection(ConnectionError),
    /// Errors reported by the server for a statement
    Query(QueryError),
    /// Value conversion errors while escaping or decoding
    Type(TypeError),
    /// Transaction outcome errors
    Transaction(TransactionError),
    /// Wire-level protocol errors
    Protocol(ProtocolError),
    /// Configuration errors
    Config(ConfigError),
    /// API misuse detected before anything reached the wire
    Usage(UsageError),
    /// I/O errors
    Io(std::io::Error),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Failed to bind a listening socket
    Bind,
    /// Authentication failed
    Authentication,
    /// Connection closed while an operation was outstanding
    Disconnected,
    /// TLS negotiation failed
    Ssl,
    /// DNS resolution failed
    DnsResolution,
    /// Connection refused
    Refused,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub code: Option<u16>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Deadlock or lock wait timeout
    Deadlock,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// The transaction was rolled back instead of committed
    RolledBack,
    /// The wrapped statement failed and the transaction was rolled back
    StatementFailed,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct UsageError {
    pub kind: UsageErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageErrorKind {
    /// A statement is already outstanding on this connection
    Busy,
    /// Commit or rollback without a matching start
    NoTransaction,
    /// The connection is already closed
    Closed,
}

impl Error {
    /// Is this an error that ended (or will end) the connection?
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Protocol(_) | Error::Io(_)
        )
    }

    /// Is this a synchronous misuse error of the given kind?
    pub fn is_usage(&self, kind: UsageErrorKind) -> bool {
        matches!(self, Error::Usage(u) if u.kind == kind)
    }

    /// Get SQLSTATE if available (e.g., "42000" for a syntax error)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the server error code if available (e.g., 1064)
    pub fn error_code(&self) -> Option<u16> {
        match self {
            Error::Query(q) => q.code,
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl QueryError {
    /// Is this a duplicate key violation?
    pub fn is_duplicate_key(&self) -> bool {
        self.code == Some(1062)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Usage(e) => write!(f, "Usage error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Protocol(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code, &self.sqlstate) {
            (Some(code), Some(sqlstate)) => {
                write!(f, "{} ({}, SQLSTATE {})", self.message, code, sqlstate)
            }
            (Some(code), None) => write!(f, "{} ({})", self.message, code),
            _ => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<UsageError> for Error {
    fn from(err: UsageError) -> Self {
        Error::Usage(err)
    }
}

/// Result type alias for tidewire operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_accessors() {
        let err = Error::Query(QueryError {
            kind: QueryErrorKind::Syntax,
            sql: Some("SELEC 1".to_string()),
            sqlstate: Some("42000".to_string()),
            code: Some(1064),
            message: "You have an error in your SQL syntax".to_string(),
        });

        assert_eq!(err.sqlstate(), Some("42000"));
        assert_eq!(err.error_code(), Some(1064));
        assert_eq!(err.sql(), Some("SELEC 1"));
        assert!(!err.is_connection_error());
        assert_eq!(
            err.to_string(),
            "Query error (SQLSTATE 42000): You have an error in your SQL syntax"
        );
    }

    #[test]
    fn test_connection_flags() {
        let lost = Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            message: "remote close".to_string(),
            source: None,
        });
        assert!(lost.is_connection_error());

        let framing = Error::Protocol(ProtocolError {
            message: "Packet number out of sequence (3 != 4)".to_string(),
            raw_data: None,
            source: None,
        });
        assert!(framing.is_connection_error());
    }

    #[test]
    fn test_usage_kind() {
        let busy = Error::Usage(UsageError {
            kind: UsageErrorKind::Busy,
            message: "statement already in progress".to_string(),
        });
        assert!(busy.is_usage(UsageErrorKind::Busy));
        assert!(!busy.is_usage(UsageErrorKind::NoTransaction));
        assert_eq!(busy.to_string(), "Usage error: statement already in progress");
    }

    #[test]
    fn test_duplicate_key() {
        let dup = QueryError {
            kind: QueryErrorKind::Constraint,
            sql: None,
            sqlstate: Some("23000".to_string()),
            code: Some(1062),
            message: "Duplicate entry '1' for key 'PRIMARY'".to_string(),
        };
        assert!(dup.is_duplicate_key());
        assert_eq!(
            dup.to_string(),
            "Duplicate entry '1' for key 'PRIMARY' (1062, SQLSTATE 23000)"
        );
    }
}
