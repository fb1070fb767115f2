//! Core types shared by the tidewire crates.
//!
//! - [`Error`] taxonomy used by the reactor and the MySQL client
//! - [`Value`] for statement parameters and decoded column values
//! - [`Row`] with column metadata shared across a result set
//! - [`IsolationLevel`] for session negotiation

pub mod error;
pub mod isolation;
pub mod row;
pub mod value;

pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, ProtocolError, QueryError,
    QueryErrorKind, Result, TransactionError, TransactionErrorKind, TypeError, UsageError,
    UsageErrorKind,
};
pub use isolation::IsolationLevel;
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
