//! Non-blocking MySQL client for the tidewire reactor.
//!
//! The MySQL client/server protocol is implemented from scratch on top of
//! [`tidewire_net`]. It provides:
//!
//! - Packet framing with sequence numbers and large-payload splitting
//! - Authentication (mysql_native_password, caching_sha2_password)
//! - In-band TLS upgrade after the server greeting
//! - Session setup (autocommit, isolation level)
//! - Text-protocol queries with typed row decoding
//! - Parameter substitution with server-aware escaping
//! - A [`Cursor`] with nested transactions
//!
//! # Protocol Overview
//!
//! Every packet is a 3-byte little-endian payload length, a 1-byte
//! sequence number and the payload. Payloads of 2^24 - 1 bytes or more are
//! split across several packets. Each command restarts the sequence at 0.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::rc::Rc;
//! use std::time::Duration;
//! use tidewire_mysql::{MySqlClient, MySqlConfig, MySqlContext, Params};
//! use tidewire_net::Network;
//!
//! let config = MySqlConfig::new().host("127.0.0.1").user("root").database("test");
//! let context = Rc::new(MySqlContext::new(config));
//!
//! let mut network = Network::new()?;
//! let id = MySqlClient::connect(&mut network, context)?;
//! MySqlClient::with_cursor(&mut network, id, |cursor| {
//!     cursor.execute("SELECT 1", Params::None, |cursor, result| {
//!         println!("{:?}", result.map(|r| r.scalar().cloned()));
//!         cursor.close();
//!     })
//! });
//! while network.is_open(id) {
//!     network.service(Duration::from_millis(100), 100)?;
//! }
//! # Ok::<(), tidewire_core::Error>(())
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod cursor;
pub mod escape;
pub mod protocol;
pub mod session;
pub mod types;

pub use client::{Callback, MySqlClient};
pub use config::{MySqlConfig, MySqlContext};
pub use cursor::{Cursor, ExecuteOptions};
pub use escape::{Params, escape_string, escape_value, interpolate};
pub use session::{QueryResult, QueryStatus, RowFormat, Rows, Session, State};
pub use types::{ColumnDef, FieldType};
