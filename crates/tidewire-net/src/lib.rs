//! Single-threaded, readiness-driven connection reactor.
//!
//! A [`Network`] multiplexes listening and connected sockets on one
//! [`mio::Poll`] and turns readiness into calls on a per-connection
//! [`Handler`]. Nothing here blocks except [`Network::service`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tidewire_net::{Conn, Handler, Network};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_data(&mut self, conn: &mut Conn<'_>, data: &[u8]) {
//!         conn.send(data);
//!     }
//! }
//!
//! let mut network = Network::new()?;
//! network.add_server(12345, || Echo, None)?;
//! loop {
//!     network.service(Duration::from_millis(100), 100)?;
//! }
//! # Ok::<(), tidewire_core::Error>(())
//! ```

pub mod connection;
pub mod handler;
pub mod reactor;
pub mod tls;

pub use connection::{Conn, ConnectionId};
pub use handler::Handler;
pub use reactor::{Listener, Network};
pub use tls::{ClientTls, ServerTls};
