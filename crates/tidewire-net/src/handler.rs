//! The callback contract between the reactor and whatever speaks over a
//! connection.

use std::any::Any;

use crate::connection::Conn;

/// Lifecycle hooks driven by the [`Network`](crate::Network).
///
/// Every hook has a no-op default, so an implementation only overrides the
/// events it cares about. Each hook receives a [`Conn`] through which the
/// handler can send, close, or pause reading on its connection.
///
/// Hooks fire in this order for a healthy connection:
/// `on_accept` (inbound only), `on_open`, `on_handshake` (TLS only),
/// `on_ready`, then any number of `on_data` / `on_send_complete`, and
/// finally `on_close` exactly once.
pub trait Handler: 'static {
    /// Inbound connection accepted; return `false` to close it immediately.
    fn on_accept(&mut self, _conn: &mut Conn<'_>) -> bool {
        true
    }

    /// TCP connection established (before any TLS negotiation).
    fn on_open(&mut self, _conn: &mut Conn<'_>) {}

    /// TLS handshake finished; return `false` to reject the peer.
    ///
    /// `peer_cert` is the DER encoding of the peer's end-entity certificate.
    fn on_handshake(&mut self, _conn: &mut Conn<'_>, _peer_cert: Option<&[u8]>) -> bool {
        true
    }

    fn on_failed_handshake(&mut self, conn: &mut Conn<'_>, reason: &str) {
        tracing::warn!(cid = %conn.id(), reason, "TLS handshake failed");
    }

    /// Outbound connect failed; `on_close` follows.
    fn on_fail(&mut self, _conn: &mut Conn<'_>, _reason: &str) {}

    /// Connection is usable: TCP is up and TLS (if any) is negotiated.
    fn on_ready(&mut self, _conn: &mut Conn<'_>) {}

    fn on_data(&mut self, _conn: &mut Conn<'_>, _data: &[u8]) {}

    fn on_close(&mut self, _conn: &mut Conn<'_>, _reason: Option<&str>) {}

    /// All bytes handed to [`Conn::send`] have been written to the socket.
    fn on_send_complete(&mut self, _conn: &mut Conn<'_>) {}

    fn on_send_error(&mut self, conn: &mut Conn<'_>, message: &str) {
        tracing::debug!(cid = %conn.id(), message, "send error");
    }

    fn on_recv_error(&mut self, conn: &mut Conn<'_>, message: &str) {
        tracing::debug!(cid = %conn.id(), message, "recv error");
    }
}

/// Object-safe handler that can be downcast back to its concrete type.
pub(crate) trait DynHandler: Handler {
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<H: Handler> DynHandler for H {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
