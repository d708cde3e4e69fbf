//! The application-supplied capability set a [`super::Connection`] invokes on its events.
//!
//! `SPEC_FULL.md` §9 ("Subclass hooks") replaces the source's abstract `HandleConnected`/
//! `HandleDisconnect`/`HandlePacket` methods with an explicit trait object passed in at
//! construction, so no inheritance hierarchy is needed to observe connection events.

use super::state::ConnectStatus;
use crate::packet::Packet;

/// Application callbacks a [`super::Connection`] invokes as its state changes.
///
/// Methods run on whichever background thread observed the triggering event (the receive
/// pump or the timer thread); implementations must not block, and must be reentrancy-safe
/// with any other `Connection` method called from within them (`SPEC_FULL.md` §5).
pub trait ConnectionHandler<P: Packet>: Send + Sync {
	/// The handshake reached a terminal outcome.
	fn handle_connected(&self, _status: ConnectStatus) {}

	/// The connection has fully torn down; no further sends will succeed.
	fn handle_disconnect(&self) {}

	/// An application datagram was decoded and is ready for the application to consume.
	fn handle_packet(&self, packet: P);
}
