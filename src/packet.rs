//! The application packet hierarchy is an external collaborator: this module only defines
//! the contract a host application implements, not a concrete packet type.

use crate::bit::{BitError, BitRead, BitWrite};

/// A single application-defined message carried over a [`crate::channel::Channel`].
///
/// An implementor typically wraps an enum of every message the application sends, with
/// [`Packet::id`] as the discriminant [`PacketFactory::create`] dispatches on.
pub trait Packet: Sized {
	/// The one-byte identifier [`crate::frame`] writes for this packet, and that
	/// [`PacketFactory::create`] maps back to a fresh instance on the receiving end.
	fn id(&self) -> u8;

	/// Serialize the packet body (everything after the id byte Framing already wrote).
	fn write_body(&self, writer: &mut dyn BitWrite);

	/// Populate `self` (freshly constructed by [`PacketFactory::create`]) from its body.
	fn read_body(&mut self, reader: &mut dyn BitRead) -> Result<(), BitError>;
}

/// Maps a one-byte packet id to a freshly constructed, not-yet-populated [`Packet`].
///
/// An implementation typically matches on `id` and returns a default-initialized variant of
/// the application's packet enum. `Send + Sync` so a [`crate::connection::Connection`] can
/// share one factory, behind an `Arc`, across its receive and timer threads.
pub trait PacketFactory<P: Packet>: Send + Sync {
	/// Number of distinct packet ids this factory can construct.
	fn type_count(&self) -> u8;

	/// Construct a blank packet for `id`, or `None` if `id` is not recognized.
	fn create(&self, id: u8) -> Option<P>;
}
