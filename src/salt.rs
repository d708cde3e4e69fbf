//! The 64-bit random values used to make handshake responses unforgeable by an off-path
//! attacker.

use rand::random;

/// A 64-bit random value exchanged during the handshake.
///
/// Each side of a handshake generates its own local [`Salt`], then derives a shared
/// session salt by [`combine`]-ing both. The session salt is carried on every application
/// datagram and validated on receipt; see [`crate::connection::Connection`].
pub type Salt = u64;

/// Derive the shared session salt from a client and a server salt.
///
/// Both ends must agree on this function: it must be order-independent, since either side
/// may be handed the pair as `(client, server)` or `(server, client)`. XOR satisfies this.
#[inline]
pub fn combine(client_salt: Salt, server_salt: Salt) -> Salt {
	client_salt ^ server_salt
}

/// Generate a new local salt from a cryptographically adequate PRNG.
///
/// A weak generator here defeats the anti-spoof property of the handshake: an attacker who
/// can predict the salt can forge `Challenge`/`Connected` responses.
#[inline]
pub fn generate() -> Salt {
	random::<Salt>()
}
