//! Ephemeral server-side handshake state recorded between `Connect` and `Solution`.

use crate::salt::Salt;

use std::time::{Duration, Instant};

/// A client's salt and the server's matching salt, recorded while awaiting `Solution`
/// (`SPEC_FULL.md` §4.4, Glossary "Pending handshake").
#[derive(Debug, Clone, Copy)]
pub struct PendingHandshake {
	pub client_salt: Salt,
	pub server_salt: Salt,
	created_at: Instant,
}

impl PendingHandshake {
	pub fn new(client_salt: Salt, server_salt: Salt) -> Self {
		Self { client_salt, server_salt, created_at: Instant::now() }
	}

	/// Time elapsed since this entry was recorded or last replaced.
	pub fn age(&self) -> Duration {
		self.created_at.elapsed()
	}
}
