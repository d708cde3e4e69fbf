//! The finite connection state machine and the CAS discipline that drives it.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a [`super::Connection`] (`SPEC_FULL.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
	/// Initial state; no handshake has started.
	ReadyToConnect = 0,
	/// `Connect` sent, waiting for `Challenge`.
	AwaitingChallenge = 1,
	/// `Solution` sent, waiting for `Connected`.
	AwaitingConnected = 2,
	/// Handshake complete; application traffic may flow.
	Connected = 3,
	/// Terminal: the connection has torn down.
	Disconnected = 4,
}

impl ConnectionState {
	fn from_u8(value: u8) -> Self {
		match value {
			0 => Self::ReadyToConnect,
			1 => Self::AwaitingChallenge,
			2 => Self::AwaitingConnected,
			3 => Self::Connected,
			_ => Self::Disconnected,
		}
	}
}

/// Atomically-updated cell carrying a [`ConnectionState`] discriminant.
///
/// Every transition is a compare-and-swap against an expected prior state (`SPEC_FULL.md` §9,
/// "State as integer for atomic CAS"): this is what lets a timer-thread transition (retry
/// exhaustion) and a receive-thread transition (a `Challenge` arriving) race safely, with
/// exactly one of them winning and the other becoming a documented no-op.
#[derive(Debug)]
pub struct AtomicState(AtomicU8);

impl AtomicState {
	pub fn new(initial: ConnectionState) -> Self {
		Self(AtomicU8::new(initial as u8))
	}

	pub fn load(&self) -> ConnectionState {
		ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
	}

	/// Attempt `expected -> new`; returns whether it won the race.
	pub fn transition(&self, expected: ConnectionState, new: ConnectionState) -> bool {
		self.0.compare_exchange(expected as u8, new as u8, Ordering::SeqCst, Ordering::SeqCst).is_ok()
	}

	/// Unconditionally swap in `new`, returning the prior state.
	pub fn swap(&self, new: ConnectionState) -> ConnectionState {
		ConnectionState::from_u8(self.0.swap(new as u8, Ordering::SeqCst))
	}

	pub fn store(&self, new: ConnectionState) {
		self.0.store(new as u8, Ordering::SeqCst);
	}
}

/// Outcome reported to [`super::handler::ConnectionHandler::handle_connected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
	/// The handshake completed; the connection is `Connected`.
	Success,
	/// No `Challenge` arrived within `retry_amount` attempts of `Connect`.
	NoChallengeReceived,
	/// No `Connected` arrived within `retry_amount` attempts of `Solution`.
	NoConnectedReceived,
	/// The connection was torn down (locally or by the peer) before the handshake finished.
	Disconnect,
}
