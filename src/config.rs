//! Tunable constants governing handshake retry, liveness and ack-window behavior.
//!
//! These are plain constants with a [`Config`] struct of overridable defaults, not a loaded
//! configuration file: every dependency this shallow in the retrieval pack (including the
//! teacher) tunes its protocol knobs this way rather than through a config-file crate.

use std::time::Duration;

/// Number of resends attempted per handshake phase before giving up.
///
/// See `SPEC_FULL.md` §4.3/§8 property 3 ("Retry bound").
pub const RETRY_AMOUNT: u32 = 10;

/// Default period between handshake resends.
pub const DEFAULT_RESEND_PERIOD: Duration = Duration::from_millis(500);

/// Default idle-connected timeout before a self-initiated disconnect.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Size of the acknowledgement window on a reliable channel; bounds the retransmit store.
pub const ACK_WINDOW_SIZE: u8 = 64;

/// Tunables for a single [`crate::connection::Connection`].
///
/// The timer thread wakes at half [`Config::resend_period`] so a due resend is issued within
/// one tick of becoming due (`SPEC_FULL.md` §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
	/// How long to wait between handshake resends.
	pub resend_period: Duration,
	/// How long a `Connected` connection may go without receiving anything before it is
	/// declared dead and disconnected.
	pub idle_timeout: Duration,
	/// Number of resends attempted per handshake phase before giving up.
	pub retry_amount: u32,
}

impl Config {
	/// The timer thread's wake period: half of [`Self::resend_period`].
	#[inline]
	pub fn tick_period(&self) -> Duration {
		self.resend_period / 2
	}
}

impl Default for Config {
	fn default() -> Self {
		Self {
			resend_period: DEFAULT_RESEND_PERIOD,
			idle_timeout: DEFAULT_IDLE_TIMEOUT,
			retry_amount: RETRY_AMOUNT,
		}
	}
}
