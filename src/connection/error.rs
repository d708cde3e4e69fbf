//! Errors [`super::Connection`] raises across its public boundary.

use std::error::Error;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::io::Error as IoError;

/// A failure directly returned from a [`super::Connection`] method call.
///
/// `SPEC_FULL.md` §7: recoverable protocol conditions never reach the application as an
/// `Err` — only genuine misuse (`InvalidState`) or a socket failure does.
#[derive(Debug)]
pub enum ConnectionError {
	/// `send` was called while the connection was not `Connected`.
	InvalidState,
	/// The underlying socket failed to send.
	Io(IoError),
}

impl From<IoError> for ConnectionError {
	fn from(error: IoError) -> Self {
		Self::Io(error)
	}
}

impl Display for ConnectionError {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		match self {
			Self::InvalidState => write!(f, "connection is not in a state that permits this operation"),
			Self::Io(error) => write!(f, "socket error: {}", error),
		}
	}
}

impl Error for ConnectionError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			Self::Io(error) => Some(error),
			Self::InvalidState => None,
		}
	}
}
