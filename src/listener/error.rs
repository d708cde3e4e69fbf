//! Errors [`super::Listener`] raises across its public boundary.

use std::error::Error;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::io::Error as IoError;

/// A failure directly returned from a [`super::Listener`] method call.
#[derive(Debug)]
pub enum ListenerError {
	/// The listening socket failed to bind or perform I/O.
	Io(IoError),
}

impl From<IoError> for ListenerError {
	fn from(error: IoError) -> Self {
		Self::Io(error)
	}
}

impl Display for ListenerError {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		match self {
			Self::Io(error) => write!(f, "listener socket error: {}", error),
		}
	}
}

impl Error for ListenerError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			Self::Io(error) => Some(error),
		}
	}
}
