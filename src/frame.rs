//! Encode/decode the two-variant wire header and the control-packet payloads.
//!
//! A datagram's first bit discriminates the two wire variants: a **control** variant
//! (bit set) drives the handshake and teardown, an **application** variant (bit clear)
//! carries a channel's payload. See `SPEC_FULL.md` §4.1/§6.

use crate::bit::{BitError, BitRead, BitWrite};
use crate::salt::Salt;

use std::error::Error;
use std::fmt::{Display, Formatter, Result as FmtResult};

/// Datagrams larger than this are a programming error; the core never fragments.
pub const MAX_DATAGRAM_SIZE: usize = 512;

/// Why a `Disconnect` control packet was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
	/// The sender is tearing down the connection voluntarily.
	ClientDisconnect,
	/// The listener's available-port pool was empty.
	ServerFull,
	/// The listener already has a live Connection for this address.
	ExistingConnection,
	/// A reason code this implementation does not recognize by name.
	///
	/// Unknown codes are accepted and logged, never treated as a decode error.
	Other(u8),
}

impl DisconnectReason {
	fn to_u8(self) -> u8 {
		match self {
			Self::ClientDisconnect => 0,
			Self::ServerFull => 1,
			Self::ExistingConnection => 2,
			Self::Other(code) => code,
		}
	}

	fn from_u8(code: u8) -> Self {
		match code {
			0 => Self::ClientDisconnect,
			1 => Self::ServerFull,
			2 => Self::ExistingConnection,
			other => Self::Other(other),
		}
	}
}

impl Display for DisconnectReason {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		match self {
			Self::ClientDisconnect => write!(f, "client disconnected"),
			Self::ServerFull => write!(f, "server full"),
			Self::ExistingConnection => write!(f, "existing connection"),
			Self::Other(code) => write!(f, "disconnect reason {}", code),
		}
	}
}

/// The five control-packet payloads that drive the handshake and teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPacket {
	/// client -> server: propose a handshake.
	Connect { client_salt: Salt },
	/// server -> client: answer with a server salt, echoing the client's.
	Challenge { client_salt: Salt, server_salt: Salt },
	/// client -> server: prove the challenge was received by returning the combined salt.
	Solution { session_salt: Salt },
	/// server -> client: handshake complete, future traffic goes to `port`.
	Connected { session_salt: Salt, port: u16 },
	/// either direction: tear down the virtual connection identified by `session_salt`.
	Disconnect { session_salt: Salt, reason: DisconnectReason },
}

const CONNECT: u8 = 0;
const CHALLENGE: u8 = 1;
const SOLUTION: u8 = 2;
const CONNECTED: u8 = 3;
const DISCONNECT: u8 = 4;

/// A datagram that failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
	/// Ran out of bytes partway through decoding.
	Truncated,
	/// The control type byte did not match any known [`ControlPacket`] variant.
	UnknownControlType(u8),
}

impl Display for FrameError {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		match self {
			Self::Truncated => write!(f, "datagram ended before decoding finished"),
			Self::UnknownControlType(id) => write!(f, "unknown control packet type {}", id),
		}
	}
}

impl Error for FrameError {}

impl From<BitError> for FrameError {
	fn from(_: BitError) -> Self {
		Self::Truncated
	}
}

impl ControlPacket {
	/// Write the control discriminator bit, type byte and payload.
	pub fn encode(&self, writer: &mut dyn BitWrite) {
		writer.write_bool(true);
		match *self {
			Self::Connect { client_salt } => {
				writer.write_u8(CONNECT);
				writer.write_u64(client_salt);
			}
			Self::Challenge { client_salt, server_salt } => {
				writer.write_u8(CHALLENGE);
				writer.write_u64(client_salt);
				writer.write_u64(server_salt);
			}
			Self::Solution { session_salt } => {
				writer.write_u8(SOLUTION);
				writer.write_u64(session_salt);
			}
			Self::Connected { session_salt, port } => {
				writer.write_u8(CONNECTED);
				writer.write_u64(session_salt);
				writer.write_u16(port);
			}
			Self::Disconnect { session_salt, reason } => {
				writer.write_u8(DISCONNECT);
				writer.write_u64(session_salt);
				writer.write_u8(reason.to_u8());
			}
		}
	}

	/// Decode a control payload; the caller has already consumed the discriminator bit.
	pub fn decode(reader: &mut dyn BitRead) -> Result<Self, FrameError> {
		match reader.read_u8()? {
			CONNECT => Ok(Self::Connect { client_salt: reader.read_u64()? }),
			CHALLENGE => Ok(Self::Challenge {
				client_salt: reader.read_u64()?,
				server_salt: reader.read_u64()?,
			}),
			SOLUTION => Ok(Self::Solution { session_salt: reader.read_u64()? }),
			CONNECTED => Ok(Self::Connected {
				session_salt: reader.read_u64()?,
				port: reader.read_u16()?,
			}),
			DISCONNECT => Ok(Self::Disconnect {
				session_salt: reader.read_u64()?,
				reason: DisconnectReason::from_u8(reader.read_u8()?),
			}),
			unknown => Err(FrameError::UnknownControlType(unknown)),
		}
	}
}

/// The framing-level view of a decoded datagram: either a fully-decoded control packet, or
/// the salt/packet-id prefix of an application datagram (the rest is the channel's to read).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
	Control(ControlPacket),
	Application { session_salt: Salt, packet_id: u8 },
}

/// Decode the leading discriminator and either a control packet or an application prefix.
pub fn decode(reader: &mut dyn BitRead) -> Result<Decoded, FrameError> {
	if reader.read_bool()? {
		Ok(Decoded::Control(ControlPacket::decode(reader)?))
	} else {
		let session_salt = reader.read_u64()?;
		let packet_id = reader.read_u8()?;
		Ok(Decoded::Application { session_salt, packet_id })
	}
}

/// Write the application-variant header; the caller's [`crate::channel::Channel`] continues
/// writing from here.
pub fn write_application_header(writer: &mut dyn BitWrite, session_salt: Salt, packet_id: u8) {
	writer.write_bool(false);
	writer.write_u64(session_salt);
	writer.write_u8(packet_id);
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::bit::{ByteReader, ByteWriter};

	fn round_trip(packet: ControlPacket) {
		let mut writer = ByteWriter::new();
		packet.encode(&mut writer);
		let bytes = writer.into_bytes();

		let mut reader = ByteReader::new(&bytes);
		match decode(&mut reader).unwrap() {
			Decoded::Control(decoded) => assert_eq!(decoded, packet),
			Decoded::Application { .. } => panic!("expected a control packet"),
		}
	}

	#[test]
	fn control_packets_round_trip() {
		round_trip(ControlPacket::Connect { client_salt: 1 });
		round_trip(ControlPacket::Challenge { client_salt: 1, server_salt: 2 });
		round_trip(ControlPacket::Solution { session_salt: 3 });
		round_trip(ControlPacket::Connected { session_salt: 3, port: 9001 });
		round_trip(ControlPacket::Disconnect {
			session_salt: 3,
			reason: DisconnectReason::ClientDisconnect,
		});
		round_trip(ControlPacket::Disconnect { session_salt: 3, reason: DisconnectReason::Other(200) });
	}

	#[test]
	fn application_header_round_trips() {
		let mut writer = ByteWriter::new();
		write_application_header(&mut writer, 0xABCD, 7);
		let bytes = writer.into_bytes();

		let mut reader = ByteReader::new(&bytes);
		match decode(&mut reader).unwrap() {
			Decoded::Application { session_salt, packet_id } => {
				assert_eq!(session_salt, 0xABCD);
				assert_eq!(packet_id, 7);
			}
			Decoded::Control(_) => panic!("expected an application prefix"),
		}
	}

	#[test]
	fn unknown_control_type_is_an_error() {
		let mut writer = ByteWriter::new();
		writer.write_bool(true);
		writer.write_u8(250);
		let bytes = writer.into_bytes();

		let mut reader = ByteReader::new(&bytes);
		assert_eq!(decode(&mut reader), Err(FrameError::UnknownControlType(250)));
	}

	#[test]
	fn truncated_datagram_is_an_error() {
		let bytes = [0x80u8];
		let mut reader = ByteReader::new(&bytes);
		assert_eq!(decode(&mut reader), Err(FrameError::Truncated));
	}
}
