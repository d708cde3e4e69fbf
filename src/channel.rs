//! The three wire disciplines a connection can attach to a packet id.
//!
//! `Channel` owns no socket; `Connection` hands it a socket and remote address on every call
//! instead of the channel holding onto them, since a channel's lifetime doesn't nest inside any
//! single borrow of its connection's send path (`SPEC_FULL.md` §4.2/§9, "capability bundle"
//! open question). [`ack`] supplies the sliding window the reliable disciplines share;
//! [`reorder`] adds the out-of-order buffer the ordered discipline needs on top of it.

pub mod ack;
pub mod error;
pub mod reorder;

use crate::bit::{BitRead, BitWrite, ByteWriter};
use crate::frame;
use crate::packet::{Packet, PacketFactory};
use crate::salt::Salt;

use ack::{AckWindow, SequenceId};
use error::ChannelError;
use reorder::ReorderBuffer;

use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

/// A datagram sent on a reliable discipline, kept around until acknowledged or superseded.
struct RetransmitEntry {
	seq: SequenceId,
	sent_at: Instant,
	bytes: Vec<u8>,
}

/// Send/receive bookkeeping shared by [`Channel::Reliable`] and [`Channel::OrderedReliable`].
struct ReliableState {
	send_seq: SequenceId,
	recv_window: AckWindow,
	retransmit: Vec<RetransmitEntry>,
}

impl ReliableState {
	fn new() -> Self {
		Self { send_seq: SequenceId(0), recv_window: AckWindow::new(), retransmit: Vec::new() }
	}

	/// Write this send's sequence and the piggybacked ack fields, then the packet body.
	fn write_and_remember<P: Packet>(
		&mut self,
		mut writer: ByteWriter,
		socket: &UdpSocket,
		remote: SocketAddr,
		packet: &P,
	) -> std::io::Result<()> {
		let seq = self.send_seq;
		self.send_seq = seq.next();
		writer.write_u16(seq.0);
		writer.write_u16(self.recv_window.last().0);
		writer.write_u64(self.recv_window.mask());
		packet.write_body(&mut writer);

		let bytes = writer.into_bytes();
		socket.send_to(&bytes, remote)?;
		self.retransmit.push(RetransmitEntry { seq, sent_at: Instant::now(), bytes });
		Ok(())
	}

	/// Read the sequence and ack fields, prune acknowledged sends, and report whether `seq` is
	/// new. The caller still owns `reader` to decode the body that follows.
	fn read_header(&mut self, reader: &mut dyn BitRead) -> Result<(SequenceId, bool), ChannelError> {
		let seq = SequenceId(reader.read_u16()?);
		let ack_seq = SequenceId(reader.read_u16()?);
		let ack_mask = reader.read_u64()?;
		let peer_ack = AckWindow::from_parts(ack_seq, ack_mask);
		self.retransmit.retain(|entry| !peer_ack.contains(entry.seq));
		let is_new = self.recv_window.insert(seq);
		Ok((seq, is_new))
	}

	fn resend_due(&mut self, resend_period: Duration, socket: &UdpSocket, remote: SocketAddr) -> std::io::Result<()> {
		let now = Instant::now();
		for entry in self.retransmit.iter_mut() {
			if now.duration_since(entry.sent_at) >= resend_period {
				socket.send_to(&entry.bytes, remote)?;
				entry.sent_at = now;
			}
		}
		Ok(())
	}
}

/// One of the three wire disciplines a packet id can be sent and received under.
///
/// Built by [`unreliable`], [`reliable`] or [`ordered_reliable`] and attached to a connection
/// with `Connection::set_packet_channel`. `P` is the host application's packet type; only the
/// ordered discipline needs it, to type the buffer of packets awaiting their turn.
pub enum Channel<P> {
	/// Fire-and-forget: no sequence number, no retransmission, no ordering guarantee.
	Unreliable,
	/// Sequenced and acknowledged; duplicates are dropped, delivery order is receive order.
	Reliable(ReliableState),
	/// [`Channel::Reliable`] plus delivery in strictly increasing sequence order, buffering
	/// packets that arrive ahead of the cursor and skipping gaps the buffer outgrows.
	OrderedReliable(ReliableState, SequenceId, ReorderBuffer<P>),
}

/// Capacity of the ordered discipline's reorder buffer, matching the ack window's span.
const REORDER_CAPACITY: usize = crate::config::ACK_WINDOW_SIZE as usize;

/// A channel with no delivery guarantees at all.
pub fn unreliable<P>() -> Channel<P> {
	Channel::Unreliable
}

/// A channel that retransmits until acknowledged and drops duplicates, in receive order.
pub fn reliable<P>() -> Channel<P> {
	Channel::Reliable(ReliableState::new())
}

/// A channel that retransmits and acknowledges like [`reliable`], but delivers strictly in
/// sequence order, buffering early arrivals and abandoning a gap if the buffer fills up.
pub fn ordered_reliable<P>() -> Channel<P> {
	Channel::OrderedReliable(ReliableState::new(), SequenceId(0), ReorderBuffer::new(REORDER_CAPACITY))
}

impl<P: Packet> Channel<P> {
	/// Frame and send `packet` on this channel, over `socket` to `remote`.
	pub fn send(&mut self, session_salt: Salt, socket: &UdpSocket, remote: SocketAddr, packet: &P) -> std::io::Result<()> {
		let mut writer = ByteWriter::with_capacity(frame::MAX_DATAGRAM_SIZE);
		frame::write_application_header(&mut writer, session_salt, packet.id());

		match self {
			Channel::Unreliable => {
				packet.write_body(&mut writer);
				socket.send_to(&writer.into_bytes(), remote)?;
				Ok(())
			}
			Channel::Reliable(state) => state.write_and_remember(writer, socket, remote, packet),
			Channel::OrderedReliable(state, ..) => state.write_and_remember(writer, socket, remote, packet),
		}
	}

	/// Decode and deliver an inbound datagram already past the application header: `reader` is
	/// positioned right after the packet id frame decoded, `factory` constructs the blank
	/// packet for it, and `deliver` is invoked once per packet that is ready to hand to the
	/// application (zero or more than once, for the ordered discipline draining a backlog).
	pub fn receive(
		&mut self,
		packet_id: u8,
		reader: &mut dyn BitRead,
		factory: &impl PacketFactory<P>,
		deliver: &mut impl FnMut(P),
	) -> Result<(), ChannelError> {
		match self {
			Channel::Unreliable => {
				let mut packet = factory.create(packet_id).ok_or(ChannelError::UnknownPacketId(packet_id))?;
				packet.read_body(reader)?;
				deliver(packet);
				Ok(())
			}
			Channel::Reliable(state) => {
				let (_seq, is_new) = state.read_header(reader)?;
				if !is_new {
					return Ok(());
				}
				let mut packet = factory.create(packet_id).ok_or(ChannelError::UnknownPacketId(packet_id))?;
				packet.read_body(reader)?;
				deliver(packet);
				Ok(())
			}
			Channel::OrderedReliable(state, next_expected, buffer) => {
				let (seq, is_new) = state.read_header(reader)?;
				if !is_new {
					return Ok(());
				}
				let mut packet = factory.create(packet_id).ok_or(ChannelError::UnknownPacketId(packet_id))?;
				packet.read_body(reader)?;

				if seq == *next_expected {
					deliver(packet);
					*next_expected = next_expected.next();
					buffer.drain_from(next_expected, deliver);
				} else if seq.is_newer_than(*next_expected) {
					buffer.insert(seq, packet, next_expected, deliver);
				}
				Ok(())
			}
		}
	}

	/// Resend anything still unacknowledged past `resend_period`. A no-op on [`Channel::Unreliable`].
	pub fn resend_due(&mut self, resend_period: Duration, socket: &UdpSocket, remote: SocketAddr) -> std::io::Result<()> {
		match self {
			Channel::Unreliable => Ok(()),
			Channel::Reliable(state) => state.resend_due(resend_period, socket, remote),
			Channel::OrderedReliable(state, ..) => state.resend_due(resend_period, socket, remote),
		}
	}
}
