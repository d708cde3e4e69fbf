//! Bounded out-of-order delivery buffer for an ordered-reliable channel.
//!
//! Grounded on the shape of the teacher's dead `connection/deliver.rs` `DeliveryManager`
//! (a small buffer of not-yet-deliverable items keyed by sequence), generalized with an
//! explicit finite capacity and a gap-skip policy: a packet arriving when the buffer is full
//! forces the delivery cursor to jump to the oldest sequence still available, permanently
//! abandoning whatever filled the gap.

use super::ack::SequenceId;

use std::collections::BTreeMap;

/// Buffers packets that arrived ahead of the delivery cursor, keyed by sequence.
pub struct ReorderBuffer<P> {
	capacity: usize,
	buffered: BTreeMap<u16, P>,
}

impl<P> ReorderBuffer<P> {
	pub fn new(capacity: usize) -> Self {
		Self { capacity, buffered: BTreeMap::new() }
	}

	/// Remove and return the buffered packet at `seq`, if any.
	pub fn take(&mut self, seq: SequenceId) -> Option<P> {
		self.buffered.remove(&seq.0)
	}

	/// Buffer `packet` at `seq`, delivering through `deliver` in sequence order.
	///
	/// When the buffer is already at capacity, the gap is abandoned: the cursor jumps forward
	/// to the oldest sequence still held (or to `seq` itself if the buffer was otherwise empty),
	/// and every contiguous run starting there is drained and delivered immediately.
	pub fn insert(
		&mut self,
		seq: SequenceId,
		packet: P,
		next_expected: &mut SequenceId,
		deliver: &mut impl FnMut(P),
	) {
		if self.buffered.len() < self.capacity {
			self.buffered.insert(seq.0, packet);
			return;
		}

		*next_expected = self.buffered.keys().next().map(|&k| SequenceId(k)).unwrap_or(seq);
		self.buffered.insert(seq.0, packet);
		self.drain_from(next_expected, deliver);
	}

	/// Drain every packet contiguous with `*next_expected`, advancing it past each one.
	pub fn drain_from(&mut self, next_expected: &mut SequenceId, deliver: &mut impl FnMut(P)) {
		while let Some(packet) = self.buffered.remove(&next_expected.0) {
			deliver(packet);
			*next_expected = next_expected.next();
		}
	}

	pub fn len(&self) -> usize {
		self.buffered.len()
	}

	pub fn is_empty(&self) -> bool {
		self.buffered.is_empty()
	}
}
