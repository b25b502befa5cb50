//! Reference-counted byte buffers: composition without copying (C1).
//!
//! `Bytes` is already a refcounted, zero-copy-sliceable buffer; `ByteSequence`
//! is the composition half on top of it: a rope of `Bytes` chunks that can be
//! appended to without copying and flattened lazily when something
//! downstream needs one contiguous slice.

use bytes::{Bytes, BytesMut};

/// A lazily-flattened sequence of byte chunks.
///
/// Interceptors and converters often build a body out of several pieces
/// (a prefix, an encoded value, a separator, ...); `ByteSequence` lets them
/// do that without forcing an allocation-and-copy at every step.
#[derive(Debug, Default, Clone)]
pub struct ByteSequence {
	chunks: Vec<Bytes>,
	len: usize,
}

impl ByteSequence {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn from_bytes(b: Bytes) -> Self {
		let len = b.len();
		Self {
			chunks: vec![b],
			len,
		}
	}

	pub fn push(&mut self, chunk: Bytes) {
		if chunk.is_empty() {
			return;
		}
		self.len += chunk.len();
		self.chunks.push(chunk);
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	pub fn chunks(&self) -> &[Bytes] {
		&self.chunks
	}

	/// Flattens the sequence into a single contiguous `Bytes`, copying only
	/// when there is more than one chunk.
	pub fn into_bytes(self) -> Bytes {
		match self.chunks.len() {
			0 => Bytes::new(),
			1 => self.chunks.into_iter().next().unwrap(),
			_ => {
				let mut out = BytesMut::with_capacity(self.len);
				for chunk in self.chunks {
					out.extend_from_slice(&chunk);
				}
				out.freeze()
			},
		}
	}
}

impl FromIterator<Bytes> for ByteSequence {
	fn from_iter<I: IntoIterator<Item = Bytes>>(iter: I) -> Self {
		let mut seq = ByteSequence::new();
		for chunk in iter {
			seq.push(chunk);
		}
		seq
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn byte_sequence_flattens_without_copy_for_single_chunk() {
		let mut seq = ByteSequence::new();
		seq.push(Bytes::from_static(b"hello"));
		assert_eq!(seq.len(), 5);
		assert_eq!(seq.into_bytes(), Bytes::from_static(b"hello"));
	}

	#[test]
	fn byte_sequence_concatenates_multiple_chunks_in_order() {
		let mut seq = ByteSequence::new();
		seq.push(Bytes::from_static(b"foo"));
		seq.push(Bytes::from_static(b"bar"));
		seq.push(Bytes::from_static(b"baz"));
		assert_eq!(seq.len(), 9);
		assert_eq!(seq.into_bytes(), Bytes::from_static(b"foobarbaz"));
	}

	#[test]
	fn byte_sequence_ignores_empty_pushes() {
		let mut seq = ByteSequence::new();
		seq.push(Bytes::new());
		assert!(seq.is_empty());
		assert_eq!(seq.chunks().len(), 0);
	}
}
