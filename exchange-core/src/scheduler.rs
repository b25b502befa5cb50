//! Cooperative per-connection scheduler (C9, spec §4.6, §5).
//!
//! One `ExchangeScheduler` lives per connection and pulls chunks from a
//! response body publisher in demand-driven batches, honoring whatever
//! credit the caller (C6/C7) currently has. Cancellation is a
//! `CancellationToken` shared with the connection: when the peer resets or
//! closes, cancelling the token causes the next `pull_batch` to stop
//! yielding and signal the handler's subscription to unwind at its next
//! suspension point, per §5's "no forced thread kill" rule.

use bytes::Bytes;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::body::ChunkStream;
use crate::error::ExchangeError;

/// Why [`ExchangeScheduler::pull_batch`] returned fewer chunks than the
/// credit allowed, or none at all.
#[derive(Debug, PartialEq, Eq)]
pub enum BatchEnd {
	/// The publisher has no more chunks.
	StreamEnded,
	/// The credit for this batch was exhausted; more may follow.
	CreditExhausted,
	/// The connection was cancelled mid-batch (peer reset/close, shutdown).
	Cancelled,
}

/// Drives demand-driven pulls from one exchange's body publisher.
pub struct ExchangeScheduler {
	cancellation: CancellationToken,
}

impl ExchangeScheduler {
	pub fn new(cancellation: CancellationToken) -> Self {
		Self { cancellation }
	}

	/// `true` once this connection (or the exchange this scheduler has been
	/// handed off to) has been cancelled.
	pub fn is_cancelled(&self) -> bool {
		self.cancellation.is_cancelled()
	}

	pub fn cancel(&self) {
		self.cancellation.cancel();
	}

	pub fn child_token(&self) -> CancellationToken {
		self.cancellation.child_token()
	}

	/// Pulls chunks from `body` until `credit` bytes have been emitted, the
	/// stream ends, or cancellation fires — whichever comes first. Never
	/// buffers more than the chunks returned in this call (§4.6: "never
	/// buffers more than one in-flight batch per exchange").
	pub async fn pull_batch(
		&self,
		body: &mut ChunkStream,
		credit: usize,
	) -> Result<(Vec<Bytes>, BatchEnd), ExchangeError> {
		let mut batch = Vec::new();
		let mut used = 0usize;

		loop {
			if self.cancellation.is_cancelled() {
				return Ok((batch, BatchEnd::Cancelled));
			}
			if used >= credit {
				return Ok((batch, BatchEnd::CreditExhausted));
			}

			let next = tokio::select! {
				biased;
				_ = self.cancellation.cancelled() => return Ok((batch, BatchEnd::Cancelled)),
				item = body.next() => item,
			};

			match next {
				None => return Ok((batch, BatchEnd::StreamEnded)),
				Some(Err(err)) => return Err(err),
				Some(Ok(chunk)) => {
					used += chunk.len();
					batch.push(chunk);
				},
			}
		}
	}
}
