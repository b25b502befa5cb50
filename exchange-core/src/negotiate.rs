//! ALPN protocol negotiation (C5, spec §4.1).
//!
//! Installed once a TLS handshake completes. `Protocol` names the two wire
//! pipelines this core knows how to install; anything else fails the
//! connection. An idle event firing mid-handshake is promoted to a
//! handshake failure rather than silently hanging (§4.1, §5 "Timeouts").

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::warn;

use crate::error::NegotiationError;

/// The negotiated wire protocol for a connection's remaining lifetime.
/// Once installed, the pipeline never re-negotiates (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
	Http1,
	Http2,
}

impl Protocol {
	/// Parses a single ALPN token as advertised on the wire.
	pub fn from_alpn_token(token: &[u8]) -> Result<Self, NegotiationError> {
		match token {
			b"http/1.1" => Ok(Protocol::Http1),
			b"h2" => Ok(Protocol::Http2),
			other => Err(NegotiationError::UnsupportedProtocol(other.to_vec())),
		}
	}
}

/// Drives the TLS handshake and resolves the negotiated protocol, failing
/// the handshake if it doesn't complete within `idle_timeout` (§4.1).
pub struct ProtocolNegotiator {
	idle_timeout: Duration,
}

impl ProtocolNegotiator {
	pub fn new(idle_timeout: Duration) -> Self {
		Self { idle_timeout }
	}

	/// Runs `accept`, which performs the TLS handshake and yields the
	/// negotiated stream plus its ALPN protocol bytes, under the idle
	/// timeout. `accept` is generic so this negotiator has no direct
	/// dependency on a specific TLS stack.
	pub async fn negotiate<S, F, Fut>(
		&self,
		accept: F,
	) -> Result<(S, Protocol), NegotiationError>
	where
		F: FnOnce() -> Fut,
		Fut: std::future::Future<Output = std::io::Result<(S, Option<Vec<u8>>)>>,
		S: AsyncRead + AsyncWrite + Unpin,
	{
		let result = timeout(self.idle_timeout, accept())
			.await
			.map_err(|_| NegotiationError::IdleTimeout)?;
		let (stream, alpn) = result.map_err(NegotiationError::Tls)?;
		let token = alpn.ok_or(NegotiationError::NoProtocol)?;
		match Protocol::from_alpn_token(&token) {
			Ok(protocol) => Ok((stream, protocol)),
			Err(err) => {
				warn!(?err, "alpn negotiation rejected");
				Err(err)
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn accepts_http1_and_h2_tokens() {
		assert_eq!(Protocol::from_alpn_token(b"http/1.1").unwrap(), Protocol::Http1);
		assert_eq!(Protocol::from_alpn_token(b"h2").unwrap(), Protocol::Http2);
	}

	#[test]
	fn rejects_unknown_token() {
		let err = Protocol::from_alpn_token(b"spdy/3").unwrap_err();
		assert!(matches!(err, NegotiationError::UnsupportedProtocol(_)));
	}

	#[tokio::test]
	async fn idle_timeout_during_handshake_fails_negotiation() {
		let negotiator = ProtocolNegotiator::new(Duration::from_millis(10));
		let result = negotiator
			.negotiate::<tokio::io::DuplexStream, _, _>(|| async {
				tokio::time::sleep(Duration::from_secs(5)).await;
				unreachable!("should time out first")
			})
			.await;
		assert!(matches!(result, Err(NegotiationError::IdleTimeout)));
	}
}
