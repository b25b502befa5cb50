//! The exchange error surface (spec §7).
//!
//! Handler code and the engine's own plumbing both raise [`ExchangeError`].
//! The kind drives both the status the error-exchange engine builds and the
//! log level it emits at (§4.4).

use http::StatusCode;

/// Error kinds surfaced to the error handler.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
	/// Malformed request/headers/frame. Not retried; response built by the
	/// error handler.
	#[error("protocol error: {0}")]
	Protocol(String),

	/// A [`crate::body::BodyResource`] reported non-existence.
	#[error("not found")]
	NotFound,

	/// Headers are immutable once written (invariant 1, §8).
	#[error("headers already written")]
	Finalized,

	/// A body/transform was set after [`crate::body::InterceptableBody`]
	/// connected to the wire.
	#[error("body already connected to the wire")]
	AlreadyConnected,

	/// Missing or failing media-type converter.
	#[error("no converter registered for media type {0:?}")]
	MissingConverter(String),

	/// A registered converter failed to encode or decode a value.
	#[error("conversion failed: {0}")]
	Converter(String),

	/// Peer cancellation; terminal, no response written.
	#[error("exchange cancelled")]
	Cancelled,

	/// No progress within the configured idle window.
	#[error("idle timeout")]
	IdleTimeout,

	/// An I/O failure talking to the transport.
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	/// A caller-supplied status, message and cause, for anything that maps
	/// onto an arbitrary HTTP status rather than one of the kinds above.
	#[error("{status}: {message}")]
	Http {
		status: StatusCode,
		message: String,
		#[source]
		cause: Option<Box<dyn std::error::Error + Send + Sync>>,
	},

	/// Any other unexpected failure.
	#[error("internal error: {0}")]
	Internal(#[from] anyhow::Error),
}

impl ExchangeError {
	pub fn http(status: StatusCode, message: impl Into<String>) -> Self {
		ExchangeError::Http {
			status,
			message: message.into(),
			cause: None,
		}
	}

	/// The status this error maps to when the error handler builds a
	/// response from it (used by the built-in last-resort handler; a user
	/// error handler is free to choose differently).
	pub fn status(&self) -> StatusCode {
		match self {
			ExchangeError::Protocol(_) => StatusCode::BAD_REQUEST,
			ExchangeError::NotFound => StatusCode::NOT_FOUND,
			ExchangeError::Finalized => StatusCode::INTERNAL_SERVER_ERROR,
			ExchangeError::AlreadyConnected => StatusCode::INTERNAL_SERVER_ERROR,
			ExchangeError::MissingConverter(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
			ExchangeError::Converter(_) => StatusCode::INTERNAL_SERVER_ERROR,
			ExchangeError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
			ExchangeError::IdleTimeout => StatusCode::REQUEST_TIMEOUT,
			ExchangeError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
			ExchangeError::Http { status, .. } => *status,
			ExchangeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// `true` when this error is terminal and must not produce a response
	/// (peer already gone).
	pub fn is_terminal(&self) -> bool {
		matches!(self, ExchangeError::Cancelled)
	}

	/// The `tracing` level §4.4 calls for: `WARN` for 4xx, `ERROR` otherwise.
	pub fn log_level(&self) -> tracing::Level {
		if self.status().is_client_error() {
			tracing::Level::WARN
		} else {
			tracing::Level::ERROR
		}
	}
}

/// Errors specific to the protocol-negotiation handshake (§4.1).
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
	#[error("unsupported ALPN protocol: {0:?}")]
	UnsupportedProtocol(Vec<u8>),
	#[error("no ALPN protocol negotiated")]
	NoProtocol,
	#[error("idle timeout during handshake")]
	IdleTimeout,
	#[error("tls handshake failed: {0}")]
	Tls(#[from] std::io::Error),
}
