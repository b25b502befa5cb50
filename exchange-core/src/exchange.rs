//! The exchange data model (spec §3): `Request`, `Response`, `Exchange`,
//! and the handler/error-handler traits that observe them.

use std::sync::Arc;

use async_trait::async_trait;
use http::{Method, StatusCode, Version};

use crate::body::{ChunkStream, InterceptableBody};
use crate::error::ExchangeError;
use crate::headers::{HeaderStore, PseudoHeaders};

/// A finite, non-restartable sequence of request body chunks (§3).
pub type BodyStream = ChunkStream;

/// The immutable half of an exchange.
pub struct Request {
	pub method: Method,
	pub scheme: String,
	pub authority: String,
	/// Normalized path; `raw_target` preserves the original request target
	/// verbatim (e.g. for proxying or logging).
	pub path: String,
	pub raw_target: String,
	pub version: Version,
	pub headers: HeaderStore,
	pub pseudo: Option<PseudoHeaders>,
	body: Option<BodyStream>,
}

impl Request {
	pub fn new(
		method: Method,
		scheme: impl Into<String>,
		authority: impl Into<String>,
		path: impl Into<String>,
		version: Version,
		headers: HeaderStore,
		body: BodyStream,
	) -> Self {
		let path = path.into();
		Self {
			method,
			scheme: scheme.into(),
			authority: authority.into(),
			raw_target: path.clone(),
			path,
			version,
			headers,
			pseudo: None,
			body: Some(body),
		}
	}

	/// Takes the body stream. A request body is a single-subscriber
	/// sequence (§9); calling this twice is a caller bug, so the second
	/// call gets `None` rather than a cloned stream.
	pub fn take_body(&mut self) -> Option<BodyStream> {
		self.body.take()
	}
}

/// The mutable-then-frozen half of an exchange (§3).
pub struct Response {
	pub status: StatusCode,
	pub headers: HeaderStore,
	pub trailers: Option<HeaderStore>,
	pub body: InterceptableBody,
}

impl Default for Response {
	fn default() -> Self {
		Self {
			status: StatusCode::OK,
			headers: HeaderStore::new(),
			trailers: None,
			body: InterceptableBody::new(),
		}
	}
}

impl Response {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set_status(&mut self, status: StatusCode) -> Result<(), ExchangeError> {
		if self.headers.is_written() {
			return Err(ExchangeError::Finalized);
		}
		self.status = status;
		Ok(())
	}

	/// Sets trailers; rejected once the headers (and thus the whole
	/// response) have been written and the terminal frame may already be
	/// past (invariant b, §3).
	pub fn set_trailers(&mut self, trailers: HeaderStore) -> Result<(), ExchangeError> {
		if self.body.is_connected() {
			return Err(ExchangeError::AlreadyConnected);
		}
		self.trailers = Some(trailers);
		Ok(())
	}
}

/// Lifecycle state of an [`Exchange`] (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
	Created,
	Running,
	RespondingHeaders,
	RespondingBody,
	Trailing,
	Completed,
	Failed,
	Reset,
}

/// Arbitrary, per-exchange context shared by reference (§3). The scheduling
/// contract forbids concurrent handler invocations for the same exchange,
/// so no synchronization is required here.
#[derive(Default)]
pub struct ExchangeContext {
	values: std::collections::HashMap<&'static str, Box<dyn std::any::Any + Send + Sync>>,
}

impl ExchangeContext {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert<T: Send + Sync + 'static>(&mut self, key: &'static str, value: T) {
		self.values.insert(key, Box::new(value));
	}

	pub fn get<T: Send + Sync + 'static>(&self, key: &'static str) -> Option<&T> {
		self.values.get(key).and_then(|v| v.downcast_ref::<T>())
	}
}

/// One request/response pair on a connection (§3).
pub struct Exchange {
	pub request: Request,
	pub response: Response,
	pub context: ExchangeContext,
	pub state: ExchangeState,
	/// `true` once any response bytes (headers included) reached the wire;
	/// drives the error-exchange `partial_response` branch (§4.2, §4.4).
	pub partial_response: bool,
}

impl Exchange {
	pub fn new(request: Request) -> Self {
		Self {
			request,
			response: Response::new(),
			context: ExchangeContext::new(),
			state: ExchangeState::Created,
			partial_response: false,
		}
	}

	pub fn transition(&mut self, state: ExchangeState) {
		self.state = state;
	}
}

/// An exchange synthesized by the error-exchange engine (C8), sharing the
/// same response slot as the original failed exchange (§4.4).
pub struct ErrorExchange<'a> {
	pub error: &'a ExchangeError,
	pub original_request: &'a Request,
	pub response: &'a mut Response,
}

/// The application-supplied request handler (§6).
#[async_trait]
pub trait Handler: Send + Sync {
	async fn handle(&self, exchange: &mut Exchange) -> Result<(), ExchangeError>;
}

/// The application-supplied error handler (§6). Failing cascades to the
/// engine's built-in last-resort handler (§4.4).
#[async_trait]
pub trait ErrorHandler: Send + Sync {
	async fn handle_error(&self, error_exchange: &mut ErrorExchange<'_>) -> Result<(), ExchangeError>;
}

pub type HandlerRef = Arc<dyn Handler>;
pub type ErrorHandlerRef = Arc<dyn ErrorHandler>;

#[cfg(test)]
mod tests {
	use super::*;
	use futures_util::stream;

	fn empty_body() -> BodyStream {
		Box::pin(stream::empty())
	}

	#[test]
	fn request_take_body_is_single_shot() {
		let mut req = Request::new(
			Method::GET,
			"http",
			"localhost",
			"/",
			Version::HTTP_11,
			HeaderStore::new(),
			empty_body(),
		);
		assert!(req.take_body().is_some());
		assert!(req.take_body().is_none());
	}

	#[test]
	fn set_status_fails_once_headers_written() {
		let mut resp = Response::new();
		resp.headers.mark_written();
		let err = resp.set_status(StatusCode::NOT_FOUND).unwrap_err();
		assert!(matches!(err, ExchangeError::Finalized));
	}

	#[test]
	fn set_trailers_fails_once_body_connected() {
		let mut resp = Response::new();
		resp.body.set_empty().unwrap();
		resp.body.connect().unwrap();
		let err = resp.set_trailers(HeaderStore::new()).unwrap_err();
		assert!(matches!(err, ExchangeError::AlreadyConnected));
	}

	#[test]
	fn context_round_trips_typed_values() {
		let mut ctx = ExchangeContext::new();
		ctx.insert("request_id", 42u64);
		assert_eq!(ctx.get::<u64>("request_id"), Some(&42));
		assert_eq!(ctx.get::<String>("request_id"), None);
	}
}
