//! Error-exchange fallback chain (C8, spec §4.4, §7).
//!
//! On handler failure, re-dispatches through the user error handler sharing
//! the failed exchange's response slot. If that fails too, runs a built-in
//! last-resort handler once. If headers were already written, or the
//! last-resort handler also fails, the connection is reset/closed with a
//! fatal log entry instead of attempting to write anything further.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{error, warn, Level};

use crate::error::ExchangeError;
use crate::exchange::{ErrorExchange, ErrorHandlerRef, Exchange, ExchangeState};
use crate::scheduler::ExchangeScheduler;

/// What happened to a failed exchange after the fallback chain ran.
#[derive(Debug)]
pub enum ErrorOutcome {
	/// A response was built into the shared response slot; the caller
	/// should serialize it normally.
	Responded,
	/// No response can be written; the caller must reset the stream
	/// (HTTP/2) or close the connection (HTTP/1.1).
	Unrecoverable,
}

/// Runs the §4.4 state machine for one failed exchange.
#[derive(Clone)]
pub struct ErrorExchangeEngine {
	user_handler: Option<ErrorHandlerRef>,
}

impl ErrorExchangeEngine {
	pub fn new(user_handler: Option<ErrorHandlerRef>) -> Self {
		Self { user_handler }
	}

	fn log(&self, err: &ExchangeError) {
		if err.log_level() == Level::WARN {
			warn!(error = %err, "exchange failed");
		} else {
			error!(error = %err, "exchange failed");
		}
	}

	/// Runs the fallback chain for `err` against `exchange`, without
	/// touching the wire. Returns whether a response landed in the shared
	/// response slot or the exchange is unrecoverable.
	pub async fn run(&self, exchange: &mut Exchange, err: ExchangeError) -> ErrorOutcome {
		self.log(&err);

		if exchange.partial_response || exchange.response.headers.is_written() {
			error!(error = %err, "error after headers written, response cannot be rebuilt");
			return ErrorOutcome::Unrecoverable;
		}

		if let Some(user_handler) = &self.user_handler {
			let mut error_exchange = ErrorExchange {
				error: &err,
				original_request: &exchange.request,
				response: &mut exchange.response,
			};
			match user_handler.handle_error(&mut error_exchange).await {
				Ok(()) => return ErrorOutcome::Responded,
				Err(user_err) => {
					error!(
						original = %err,
						handler_error = %user_err,
						"user error handler failed, falling back to last resort"
					);
				},
			}
		}

		match last_resort_response(&mut exchange.response, &err) {
			Ok(()) => ErrorOutcome::Responded,
			Err(last_resort_err) => {
				error!(
					original = %err,
					last_resort_error = %last_resort_err,
					"last-resort error handler failed"
				);
				ErrorOutcome::Unrecoverable
			},
		}
	}

	/// Convenience wrapper for the HTTP/1.1 driver: runs the fallback chain
	/// and, on [`ErrorOutcome::Responded`], serializes the result; on
	/// [`ErrorOutcome::Unrecoverable`], closes the connection.
	pub async fn recover_http1<S>(
		&self,
		exchange: &mut Exchange,
		err: ExchangeError,
		stream: &mut S,
		scheduler: &ExchangeScheduler,
	) -> Result<(), ExchangeError>
	where
		S: AsyncWrite + Unpin,
	{
		match self.run(exchange, err).await {
			ErrorOutcome::Responded => crate::http1::write_response(stream, exchange, scheduler).await,
			ErrorOutcome::Unrecoverable => {
				exchange.transition(ExchangeState::Failed);
				stream.shutdown().await.map_err(ExchangeError::Io)
			},
		}
	}
}

/// The built-in last-resort handler (§4.4): a minimal response whose status
/// is derived from the error and whose body is a short diagnostic text.
fn last_resort_response(
	response: &mut crate::exchange::Response,
	err: &ExchangeError,
) -> Result<(), ExchangeError> {
	response.set_status(err.status())?;
	response.headers.set(
		http::header::CONTENT_TYPE,
		http::HeaderValue::from_static("text/plain"),
	)?;
	response.body.set_string(err.to_string())
}
