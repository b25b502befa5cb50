//! HTTP/2 connection driver (C7, spec §4.3, §6).
//!
//! Wraps `h2::server::Connection`, dispatching each accepted stream to the
//! handler and serializing the response as HEADERS, DATA, and an optional
//! trailing HEADERS frame per the write order in §4.3. `h2` already
//! fragments oversized writes across `SETTINGS_MAX_FRAME_SIZE`-bounded
//! frames internally; this driver's job is flow-control-aware pacing and
//! preserving publisher chunk boundaries (never coalescing two handler
//! emissions into one `send_data` call without an explicit flush).

use std::future::poll_fn;

use bytes::Bytes;
use futures_util::StreamExt;
use h2::server::SendResponse;
use h2::SendStream;
use http::{Request as HttpRequest, Response as HttpResponse, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::body::ConnectedBody;
use crate::error::ExchangeError;
use crate::error_exchange::{ErrorExchangeEngine, ErrorOutcome};
use crate::exchange::{Exchange, ExchangeState, HandlerRef, Request};
use crate::headers::HeaderStore;
use crate::scheduler::{BatchEnd, ExchangeScheduler};

/// Drives one HTTP/2 connection: accepts streams and dispatches each to its
/// own exchange. Exchanges on different streams interleave freely; ordering
/// within one stream still follows headers-then-body-then-trailers (§4.6).
pub struct Http2Connection<S> {
	conn: h2::server::Connection<S, Bytes>,
	handler: HandlerRef,
	errors: ErrorExchangeEngine,
	cancellation: CancellationToken,
}

impl<S> Http2Connection<S>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	pub async fn handshake(
		io: S,
		handler: HandlerRef,
		errors: ErrorExchangeEngine,
		cancellation: CancellationToken,
	) -> Result<Self, ExchangeError> {
		let conn = h2::server::handshake(io)
			.await
			.map_err(|e| ExchangeError::Protocol(format!("h2 handshake failed: {e}")))?;
		Ok(Self {
			conn,
			handler,
			errors,
			cancellation,
		})
	}

	#[instrument(skip(self))]
	pub async fn run(mut self) -> Result<(), ExchangeError> {
		loop {
			let next = tokio::select! {
				biased;
				_ = self.cancellation.cancelled() => return Ok(()),
				accepted = self.conn.accept() => accepted,
			};
			let Some(accepted) = next else {
				return Ok(());
			};
			let (request, respond) = accepted.map_err(|e| ExchangeError::Protocol(e.to_string()))?;

			let handler = self.handler.clone();
			let errors = self.errors.clone();
			let stream_cancellation = self.cancellation.child_token();
			tokio::spawn(async move {
				if let Err(err) =
					handle_stream(request, respond, handler, errors, stream_cancellation).await
				{
					warn!(error = %err, "http/2 stream handling failed");
				}
			});
		}
	}
}

fn build_request(req: HttpRequest<h2::RecvStream>) -> Request {
	let (parts, mut recv_stream) = req.into_parts();
	let mut headers = HeaderStore::new();
	for (name, value) in parts.headers.iter() {
		let _ = headers.add(name.clone(), value.clone());
	}
	let scheme = parts
		.uri
		.scheme_str()
		.unwrap_or("https")
		.to_string();
	let authority = parts
		.uri
		.authority()
		.map(|a| a.to_string())
		.unwrap_or_default();
	let path = parts.uri.path().to_string();

	let body = Box::pin(async_stream::try_stream! {
		while let Some(chunk) = recv_stream.next().await {
			let chunk = chunk.map_err(|e| ExchangeError::Protocol(e.to_string()))?;
			let len = chunk.len();
			yield chunk;
			let _ = recv_stream.flow_control().release_capacity(len);
		}
	});

	Request::new(parts.method, scheme, authority, path, parts.version, headers, body)
}

#[instrument(skip_all)]
async fn handle_stream(
	req: HttpRequest<h2::RecvStream>,
	mut respond: SendResponse<Bytes>,
	handler: HandlerRef,
	errors: ErrorExchangeEngine,
	cancellation: CancellationToken,
) -> Result<(), ExchangeError> {
	let request = build_request(req);
	let mut exchange = Exchange::new(request);
	exchange.transition(ExchangeState::Running);

	if let Err(err) = handler.handle(&mut exchange).await {
		match errors.run(&mut exchange, err).await {
			ErrorOutcome::Responded => {
				write_response(&mut respond, &mut exchange, &cancellation, &errors).await
			},
			ErrorOutcome::Unrecoverable => {
				exchange.transition(ExchangeState::Reset);
				if let Ok(mut send) = respond.send_response(minimal_head(StatusCode::INTERNAL_SERVER_ERROR), true) {
					send.send_reset(h2::Reason::INTERNAL_ERROR);
				}
				Ok(())
			},
		}
	} else {
		write_response(&mut respond, &mut exchange, &cancellation, &errors).await
	}
}

fn minimal_head(status: StatusCode) -> HttpResponse<()> {
	HttpResponse::builder().status(status).body(()).expect("valid minimal response head")
}

/// Serializes `exchange.response` as HEADERS (+ DATA* (+ trailing HEADERS))
/// per the write order in §4.3. Any failure once HEADERS may already be on
/// the wire is routed through `errors` (§4.2 escalation) instead of
/// propagated to the caller: by that point `partial_response` is already
/// set, so the engine always resolves `Unrecoverable` and the only thing
/// left to do is log and reset the stream, which this function does itself.
async fn write_response(
	respond: &mut SendResponse<Bytes>,
	exchange: &mut Exchange,
	cancellation: &CancellationToken,
	errors: &ErrorExchangeEngine,
) -> Result<(), ExchangeError> {
	let connected = exchange.response.body.connect()?;
	exchange.partial_response = true;
	exchange.transition(ExchangeState::RespondingHeaders);

	if let ConnectedBody::Buffered(ref bytes) = connected {
		if exchange.response.headers.content_length().is_none() {
			exchange.response.headers.set_content_length(bytes.len() as u64)?;
		}
	}

	let trailers = exchange.response.trailers.take();
	let status = exchange.response.status;
	exchange.response.headers.mark_written();

	let mut head = HttpResponse::builder().status(status);
	if let Some(map) = head.headers_mut() {
		for (name, value) in exchange.response.headers.iter() {
			map.insert(name.clone(), value.clone());
		}
	}
	let head = head.body(()).map_err(|e| ExchangeError::Protocol(e.to_string()))?;

	match connected {
		ConnectedBody::Buffered(bytes) => {
			let end_stream = bytes.is_empty() && trailers.is_none();
			let mut send = match respond.send_response(head, end_stream) {
				Ok(send) => send,
				Err(e) => {
					errors.run(exchange, ExchangeError::Protocol(e.to_string())).await;
					exchange.transition(ExchangeState::Reset);
					return Ok(());
				},
			};
			exchange.transition(ExchangeState::RespondingBody);
			if !bytes.is_empty() {
				if let Err(err) =
					send_with_flow_control(&mut send, bytes, trailers.is_none(), cancellation).await
				{
					return fail_and_reset(errors, exchange, &mut send, err).await;
				}
			}
			if let Some(trailers) = trailers {
				exchange.transition(ExchangeState::Trailing);
				if let Err(e) = send.send_trailers(trailers.into_inner()) {
					return fail_and_reset(errors, exchange, &mut send, ExchangeError::Protocol(e.to_string()))
						.await;
				}
			}
		},
		ConnectedBody::Streamed(mut body) => {
			let mut send = match respond.send_response(head, false) {
				Ok(send) => send,
				Err(e) => {
					errors.run(exchange, ExchangeError::Protocol(e.to_string())).await;
					exchange.transition(ExchangeState::Reset);
					return Ok(());
				},
			};
			exchange.transition(ExchangeState::RespondingBody);
			// Pulls one chunk at a time through the scheduler (C9) rather
			// than calling `body.next()` directly: that's what observes
			// cancellation uniformly with the HTTP/1.1 driver and stops the
			// handler's publisher subscription at its next suspension point
			// (§4.6, §5 "Cancellation"). Per-frame flow-control pacing still
			// happens below in `send_with_flow_control`.
			let scheduler = ExchangeScheduler::new(cancellation.clone());
			let mut last_chunk: Option<Bytes> = None;
			let mut cancelled = false;
			let mut pull_err = None;
			'pull: loop {
				match scheduler.pull_batch(&mut body, 1).await {
					Ok((batch, end)) => {
						for chunk in batch {
							if let Some(prev) = last_chunk.take() {
								if let Err(err) =
									send_with_flow_control(&mut send, prev, false, cancellation).await
								{
									pull_err = Some(err);
									break 'pull;
								}
							}
							last_chunk = Some(chunk);
						}
						match end {
							BatchEnd::StreamEnded => break,
							BatchEnd::CreditExhausted => continue,
							BatchEnd::Cancelled => {
								cancelled = true;
								break;
							},
						}
					},
					Err(err) => {
						pull_err = Some(err);
						break;
					},
				}
			}
			if let Some(err) = pull_err {
				return fail_and_reset(errors, exchange, &mut send, err).await;
			}
			if cancelled {
				send.send_reset(h2::Reason::CANCEL);
				exchange.transition(ExchangeState::Reset);
				return Ok(());
			}
			let is_last_and_no_trailers = trailers.is_none();
			if let Some(prev) = last_chunk.take() {
				if let Err(err) =
					send_with_flow_control(&mut send, prev, is_last_and_no_trailers, cancellation).await
				{
					return fail_and_reset(errors, exchange, &mut send, err).await;
				}
			} else if trailers.is_none() {
				if let Err(err) = send_with_flow_control(&mut send, Bytes::new(), true, cancellation).await {
					return fail_and_reset(errors, exchange, &mut send, err).await;
				}
			}
			if let Some(trailers) = trailers {
				exchange.transition(ExchangeState::Trailing);
				if let Err(e) = send.send_trailers(trailers.into_inner()) {
					return fail_and_reset(errors, exchange, &mut send, ExchangeError::Protocol(e.to_string()))
						.await;
				}
			}
		},
	}

	exchange.transition(ExchangeState::Completed);
	Ok(())
}

/// Logs a mid-response write failure through the error-exchange engine and
/// resets the stream (§4.2 escalation). Headers are already on the wire by
/// the time this runs, so there's nothing left to rebuild — only to log and
/// tear down.
async fn fail_and_reset(
	errors: &ErrorExchangeEngine,
	exchange: &mut Exchange,
	send: &mut SendStream<Bytes>,
	err: ExchangeError,
) -> Result<(), ExchangeError> {
	errors.run(exchange, err).await;
	send.send_reset(h2::Reason::INTERNAL_ERROR);
	exchange.transition(ExchangeState::Reset);
	Ok(())
}

/// Sends one chunk honoring the peer's flow-control window (§4.3 rule 2,
/// §5 "Suspension"). `end_stream` is only ever true on the final write for
/// this body (§8 invariant 2: exactly one frame carries `END_STREAM`).
async fn send_with_flow_control(
	send: &mut SendStream<Bytes>,
	chunk: Bytes,
	end_stream: bool,
	cancellation: &CancellationToken,
) -> Result<(), ExchangeError> {
	let mut remaining = chunk;
	loop {
		if remaining.is_empty() {
			send
				.send_data(Bytes::new(), end_stream)
				.map_err(|e| ExchangeError::Protocol(e.to_string()))?;
			return Ok(());
		}

		send.reserve_capacity(remaining.len());
		let available = tokio::select! {
			biased;
			_ = cancellation.cancelled() => {
				send.send_reset(h2::Reason::CANCEL);
				return Ok(());
			}
			capacity = poll_fn(|cx| send.poll_capacity(cx)) => capacity,
		};
		let available = match available {
			Some(Ok(n)) => n,
			Some(Err(e)) => return Err(ExchangeError::Protocol(e.to_string())),
			None => return Err(ExchangeError::Protocol("send stream closed by peer".into())),
		};
		if available == 0 {
			continue;
		}
		let take = available.min(remaining.len());
		let piece = remaining.split_to(take);
		let is_final_piece = remaining.is_empty();
		send
			.send_data(piece, end_stream && is_final_piece)
			.map_err(|e| ExchangeError::Protocol(e.to_string()))?;
		if is_final_piece {
			// The last non-empty piece already carried `end_stream`; looping
			// back here would hit the `remaining.is_empty()` branch above and
			// send a second, illegal DATA frame after END_STREAM (§8
			// invariant 2: exactly one frame carries it).
			return Ok(());
		}
	}
}

/// Builds a pseudo-header `HeaderValue` helper for tests that need to
/// construct a minimal h2 response head without a live connection.
#[cfg(test)]
fn status_header_value(status: StatusCode) -> http::HeaderValue {
	http::HeaderValue::from_str(status.as_str()).expect("valid status value")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_header_value_round_trips() {
		assert_eq!(status_header_value(StatusCode::OK), http::HeaderValue::from_static("200"));
	}
}
