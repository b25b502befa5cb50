//! HTTP/1.1 connection driver (C6, spec §4.2, §6).
//!
//! Parses the request line/headers with `httparse`, frames the body by
//! content-length or chunked transfer-encoding, and serializes the response
//! per the three body shapes the spec calls out: empty, single-chunk, and
//! multi-chunk/unknown-length (chunked). Exchanges on one connection are
//! processed strictly sequentially (§4.2 "Keep-alive dispatch").

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::body::ConnectedBody;
use crate::error::ExchangeError;
use crate::error_exchange::ErrorExchangeEngine;
use crate::exchange::{Exchange, ExchangeState, HandlerRef, Request};
use crate::headers::HeaderStore;
use crate::scheduler::{BatchEnd, ExchangeScheduler};
use http::{HeaderName, HeaderValue, Method, Version};

const MAX_HEADER_BYTES: usize = 64 * 1024;
const READ_CHUNK: usize = 8 * 1024;

/// How the request body is framed on the wire (RFC 7230 §3.3).
#[derive(Debug, Clone, Copy)]
enum BodyFraming {
	None,
	ContentLength(u64),
	Chunked,
}

struct ParsedHead {
	method: Method,
	target: String,
	version: Version,
	headers: HeaderStore,
	framing: BodyFraming,
}

/// Reads and parses one request head from `stream`, buffering any
/// leftover bytes (start of the body) back into `leftover`.
async fn read_request_head<S>(
	stream: &mut S,
	leftover: &mut BytesMut,
) -> Result<Option<ParsedHead>, ExchangeError>
where
	S: AsyncRead + Unpin,
{
	loop {
		let mut headers_buf = [httparse::EMPTY_HEADER; 64];
		let mut parsed = httparse::Request::new(&mut headers_buf);
		match parsed.parse(leftover) {
			Ok(httparse::Status::Complete(consumed)) => {
				let method = parsed
					.method
					.ok_or_else(|| ExchangeError::Protocol("missing method".into()))?;
				let method = Method::from_bytes(method.as_bytes())
					.map_err(|e| ExchangeError::Protocol(e.to_string()))?;
				let target = parsed
					.path
					.ok_or_else(|| ExchangeError::Protocol("missing request target".into()))?
					.to_string();
				let version = if parsed.version == Some(1) {
					Version::HTTP_11
				} else {
					Version::HTTP_10
				};
				let mut store = HeaderStore::new();
				for h in parsed.headers.iter() {
					let name = HeaderName::from_bytes(h.name.as_bytes())
						.map_err(|e| ExchangeError::Protocol(e.to_string()))?;
					let value = HeaderValue::from_bytes(h.value)
						.map_err(|e| ExchangeError::Protocol(e.to_string()))?;
					store
						.add(name, value)
						.map_err(|e| ExchangeError::Protocol(e.to_string()))?;
				}
				let framing = if store.is_chunked() {
					BodyFraming::Chunked
				} else if let Some(len) = store.content_length() {
					BodyFraming::ContentLength(len)
				} else {
					BodyFraming::None
				};
				let _ = leftover.split_to(consumed);
				return Ok(Some(ParsedHead {
					method,
					target,
					version,
					headers: store,
					framing,
				}));
			},
			Ok(httparse::Status::Partial) => {
				if leftover.len() >= MAX_HEADER_BYTES {
					return Err(ExchangeError::Protocol("request head too large".into()));
				}
				let mut chunk = [0u8; READ_CHUNK];
				let n = stream
					.read(&mut chunk)
					.await
					.map_err(ExchangeError::Io)?;
				if n == 0 {
					if leftover.is_empty() {
						return Ok(None);
					}
					return Err(ExchangeError::Protocol("connection closed mid-request".into()));
				}
				leftover.extend_from_slice(&chunk[..n]);
			},
			Err(e) => return Err(ExchangeError::Protocol(e.to_string())),
		}
	}
}

async fn fill_line<S: AsyncRead + Unpin>(
	stream: &mut S,
	buf: &mut BytesMut,
) -> Result<String, ExchangeError> {
	loop {
		if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
			let line = buf.split_to(pos + 2);
			let line = std::str::from_utf8(&line[..pos])
				.map_err(|e| ExchangeError::Protocol(e.to_string()))?
				.to_string();
			return Ok(line);
		}
		let mut chunk = [0u8; READ_CHUNK];
		let n = stream.read(&mut chunk).await.map_err(ExchangeError::Io)?;
		if n == 0 {
			return Err(ExchangeError::Protocol("connection closed mid-chunk".into()));
		}
		buf.extend_from_slice(&chunk[..n]);
	}
}

async fn read_chunk_size_line<S: AsyncRead + Unpin>(
	stream: &mut S,
	buf: &mut BytesMut,
) -> Result<usize, ExchangeError> {
	let line = fill_line(stream, buf).await?;
	let size_token = line.split(';').next().unwrap_or("").trim();
	usize::from_str_radix(size_token, 16)
		.map_err(|e| ExchangeError::Protocol(format!("bad chunk size: {e}")))
}

async fn consume_crlf<S: AsyncRead + Unpin>(
	stream: &mut S,
	buf: &mut BytesMut,
) -> Result<(), ExchangeError> {
	let line = fill_line(stream, buf).await?;
	if !line.is_empty() {
		return Err(ExchangeError::Protocol("malformed chunk terminator".into()));
	}
	Ok(())
}

async fn read_trailers<S: AsyncRead + Unpin>(
	stream: &mut S,
	buf: &mut BytesMut,
) -> Result<(), ExchangeError> {
	loop {
		let line = fill_line(stream, buf).await?;
		if line.is_empty() {
			return Ok(());
		}
	}
}

/// Drives one HTTP/1.1 connection to completion.
pub struct Http1Connection<S> {
	stream: S,
	handler: HandlerRef,
	errors: ErrorExchangeEngine,
	scheduler: ExchangeScheduler,
}

impl<S> Http1Connection<S>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	pub fn new(stream: S, handler: HandlerRef, errors: ErrorExchangeEngine) -> Self {
		Self::with_cancellation(stream, handler, errors, CancellationToken::new())
	}

	/// Like [`Self::new`], but sharing a connection-drain `CancellationToken`
	/// with the listener (§5 "Shared resources"): cancelling it stops this
	/// connection from starting its next keep-alive exchange and, via the
	/// [`ExchangeScheduler`] it feeds, cancels any body publisher currently
	/// being pulled from.
	pub fn with_cancellation(
		stream: S,
		handler: HandlerRef,
		errors: ErrorExchangeEngine,
		cancellation: CancellationToken,
	) -> Self {
		Self {
			stream,
			handler,
			errors,
			scheduler: ExchangeScheduler::new(cancellation),
		}
	}

	#[instrument(skip(self))]
	pub async fn run(mut self) -> Result<(), ExchangeError> {
		let mut leftover = BytesMut::new();
		loop {
			if self.scheduler.is_cancelled() {
				debug!("connection cancelled, not starting another keep-alive exchange");
				return Ok(());
			}
			let head = read_request_head(&mut self.stream, &mut leftover).await?;
			let Some(head) = head else {
				debug!("connection closed between requests");
				return Ok(());
			};

			// The body stream must not outlive this iteration (it would
			// need to co-own `self.stream`), so it's drained fully before
			// the response for this exchange is serialized. That enforces
			// keep-alive ordering (§4.2) at the cost of true request/
			// response body overlap, which this core doesn't need: the
			// handler sees a fully materialized body.
			let body_bytes =
				drain_body_into_bytes(&mut self.stream, leftover, head.framing).await?;
			leftover = BytesMut::new();

			let scheme = "http".to_string();
			let authority = head
				.headers
				.get(&http::header::HOST)
				.and_then(|v| v.to_str().ok())
				.unwrap_or("")
				.to_string();
			let request = Request::new(
				head.method,
				scheme,
				authority,
				head.target.clone(),
				head.version,
				head.headers,
				Box::pin(futures_util::stream::once(async move { Ok(body_bytes) })),
			);
			let mut exchange = Exchange::new(request);
			exchange.transition(ExchangeState::Running);

			let wants_close = exchange.request.headers.wants_close();
			if let Err(err) = self.handler.handle(&mut exchange).await {
				self
					.errors
					.recover_http1(&mut exchange, err, &mut self.stream, &self.scheduler)
					.await?;
			} else if let Err(err) =
				write_response(&mut self.stream, &mut exchange, &self.scheduler).await
			{
				// §4.2: a write failure mid-response still has to go through
				// the error-exchange engine for its fatal log. By this point
				// `write_response` has already set `partial_response`, so the
				// engine always resolves `Unrecoverable` here and this just
				// closes the connection instead of attempting to serialize
				// a second response.
				self
					.errors
					.recover_http1(&mut exchange, err, &mut self.stream, &self.scheduler)
					.await?;
			}

			if wants_close || exchange.state == ExchangeState::Reset {
				self.stream.flush().await.map_err(ExchangeError::Io)?;
				return Ok(());
			}
		}
	}
}

async fn drain_body_into_bytes<S>(
	stream: &mut S,
	leftover: BytesMut,
	framing: BodyFraming,
) -> Result<Bytes, ExchangeError>
where
	S: AsyncRead + Unpin,
{
	match framing {
		BodyFraming::None => Ok(Bytes::new()),
		BodyFraming::ContentLength(len) => {
			let mut buf = leftover;
			while (buf.len() as u64) < len {
				let mut chunk = [0u8; READ_CHUNK];
				let n = stream.read(&mut chunk).await.map_err(ExchangeError::Io)?;
				if n == 0 {
					return Err(ExchangeError::Protocol("body ended early".into()));
				}
				buf.extend_from_slice(&chunk[..n]);
			}
			Ok(buf.split_to(len as usize).freeze())
		},
		BodyFraming::Chunked => {
			let mut buf = leftover;
			let mut out = BytesMut::new();
			loop {
				let size = read_chunk_size_line(stream, &mut buf).await?;
				if size == 0 {
					read_trailers(stream, &mut buf).await?;
					break;
				}
				while buf.len() < size {
					let mut chunk = [0u8; READ_CHUNK];
					let n = stream.read(&mut chunk).await.map_err(ExchangeError::Io)?;
					if n == 0 {
						return Err(ExchangeError::Protocol("chunked body ended early".into()));
					}
					buf.extend_from_slice(&chunk[..n]);
				}
				out.extend_from_slice(&buf.split_to(size));
				consume_crlf(stream, &mut buf).await?;
			}
			Ok(out.freeze())
		},
	}
}

/// Serializes `exchange.response` per the three shapes in §4.2. Streamed
/// bodies are pulled one chunk at a time through `scheduler` (C9), which is
/// what observes cancellation and transitions the exchange to `Reset` if the
/// connection is torn down mid-body (§4.6 "backpressure ... one chunk
/// (HTTP/1.1 chunked)").
pub async fn write_response<S>(
	stream: &mut S,
	exchange: &mut Exchange,
	scheduler: &ExchangeScheduler,
) -> Result<(), ExchangeError>
where
	S: AsyncWrite + Unpin,
{
	let connected = exchange.response.body.connect()?;
	exchange.partial_response = true;
	exchange.transition(ExchangeState::RespondingHeaders);
	let trailers = exchange.response.trailers.take();

	match connected {
		ConnectedBody::Buffered(bytes) => {
			if trailers.is_some() {
				// A trailer section can't ride on content-length framing
				// (RFC 7230 §4.1.2): force the buffered body into a single
				// chunked frame so trailers set via `Response::set_trailers`
				// actually reach the wire instead of being silently dropped.
				exchange.response.headers.remove(&http::header::CONTENT_LENGTH)?;
				if !exchange.response.headers.is_chunked() {
					exchange.response.headers.set(
						http::header::TRANSFER_ENCODING,
						HeaderValue::from_static("chunked"),
					)?;
				}
				exchange.response.headers.mark_written();
				write_status_and_headers(stream, exchange.response.status, &exchange.response.headers)
					.await?;
				stream.write_all(b"\r\n").await.map_err(ExchangeError::Io)?;
				exchange.transition(ExchangeState::RespondingBody);
				if !bytes.is_empty() {
					let size_line = format!("{:x}\r\n", bytes.len());
					stream.write_all(size_line.as_bytes()).await.map_err(ExchangeError::Io)?;
					stream.write_all(&bytes).await.map_err(ExchangeError::Io)?;
					stream.write_all(b"\r\n").await.map_err(ExchangeError::Io)?;
				}
				exchange.transition(ExchangeState::Trailing);
				stream.write_all(b"0\r\n").await.map_err(ExchangeError::Io)?;
				write_trailers(stream, trailers.as_ref()).await?;
			} else if bytes.is_empty() {
				exchange.response.headers.set_if_absent(
					http::header::CONTENT_LENGTH,
					HeaderValue::from_static("0"),
				)?;
				exchange.response.headers.mark_written();
				write_status_and_headers(stream, exchange.response.status, &exchange.response.headers)
					.await?;
				stream.write_all(b"\r\n").await.map_err(ExchangeError::Io)?;
			} else {
				if exchange.response.headers.content_length().is_none() {
					exchange.response.headers.set_content_length(bytes.len() as u64)?;
				}
				exchange.response.headers.mark_written();
				write_status_and_headers(stream, exchange.response.status, &exchange.response.headers)
					.await?;
				stream.write_all(b"\r\n").await.map_err(ExchangeError::Io)?;
				stream.write_all(&bytes).await.map_err(ExchangeError::Io)?;
			}
		},
		ConnectedBody::Streamed(mut body) => {
			if trailers.is_some() {
				exchange.response.headers.remove(&http::header::CONTENT_LENGTH)?;
			}
			if trailers.is_some()
				|| (!exchange.response.headers.contains(&http::header::CONTENT_LENGTH)
					&& !exchange.response.headers.contains(&http::header::TRANSFER_ENCODING))
			{
				if !exchange.response.headers.is_chunked() {
					exchange.response.headers.set(
						http::header::TRANSFER_ENCODING,
						HeaderValue::from_static("chunked"),
					)?;
				}
			}
			exchange.response.headers.mark_written();
			write_status_and_headers(stream, exchange.response.status, &exchange.response.headers)
				.await?;
			stream.write_all(b"\r\n").await.map_err(ExchangeError::Io)?;
			exchange.transition(ExchangeState::RespondingBody);

			let chunked = exchange.response.headers.is_chunked();
			let mut cancelled = false;
			loop {
				let (batch, end) = scheduler.pull_batch(&mut body, 1).await?;
				for chunk in batch {
					if chunk.is_empty() {
						continue;
					}
					if chunked {
						let size_line = format!("{:x}\r\n", chunk.len());
						stream
							.write_all(size_line.as_bytes())
							.await
							.map_err(ExchangeError::Io)?;
						stream.write_all(&chunk).await.map_err(ExchangeError::Io)?;
						stream.write_all(b"\r\n").await.map_err(ExchangeError::Io)?;
					} else {
						stream.write_all(&chunk).await.map_err(ExchangeError::Io)?;
					}
				}
				match end {
					BatchEnd::StreamEnded => break,
					BatchEnd::CreditExhausted => continue,
					BatchEnd::Cancelled => {
						cancelled = true;
						break;
					},
				}
			}
			if cancelled {
				// Peer reset or connection shutdown mid-body: the scheduler
				// has already stopped pulling from the handler's publisher.
				// No chunked trailer is well-formed at this point, so the
				// exchange is reset and the connection closes without one
				// (§4.6 "Cancellation").
				stream.flush().await.map_err(ExchangeError::Io)?;
				exchange.transition(ExchangeState::Reset);
				return Ok(());
			}
			if chunked {
				exchange.transition(ExchangeState::Trailing);
				stream.write_all(b"0\r\n").await.map_err(ExchangeError::Io)?;
				write_trailers(stream, trailers.as_ref()).await?;
			}
		},
	}

	stream.flush().await.map_err(ExchangeError::Io)?;
	exchange.transition(ExchangeState::Completed);
	Ok(())
}

/// Writes the trailer section that terminates a chunked body: each header
/// line from `trailers` (if any), then the final blank-line terminator.
async fn write_trailers<S>(
	stream: &mut S,
	trailers: Option<&HeaderStore>,
) -> Result<(), ExchangeError>
where
	S: AsyncWrite + Unpin,
{
	if let Some(trailers) = trailers {
		for (name, value) in trailers.iter() {
			stream.write_all(name.as_str().as_bytes()).await.map_err(ExchangeError::Io)?;
			stream.write_all(b": ").await.map_err(ExchangeError::Io)?;
			stream.write_all(value.as_bytes()).await.map_err(ExchangeError::Io)?;
			stream.write_all(b"\r\n").await.map_err(ExchangeError::Io)?;
		}
	}
	stream.write_all(b"\r\n").await.map_err(ExchangeError::Io)?;
	Ok(())
}

async fn write_status_and_headers<S>(
	stream: &mut S,
	status: http::StatusCode,
	headers: &HeaderStore,
) -> Result<(), ExchangeError>
where
	S: AsyncWrite + Unpin,
{
	let status_line = format!(
		"HTTP/1.1 {} {}\r\n",
		status.as_str(),
		status.canonical_reason().unwrap_or("")
	);
	stream
		.write_all(status_line.as_bytes())
		.await
		.map_err(ExchangeError::Io)?;
	for (name, value) in headers.iter() {
		stream.write_all(name.as_str().as_bytes()).await.map_err(ExchangeError::Io)?;
		stream.write_all(b": ").await.map_err(ExchangeError::Io)?;
		stream.write_all(value.as_bytes()).await.map_err(ExchangeError::Io)?;
		stream.write_all(b"\r\n").await.map_err(ExchangeError::Io)?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::duplex;

	#[tokio::test]
	async fn parses_simple_get_request_head() {
		let (mut client, server) = duplex(1024);
		client
			.write_all(b"GET /ping HTTP/1.1\r\nhost: example.com\r\n\r\n")
			.await
			.unwrap();
		let mut server = server;
		let mut leftover = BytesMut::new();
		let head = read_request_head(&mut server, &mut leftover)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(head.method, Method::GET);
		assert_eq!(head.target, "/ping");
		assert!(matches!(head.framing, BodyFraming::None));
	}

	#[tokio::test]
	async fn returns_none_on_clean_close_before_any_bytes() {
		let (client, server) = duplex(1024);
		drop(client);
		let mut server = server;
		let mut leftover = BytesMut::new();
		let head = read_request_head(&mut server, &mut leftover).await.unwrap();
		assert!(head.is_none());
	}

	#[tokio::test]
	async fn single_chunk_response_writes_pong() {
		let (mut client, server) = duplex(8192);
		client
			.write_all(b"GET /ping HTTP/1.1\r\nhost: x\r\n\r\n")
			.await
			.unwrap();
		let mut server = server;
		let mut leftover = BytesMut::new();
		let head = read_request_head(&mut server, &mut leftover).await.unwrap().unwrap();
		let request = Request::new(
			head.method,
			"http",
			"x",
			head.target,
			head.version,
			head.headers,
			Box::pin(futures_util::stream::empty()),
		);
		let mut exchange = Exchange::new(request);
		exchange.response.body.set_string("pong").unwrap();
		let scheduler = ExchangeScheduler::new(CancellationToken::new());
		write_response(&mut server, &mut exchange, &scheduler).await.unwrap();
		drop(server);

		let mut out = Vec::new();
		client.read_to_end(&mut out).await.unwrap();
		assert_eq!(out, b"HTTP/1.1 200 OK\r\ncontent-length: 4\r\n\r\npong");
	}

	#[tokio::test]
	async fn buffered_body_with_trailers_is_forced_into_chunked_framing() {
		let (mut client, server) = duplex(8192);
		client
			.write_all(b"GET /ping HTTP/1.1\r\nhost: x\r\n\r\n")
			.await
			.unwrap();
		let mut server = server;
		let mut leftover = BytesMut::new();
		let head = read_request_head(&mut server, &mut leftover).await.unwrap().unwrap();
		let request = Request::new(
			head.method,
			"http",
			"x",
			head.target,
			head.version,
			head.headers,
			Box::pin(futures_util::stream::empty()),
		);
		let mut exchange = Exchange::new(request);
		exchange.response.body.set_string("pong").unwrap();
		let mut trailers = HeaderStore::new();
		trailers
			.set(
				HeaderName::from_static("x-checksum"),
				HeaderValue::from_static("abc123"),
			)
			.unwrap();
		exchange.response.set_trailers(trailers).unwrap();
		let scheduler = ExchangeScheduler::new(CancellationToken::new());
		write_response(&mut server, &mut exchange, &scheduler).await.unwrap();
		drop(server);

		let mut out = Vec::new();
		client.read_to_end(&mut out).await.unwrap();
		assert_eq!(
			out,
			b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n4\r\npong\r\n0\r\nx-checksum: abc123\r\n\r\n"
		);
	}

	#[tokio::test]
	async fn chunked_stream_response_matches_scenario_two() {
		let (client_half, mut server) = duplex(8192);
		let request = Request::new(
			Method::GET,
			"http",
			"x",
			"/stream",
			Version::HTTP_11,
			HeaderStore::new(),
			Box::pin(futures_util::stream::empty()),
		);
		let mut exchange = Exchange::new(request);
		let chunks = vec![
			Ok(Bytes::from_static(b"a")),
			Ok(Bytes::from_static(b"b")),
			Ok(Bytes::from_static(b"c")),
		];
		exchange
			.response
			.body
			.set_stream(Box::pin(futures_util::stream::iter(chunks)))
			.unwrap();
		let scheduler = ExchangeScheduler::new(CancellationToken::new());
		write_response(&mut server, &mut exchange, &scheduler).await.unwrap();
		drop(server);

		let mut client_half = client_half;
		let mut out = Vec::new();
		client_half.read_to_end(&mut out).await.unwrap();
		assert_eq!(
			out,
			b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n1\r\na\r\n1\r\nb\r\n1\r\nc\r\n0\r\n\r\n"
		);
	}

	#[tokio::test]
	async fn cancellation_mid_stream_resets_exchange_without_chunked_trailer() {
		let (client_half, mut server) = duplex(8192);
		let request = Request::new(
			Method::GET,
			"http",
			"x",
			"/stream",
			Version::HTTP_11,
			HeaderStore::new(),
			Box::pin(futures_util::stream::empty()),
		);
		let mut exchange = Exchange::new(request);
		let chunks = vec![Ok(Bytes::from_static(b"a")), Ok(Bytes::from_static(b"b"))];
		exchange
			.response
			.body
			.set_stream(Box::pin(futures_util::stream::iter(chunks)))
			.unwrap();

		let token = CancellationToken::new();
		token.cancel();
		let scheduler = ExchangeScheduler::new(token);
		write_response(&mut server, &mut exchange, &scheduler).await.unwrap();
		drop(server);

		assert_eq!(exchange.state, ExchangeState::Reset);
		let mut client_half = client_half;
		let mut out = Vec::new();
		client_half.read_to_end(&mut out).await.unwrap();
		// Headers went out, but no chunk frames and no "0\r\n\r\n" trailer:
		// the scheduler observed cancellation before pulling anything.
		assert_eq!(
			out,
			b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n"
		);
	}
}
