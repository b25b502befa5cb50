//! End-to-end HTTP/2 coverage, driving a real `h2` client against
//! `Http2Connection` over an in-memory duplex pipe: the echo scenario
//! (single HEADERS + single DATA, `END_STREAM` on the final frame only)
//! and the "handler writes headers then throws" fallback to RST_STREAM.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use exchange_core::{ErrorExchangeEngine, Exchange, ExchangeError, Handler, Http2Connection};
use futures_util::StreamExt;
use http::{Request, StatusCode};
use tokio::io::duplex;
use tokio_util::sync::CancellationToken;

struct Http2ScenarioHandler;

#[async_trait]
impl Handler for Http2ScenarioHandler {
	async fn handle(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
		match exchange.request.path.as_str() {
			"/echo" => {
				let mut body = exchange.request.take_body().expect("body taken once");
				let mut collected = Vec::new();
				while let Some(chunk) = body.next().await {
					collected.extend_from_slice(&chunk?);
				}
				exchange.response.body.set_raw(Bytes::from(collected))
			},
			"/fail-after-headers" => {
				exchange.response.headers.mark_written();
				Err(ExchangeError::Internal(anyhow::anyhow!("boom after headers were written")))
			},
			"/pending" => {
				// Never produces a chunk; exercises the scheduler-mediated
				// cancellation path (§4.6, §5 "Cancellation") rather than
				// any real data flow.
				exchange.response.body.set_stream(Box::pin(futures_util::stream::pending()))
			},
			_ => Err(ExchangeError::NotFound),
		}
	}
}

async fn spawn_server() -> tokio::io::DuplexStream {
	spawn_server_with_cancellation(CancellationToken::new()).await
}

async fn spawn_server_with_cancellation(cancellation: CancellationToken) -> tokio::io::DuplexStream {
	let (client_io, server_io) = duplex(8192);
	let handler = Arc::new(Http2ScenarioHandler);
	let errors = ErrorExchangeEngine::new(None);
	tokio::spawn(async move {
		let connection = Http2Connection::handshake(server_io, handler, errors, cancellation)
			.await
			.unwrap();
		connection.run().await.unwrap();
	});
	client_io
}

#[tokio::test]
async fn scenario_three_echo_produces_one_headers_and_one_data_frame() {
	let client_io = spawn_server().await;
	let (mut send_request, connection) = h2::client::handshake(client_io).await.unwrap();
	tokio::spawn(async move {
		let _ = connection.await;
	});
	send_request.ready().await.unwrap();

	let request = Request::builder()
		.method("POST")
		.uri("https://example.test/echo")
		.body(())
		.unwrap();
	let (response_fut, mut send_stream) = send_request.send_request(request, false).unwrap();
	send_stream.send_data(Bytes::from_static(&[0x01, 0x02, 0x03]), true).unwrap();

	let response = response_fut.await.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	assert_eq!(response.headers().get("content-length").unwrap(), "3");

	let mut body = response.into_body();
	let mut collected = Vec::new();
	let mut chunk_count = 0;
	while let Some(chunk) = body.next().await {
		chunk_count += 1;
		collected.extend_from_slice(&chunk.unwrap());
	}
	assert_eq!(collected, vec![0x01, 0x02, 0x03]);
	assert_eq!(chunk_count, 1, "exactly one DATA frame carries the echoed payload");
}

#[tokio::test]
async fn scenario_five_handler_throws_after_writing_headers_resets_stream() {
	let client_io = spawn_server().await;
	let (mut send_request, connection) = h2::client::handshake(client_io).await.unwrap();
	tokio::spawn(async move {
		let _ = connection.await;
	});
	send_request.ready().await.unwrap();

	let request = Request::builder()
		.method("GET")
		.uri("https://example.test/fail-after-headers")
		.body(())
		.unwrap();
	let (response_fut, _send_stream) = send_request.send_request(request, true).unwrap();

	let response = response_fut.await.unwrap();
	assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

	let mut body = response.into_body();
	assert!(body.next().await.is_none(), "no DATA frames follow the reset");
}

#[tokio::test]
async fn connection_shutdown_resets_a_stream_stuck_mid_body() {
	let cancellation = CancellationToken::new();
	let client_io = spawn_server_with_cancellation(cancellation.clone()).await;
	let (mut send_request, connection) = h2::client::handshake(client_io).await.unwrap();
	tokio::spawn(async move {
		let _ = connection.await;
	});
	send_request.ready().await.unwrap();

	let request = Request::builder()
		.method("GET")
		.uri("https://example.test/pending")
		.body(())
		.unwrap();
	let (response_fut, _send_stream) = send_request.send_request(request, true).unwrap();

	let response = response_fut.await.unwrap();
	assert_eq!(response.status(), StatusCode::OK, "headers precede the stuck body");

	// The handler's publisher never yields; cancelling the connection-level
	// token is what the scheduler (C9) observes to stop waiting on it and
	// reset the stream, rather than hanging forever (§4.6, §5 "Cancellation").
	cancellation.cancel();

	let mut body = response.into_body();
	match tokio::time::timeout(std::time::Duration::from_secs(5), body.next())
		.await
		.expect("cancellation resets the stream instead of hanging")
	{
		None => {},
		Some(Err(_)) => {},
		Some(Ok(chunk)) => panic!("unexpected data chunk after cancellation: {chunk:?}"),
	}
}
