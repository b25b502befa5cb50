//! Scenario 6: a handler producing a two-element JSON publisher, framed by
//! the media-type conversion service and served over HTTP/1.1.

use std::sync::Arc;

use async_trait::async_trait;
use exchange_core::{
	ConverterRegistry, ConvertValue, ErrorExchangeEngine, Exchange, ExchangeError, Handler,
	Http1Connection,
};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

struct JsonStreamHandler {
	registry: ConverterRegistry,
}

#[async_trait]
impl Handler for JsonStreamHandler {
	async fn handle(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
		let converter = self.registry.get_converter("application/json")?;
		let values = vec![
			ConvertValue::Json(serde_json::json!({"x": 1})),
			ConvertValue::Json(serde_json::json!({"x": 2})),
		];
		let framed = converter.encode_stream(&values)?;
		exchange.response.headers.set(
			http::header::CONTENT_TYPE,
			http::HeaderValue::from_static("application/json"),
		)?;
		exchange.response.body.set_raw(framed)
	}
}

#[tokio::test]
async fn scenario_six_two_element_json_publisher_frames_as_array() {
	let (mut client, server) = duplex(8192);
	let handler = Arc::new(JsonStreamHandler {
		registry: ConverterRegistry::with_defaults(),
	});
	let errors = ErrorExchangeEngine::new(None);
	let connection = Http1Connection::new(server, handler, errors);
	let task = tokio::spawn(connection.run());

	client
		.write_all(b"GET /items HTTP/1.1\r\nhost: x\r\nconnection: close\r\n\r\n")
		.await
		.unwrap();
	client.shutdown().await.unwrap();

	let mut out = Vec::new();
	client.read_to_end(&mut out).await.unwrap();
	task.await.unwrap().unwrap();

	let response = String::from_utf8(out).unwrap();
	let (head, body) = response.split_once("\r\n\r\n").unwrap();
	assert!(head.contains("content-type: application/json"));
	assert_eq!(body, "[{\"x\":1},{\"x\":2}]");
}
