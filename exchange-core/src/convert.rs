//! Media-type conversion service (C3, spec §4.7).
//!
//! A small registry mapping a normalized content type to a
//! [`MediaTypeConverter`]. Values flowing through a converter are scalars or
//! byte/string payloads (§8 round-trip property); streams of such values are
//! framed by the converter itself, which is what makes JSON-array framing
//! for multi-element streams (never NDJSON) a converter concern rather than
//! something bolted onto the body layer.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::ExchangeError;

/// A value that can cross the converter boundary.
///
/// This core ships converters for the subset of scalar kinds needed to
/// exercise the round-trip property in §8: `OctetStreamConverter` round-trips
/// `Bytes`, `PlainTextConverter` round-trips `Str`, and `JsonConverter`
/// round-trips `Bool`/`I64`/`F64`/`DateTime` (it reconstructs the most
/// specific variant a decoded JSON scalar can carry, rather than always
/// returning `Json`). Additional scalar kinds (big integers, currencies,
/// locales, regex patterns, ...) are extension points, per the Open
/// Questions in §9, not implemented here.
#[derive(Debug, Clone, PartialEq)]
pub enum ConvertValue {
	Bytes(Bytes),
	Str(String),
	Bool(bool),
	I64(i64),
	F64(f64),
	DateTime(DateTime<Utc>),
	Json(serde_json::Value),
}

impl fmt::Display for ConvertValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ConvertValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
			ConvertValue::Str(s) => write!(f, "{s}"),
			ConvertValue::Bool(b) => write!(f, "{b}"),
			ConvertValue::I64(v) => write!(f, "{v}"),
			ConvertValue::F64(v) => write!(f, "{v}"),
			ConvertValue::DateTime(v) => write!(f, "{}", v.to_rfc3339()),
			ConvertValue::Json(v) => write!(f, "{v}"),
		}
	}
}

/// Encodes/decodes values for one media type.
///
/// `encode_stream` is the framing entry point for multi-element publishers
/// (§4.7, §8 invariant 5): implementors that support streaming override it;
/// the default wraps `encode` per element with no separators, which is
/// correct for the byte/string converters (concatenation is their natural
/// framing) but wrong for anything that needs delimiters — `JsonConverter`
/// overrides it.
pub trait MediaTypeConverter: Send + Sync {
	/// The exact, normalized media type this converter is registered under.
	fn media_type(&self) -> &str;

	fn encode(&self, value: &ConvertValue) -> Result<Bytes, ExchangeError>;

	fn decode(&self, bytes: &[u8]) -> Result<ConvertValue, ExchangeError>;

	/// Frames a finite sequence of values into a single payload.
	fn encode_stream(&self, values: &[ConvertValue]) -> Result<Bytes, ExchangeError> {
		let mut out = Vec::new();
		for value in values {
			out.extend_from_slice(&self.encode(value)?);
		}
		Ok(Bytes::from(out))
	}
}

/// UTF-8 string passthrough, registered for `text/plain`.
pub struct PlainTextConverter;

impl MediaTypeConverter for PlainTextConverter {
	fn media_type(&self) -> &str {
		mime::TEXT_PLAIN.as_ref()
	}

	fn encode(&self, value: &ConvertValue) -> Result<Bytes, ExchangeError> {
		let s = match value {
			ConvertValue::Str(s) => s.clone(),
			other => other.to_string(),
		};
		Ok(Bytes::from(s.into_bytes()))
	}

	fn decode(&self, bytes: &[u8]) -> Result<ConvertValue, ExchangeError> {
		let s = std::str::from_utf8(bytes)
			.map_err(|e| ExchangeError::Converter(e.to_string()))?
			.to_string();
		Ok(ConvertValue::Str(s))
	}
}

/// Raw byte passthrough, registered for `application/octet-stream`.
pub struct OctetStreamConverter;

impl MediaTypeConverter for OctetStreamConverter {
	fn media_type(&self) -> &str {
		mime::APPLICATION_OCTET_STREAM.as_ref()
	}

	fn encode(&self, value: &ConvertValue) -> Result<Bytes, ExchangeError> {
		match value {
			ConvertValue::Bytes(b) => Ok(b.clone()),
			other => Err(ExchangeError::Converter(format!(
				"octet-stream converter cannot encode {other:?}"
			))),
		}
	}

	fn decode(&self, bytes: &[u8]) -> Result<ConvertValue, ExchangeError> {
		Ok(ConvertValue::Bytes(Bytes::copy_from_slice(bytes)))
	}
}

/// `application/json`, with array framing for multi-element streams
/// (§4.7, §8 invariant 5).
pub struct JsonConverter;

impl JsonConverter {
	fn to_json(value: &ConvertValue) -> Result<serde_json::Value, ExchangeError> {
		Ok(match value {
			ConvertValue::Json(v) => v.clone(),
			ConvertValue::Str(s) => serde_json::Value::String(s.clone()),
			ConvertValue::Bool(b) => serde_json::Value::Bool(*b),
			ConvertValue::I64(v) => serde_json::Value::from(*v),
			ConvertValue::F64(v) => serde_json::Number::from_f64(*v)
				.map(serde_json::Value::Number)
				.ok_or_else(|| ExchangeError::Converter("non-finite float".to_string()))?,
			ConvertValue::DateTime(v) => serde_json::Value::String(v.to_rfc3339()),
			ConvertValue::Bytes(b) => {
				serde_json::from_slice(b).map_err(|e| ExchangeError::Converter(e.to_string()))?
			},
		})
	}

	/// Reconstructs the most specific `ConvertValue` a JSON scalar can carry,
	/// so `decode` actually round-trips `Bool`/`I64`/`F64`/`DateTime` instead
	/// of flattening every decode into `Json`. A string that parses as
	/// RFC 3339 becomes `DateTime`; since JSON carries no separate date-time
	/// type, a `Str` whose contents happen to look like an RFC 3339 timestamp
	/// decodes as `DateTime` too — the one case this converter cannot
	/// distinguish on the wire alone.
	fn from_json(value: serde_json::Value) -> ConvertValue {
		match value {
			serde_json::Value::Bool(b) => ConvertValue::Bool(b),
			serde_json::Value::Number(n) => {
				if let Some(i) = n.as_i64() {
					ConvertValue::I64(i)
				} else if let Some(f) = n.as_f64() {
					ConvertValue::F64(f)
				} else {
					ConvertValue::Json(serde_json::Value::Number(n))
				}
			},
			serde_json::Value::String(s) => match DateTime::parse_from_rfc3339(&s) {
				Ok(dt) => ConvertValue::DateTime(dt.with_timezone(&Utc)),
				Err(_) => ConvertValue::Str(s),
			},
			other => ConvertValue::Json(other),
		}
	}
}

impl MediaTypeConverter for JsonConverter {
	fn media_type(&self) -> &str {
		mime::APPLICATION_JSON.as_ref()
	}

	fn encode(&self, value: &ConvertValue) -> Result<Bytes, ExchangeError> {
		let json = Self::to_json(value)?;
		serde_json::to_vec(&json)
			.map(Bytes::from)
			.map_err(|e| ExchangeError::Converter(e.to_string()))
	}

	fn decode(&self, bytes: &[u8]) -> Result<ConvertValue, ExchangeError> {
		let value: serde_json::Value =
			serde_json::from_slice(bytes).map_err(|e| ExchangeError::Converter(e.to_string()))?;
		Ok(Self::from_json(value))
	}

	fn encode_stream(&self, values: &[ConvertValue]) -> Result<Bytes, ExchangeError> {
		let mut out = Vec::new();
		out.push(b'[');
		for (i, value) in values.iter().enumerate() {
			if i > 0 {
				out.push(b',');
			}
			out.extend_from_slice(&self.encode(value)?);
		}
		out.push(b']');
		Ok(Bytes::from(out))
	}
}

/// Normalizes a content-type token per §4.7: a bare token (no `/`) becomes
/// `application/<token>`; matching is otherwise case-insensitive. Parsed
/// through `mime::Mime` (the same crate the corpus reaches for to classify
/// `content-type`, see `crates/agentgateway/src/http/mod.rs`'s
/// `content_type_str.parse::<mime::Mime>()`), which also strips any
/// `;`-delimited parameters (e.g. `; charset=utf-8`) since the registry
/// keys on the type/subtype pair alone.
pub fn normalize_media_type(input: &str) -> String {
	let candidate = input.trim();
	let candidate = if candidate.contains('/') {
		candidate.to_string()
	} else {
		format!("application/{candidate}")
	};
	match candidate.parse::<mime::Mime>() {
		Ok(parsed) => format!("{}/{}", parsed.type_(), parsed.subtype()),
		Err(_) => candidate.split(';').next().unwrap_or(&candidate).trim().to_ascii_lowercase(),
	}
}

/// Resolves a [`MediaTypeConverter`] by normalized content type (C3,
/// §4.7: `DataConversionService.get_converter`).
#[derive(Default)]
pub struct ConverterRegistry {
	converters: HashMap<String, Box<dyn MediaTypeConverter>>,
}

impl ConverterRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// A registry preloaded with the converters this core ships (§8
	/// round-trip property: byte sequences, UTF-8 strings, JSON).
	pub fn with_defaults() -> Self {
		let mut registry = Self::new();
		registry.register(Box::new(PlainTextConverter));
		registry.register(Box::new(OctetStreamConverter));
		registry.register(Box::new(JsonConverter));
		registry
	}

	pub fn register(&mut self, converter: Box<dyn MediaTypeConverter>) {
		let key = normalize_media_type(converter.media_type());
		self.converters.insert(key, converter);
	}

	pub fn get_converter(&self, media_type: &str) -> Result<&dyn MediaTypeConverter, ExchangeError> {
		let key = normalize_media_type(media_type);
		self
			.converters
			.get(&key)
			.map(|c| c.as_ref())
			.ok_or_else(|| ExchangeError::MissingConverter(key))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn normalizes_bare_token_to_application_subtype() {
		assert_eq!(normalize_media_type("JSON"), "application/json");
		assert_eq!(normalize_media_type("text/plain; charset=utf-8"), "text/plain");
	}

	#[test]
	fn registry_resolves_case_insensitively() {
		let registry = ConverterRegistry::with_defaults();
		assert!(registry.get_converter("APPLICATION/JSON").is_ok());
		assert!(matches!(
			registry.get_converter("application/xml"),
			Err(ExchangeError::MissingConverter(_))
		));
	}

	#[test]
	fn json_stream_framing_uses_array_with_single_comma() {
		let converter = JsonConverter;
		let values = vec![
			ConvertValue::Json(serde_json::json!({"x": 1})),
			ConvertValue::Json(serde_json::json!({"x": 2})),
		];
		let framed = converter.encode_stream(&values).unwrap();
		assert_eq!(framed, Bytes::from_static(b"[{\"x\":1},{\"x\":2}]"));
	}

	#[test]
	fn json_round_trip() {
		let converter = JsonConverter;
		let original = ConvertValue::Json(serde_json::json!({"a": [1,2,3]}));
		let encoded = converter.encode(&original).unwrap();
		let decoded = converter.decode(&encoded).unwrap();
		assert_eq!(original, decoded);
	}

	#[test]
	fn plain_text_round_trip() {
		let converter = PlainTextConverter;
		let original = ConvertValue::Str("hello world".to_string());
		let encoded = converter.encode(&original).unwrap();
		let decoded = converter.decode(&encoded).unwrap();
		assert_eq!(original, decoded);
	}

	#[test]
	fn json_round_trips_bool_i64_f64_and_datetime() {
		let converter = JsonConverter;
		for original in [
			ConvertValue::Bool(true),
			ConvertValue::I64(-42),
			ConvertValue::F64(3.5),
			ConvertValue::DateTime(DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc)),
		] {
			let encoded = converter.encode(&original).unwrap();
			let decoded = converter.decode(&encoded).unwrap();
			assert_eq!(original, decoded);
		}
	}

	#[test]
	fn octet_stream_round_trip() {
		let converter = OctetStreamConverter;
		let original = ConvertValue::Bytes(Bytes::from_static(b"\x00\x01binary"));
		let encoded = converter.encode(&original).unwrap();
		let decoded = converter.decode(&encoded).unwrap();
		assert_eq!(original, decoded);
	}
}
