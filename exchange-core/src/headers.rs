//! Case-insensitive header table with typed views (spec §3, §4.5, C2).
//!
//! Backed by `http::HeaderMap`, which already is an ordered, case-insensitive
//! multimap with O(1) typed lookups by `HeaderName` constant — exactly the
//! "dedicated data structure" the design notes (spec §9) ask for instead of
//! a hand-rolled lazy map. `HeaderStore` adds the write-once invariant
//! (spec §3 invariant a, §8 invariant 1) and the HTTP/2 pseudo-header slot
//! (spec §3 "Stream").

use chrono::{DateTime, Utc};
use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};

use crate::error::ExchangeError;

/// HTTP/2 pseudo-headers, kept apart from the regular header map (spec §3).
#[derive(Debug, Clone, Default)]
pub struct PseudoHeaders {
	pub method: Option<String>,
	pub scheme: Option<String>,
	pub authority: Option<String>,
	pub path: Option<String>,
	pub status: Option<StatusCode>,
}

/// A header table that becomes immutable once the owning message has been
/// written to the wire.
#[derive(Debug, Clone, Default)]
pub struct HeaderStore {
	map: HeaderMap,
	written: bool,
}

impl HeaderStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn from_map(map: HeaderMap) -> Self {
		Self {
			map,
			written: false,
		}
	}

	pub fn is_written(&self) -> bool {
		self.written
	}

	/// Freezes the store. Idempotent.
	pub fn mark_written(&mut self) {
		self.written = true;
	}

	fn check_mutable(&self) -> Result<(), ExchangeError> {
		if self.written {
			Err(ExchangeError::Finalized)
		} else {
			Ok(())
		}
	}

	pub fn set(&mut self, name: HeaderName, value: HeaderValue) -> Result<(), ExchangeError> {
		self.check_mutable()?;
		self.map.insert(name, value);
		Ok(())
	}

	pub fn add(&mut self, name: HeaderName, value: HeaderValue) -> Result<(), ExchangeError> {
		self.check_mutable()?;
		self.map.append(name, value);
		Ok(())
	}

	pub fn remove(&mut self, name: &HeaderName) -> Result<(), ExchangeError> {
		self.check_mutable()?;
		self.map.remove(name);
		Ok(())
	}

	/// Sets a header only if it is not already present — used throughout C4
	/// for the "set only when absent" resource-header rule (spec §9 Open
	/// Questions: the `ResourceData` "contains" check is inverted in the
	/// source; this core always treats it as "set only when absent").
	pub fn set_if_absent(
		&mut self,
		name: HeaderName,
		value: HeaderValue,
	) -> Result<(), ExchangeError> {
		if self.map.contains_key(&name) {
			return Ok(());
		}
		self.set(name, value)
	}

	pub fn get(&self, name: &HeaderName) -> Option<&HeaderValue> {
		self.map.get(name)
	}

	pub fn contains(&self, name: &HeaderName) -> bool {
		self.map.contains_key(name)
	}

	pub fn iter(&self) -> http::header::Iter<'_, HeaderValue> {
		self.map.iter()
	}

	pub fn inner(&self) -> &HeaderMap {
		&self.map
	}

	pub fn into_inner(self) -> HeaderMap {
		self.map
	}

	pub fn len(&self) -> usize {
		self.map.len()
	}

	pub fn is_empty(&self) -> bool {
		self.map.is_empty()
	}

	// ---- typed views ----

	pub fn content_type(&self) -> Option<&str> {
		self.get(&header::CONTENT_TYPE).and_then(|v| v.to_str().ok())
	}

	pub fn content_length(&self) -> Option<u64> {
		self
			.get(&header::CONTENT_LENGTH)
			.and_then(|v| v.to_str().ok())
			.and_then(|v| v.parse().ok())
	}

	pub fn set_content_length(&mut self, len: u64) -> Result<(), ExchangeError> {
		let mut buf = itoa::Buffer::new();
		let value = HeaderValue::from_str(buf.format(len))
			.map_err(|e| ExchangeError::Protocol(e.to_string()))?;
		self.set(header::CONTENT_LENGTH, value)
	}

	pub fn is_chunked(&self) -> bool {
		self
			.get(&header::TRANSFER_ENCODING)
			.and_then(|v| v.to_str().ok())
			.map(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("chunked")))
			.unwrap_or(false)
	}

	pub fn wants_close(&self) -> bool {
		self
			.get(&header::CONNECTION)
			.and_then(|v| v.to_str().ok())
			.map(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("close")))
			.unwrap_or(false)
	}

	pub fn trailer_names(&self) -> Vec<String> {
		self
			.get(&header::TRAILER)
			.and_then(|v| v.to_str().ok())
			.map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
			.unwrap_or_default()
	}

	pub fn cookies(&self) -> impl Iterator<Item = (&str, &str)> {
		self
			.map
			.get_all(header::COOKIE)
			.iter()
			.filter_map(|v| v.to_str().ok())
			.flat_map(|v| v.split(';'))
			.filter_map(|pair| {
				let mut parts = pair.splitn(2, '=');
				let name = parts.next()?.trim();
				let value = parts.next()?.trim();
				if name.is_empty() {
					None
				} else {
					Some((name, value))
				}
			})
	}

	pub fn set_last_modified(&mut self, when: DateTime<Utc>) -> Result<(), ExchangeError> {
		// RFC 5322 date-time, the format `content-length`'s sibling
		// `last-modified` is required to use on the wire.
		let formatted = when.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
		let value =
			HeaderValue::from_str(&formatted).map_err(|e| ExchangeError::Protocol(e.to_string()))?;
		self.set(header::LAST_MODIFIED, value)
	}
}
