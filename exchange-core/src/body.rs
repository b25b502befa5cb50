//! Interceptable response body (C4, spec §4.5).
//!
//! A body container that starts mutable so interceptors/handlers can set or
//! transform it, then freezes into a wire body once the connection takes
//! over. Modeled as an explicit state enum per the re-architecture note in
//! §9 ("mutable-then-frozen semantics ... state enum with explicit
//! transitions"), rather than the inheritance-based abstract body the
//! original used.

use std::pin::Pin;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use http::header::{CONTENT_TYPE, LAST_MODIFIED};

use crate::buf::ByteSequence;
use crate::error::ExchangeError;
use crate::headers::HeaderStore;

/// A finite, demand-driven sequence of byte chunks (§9: "lazy, demand-driven
/// sequences of byte chunks with explicit cancellation"). Used for both
/// request bodies and a streamed response body.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, ExchangeError>> + Send>>;

/// A chunk transform applied to every byte chunk passing through the body.
pub type ChunkTransform = Box<dyn Fn(bytes::Bytes) -> bytes::Bytes + Send + Sync>;

/// What a connected body hands to the wire encoder (C6/C7): either the
/// fully materialized payload, or a publisher to be pulled from in
/// demand-driven batches by the scheduler (C9).
pub enum ConnectedBody {
	Buffered(Bytes),
	Streamed(ChunkStream),
}

/// An externally-owned payload source (file, generated resource, ...) that
/// can report its size, media type and modification time without being
/// fully materialized.
pub trait BodyResource: Send + Sync {
	/// `false` when the resource doesn't exist; maps to [`ExchangeError::NotFound`]
	/// when a caller tries to set it as a body (§4.5).
	fn exists(&self) -> bool;

	fn size(&self) -> Option<u64> {
		None
	}

	fn media_type(&self) -> Option<&str> {
		None
	}

	fn last_modified(&self) -> Option<DateTime<Utc>> {
		None
	}

	/// Reads the resource fully. Only called after `exists()` is confirmed.
	fn read(&self) -> Result<bytes::Bytes, ExchangeError>;
}

enum BodyState {
	Unset,
	Data(ByteSequence),
	Stream(ChunkStream),
	Connected,
}

/// The interceptable body (§3, §4.5). `Transforming` from the spec's state
/// list is folded into the other two states here: a pending transform is
/// simply a queued closure applied eagerly once data exists, or at
/// `connect` if it never does.
pub struct InterceptableBody {
	state: BodyState,
	pending_transforms: Vec<ChunkTransform>,
}

impl Default for InterceptableBody {
	fn default() -> Self {
		Self {
			state: BodyState::Unset,
			pending_transforms: Vec::new(),
		}
	}
}

impl InterceptableBody {
	pub fn new() -> Self {
		Self::default()
	}

	fn check_not_connected(&self) -> Result<(), ExchangeError> {
		match self.state {
			BodyState::Connected => Err(ExchangeError::AlreadyConnected),
			_ => Ok(()),
		}
	}

	pub fn is_connected(&self) -> bool {
		matches!(self.state, BodyState::Connected)
	}

	pub fn is_unset(&self) -> bool {
		matches!(self.state, BodyState::Unset)
	}

	pub fn set_empty(&mut self) -> Result<(), ExchangeError> {
		self.check_not_connected()?;
		self.state = BodyState::Data(ByteSequence::new());
		Ok(())
	}

	pub fn set_raw(&mut self, bytes: bytes::Bytes) -> Result<(), ExchangeError> {
		self.check_not_connected()?;
		let transformed = self.apply_pending(bytes);
		self.state = BodyState::Data(ByteSequence::from_bytes(transformed));
		Ok(())
	}

	pub fn set_string(&mut self, s: impl Into<String>) -> Result<(), ExchangeError> {
		self.set_raw(bytes::Bytes::from(s.into().into_bytes()))
	}

	/// Sets the body to a demand-driven publisher (§3 `InterceptableBody`,
	/// the multi-chunk path exercised by scenario 2 in §8). Pending
	/// transforms are applied lazily as the scheduler pulls chunks.
	pub fn set_stream(&mut self, stream: ChunkStream) -> Result<(), ExchangeError> {
		self.check_not_connected()?;
		let stream = self.wrap_with_pending(stream);
		self.state = BodyState::Stream(stream);
		Ok(())
	}

	fn wrap_with_pending(&mut self, stream: ChunkStream) -> ChunkStream {
		if self.pending_transforms.is_empty() {
			return stream;
		}
		let transforms = std::mem::take(&mut self.pending_transforms);
		Box::pin(futures_util::StreamExt::map(stream, move |item| {
			item.map(|chunk| {
				let mut out = chunk;
				for f in &transforms {
					out = f(out);
				}
				out
			})
		}))
	}

	/// Sets the body from an external resource, populating headers per
	/// §4.5's absent-header rules while `headers` is still mutable.
	pub fn set_resource(
		&mut self,
		resource: &dyn BodyResource,
		headers: &mut HeaderStore,
	) -> Result<(), ExchangeError> {
		self.check_not_connected()?;
		if !resource.exists() {
			return Err(ExchangeError::NotFound);
		}
		if let Some(size) = resource.size() {
			if headers.content_length().is_none() {
				headers.set_content_length(size)?;
			}
		}
		if let Some(media_type) = resource.media_type() {
			if !headers.contains(&CONTENT_TYPE) {
				let value = http::HeaderValue::from_str(media_type)
					.map_err(|e| ExchangeError::Protocol(e.to_string()))?;
				headers.set(CONTENT_TYPE, value)?;
			}
		}
		if let Some(modified) = resource.last_modified() {
			if !headers.contains(&LAST_MODIFIED) {
				headers.set_last_modified(modified)?;
			}
		}
		let data = resource.read()?;
		self.set_raw(data)
	}

	/// Appends a chunk transform to the pipeline (`transform(f).transform(g)`
	/// applies `f` then `g`, per §4.5). Applied eagerly to data already set,
	/// otherwise deferred to the next `set_*`/`connect`.
	pub fn transform(
		&mut self,
		f: impl Fn(bytes::Bytes) -> bytes::Bytes + Send + Sync + 'static,
	) -> Result<(), ExchangeError> {
		self.check_not_connected()?;
		let boxed: ChunkTransform = Box::new(f);
		match &mut self.state {
			BodyState::Data(seq) => {
				let current = seq.clone().into_bytes();
				let transformed = boxed(current);
				self.state = BodyState::Data(ByteSequence::from_bytes(transformed));
			},
			BodyState::Stream(_) => {
				let stream = match std::mem::replace(&mut self.state, BodyState::Unset) {
					BodyState::Stream(s) => s,
					_ => unreachable!("matched above"),
				};
				let wrapped: ChunkStream = Box::pin(futures_util::StreamExt::map(stream, move |item| {
					item.map(|chunk| boxed(chunk))
				}));
				self.state = BodyState::Stream(wrapped);
			},
			BodyState::Unset => {
				self.pending_transforms.push(boxed);
			},
			BodyState::Connected => unreachable!("checked by check_not_connected above"),
		}
		Ok(())
	}

	fn apply_pending(&mut self, bytes: bytes::Bytes) -> bytes::Bytes {
		let mut out = bytes;
		for f in self.pending_transforms.drain(..) {
			out = f(out);
		}
		out
	}

	/// Freezes the body, applying any transforms still pending against
	/// whatever data (possibly none) has been set, and hands the final
	/// payload to the wire encoder.
	pub fn connect(&mut self) -> Result<ConnectedBody, ExchangeError> {
		self.check_not_connected()?;
		match std::mem::replace(&mut self.state, BodyState::Connected) {
			BodyState::Unset => Ok(ConnectedBody::Buffered(Bytes::new())),
			BodyState::Data(seq) => {
				let flattened = seq.into_bytes();
				let transformed = self.apply_pending(flattened);
				Ok(ConnectedBody::Buffered(transformed))
			},
			BodyState::Stream(stream) => Ok(ConnectedBody::Streamed(stream)),
			BodyState::Connected => unreachable!("checked above"),
		}
	}
}

impl ConnectedBody {
	#[cfg(test)]
	fn into_buffered(self) -> Bytes {
		match self {
			ConnectedBody::Buffered(b) => b,
			ConnectedBody::Streamed(_) => panic!("expected a buffered body"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use futures_util::StreamExt;

	struct FakeResource {
		exists: bool,
		size: Option<u64>,
		media_type: Option<&'static str>,
		data: bytes::Bytes,
	}

	impl BodyResource for FakeResource {
		fn exists(&self) -> bool {
			self.exists
		}
		fn size(&self) -> Option<u64> {
			self.size
		}
		fn media_type(&self) -> Option<&str> {
			self.media_type
		}
		fn read(&self) -> Result<bytes::Bytes, ExchangeError> {
			Ok(self.data.clone())
		}
	}

	#[test]
	fn set_after_connect_fails() {
		let mut body = InterceptableBody::new();
		body.set_string("hi").unwrap();
		body.connect().unwrap();
		let err = body.set_string("again").unwrap_err();
		assert!(matches!(err, ExchangeError::AlreadyConnected));
	}

	#[test]
	fn transform_eager_when_data_present() {
		let mut body = InterceptableBody::new();
		body.set_raw(bytes::Bytes::from_static(b"abc")).unwrap();
		body.transform(|b| {
			let mut v = b.to_vec();
			v.make_ascii_uppercase();
			bytes::Bytes::from(v)
		})
		.unwrap();
		let connected = body.connect().unwrap();
		assert_eq!(connected.into_buffered(), bytes::Bytes::from_static(b"ABC"));
	}

	#[test]
	fn transform_deferred_until_connect_when_unset() {
		let mut body = InterceptableBody::new();
		body.transform(|b| {
			let mut v = b.to_vec();
			v.push(b'!');
			bytes::Bytes::from(v)
		})
		.unwrap();
		body.set_raw(bytes::Bytes::from_static(b"hi")).unwrap();
		let connected = body.connect().unwrap();
		assert_eq!(connected.into_buffered(), bytes::Bytes::from_static(b"hi!"));
	}

	#[test]
	fn transform_composes_left_to_right() {
		let mut body = InterceptableBody::new();
		body.set_raw(bytes::Bytes::from_static(b"a")).unwrap();
		body.transform(|b| {
			let mut v = b.to_vec();
			v.push(b'1');
			bytes::Bytes::from(v)
		})
		.unwrap();
		body.transform(|b| {
			let mut v = b.to_vec();
			v.push(b'2');
			bytes::Bytes::from(v)
		})
		.unwrap();
		let connected = body.connect().unwrap();
		assert_eq!(connected.into_buffered(), bytes::Bytes::from_static(b"a12"));
	}

	#[tokio::test]
	async fn streamed_body_applies_pending_transform_per_chunk() {
		let mut body = InterceptableBody::new();
		body.transform(|b| {
			let mut v = b.to_vec();
			v.push(b'!');
			bytes::Bytes::from(v)
		})
		.unwrap();
		let chunks = vec![
			Ok(bytes::Bytes::from_static(b"a")),
			Ok(bytes::Bytes::from_static(b"b")),
		];
		let stream: ChunkStream = Box::pin(futures_util::stream::iter(chunks));
		body.set_stream(stream).unwrap();
		let connected = body.connect().unwrap();
		let ConnectedBody::Streamed(mut stream) = connected else {
			panic!("expected a streamed body");
		};
		let mut collected = Vec::new();
		while let Some(chunk) = stream.next().await {
			collected.push(chunk.unwrap());
		}
		assert_eq!(collected, vec![
			bytes::Bytes::from_static(b"a!"),
			bytes::Bytes::from_static(b"b!"),
		]);
	}

	#[test]
	fn resource_not_found_maps_to_not_found_error() {
		let mut body = InterceptableBody::new();
		let mut headers = HeaderStore::new();
		let resource = FakeResource {
			exists: false,
			size: None,
			media_type: None,
			data: bytes::Bytes::new(),
		};
		let err = body.set_resource(&resource, &mut headers).unwrap_err();
		assert!(matches!(err, ExchangeError::NotFound));
	}

	#[test]
	fn resource_sets_absent_headers_only() {
		let mut body = InterceptableBody::new();
		let mut headers = HeaderStore::new();
		headers
			.set(CONTENT_TYPE, http::HeaderValue::from_static("text/special"))
			.unwrap();
		let resource = FakeResource {
			exists: true,
			size: Some(5),
			media_type: Some("application/octet-stream"),
			data: bytes::Bytes::from_static(b"hello"),
		};
		body.set_resource(&resource, &mut headers).unwrap();
		assert_eq!(headers.content_type(), Some("text/special"));
		assert_eq!(headers.content_length(), Some(5));
	}
}
