//! HTTP/1.1 + HTTP/2 server exchange core: reactive payload streaming, an
//! error-exchange fallback chain, an interceptable response body, and a
//! media-type conversion service. Every other concern of the application
//! framework this core is part of (configuration, discovery, LDAP, SQL,
//! session, JOSE/JWT, Web client, gRPC) is an external collaborator and is
//! not implemented here.

pub mod body;
pub mod buf;
pub mod convert;
pub mod error;
pub mod error_exchange;
pub mod exchange;
pub mod headers;
pub mod http1;
pub mod http2;
pub mod negotiate;
pub mod scheduler;

pub use body::{BodyResource, ConnectedBody, InterceptableBody};
pub use buf::ByteSequence;
pub use convert::{ConverterRegistry, ConvertValue, MediaTypeConverter};
pub use error::{ExchangeError, NegotiationError};
pub use error_exchange::{ErrorExchangeEngine, ErrorOutcome};
pub use exchange::{
	ErrorExchange, ErrorHandler, ErrorHandlerRef, Exchange, ExchangeContext, ExchangeState,
	Handler, HandlerRef, Request, Response,
};
pub use headers::{HeaderStore, PseudoHeaders};
pub use http1::Http1Connection;
pub use http2::Http2Connection;
pub use negotiate::{Protocol, ProtocolNegotiator};
pub use scheduler::{BatchEnd, ExchangeScheduler};
