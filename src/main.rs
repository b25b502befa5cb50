use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use exchange_core::{
	Exchange, ErrorExchangeEngine, ExchangeError, Handler, HandlerRef, Http1Connection,
	Http2Connection, NegotiationError, Protocol, ProtocolNegotiator,
};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Command-line surface for the demonstration binary (§10.3): the exchange
/// core itself takes no CLI, env, or on-disk configuration.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
	/// Address to bind the listener on.
	#[arg(short, long, default_value = "0.0.0.0:8443")]
	bind: SocketAddr,

	/// Path to a YAML config file for anything not worth a flag.
	#[arg(short, long, value_name = "file")]
	file: Option<PathBuf>,

	/// TLS certificate chain (PEM). Self-signed if omitted.
	#[arg(long, value_name = "cert")]
	tls_cert: Option<PathBuf>,

	/// TLS private key (PEM). Self-signed if omitted.
	#[arg(long, value_name = "key")]
	tls_key: Option<PathBuf>,

	/// Idle timeout for connections still in the ALPN handshake.
	#[arg(long, default_value_t = 10)]
	idle_timeout_secs: u64,
}

#[derive(Clone, Deserialize)]
struct Config {
	#[serde(default = "default_grace_period_secs")]
	drain_grace_period_secs: u64,
}

fn default_grace_period_secs() -> u64 {
	5
}

impl Default for Config {
	fn default() -> Self {
		Self {
			drain_grace_period_secs: default_grace_period_secs(),
		}
	}
}

/// A minimal handler exercising the exchange core end to end: `GET /ping`
/// returns `pong`; anything else is a 404 routed through the error chain.
struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
	async fn handle(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
		if exchange.request.path == "/ping" {
			exchange.response.body.set_string("pong")?;
			Ok(())
		} else {
			Err(ExchangeError::NotFound)
		}
	}
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
	match path {
		None => Ok(Config::default()),
		Some(path) => {
			let contents = std::fs::read_to_string(path)
				.with_context(|| format!("reading config file {}", path.display()))?;
			serde_yaml::from_str(&contents).context("parsing config file")
		},
	}
}

fn load_tls_acceptor(args: &Args) -> Result<TlsAcceptor> {
	let (cert_chain, key) = match (&args.tls_cert, &args.tls_key) {
		(Some(cert_path), Some(key_path)) => {
			let cert_pem = std::fs::read(cert_path).context("reading TLS certificate")?;
			let key_pem = std::fs::read(key_path).context("reading TLS private key")?;
			let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
				.collect::<std::result::Result<Vec<_>, _>>()
				.context("parsing TLS certificate chain")?;
			let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
				.context("parsing TLS private key")?
				.context("no private key found")?;
			(certs, key)
		},
		_ => {
			info!("no TLS cert/key provided, generating a self-signed certificate");
			let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
				.context("generating self-signed certificate")?;
			let cert = generated.cert.der().clone();
			let key =
				rustls::pki_types::PrivateKeyDer::Pkcs8(generated.signing_key.serialize_der().into());
			(vec![cert], key)
		},
	};

	let mut server_config = rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(cert_chain, key)
		.context("building TLS server config")?;
	server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

	Ok(TlsAcceptor::from(Arc::new(server_config)))
}

async fn serve_connection(
	stream: TcpStream,
	acceptor: TlsAcceptor,
	handler: HandlerRef,
	errors: ErrorExchangeEngine,
	idle_timeout: Duration,
	cancellation: CancellationToken,
) -> Result<(), ExchangeError> {
	let negotiator = ProtocolNegotiator::new(idle_timeout);
	let (tls_stream, protocol) = negotiator
		.negotiate(|| async {
			let tls_stream = acceptor.accept(stream).await?;
			let protocol = tls_stream.get_ref().1.alpn_protocol().map(|p| p.to_vec());
			Ok((tls_stream, protocol))
		})
		.await
		.map_err(negotiation_to_exchange_error)?;

	match protocol {
		Protocol::Http1 => {
			Http1Connection::with_cancellation(tls_stream, handler, errors, cancellation)
				.run()
				.await
		},
		Protocol::Http2 => {
			Http2Connection::handshake(tls_stream, handler, errors, cancellation)
				.await?
				.run()
				.await
		},
	}
}

fn negotiation_to_exchange_error(err: NegotiationError) -> ExchangeError {
	match err {
		NegotiationError::IdleTimeout => ExchangeError::IdleTimeout,
		other => ExchangeError::Protocol(other.to_string()),
	}
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();

	let args = Args::parse();
	let config = load_config(args.file.as_ref())?;
	let acceptor = load_tls_acceptor(&args)?;

	let handler: HandlerRef = Arc::new(PingHandler);
	let errors = ErrorExchangeEngine::new(None);
	let idle_timeout = Duration::from_secs(args.idle_timeout_secs);
	let shutdown = CancellationToken::new();

	let listener = TcpListener::bind(args.bind)
		.await
		.with_context(|| format!("binding {}", args.bind))?;
	info!(addr = %args.bind, "listening");

	let mut connections = tokio::task::JoinSet::new();
	loop {
		tokio::select! {
			biased;
			_ = tokio::signal::ctrl_c() => {
				info!("shutdown requested, draining connections");
				shutdown.cancel();
				break;
			}
			accepted = listener.accept() => {
				let (stream, peer) = accepted.context("accepting connection")?;
				let acceptor = acceptor.clone();
				let handler = handler.clone();
				let errors = errors.clone();
				let cancellation = shutdown.child_token();
				connections.spawn(async move {
					if let Err(err) =
						serve_connection(stream, acceptor, handler, errors, idle_timeout, cancellation).await
					{
						warn!(%peer, error = %err, "connection ended with an error");
					}
				});
			}
		}
	}

	let grace_period = Duration::from_secs(config.drain_grace_period_secs);
	if tokio::time::timeout(grace_period, async {
		while connections.join_next().await.is_some() {}
	})
	.await
	.is_err()
	{
		error!("drain grace period elapsed, aborting remaining connections");
		connections.abort_all();
	}

	Ok(())
}
