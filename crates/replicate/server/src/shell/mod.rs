//! The `ws`/`wss` listener (§6.1, §6.4 `protocol`): replaces the teacher's
//! WebTransport accept loop (`crate::chad`) with a plain TCP listener,
//! optionally TLS-wrapped, handing each accepted socket off to
//! `tokio-tungstenite`'s WebSocket handshake and then to a per-connection
//! [`crate::session::Session`] loop.

pub mod ws_adapter;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use color_eyre::eyre::{Context, Result};
use replicate_common::framed::{CodecError, Delivery, FramedTransport, TransportError};
use replicate_common::ids::{ClientId, ResourceId, SequenceNr};
use replicate_common::message::{ControlMessage, Envelope, MessagePool, SequenceAllocator};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::signal::unix::SignalKind;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{info, info_span, warn, Instrument};

use crate::config::{Args, Protocol};
use crate::resources::Manager;
use crate::session::{AuthContext, Session};

use self::ws_adapter::WsAdapter;

/// Builds a [`rustls::ServerConfig`]-backed [`TlsAcceptor`] from the PEM
/// certificate chain/key pair at the configured paths (§6.4 `wss`).
fn build_tls_acceptor(args: &Args) -> Result<TlsAcceptor> {
	let cert_path = args
		.certificate_path
		.as_ref()
		.context("certificate_path is required for the wss protocol")?;
	let key_path = args
		.private_key_path
		.as_ref()
		.context("private_key_path is required for the wss protocol")?;

	let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
		.collect::<std::io::Result<Vec<_>>>()
		.context("failed to parse certificate chain")?;
	let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))
		.context("failed to parse private key")?
		.context("no private key found in private_key_path")?;

	let config = rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(certs, key)
		.context("invalid certificate/key pair")?;
	Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Runs the configured listener until the process receives a shutdown
/// signal (§5: a clean `ctrl_c` triggers an orderly stop rather than an
/// abrupt kill of in-flight connections; a `HUP` instead notifies every
/// live connection with a `terminate` message before the same clean stop).
pub async fn run(args: Arc<Args>, manager: Arc<Manager>, auth: Arc<AuthContext>) -> Result<()> {
	let port = args.port.unwrap_or(match args.protocol {
		Protocol::Ws => 8080,
		Protocol::Wss => 8443,
	});
	let listener = TcpListener::bind(("0.0.0.0", port))
		.await
		.with_context(|| format!("failed to bind port {port}"))?;
	info!(%port, protocol = ?args.protocol, "listening");

	// §6.4 `extra_local_port`: an additional plain-`ws` listener alongside
	// the main (possibly TLS-wrapped) one, e.g. for same-host tooling that
	// shouldn't need a certificate to reach the server.
	let extra_listener = match args.extra_local_port {
		Some(extra_port) => {
			let listener = TcpListener::bind(("127.0.0.1", extra_port))
				.await
				.with_context(|| format!("failed to bind extra local port {extra_port}"))?;
			info!(port = %extra_port, "listening (extra local port)");
			Some(listener)
		}
		None => None,
	};

	serve(listener, extra_listener, args, manager, auth).await
}

/// Drives already-bound listeners until shutdown. Split out from [`run`] so
/// tests can bind an ephemeral port (`0`) themselves, read back the address
/// the OS assigned, and hand the listener in here rather than guessing a
/// port up front.
pub async fn serve(
	listener: TcpListener,
	extra_listener: Option<TcpListener>,
	args: Arc<Args>,
	manager: Arc<Manager>,
	auth: Arc<AuthContext>,
) -> Result<()> {
	let tls_acceptor = match args.protocol {
		Protocol::Ws => None,
		Protocol::Wss => Some(build_tls_acceptor(&args)?),
	};

	// Every live connection subscribes its own receiver; a `HUP` fans a
	// termination notice out to all of them before `serve` returns (§5).
	let (shutdown_tx, _) = broadcast::channel::<()>(16);

	let main_loop = accept_loop(listener, tls_acceptor, args.clone(), manager.clone(), auth.clone(), shutdown_tx.clone());
	let extra_loop = async {
		match extra_listener {
			Some(listener) => accept_loop(listener, None, args.clone(), manager.clone(), auth.clone(), shutdown_tx.clone()).await,
			None => std::future::pending().await,
		}
	};
	let mut hangup = tokio::signal::unix::signal(SignalKind::hangup()).context("failed to register SIGHUP handler")?;

	tokio::select! {
		result = main_loop => result,
		result = extra_loop => result,
		_ = tokio::signal::ctrl_c() => {
			info!("received shutdown signal");
			Ok(())
		}
		_ = hangup.recv() => {
			info!("received SIGHUP, terminating connections");
			let _ = shutdown_tx.send(());
			Ok(())
		}
	}
}

/// Accepts connections off `listener` forever, optionally TLS-wrapping each
/// one via `tls_acceptor`, and spawns a `drive_connection` task per socket.
async fn accept_loop(
	listener: TcpListener,
	tls_acceptor: Option<TlsAcceptor>,
	args: Arc<Args>,
	manager: Arc<Manager>,
	auth: Arc<AuthContext>,
	shutdown_tx: broadcast::Sender<()>,
) -> Result<()> {
	loop {
		let (stream, peer_addr) = match listener.accept().await {
			Ok(pair) => pair,
			Err(e) => {
				warn!(error = %e, "failed to accept connection");
				continue;
			}
		};
		let _ = stream.set_nodelay(true);

		let args = args.clone();
		let manager = manager.clone();
		let auth = auth.clone();
		let tls_acceptor = tls_acceptor.clone();
		let client_id = ClientId::random();
		let shutdown_rx = shutdown_tx.subscribe();

		tokio::spawn(
			async move {
				let result = match tls_acceptor {
					Some(acceptor) => match acceptor.accept(stream).await {
						Ok(tls_stream) => accept_and_serve(tls_stream, client_id, args, manager, auth, shutdown_rx).await,
						Err(e) => Err(e).context("tls handshake failed"),
					},
					None => accept_and_serve(stream, client_id, args, manager, auth, shutdown_rx).await,
				};
				if let Err(e) = result {
					warn!(error = ?e, "connection ended with error");
				} else {
					info!("connection closed");
				}
			}
			.instrument(info_span!("connection", %client_id, %peer_addr)),
		);
	}
}

async fn accept_and_serve<S>(
	stream: S,
	client_id: ClientId,
	args: Arc<Args>,
	manager: Arc<Manager>,
	auth: Arc<AuthContext>,
	shutdown_rx: broadcast::Receiver<()>,
) -> Result<()>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let ws_stream = tokio_tungstenite::accept_async(stream)
		.await
		.context("websocket handshake failed")?;
	info!("accepted connection");
	let transport = FramedTransport::with_max_segment_size(WsAdapter::new(ws_stream), args.max_segment_size);
	drive_connection(transport, client_id, &manager, &auth, args.pool_size, args.pool_delay_ms, shutdown_rx).await
}

/// The per-connection loop (§4.2/§4.8): reads [`Envelope`] batches off the
/// transport and dispatches them to the [`Session`], and forwards whatever
/// the session emits — replies plus fanned-out [`crate::resources::Notification`]s
/// — back out, pooled per §6.4's `pool_size`/`pool_delay_ms`.
async fn drive_connection<T, E>(
	mut transport: FramedTransport<T>,
	client_id: ClientId,
	manager: &Arc<Manager>,
	auth: &Arc<AuthContext>,
	pool_size: usize,
	pool_delay_ms: u64,
	mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()>
where
	T: futures::Sink<Bytes, Error = E> + futures::Stream<Item = Result<Bytes, E>> + Unpin,
	E: std::error::Error + Send + Sync + 'static,
{
	let (notify_tx, mut notify_rx) = tokio::sync::mpsc::unbounded_channel();
	let mut session = Session::new(client_id, notify_tx);
	let seq_alloc = SequenceAllocator::new();
	let mut pool = MessagePool::new(pool_size.max(1));
	let mut ticker = tokio::time::interval(std::time::Duration::from_millis(pool_delay_ms.max(1)));
	ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			delivery = transport.recv() => {
				match delivery {
					Ok(None) => break,
					Ok(Some(Delivery::FlowAck(_))) => {}
					Ok(Some(Delivery::Message(msg))) => {
						let envelopes: Vec<Envelope> = match serde_json::from_slice(&msg.payload) {
							Ok(e) => e,
							Err(e) => {
								warn!(error = %e, "dropping malformed envelope batch");
								continue;
							}
						};
						for envelope in envelopes {
							let replies = session.handle_message(manager, auth, envelope.message).await;
							if enqueue(&mut pool, &seq_alloc, replies, Some(envelope.seq)) {
								flush(&mut transport, &mut pool, &seq_alloc).await?;
							}
						}
					}
					// §7: a mismatched header version notifies the peer before the
					// connection closes, rather than dying silently.
					Err(TransportError::Codec(CodecError::HeaderVersionMismatch { expected, got })) => {
						warn!(expected, got, "header version mismatch, terminating connection");
						let _ = send_terminate(&mut transport, &seq_alloc, "header version mismatch").await;
						break;
					}
					Err(e) => return Err(e).context("transport receive failed"),
				}
			}
			notification = notify_rx.recv() => {
				let Some(notification) = notification else { break };
				if let Some(replies) = session.handle_notification(notification).await {
					if enqueue(&mut pool, &seq_alloc, replies, None) {
						flush(&mut transport, &mut pool, &seq_alloc).await?;
					}
				}
			}
			_ = ticker.tick() => {
				flush(&mut transport, &mut pool, &seq_alloc).await?;
			}
			_ = shutdown_rx.recv() => {
				info!("terminating connection for server shutdown");
				let _ = send_terminate(&mut transport, &seq_alloc, "server shutting down").await;
				break;
			}
		}
	}

	session.unsubscribe_all();
	let _ = transport.close().await;
	Ok(())
}

/// Sends a `terminate` control message ahead of closing the transport
/// (§5, §7): used both for a `HUP`-driven shutdown and a header-version
/// mismatch, the two cases that require a notice before the connection dies.
async fn send_terminate<T, E>(transport: &mut FramedTransport<T>, seq_alloc: &SequenceAllocator, reason: &str) -> Result<()>
where
	T: futures::Sink<Bytes, Error = E> + futures::Stream<Item = Result<Bytes, E>> + Unpin,
	E: std::error::Error + Send + Sync + 'static,
{
	let envelope = Envelope {
		seq: seq_alloc.next(),
		in_reply_to: None,
		message: ControlMessage::Terminate { reason: reason.to_string() },
	};
	let payload = serde_json::to_vec(&[envelope]).context("failed to serialize terminate message")?;
	transport
		.send_message(ResourceId::from(0), seq_alloc.next(), Bytes::from(payload))
		.await
		.map_err(|e| color_eyre::eyre::eyre!("failed to send terminate: {e}"))
}

/// Queues `messages` for the outbound pool, returning whether the
/// size threshold was reached and an immediate flush should follow.
fn enqueue(
	pool: &mut MessagePool,
	seq_alloc: &SequenceAllocator,
	messages: Vec<ControlMessage>,
	in_reply_to: Option<SequenceNr>,
) -> bool {
	let mut should_flush = false;
	for message in messages {
		if pool.push(Envelope {
			seq: seq_alloc.next(),
			in_reply_to,
			message,
		}) {
			should_flush = true;
		}
	}
	should_flush
}

async fn flush<T, E>(transport: &mut FramedTransport<T>, pool: &mut MessagePool, seq_alloc: &SequenceAllocator) -> Result<()>
where
	T: futures::Sink<Bytes, Error = E> + futures::Stream<Item = Result<Bytes, E>> + Unpin,
	E: std::error::Error + Send + Sync + 'static,
{
	let Some(batch) = pool.begin_flush() else {
		return Ok(());
	};
	let payload = serde_json::to_vec(&batch).context("failed to serialize outbound envelope batch")?;
	let result = transport
		.send_message(ResourceId::from(0), seq_alloc.next(), Bytes::from(payload))
		.await;
	pool.end_flush();
	match result {
		Ok(()) => Ok(()),
		Err(e) => Err(color_eyre::eyre::eyre!("failed to send outbound batch: {e}")),
	}
}
