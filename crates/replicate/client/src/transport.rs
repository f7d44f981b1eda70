//! Client-side half of the `ws`/`wss` transport (mirrors
//! `replicate_server::shell::ws_adapter`): bridges a `tokio-tungstenite`
//! connection to [`FramedTransport`] and layers [`Envelope`] batching on
//! top, since the wire carries one JSON array of envelopes per binary
//! message (§4.2).

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use eyre::{Context as _, Result};
use futures::{Sink, Stream};
use replicate_common::framed::{Delivery, FramedTransport};
use replicate_common::ids::ResourceId;
use replicate_common::message::{Envelope, SequenceAllocator};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

struct WsAdapter {
	inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Stream for WsAdapter {
	type Item = Result<Bytes, tokio_tungstenite::tungstenite::Error>;

	fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		let this = self.get_mut();
		loop {
			return match Pin::new(&mut this.inner).poll_next(cx) {
				Poll::Ready(Some(Ok(Message::Binary(data)))) => Poll::Ready(Some(Ok(Bytes::from(data)))),
				Poll::Ready(Some(Ok(Message::Close(_)))) => Poll::Ready(None),
				Poll::Ready(Some(Ok(_))) => continue,
				Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
				Poll::Ready(None) => Poll::Ready(None),
				Poll::Pending => Poll::Pending,
			};
		}
	}
}

impl Sink<Bytes> for WsAdapter {
	type Error = tokio_tungstenite::tungstenite::Error;

	fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Pin::new(&mut self.get_mut().inner).poll_ready(cx)
	}

	fn start_send(self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
		Pin::new(&mut self.get_mut().inner).start_send(Message::Binary(item.to_vec()))
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Pin::new(&mut self.get_mut().inner).poll_flush(cx)
	}

	fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Pin::new(&mut self.get_mut().inner).poll_close(cx)
	}
}

/// Connection-wide channel envelope batches travel on (§6.1); resource ids
/// proper start at 1, so 0 is free for this purpose.
const CONTROL_RESOURCE_ID: ResourceId = ResourceId(0);

/// A connected transport that batches [`Envelope`]s the way the server's
/// per-connection loop does: one JSON array per outbound binary message,
/// framed at the segment level by [`FramedTransport`].
pub(crate) struct WsTransport {
	framed: FramedTransport<WsAdapter>,
	seq_alloc: SequenceAllocator,
	inbound: VecDeque<Envelope>,
}

impl WsTransport {
	pub(crate) async fn connect(url: &Url) -> Result<Self> {
		let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
			.await
			.with_context(|| format!("failed to open websocket connection to {url}"))?;
		Ok(Self {
			framed: FramedTransport::new(WsAdapter { inner: stream }),
			seq_alloc: SequenceAllocator::new(),
			inbound: VecDeque::new(),
		})
	}

	pub(crate) async fn send(&mut self, envelope: Envelope) -> Result<()> {
		let payload = serde_json::to_vec(&[envelope]).context("failed to serialize outbound envelope")?;
		self.framed
			.send_message(CONTROL_RESOURCE_ID, self.seq_alloc.next(), Bytes::from(payload))
			.await
			.map_err(|e| eyre::eyre!("failed to send message: {e}"))
	}

	pub(crate) async fn recv(&mut self) -> Result<Envelope> {
		loop {
			if let Some(envelope) = self.inbound.pop_front() {
				return Ok(envelope);
			}
			match self.framed.recv().await.context("transport receive failed")? {
				None => eyre::bail!("connection closed"),
				Some(Delivery::FlowAck(_)) => continue,
				Some(Delivery::Message(msg)) => {
					let envelopes: Vec<Envelope> =
						serde_json::from_slice(&msg.payload).context("received malformed envelope batch")?;
					self.inbound.extend(envelopes);
				}
			}
		}
	}
}
