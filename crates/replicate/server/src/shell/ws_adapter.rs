//! Bridges a `tokio-tungstenite` [`WebSocketStream`] — which speaks
//! `Sink`/`Stream` over [`tungstenite::Message`] — to the plain
//! `Sink<Bytes> + Stream<Item = Result<Bytes, E>>` that
//! [`replicate_common::framed::FramedTransport`] is generic over. Every
//! outbound [`Bytes`] becomes one `Message::Binary` frame; inbound frames
//! that aren't `Binary` (ping/pong/text/close) are consumed and skipped
//! rather than surfaced, since the framed transport only ever exchanges
//! binary segments.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

pub struct WsAdapter<S> {
	inner: WebSocketStream<S>,
}

impl<S> WsAdapter<S> {
	pub fn new(inner: WebSocketStream<S>) -> Self {
		Self { inner }
	}
}

impl<S> Stream for WsAdapter<S>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
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

impl<S> Sink<Bytes> for WsAdapter<S>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
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
