//! The message layer above the framed transport (§4.2): typed control
//! messages, sequence number assignment, reply correlation, and the
//! outbound pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::oneshot;

use crate::ids::{ClientResourceId, Revision, SequenceNr};
use crate::resource_spec::ResourceSpec;

/// Mirrors the table in §6.2. Serde-tagged on `type` so the wire
/// representation is `{ "type": "subscribe", ... }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
	#[serde(rename = "subscribe")]
	Subscribe {
		#[serde(rename = "resourceId")]
		resource_id: ClientResourceId,
		#[serde(rename = "resourceSpec")]
		resource_spec: ResourceSpec,
		#[serde(default)]
		revision: Option<u64>,
	},
	#[serde(rename = "unsubscribe")]
	Unsubscribe {
		#[serde(rename = "resourceId")]
		resource_id: ClientResourceId,
	},
	#[serde(rename = "releaseResource")]
	ReleaseResource {
		#[serde(rename = "resourceId")]
		resource_id: ClientResourceId,
	},
	#[serde(rename = "write")]
	Write {
		#[serde(rename = "resourceId")]
		resource_id: ClientResourceId,
		list: Vec<Json>,
	},
	#[serde(rename = "writeAck")]
	WriteAck {
		#[serde(rename = "resourceId")]
		resource_id: ClientResourceId,
		revision: u64,
		info: Json,
		status: bool,
		#[serde(rename = "inReplyTo")]
		in_reply_to: u64,
	},
	#[serde(rename = "resourceUpdate")]
	ResourceUpdate {
		#[serde(rename = "resourceId")]
		resource_id: ClientResourceId,
		update: Vec<Json>,
		revision: u64,
		#[serde(default)]
		error: bool,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		reason: Option<String>,
	},
	#[serde(rename = "define")]
	Define {
		#[serde(rename = "resourceId")]
		resource_id: ClientResourceId,
		list: Vec<Json>,
	},
	#[serde(rename = "login")]
	Login {
		username: String,
		password: String,
		#[serde(rename = "loginSeqNr")]
		login_seq_nr: u64,
	},
	#[serde(rename = "createAccount")]
	CreateAccount {
		username: String,
		password: String,
		email: String,
		#[serde(rename = "loginSeqNr")]
		login_seq_nr: u64,
	},
	#[serde(rename = "logout")]
	Logout,
	#[serde(rename = "loginStatus")]
	LoginStatus {
		username: String,
		authenticated: bool,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		reason: Option<String>,
		#[serde(rename = "loginSeqNr")]
		login_seq_nr: u64,
	},
	#[serde(rename = "terminate")]
	Terminate { reason: String },
	#[serde(rename = "reloadApplication")]
	ReloadApplication { reason: String },
}

/// `{ seq, inReplyTo?, message }`; the envelope that actually crosses the
/// framed transport as one message's JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
	pub seq: SequenceNr,
	#[serde(rename = "inReplyTo", default, skip_serializing_if = "Option::is_none")]
	pub in_reply_to: Option<SequenceNr>,
	pub message: ControlMessage,
}

/// Assigns strictly increasing, positive sequence numbers to outgoing
/// messages. Backed by an `AtomicU64` so it can be shared across the
/// connection's write-side tasks without a mutex.
#[derive(Debug)]
pub struct SequenceAllocator {
	next: AtomicU64,
}

impl Default for SequenceAllocator {
	fn default() -> Self {
		Self::new()
	}
}

impl SequenceAllocator {
	pub fn new() -> Self {
		Self {
			next: AtomicU64::new(1),
		}
	}

	pub fn next(&self) -> SequenceNr {
		SequenceNr::from(self.next.fetch_add(1, Ordering::Relaxed))
	}
}

/// Resolution of a reply that was awaited on a [`PendingReplies`] entry.
#[derive(Debug)]
pub enum ReplyOutcome {
	Received(Envelope),
	ShutDown,
}

/// `pendingReply[sequenceNr] -> (handler, deadline?)`, as in §4.2. The
/// handler here is a oneshot sender; awaiting the receiver is the "handler"
/// itself, which is more idiomatic in async Rust than a stored closure.
#[derive(Debug, Default)]
pub struct PendingReplies {
	waiters: HashMap<SequenceNr, (oneshot::Sender<ReplyOutcome>, Option<Duration>)>,
}

impl PendingReplies {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a wait for the reply to `seq`, returning the receiver.
	pub fn register(&mut self, seq: SequenceNr, deadline: Option<Duration>) -> oneshot::Receiver<ReplyOutcome> {
		let (tx, rx) = oneshot::channel();
		self.waiters.insert(seq, (tx, deadline));
		rx
	}

	/// Route an inbound reply to its waiter, if still registered. A reply to
	/// an id with no waiter (already timed out, or unsolicited) is dropped.
	pub fn resolve(&mut self, envelope: Envelope) {
		if let Some(in_reply_to) = envelope.in_reply_to {
			if let Some((tx, _)) = self.waiters.remove(&in_reply_to) {
				let _ = tx.send(ReplyOutcome::Received(envelope));
			}
		}
	}

	/// Invoked on shutdown: every pending reply handler is invoked with a
	/// failure, per §4.2/§5.
	pub fn shut_down_all(&mut self) {
		for (_, (tx, _)) in self.waiters.drain() {
			let _ = tx.send(ReplyOutcome::ShutDown);
		}
	}

	pub fn earliest_deadline(&self) -> Option<Duration> {
		self.waiters.values().filter_map(|(_, d)| *d).min()
	}

	pub fn is_empty(&self) -> bool {
		self.waiters.is_empty()
	}
}

/// Buffers outbound envelopes and flushes them when either the pool size or
/// the pool-delay timer fires; a flush already in flight is a no-op, guarded
/// here by `flushing`.
pub struct MessagePool {
	buffer: Vec<Envelope>,
	pool_size: usize,
	flushing: bool,
}

impl MessagePool {
	pub fn new(pool_size: usize) -> Self {
		Self {
			buffer: Vec::new(),
			pool_size,
			flushing: false,
		}
	}

	/// Queue `envelope`. Returns `true` if the pool is now at or above its
	/// size threshold and should be flushed immediately.
	pub fn push(&mut self, envelope: Envelope) -> bool {
		self.buffer.push(envelope);
		self.buffer.len() >= self.pool_size
	}

	pub fn is_empty(&self) -> bool {
		self.buffer.is_empty()
	}

	/// Take everything queued, for an actual flush. A second call while a
	/// flush from the first is still outstanding returns `None`.
	pub fn begin_flush(&mut self) -> Option<Vec<Envelope>> {
		if self.flushing || self.buffer.is_empty() {
			return None;
		}
		self.flushing = true;
		Some(std::mem::take(&mut self.buffer))
	}

	pub fn end_flush(&mut self) {
		self.flushing = false;
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn sequence_allocator_is_strictly_increasing() {
		let alloc = SequenceAllocator::new();
		let a = alloc.next();
		let b = alloc.next();
		assert!(a.get() < b.get());
		assert_eq!(a.get(), 1);
	}

	#[tokio::test]
	async fn pending_reply_resolves_registered_waiter() {
		let mut pending = PendingReplies::new();
		let rx = pending.register(SequenceNr::from(5), None);
		pending.resolve(Envelope {
			seq: SequenceNr::from(99),
			in_reply_to: Some(SequenceNr::from(5)),
			message: ControlMessage::Logout,
		});
		let outcome = rx.await.unwrap();
		assert!(matches!(outcome, ReplyOutcome::Received(_)));
	}

	#[tokio::test]
	async fn shutdown_resolves_all_waiters_as_failures() {
		let mut pending = PendingReplies::new();
		let rx1 = pending.register(SequenceNr::from(1), None);
		let rx2 = pending.register(SequenceNr::from(2), None);
		pending.shut_down_all();
		assert!(matches!(rx1.await.unwrap(), ReplyOutcome::ShutDown));
		assert!(matches!(rx2.await.unwrap(), ReplyOutcome::ShutDown));
	}

	#[test]
	fn message_pool_flush_in_flight_is_noop() {
		let mut pool = MessagePool::new(10);
		pool.push(Envelope {
			seq: SequenceNr::from(1),
			in_reply_to: None,
			message: ControlMessage::Logout,
		});
		let batch = pool.begin_flush();
		assert!(batch.is_some());
		// A second flush attempt while the first is still "in flight" is a no-op.
		assert!(pool.begin_flush().is_none());
		pool.end_flush();
	}

	#[test]
	fn message_pool_signals_flush_at_size_threshold() {
		let mut pool = MessagePool::new(2);
		let env = || Envelope {
			seq: SequenceNr::from(1),
			in_reply_to: None,
			message: ControlMessage::Logout,
		};
		assert!(!pool.push(env()));
		assert!(pool.push(env()));
	}
}
