//! A thin client for exercising a `replicate-server` over the wire.
//!
//! This is deliberately minimal: it tracks just enough per-resource state
//! (`revision` and the list of writes not yet acknowledged) to honor the
//! reconnect contract described alongside the wire protocol — resubscribe
//! with `fromRevision = revision` and resubmit every unacknowledged write —
//! so that integration tests can drive a real server end to end without a
//! full client-side data model.

mod transport;

use std::collections::BTreeMap;
use std::time::Duration;

use eyre::{bail, Context, Result};
use replicate_common::auth_token::BearerCredentials;
use replicate_common::ids::{ClientResourceId, Revision};
use replicate_common::message::{ControlMessage, Envelope, PendingReplies, ReplyOutcome, SequenceAllocator};
use replicate_common::resource_spec::ResourceSpec;
use serde_json::Value as Json;
use url::Url;

use crate::transport::WsTransport;

/// Tracks what a subscribed resource looked like the last time we heard
/// from the server, plus any writes still awaiting a `writeAck`.
#[derive(Debug, Clone)]
struct ResourceState {
	spec: ResourceSpec,
	revision: Revision,
	elements: BTreeMap<String, Json>,
	unacked_writes: Vec<Vec<Json>>,
}

impl ResourceState {
	fn new(spec: ResourceSpec) -> Self {
		Self {
			spec,
			revision: Revision::from(0),
			elements: BTreeMap::new(),
			unacked_writes: Vec::new(),
		}
	}

	fn apply_update(&mut self, update: &[Json], revision: u64) {
		for element in update {
			let Some(ident) = element.get("ident").and_then(Json::as_str) else {
				continue;
			};
			if element.get("value").map(|v| v.get("type") == Some(&Json::String("xdrDelete".into()))) == Some(true) {
				self.elements.remove(ident);
			} else if let Some(value) = element.get("value") {
				self.elements.insert(ident.to_string(), value.clone());
			}
		}
		self.revision = Revision::from(revision);
	}
}

/// A connected client session. One [`Client`] owns one transport; call
/// [`Client::reconnect`] to replace it after a disconnect while keeping all
/// tracked subscription/write state so resubscription and resubmission
/// happen automatically.
pub struct Client {
	url: Url,
	credentials: Option<BearerCredentials>,
	transport: WsTransport,
	seq_alloc: SequenceAllocator,
	pending: PendingReplies,
	next_client_resource_id: u64,
	resources: BTreeMap<ClientResourceId, ResourceState>,
}

/// How long to wait for a correlated reply before giving up, matching the
/// "reply has not arrived by its deadline" shutdown condition — a client
/// observes the same timeout locally rather than hanging forever.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

impl Client {
	/// Connects to `url` (a `ws://` or `wss://` address) and, if `credentials`
	/// is given, logs in before returning.
	pub async fn connect(url: Url, credentials: Option<BearerCredentials>) -> Result<Self> {
		let transport = WsTransport::connect(&url).await?;
		let mut client = Self {
			url,
			credentials,
			transport,
			seq_alloc: SequenceAllocator::new(),
			pending: PendingReplies::new(),
			next_client_resource_id: 1,
			resources: BTreeMap::new(),
		};
		if let Some(creds) = client.credentials.clone() {
			client.login(&creds.username, &creds.password).await?;
		}
		Ok(client)
	}

	/// Tears down the current transport and reconnects to the same url,
	/// then resubscribes every tracked resource at its last-seen revision
	/// and resubmits every write that never received a `writeAck` — the
	/// client half of the reconnect contract.
	pub async fn reconnect(&mut self) -> Result<()> {
		// Per §4.2/§5: a connection's shutdown hands every outstanding
		// pending-reply waiter a failure rather than leaving it hanging.
		self.pending.shut_down_all();
		self.transport = WsTransport::connect(&self.url).await?;
		if let Some(creds) = self.credentials.clone() {
			self.login(&creds.username, &creds.password).await?;
		}

		let client_resource_ids: Vec<_> = self.resources.keys().copied().collect();
		for client_resource_id in client_resource_ids {
			let (spec, revision, writes) = {
				let state = &self.resources[&client_resource_id];
				(state.spec.clone(), state.revision, state.unacked_writes.clone())
			};
			self.send_subscribe(client_resource_id, spec, Some(revision.get())).await?;
			for write in writes {
				self.send_write(client_resource_id, write).await?;
			}
		}
		Ok(())
	}

	/// Subscribes to `spec`, returning the id the caller should use to refer
	/// to it in subsequent `write`/`unsubscribe` calls.
	pub async fn subscribe(&mut self, spec: ResourceSpec) -> Result<ClientResourceId> {
		let client_resource_id = ClientResourceId::from(self.next_client_resource_id);
		self.next_client_resource_id += 1;
		self.resources.insert(client_resource_id, ResourceState::new(spec.clone()));
		self.send_subscribe(client_resource_id, spec, None).await?;
		Ok(client_resource_id)
	}

	async fn send_subscribe(&mut self, client_resource_id: ClientResourceId, spec: ResourceSpec, revision: Option<u64>) -> Result<()> {
		let reply = self
			.request(ControlMessage::Subscribe {
				resource_id: client_resource_id,
				resource_spec: spec,
				revision,
			})
			.await?;
		let ControlMessage::ResourceUpdate {
			update, revision, error, reason, ..
		} = reply
		else {
			bail!("expected resourceUpdate in reply to subscribe, got {reply:?}");
		};
		if error {
			bail!("subscribe denied: {}", reason.unwrap_or_default());
		}
		if let Some(state) = self.resources.get_mut(&client_resource_id) {
			state.apply_update(&update, revision);
		}
		Ok(())
	}

	/// Writes `list` to the resource named by `client_resource_id`, tracking
	/// it as unacknowledged until the matching `writeAck` arrives so that a
	/// later `reconnect` can resubmit it if the connection drops first.
	pub async fn write(&mut self, client_resource_id: ClientResourceId, list: Vec<Json>) -> Result<(u64, Json)> {
		if !self.resources.contains_key(&client_resource_id) {
			bail!("unknown client resource id {client_resource_id:?}; call subscribe first");
		}
		self.send_write(client_resource_id, list).await
	}

	async fn send_write(&mut self, client_resource_id: ClientResourceId, list: Vec<Json>) -> Result<(u64, Json)> {
		if let Some(state) = self.resources.get_mut(&client_resource_id) {
			state.unacked_writes.push(list.clone());
		}
		let reply = self
			.request(ControlMessage::Write {
				resource_id: client_resource_id,
				list: list.clone(),
			})
			.await?;
		let ControlMessage::WriteAck {
			revision, info, status, ..
		} = reply
		else {
			bail!("expected writeAck in reply to write, got {reply:?}");
		};
		if let Some(state) = self.resources.get_mut(&client_resource_id) {
			state.unacked_writes.retain(|w| w != &list);
		}
		if !status {
			bail!("write rejected: {info}");
		}
		Ok((revision, info))
	}

	/// Authenticates over the current connection.
	pub async fn login(&mut self, username: &str, password: &str) -> Result<()> {
		let reply = self
			.request(ControlMessage::Login {
				username: username.to_string(),
				password: password.to_string(),
				login_seq_nr: 0,
			})
			.await?;
		let ControlMessage::LoginStatus { authenticated, reason, .. } = reply else {
			bail!("expected loginStatus in reply to login, got {reply:?}");
		};
		if !authenticated {
			bail!("login failed: {}", reason.unwrap_or_default());
		}
		Ok(())
	}

	/// The elements currently known for a subscribed resource, as last
	/// reconstructed from `resourceUpdate`s.
	pub fn elements(&self, client_resource_id: ClientResourceId) -> Option<&BTreeMap<String, Json>> {
		self.resources.get(&client_resource_id).map(|s| &s.elements)
	}

	pub fn revision(&self, client_resource_id: ClientResourceId) -> Option<Revision> {
		self.resources.get(&client_resource_id).map(|s| s.revision)
	}

	/// Sends `message`, then reads envelopes until the one that replies to
	/// it, applying any `resourceUpdate`s for already-subscribed resources
	/// seen along the way (this is how a fan-out notification to some other
	/// subscription on the same connection would be observed). Correlation
	/// goes through [`PendingReplies`] rather than a hand-rolled loop over
	/// `in_reply_to`, per §4.2's `pendingReply[sequenceNr]` registry.
	async fn request(&mut self, message: ControlMessage) -> Result<ControlMessage> {
		let seq = self.seq_alloc.next();
		self.transport
			.send(Envelope {
				seq,
				in_reply_to: None,
				message,
			})
			.await
			.context("failed to send request")?;

		let mut receiver = self.pending.register(seq, Some(REPLY_TIMEOUT));
		let outcome = tokio::time::timeout(REPLY_TIMEOUT, async {
			loop {
				tokio::select! {
					biased;
					outcome = &mut receiver => return outcome.context("pending-reply channel dropped"),
					envelope = self.transport.recv() => {
						let envelope = envelope.context("connection closed while waiting for reply")?;
						self.observe(&envelope);
						self.pending.resolve(envelope);
					}
				}
			}
		})
		.await
		.context("timed out waiting for reply")??;

		match outcome {
			ReplyOutcome::Received(envelope) => Ok(envelope.message),
			ReplyOutcome::ShutDown => bail!("connection shut down while waiting for reply"),
		}
	}

	/// Applies any already-subscribed resource's `resourceUpdate` to local
	/// bookkeeping, independent of whether it was the message we were
	/// waiting on.
	fn observe(&mut self, envelope: &Envelope) {
		if let ControlMessage::ResourceUpdate {
			resource_id, update, revision, error, ..
		} = &envelope.message
		{
			if !error {
				if let Some(state) = self.resources.get_mut(resource_id) {
					state.apply_update(update, *revision);
				}
			}
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn resource_state_applies_delete_sentinel() {
		let mut state = ResourceState::new(ResourceSpec::Metadata);
		state.apply_update(&[serde_json::json!({"ident": "a", "value": {"type": "str", "value": "x"}})], 1);
		assert!(state.elements.contains_key("a"));
		state.apply_update(&[serde_json::json!({"ident": "a", "value": {"type": "xdrDelete"}})], 2);
		assert!(!state.elements.contains_key("a"));
		assert_eq!(state.revision, Revision::from(2));
	}
}
