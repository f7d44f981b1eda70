//! §4.8 Session & Message Handlers: the per-connection state a [`crate::shell`]
//! listener drives as it reads [`ControlMessage`]s off one
//! [`replicate_common::framed::FramedTransport`] and forwards
//! [`Notification`]s from whatever resources the connection has subscribed
//! to. One [`Session`] lives for the lifetime of one connection; nothing in
//! here talks to the network directly.

use std::collections::HashMap;
use std::sync::Arc;

use replicate_common::element::ResourceElement;
use replicate_common::identifiers::{IdentifierChannel, IndexEntry, TemplateEntry};
use replicate_common::ids::{ClientId, ClientResourceId, IndexId, ResourceId, TemplateId, ROOT_ID};
use replicate_common::message::ControlMessage;
use replicate_common::resource_spec::ResourceSpec;
use replicate_common::value::Value;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};

use crate::auth::{Credentials, CredentialStore, RuleKind, RuleStore};
use crate::error::SessionError;
use crate::resources::{Manager, Notification, NotificationSender, ResourceHandle, WriteEntry};

/// What a session needs to resolve `subscribe`/`write` authorization and
/// `login`/`createAccount` (§4.5, §6.4 `local_mode`/`public_data_access`).
pub struct AuthContext {
	pub rules: RuleStore,
	pub credentials: Arc<dyn CredentialStore>,
	pub public_data_access: bool,
	pub local_mode: bool,
}

/// `(owner, type, name)` a [`ResourceSpec`] resolves to for `RuleStore`
/// purposes. Table/external resources have no distinct "owner" field in the
/// spec itself, so their owning app name doubles as both.
fn owner_kind_name(spec: &ResourceSpec) -> (String, RuleKind, String) {
	match spec {
		ResourceSpec::AppState { owner, app } => (owner.clone(), RuleKind::AppState, app.clone()),
		ResourceSpec::Table { app, path } => (
			app.clone(),
			RuleKind::Table,
			if path.is_empty() { app.clone() } else { path.join("/") },
		),
		ResourceSpec::Metadata => (String::new(), RuleKind::Metadata, "metadata".to_string()),
		ResourceSpec::External { app, path, .. } => (
			app.clone(),
			RuleKind::External,
			if path.is_empty() { app.clone() } else { path.join("/") },
		),
	}
}

#[derive(Clone)]
struct Subscription {
	resource_id: ResourceId,
	subscriber_id: replicate_common::ids::SubscriberId,
	handle: ResourceHandle,
	spec: ResourceSpec,
}

/// One connection's worth of state: who it's authenticated as, which
/// resources it has live subscriptions on, and the per-resource
/// [`IdentifierChannel`] that translates template/index ids for each.
pub struct Session {
	pub client_id: ClientId,
	user: Option<String>,
	notify: NotificationSender,
	subscriptions: HashMap<ClientResourceId, Subscription>,
	by_resource_id: HashMap<ResourceId, ClientResourceId>,
	identifier_channels: HashMap<ResourceId, IdentifierChannel>,
}

impl Session {
	pub fn new(client_id: ClientId, notify: NotificationSender) -> Self {
		Self {
			client_id,
			user: None,
			notify,
			subscriptions: HashMap::new(),
			by_resource_id: HashMap::new(),
			identifier_channels: HashMap::new(),
		}
	}

	pub fn user(&self) -> Option<&str> {
		self.user.as_deref()
	}

	/// Releases every subscription this session holds. Called when the
	/// connection is torn down (§5: a session never leaves a dangling
	/// subscriber registration behind on the resources it touched).
	pub fn unsubscribe_all(&mut self) {
		for (_, sub) in self.subscriptions.drain() {
			sub.handle.unsubscribe(sub.subscriber_id);
		}
		self.by_resource_id.clear();
		self.identifier_channels.clear();
	}

	fn drop_subscription(&mut self, client_resource_id: ClientResourceId) {
		if let Some(sub) = self.subscriptions.remove(&client_resource_id) {
			self.by_resource_id.remove(&sub.resource_id);
			self.identifier_channels.remove(&sub.resource_id);
		}
	}

	/// Dispatch one inbound [`ControlMessage`], returning zero or more
	/// messages to send back (the wire envelope's `seq`/`inReplyTo` are the
	/// caller's concern, per §4.2).
	pub async fn handle_message(
		&mut self,
		manager: &Arc<Manager>,
		auth: &AuthContext,
		message: ControlMessage,
	) -> Vec<ControlMessage> {
		match message {
			ControlMessage::Subscribe {
				resource_id,
				resource_spec,
				revision,
			} => self.handle_subscribe(manager, auth, resource_id, resource_spec, revision).await,
			ControlMessage::Unsubscribe { resource_id } => {
				if let Some(sub) = self.subscriptions.get(&resource_id).cloned() {
					sub.handle.unsubscribe(sub.subscriber_id);
					self.drop_subscription(resource_id);
				}
				Vec::new()
			}
			ControlMessage::ReleaseResource { resource_id } => {
				if let Some(sub) = self.subscriptions.get(&resource_id).cloned() {
					sub.handle.release_resource(sub.subscriber_id);
					self.drop_subscription(resource_id);
				}
				Vec::new()
			}
			ControlMessage::Write { resource_id, list } => self.handle_write(resource_id, list).await,
			ControlMessage::Define { resource_id, list } => self.handle_define(resource_id, list).await,
			ControlMessage::Login {
				username,
				password,
				login_seq_nr,
			} => self.handle_login(auth, username, password, login_seq_nr).await,
			ControlMessage::CreateAccount {
				username,
				password,
				email,
				login_seq_nr,
			} => self.handle_create_account(auth, username, password, email, login_seq_nr).await,
			ControlMessage::Logout => {
				self.handle_logout(auth);
				Vec::new()
			}
			other @ (ControlMessage::WriteAck { .. }
			| ControlMessage::ResourceUpdate { .. }
			| ControlMessage::LoginStatus { .. }
			| ControlMessage::Terminate { .. }
			| ControlMessage::ReloadApplication { .. }) => {
				tracing::warn!(?other, "ignoring server-originated message type from peer");
				Vec::new()
			}
		}
	}

	async fn handle_subscribe(
		&mut self,
		manager: &Arc<Manager>,
		auth: &AuthContext,
		resource_id: ClientResourceId,
		spec: ResourceSpec,
		revision: Option<u64>,
	) -> Vec<ControlMessage> {
		let (owner, kind, name) = owner_kind_name(&spec);
		let accessor = self.user.clone().unwrap_or_else(|| "anonymous".to_string());
		let allowed =
			auth.local_mode || auth.rules.resolve(&owner, kind, &name, &accessor, auth.public_data_access, true);
		if !allowed {
			return vec![denial(resource_id, "not authorized")];
		}

		let handle = manager.get_resource_by_spec(&spec);
		let subscriber_id = match handle.subscribe(self.notify.clone()).await {
			Ok(id) => id,
			Err(e) => return vec![denial(resource_id, &e.to_string())],
		};
		let from_revision = revision.map(replicate_common::ids::Revision::from);
		let snapshot = match handle.get_all_elements(from_revision).await {
			Ok(s) => s,
			Err(e) => {
				handle.unsubscribe(subscriber_id);
				return vec![denial(resource_id, &e.to_string())];
			}
		};

		self.subscriptions.insert(
			resource_id,
			Subscription {
				resource_id: handle.id,
				subscriber_id,
				handle: handle.clone(),
				spec: spec.clone(),
			},
		);
		self.by_resource_id.insert(handle.id, resource_id);
		let channel = self.identifier_channels.entry(handle.id).or_default();

		let mut update = Vec::with_capacity(snapshot.elements.len());
		for element in &snapshot.elements {
			match marshal_outbound_element(element, &spec, channel, &handle).await {
				Ok(j) => update.push(j),
				Err(e) => tracing::warn!(error = %e, ident = %element.ident, "failed to marshal element on subscribe"),
			}
		}
		let mut out = flush_definitions(channel, resource_id);
		out.push(ControlMessage::ResourceUpdate {
			resource_id,
			update,
			revision: snapshot.last_revision.get(),
			error: false,
			reason: None,
		});
		out
	}

	async fn handle_write(&mut self, resource_id: ClientResourceId, list: Vec<Json>) -> Vec<ControlMessage> {
		let Some(sub) = self.subscriptions.get(&resource_id).cloned() else {
			return vec![write_failure(resource_id)];
		};
		let channel = self.identifier_channels.entry(sub.resource_id).or_default();

		let mut entries = Vec::with_capacity(list.len());
		for item in &list {
			match parse_write_item(item, &sub.spec, channel) {
				Ok(entry) => entries.push(entry),
				Err(e) => {
					tracing::warn!(error = %e, "malformed write entry");
					return vec![write_failure(resource_id)];
				}
			}
		}

		match sub.handle.write(sub.subscriber_id, entries).await {
			Ok(ack) => vec![ControlMessage::WriteAck {
				resource_id,
				revision: ack.revision.get(),
				info: ack.info,
				status: true,
				in_reply_to: 0,
			}],
			Err(e) => {
				tracing::warn!(error = %e, "write rejected by resource");
				vec![write_failure(resource_id)]
			}
		}
	}

	async fn handle_define(&mut self, resource_id: ClientResourceId, list: Vec<Json>) -> Vec<ControlMessage> {
		let Some(sub) = self.subscriptions.get(&resource_id).cloned() else {
			return Vec::new();
		};
		let defs: Vec<WireDefinition> = match list.iter().map(|j| serde_json::from_value(j.clone())).collect() {
			Ok(v) => v,
			Err(e) => {
				tracing::warn!(error = %e, "malformed define list");
				return Vec::new();
			}
		};
		let channel = self.identifier_channels.entry(sub.resource_id).or_default();
		for def in defs {
			if let Err(e) = apply_inbound_definition(channel, &sub.handle, def).await {
				tracing::warn!(error = %e, "failed to apply peer definition");
			}
		}
		Vec::new()
	}

	async fn handle_login(
		&mut self,
		auth: &AuthContext,
		username: String,
		password: String,
		login_seq_nr: u64,
	) -> Vec<ControlMessage> {
		let credentials = Credentials::Bearer {
			username: username.clone(),
			password,
		};
		match auth.credentials.verify(&credentials).await {
			Ok(user) => {
				self.user = Some(user.clone());
				vec![ControlMessage::LoginStatus {
					username: user,
					authenticated: true,
					reason: None,
					login_seq_nr,
				}]
			}
			Err(e) => vec![ControlMessage::LoginStatus {
				username,
				authenticated: false,
				reason: Some(e.to_string()),
				login_seq_nr,
			}],
		}
	}

	async fn handle_create_account(
		&mut self,
		auth: &AuthContext,
		username: String,
		password: String,
		email: String,
		login_seq_nr: u64,
	) -> Vec<ControlMessage> {
		match auth.credentials.create(&username, &password, &email).await {
			Ok(()) => {
				self.user = Some(username.clone());
				vec![ControlMessage::LoginStatus {
					username,
					authenticated: true,
					reason: None,
					login_seq_nr,
				}]
			}
			Err(e) => vec![ControlMessage::LoginStatus {
				username,
				authenticated: false,
				reason: Some(e.to_string()),
				login_seq_nr,
			}],
		}
	}

	/// §4.8: clears the authenticated user and drops every subscription that
	/// isn't publicly readable table/metadata content.
	fn handle_logout(&mut self, auth: &AuthContext) {
		self.user = None;
		let to_drop: Vec<ClientResourceId> = self
			.subscriptions
			.iter()
			.filter(|(_, sub)| {
				!(auth.public_data_access && matches!(sub.spec, ResourceSpec::Table { .. } | ResourceSpec::Metadata))
			})
			.map(|(id, _)| *id)
			.collect();
		for id in to_drop {
			if let Some(sub) = self.subscriptions.get(&id).cloned() {
				sub.handle.unsubscribe(sub.subscriber_id);
			}
			self.drop_subscription(id);
		}
	}

	/// Translate a [`Notification`] fanned out by a subscribed resource into
	/// the messages to forward to this connection's peer, or `None` if the
	/// notification is for a resource this session is no longer subscribed to
	/// (a race against an in-flight `unsubscribe`).
	pub async fn handle_notification(&mut self, notification: Notification) -> Option<Vec<ControlMessage>> {
		let client_resource_id = *self.by_resource_id.get(&notification.resource_id)?;
		let sub = self.subscriptions.get(&client_resource_id)?.clone();
		let channel = self.identifier_channels.entry(notification.resource_id).or_default();

		let mut update = Vec::with_capacity(notification.update.len());
		for element in &notification.update {
			match marshal_outbound_element(element, &sub.spec, channel, &sub.handle).await {
				Ok(j) => update.push(j),
				Err(e) => tracing::warn!(error = %e, ident = %element.ident, "failed to marshal notification element"),
			}
		}
		let mut out = flush_definitions(channel, client_resource_id);
		out.push(ControlMessage::ResourceUpdate {
			resource_id: client_resource_id,
			update,
			revision: notification.revision.get(),
			error: notification.error,
			reason: notification.reason,
		});
		Some(out)
	}
}

fn denial(resource_id: ClientResourceId, reason: &str) -> ControlMessage {
	ControlMessage::ResourceUpdate {
		resource_id,
		update: Vec::new(),
		revision: 0,
		error: true,
		reason: Some(reason.to_string()),
	}
}

fn write_failure(resource_id: ClientResourceId) -> ControlMessage {
	ControlMessage::WriteAck {
		resource_id,
		revision: 0,
		info: Json::Null,
		status: false,
		in_reply_to: 0,
	}
}

fn flush_definitions(channel: &mut IdentifierChannel, resource_id: ClientResourceId) -> Vec<ControlMessage> {
	let pending = channel.take_pending_definitions();
	if pending.is_empty() {
		return Vec::new();
	}
	vec![ControlMessage::Define {
		resource_id,
		list: pending
			.into_iter()
			.map(|def| match def {
				replicate_common::identifiers::PendingDefinition::Template(id, entry) => {
					serde_json::to_value(WireDefinition::Template { id, entry }).expect("serializable")
				}
				replicate_common::identifiers::PendingDefinition::Index(id, entry) => {
					serde_json::to_value(WireDefinition::Index { id, entry }).expect("serializable")
				}
			})
			.collect(),
	}]
}

/// The wire shape of one `define.list` entry (§4.3/§6.2). `TemplateEntry`/
/// `IndexEntry` already derive `Serialize`/`Deserialize`, so this just tags
/// which arena the entry belongs to.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind")]
enum WireDefinition {
	#[serde(rename = "template")]
	Template { id: TemplateId, entry: TemplateEntry },
	#[serde(rename = "index")]
	Index { id: IndexId, entry: IndexEntry },
}

/// Resolves an id a peer used in a message to this channel's local/canonical
/// numbering: either it was defined by the peer earlier (remote mapping), or
/// it's an id this channel already knows about directly (root, or one this
/// side itself defined to the peer) — app-state connections use the same
/// canonical numbering on both sides once a definition has been exchanged.
fn resolve_template(channel: &IdentifierChannel, id: TemplateId) -> Result<TemplateId, SessionError> {
	if let Ok(t) = channel.translate_template(id) {
		return Ok(t);
	}
	if channel.known_local_template(id) {
		return Ok(id);
	}
	Err(SessionError::Protocol(format!("unknown template id {id}")))
}

fn resolve_index(channel: &IdentifierChannel, id: IndexId) -> Result<IndexId, SessionError> {
	if let Ok(i) = channel.translate_index(id) {
		return Ok(i);
	}
	if channel.known_local_index(id) {
		return Ok(id);
	}
	Err(SessionError::Protocol(format!("unknown index id {id}")))
}

/// Registers a peer-defined template/index entry under its canonical
/// (resource-wide) id, obtained from the resource's own allocator so that
/// equivalent definitions from different connections dedupe (§4.3 Design
/// Notes, [`crate::resources::app_state::PaidManager`]).
async fn apply_inbound_definition(
	channel: &mut IdentifierChannel,
	handle: &ResourceHandle,
	def: WireDefinition,
) -> Result<(), SessionError> {
	match def {
		WireDefinition::Template { id: remote_id, entry } => {
			if channel.translate_template(remote_id).is_ok() {
				return Ok(());
			}
			let parent_id = resolve_template(channel, entry.parent_id)?;
			let referred_id = entry.referred_id.map(|r| resolve_template(channel, r)).transpose()?;
			let canonical = TemplateEntry {
				parent_id,
				child_type: entry.child_type,
				child_name: entry.child_name,
				referred_id,
			};
			let canonical_id = handle.define_template(canonical.clone()).await?;
			channel.register_local_template(canonical_id, canonical);
			channel.register_remote_template(remote_id, canonical_id);
			Ok(())
		}
		WireDefinition::Index { id: remote_id, entry } => {
			if channel.translate_index(remote_id).is_ok() {
				return Ok(());
			}
			let prefix_id = resolve_index(channel, entry.prefix_id)?;
			let compose = entry.compose.map(|c| resolve_index(channel, c)).transpose()?;
			let canonical = IndexEntry {
				prefix_id,
				append: entry.append,
				compose,
			};
			let canonical_id = handle.define_index(canonical.clone()).await?;
			channel.register_local_index(canonical_id, canonical);
			channel.register_remote_index(remote_id, canonical_id);
			Ok(())
		}
	}
}

/// Splits an app-state element's `templateId:indexId:path` composite ident.
fn parse_composite_ident(ident: &str) -> Option<(TemplateId, IndexId, String)> {
	let mut parts = ident.splitn(3, ':');
	let template: u32 = parts.next()?.parse().ok()?;
	let index: u32 = parts.next()?.parse().ok()?;
	let path = parts.next()?.to_string();
	Some((TemplateId::from(template), IndexId::from(index), path))
}

/// Recursively ensures `id` and its dependency chain are registered in
/// `channel` (fetching entries from the resource's allocator if this
/// connection has never seen them) and flushed to the pending-definitions
/// queue.
fn ensure_template_defined<'a>(
	channel: &'a mut IdentifierChannel,
	handle: &'a ResourceHandle,
	id: TemplateId,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), SessionError>> + Send + 'a>> {
	Box::pin(async move {
		if id == TemplateId::from(ROOT_ID) {
			return Ok(());
		}
		if !channel.known_local_template(id) {
			let entry = handle
				.get_template_entry(id)
				.await?
				.ok_or_else(|| SessionError::Protocol(format!("unknown template id {id}")))?;
			ensure_template_defined(channel, handle, entry.parent_id).await?;
			if let Some(referred) = entry.referred_id {
				ensure_template_defined(channel, handle, referred).await?;
			}
			channel.register_local_template(id, entry);
		}
		channel.define_template(id)?;
		Ok(())
	})
}

fn ensure_index_defined<'a>(
	channel: &'a mut IdentifierChannel,
	handle: &'a ResourceHandle,
	id: IndexId,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), SessionError>> + Send + 'a>> {
	Box::pin(async move {
		if id == IndexId::from(ROOT_ID) {
			return Ok(());
		}
		if !channel.known_local_index(id) {
			let entry = handle
				.get_index_entry(id)
				.await?
				.ok_or_else(|| SessionError::Protocol(format!("unknown index id {id}")))?;
			ensure_index_defined(channel, handle, entry.prefix_id).await?;
			if let Some(compose) = entry.compose {
				ensure_index_defined(channel, handle, compose).await?;
			}
			channel.register_local_index(id, entry);
		}
		channel.define_index(id)?;
		Ok(())
	})
}

/// Marshals one [`ResourceElement`] for `resourceUpdate`/subscribe-snapshot
/// delivery. App-state idents carry template/index ids in the channel's
/// canonical numbering; this ensures the peer has (or is about to receive)
/// the definitions those ids depend on before the element referencing them
/// goes out, per invariant 6.
async fn marshal_outbound_element(
	element: &ResourceElement,
	spec: &ResourceSpec,
	channel: &mut IdentifierChannel,
	handle: &ResourceHandle,
) -> Result<Json, SessionError> {
	let ident = if matches!(spec, ResourceSpec::AppState { .. }) {
		let (template_id, index_id, path) = parse_composite_ident(&element.ident)
			.ok_or_else(|| SessionError::Protocol(format!("malformed appState ident {}", element.ident)))?;
		ensure_template_defined(channel, handle, template_id).await?;
		ensure_index_defined(channel, handle, index_id).await?;
		format!("{}:{}:{}", template_id.get(), index_id.get(), path)
	} else {
		element.ident.clone()
	};
	Ok(json!({
		"ident": ident,
		"value": element.value.marshal(channel)?,
		"revision": element.revision.get(),
		"revTimeStamp": element.rev_timestamp.to_rfc3339(),
	}))
}

/// Parses one `write.list` entry `{ ident, value }`. App-state idents arrive
/// in the peer's own template/index numbering and are translated to
/// canonical form before the write reaches the resource.
fn parse_write_item(
	item: &Json,
	spec: &ResourceSpec,
	channel: &mut IdentifierChannel,
) -> Result<WriteEntry, SessionError> {
	let raw_ident = item
		.get("ident")
		.and_then(Json::as_str)
		.ok_or_else(|| SessionError::Protocol("write entry missing ident".to_string()))?;
	let ident = if matches!(spec, ResourceSpec::AppState { .. }) {
		let (template_id, index_id, path) = parse_composite_ident(raw_ident)
			.ok_or_else(|| SessionError::Protocol(format!("malformed appState ident {raw_ident}")))?;
		let template_id = resolve_template(channel, template_id)?;
		let index_id = resolve_index(channel, index_id)?;
		format!("{}:{}:{}", template_id.get(), index_id.get(), path)
	} else {
		raw_ident.to_string()
	};
	let value_json = item
		.get("value")
		.ok_or_else(|| SessionError::Protocol("write entry missing value".to_string()))?;
	let value = Value::unmarshal(value_json, channel)?;
	Ok(WriteEntry { ident, value })
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::auth::FileCredentialStore;
	use crate::resources::manager::Manager;
	use replicate_common::resource_spec::ResourceSpec;
	use tokio::sync::mpsc;

	fn auth_ctx(local_mode: bool) -> AuthContext {
		AuthContext {
			rules: RuleStore::new(),
			credentials: Arc::new(FileCredentialStore::from_contents("", false)),
			public_data_access: false,
			local_mode,
		}
	}

	fn session() -> (Session, mpsc::UnboundedReceiver<Notification>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(Session::new(ClientId::random(), tx), rx)
	}

	#[tokio::test]
	async fn subscribe_in_local_mode_bypasses_authorization() {
		let (mut sess, _rx) = session();
		let manager = Manager::new(Vec::new());
		let auth = auth_ctx(true);
		let spec = ResourceSpec::AppState {
			owner: "alice".to_string(),
			app: "x".to_string(),
		};
		let out = sess
			.handle_message(
				&manager,
				&auth,
				ControlMessage::Subscribe {
					resource_id: ClientResourceId::from(1),
					resource_spec: spec,
					revision: None,
				},
			)
			.await;
		assert!(matches!(out.last(), Some(ControlMessage::ResourceUpdate { error: false, .. })));
	}

	#[tokio::test]
	async fn subscribe_denied_without_authentication() {
		let (mut sess, _rx) = session();
		let manager = Manager::new(Vec::new());
		let auth = auth_ctx(false);
		let spec = ResourceSpec::AppState {
			owner: "alice".to_string(),
			app: "x".to_string(),
		};
		let out = sess
			.handle_message(
				&manager,
				&auth,
				ControlMessage::Subscribe {
					resource_id: ClientResourceId::from(1),
					resource_spec: spec,
					revision: None,
				},
			)
			.await;
		assert!(matches!(out.last(), Some(ControlMessage::ResourceUpdate { error: true, .. })));
	}

	#[tokio::test]
	async fn write_then_resubscribe_observes_the_value() {
		let (mut sess, _rx) = session();
		let manager = Manager::new(Vec::new());
		let auth = auth_ctx(true);
		let spec = ResourceSpec::Table {
			app: "orders".to_string(),
			path: Vec::new(),
		};
		let resource_id = ClientResourceId::from(7);
		sess.handle_message(
			&manager,
			&auth,
			ControlMessage::Subscribe {
				resource_id,
				resource_spec: spec.clone(),
				revision: None,
			},
		)
		.await;

		let mapping_value = json!({"type": "attributeValueRecord", "value": {
			"nrDataElements": {"type": "number", "value": 0.0},
			"firstId": {"type": "number", "value": 0.0},
			"columnPaths": {"type": "orderedSet", "value": []},
		}});
		let ack = sess
			.handle_message(
				&manager,
				&auth,
				ControlMessage::Write {
					resource_id,
					list: vec![json!({"ident": "", "value": mapping_value})],
				},
			)
			.await;
		assert!(matches!(ack.first(), Some(ControlMessage::WriteAck { status: true, .. })));
	}

	#[tokio::test]
	async fn logout_drops_non_public_subscriptions() {
		let (mut sess, _rx) = session();
		let manager = Manager::new(Vec::new());
		let auth = auth_ctx(true);
		let resource_id = ClientResourceId::from(1);
		sess.handle_message(
			&manager,
			&auth,
			ControlMessage::Subscribe {
				resource_id,
				resource_spec: ResourceSpec::AppState {
					owner: "alice".to_string(),
					app: "x".to_string(),
				},
				revision: None,
			},
		)
		.await;
		assert_eq!(sess.subscriptions.len(), 1);
		sess.handle_message(&manager, &auth, ControlMessage::Logout).await;
		assert!(sess.subscriptions.is_empty());
	}
}
