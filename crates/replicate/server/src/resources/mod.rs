//! Resource manager and the common resource actor contract (§4.6/§4.7).
//!
//! Each live resource is a single Tokio task ("single-writer island", §5)
//! draining a mailbox of [`Request`]s. [`ResourceCore`] is the state every
//! concrete resource shares (elements, subscribers, revision counter,
//! ready-queue); concrete behaviour (how a write is applied, how the
//! persisted state is loaded) is supplied per resource kind via
//! [`ResourceKind`] and driven generically by [`run_actor`].

pub mod app_state;
pub mod compression;
pub mod external;
pub mod manager;
pub mod metadata;
pub mod table;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use replicate_common::element::ResourceElement;
use replicate_common::identifiers::{IndexEntry, TemplateEntry};
use replicate_common::ids::{IndexId, Revision, ResourceId, SubscriberId, TemplateId};
use replicate_common::value::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::ResourceError;

pub use manager::Manager;

/// One element to be written, as unmarshalled from the client's `write.list` (§4.7).
#[derive(Debug, Clone)]
pub struct WriteEntry {
	pub ident: String,
	pub value: Value,
}

/// What a subscriber observes as a resource's content changes (§4.7, §6.2
/// `resourceUpdate`). `update` carries raw [`Value`]s; the session marshals
/// them per-connection because only it owns the relevant [`IdentifierChannel`]
/// (`replicate_common::identifiers::IdentifierChannel`).
#[derive(Debug, Clone)]
pub struct Notification {
	pub resource_id: ResourceId,
	pub update: Vec<ResourceElement>,
	pub revision: Revision,
	pub error: bool,
	pub reason: Option<String>,
}

pub type NotificationSender = mpsc::UnboundedSender<Notification>;

/// `cb(error, ackInfo, revision)` from §4.7's `write` contract.
#[derive(Debug, Clone, Default)]
pub struct WriteAck {
	pub revision: Revision,
	pub info: serde_json::Value,
}

/// The element set delivered by `getAllElement` (§4.7): either the full
/// current set, or (with `from_revision`) only elements written since.
#[derive(Debug, Clone)]
pub struct ElementSnapshot {
	pub elements: Vec<ResourceElement>,
	pub last_revision: Revision,
}

/// One mailbox message per `Resource` contract operation in §4.7. Resources
/// never block holding another resource's state while awaiting a reply (§5);
/// all replies travel over `oneshot` channels.
pub enum Request {
	Subscribe {
		notify: NotificationSender,
		reply: oneshot::Sender<SubscriberId>,
	},
	Unsubscribe {
		subscriber: SubscriberId,
	},
	ReleaseResource {
		subscriber: SubscriberId,
	},
	GetAllElements {
		from_revision: Option<Revision>,
		reply: oneshot::Sender<ElementSnapshot>,
	},
	Write {
		originator: SubscriberId,
		entries: Vec<WriteEntry>,
		reply: oneshot::Sender<Result<WriteAck, ResourceError>>,
	},
	/// Identifier Registry ("Paid Manager", §4.3 Design Notes / Glossary)
	/// operations. Only [`app_state::AppStateResource`] answers these; other
	/// kinds reply with [`ResourceError::UnsupportedOperation`].
	DefineTemplate {
		entry: TemplateEntry,
		reply: oneshot::Sender<Result<TemplateId, ResourceError>>,
	},
	DefineIndex {
		entry: IndexEntry,
		reply: oneshot::Sender<Result<IndexId, ResourceError>>,
	},
	GetTemplateEntry {
		id: TemplateId,
		reply: oneshot::Sender<Result<Option<TemplateEntry>, ResourceError>>,
	},
	GetIndexEntry {
		id: IndexId,
		reply: oneshot::Sender<Result<Option<IndexEntry>, ResourceError>>,
	},
	/// `removeTable` (§4.7.2); only [`table::TableResource`] overrides
	/// [`ResourceKind::remove`], everything else replies with
	/// [`ResourceError::UnsupportedOperation`].
	Remove {
		reply: oneshot::Sender<Result<(), ResourceError>>,
	},
}

/// A cheap, cloneable reference to a live resource's mailbox.
#[derive(Debug, Clone)]
pub struct ResourceHandle {
	pub id: ResourceId,
	sender: mpsc::UnboundedSender<Request>,
}

impl ResourceHandle {
	pub async fn subscribe(&self, notify: NotificationSender) -> Result<SubscriberId, ResourceError> {
		let (reply, rx) = oneshot::channel();
		self.sender
			.send(Request::Subscribe { notify, reply })
			.map_err(|_| ResourceError::AlreadyReleased)?;
		rx.await.map_err(|_| ResourceError::AlreadyReleased)
	}

	pub fn unsubscribe(&self, subscriber: SubscriberId) {
		let _ = self.sender.send(Request::Unsubscribe { subscriber });
	}

	pub fn release_resource(&self, subscriber: SubscriberId) {
		let _ = self.sender.send(Request::ReleaseResource { subscriber });
	}

	pub async fn get_all_elements(
		&self,
		from_revision: Option<Revision>,
	) -> Result<ElementSnapshot, ResourceError> {
		let (reply, rx) = oneshot::channel();
		self.sender
			.send(Request::GetAllElements { from_revision, reply })
			.map_err(|_| ResourceError::AlreadyReleased)?;
		rx.await.map_err(|_| ResourceError::AlreadyReleased)
	}

	pub async fn write(
		&self,
		originator: SubscriberId,
		entries: Vec<WriteEntry>,
	) -> Result<WriteAck, ResourceError> {
		let (reply, rx) = oneshot::channel();
		self.sender
			.send(Request::Write {
				originator,
				entries,
				reply,
			})
			.map_err(|_| ResourceError::AlreadyReleased)?;
		rx.await.map_err(|_| ResourceError::AlreadyReleased)?
	}

	pub async fn define_template(&self, entry: TemplateEntry) -> Result<TemplateId, ResourceError> {
		let (reply, rx) = oneshot::channel();
		self.sender
			.send(Request::DefineTemplate { entry, reply })
			.map_err(|_| ResourceError::AlreadyReleased)?;
		rx.await.map_err(|_| ResourceError::AlreadyReleased)?
	}

	pub async fn define_index(&self, entry: IndexEntry) -> Result<IndexId, ResourceError> {
		let (reply, rx) = oneshot::channel();
		self.sender
			.send(Request::DefineIndex { entry, reply })
			.map_err(|_| ResourceError::AlreadyReleased)?;
		rx.await.map_err(|_| ResourceError::AlreadyReleased)?
	}

	pub async fn get_template_entry(&self, id: TemplateId) -> Result<Option<TemplateEntry>, ResourceError> {
		let (reply, rx) = oneshot::channel();
		self.sender
			.send(Request::GetTemplateEntry { id, reply })
			.map_err(|_| ResourceError::AlreadyReleased)?;
		rx.await.map_err(|_| ResourceError::AlreadyReleased)?
	}

	pub async fn get_index_entry(&self, id: IndexId) -> Result<Option<IndexEntry>, ResourceError> {
		let (reply, rx) = oneshot::channel();
		self.sender
			.send(Request::GetIndexEntry { id, reply })
			.map_err(|_| ResourceError::AlreadyReleased)?;
		rx.await.map_err(|_| ResourceError::AlreadyReleased)?
	}

	pub async fn remove(&self) -> Result<(), ResourceError> {
		let (reply, rx) = oneshot::channel();
		self.sender
			.send(Request::Remove { reply })
			.map_err(|_| ResourceError::AlreadyReleased)?;
		rx.await.map_err(|_| ResourceError::AlreadyReleased)?
	}
}

/// The shared state every concrete resource kind carries: the element table,
/// revision counter, subscriber registrations, and the ready-queue described
/// in §4.7's `executeWhenReady`.
pub struct ResourceCore {
	pub elements: BTreeMap<String, ResourceElement>,
	pub last_revision: Revision,
	subscribers: HashMap<SubscriberId, NotificationSender>,
	next_subscriber: u64,
	ready: bool,
	pending: Vec<Request>,
}

impl Default for ResourceCore {
	fn default() -> Self {
		Self {
			elements: BTreeMap::new(),
			last_revision: Revision::from(0),
			subscribers: HashMap::new(),
			next_subscriber: 1,
			ready: false,
			pending: Vec::new(),
		}
	}
}

impl ResourceCore {
	pub fn is_ready(&self) -> bool {
		self.ready
	}

	fn register_subscriber(&mut self, notify: NotificationSender) -> SubscriberId {
		let id = SubscriberId::from(self.next_subscriber);
		self.next_subscriber += 1;
		self.subscribers.insert(id, notify);
		id
	}

	fn remove_subscriber(&mut self, id: SubscriberId) {
		self.subscribers.remove(&id);
	}

	pub fn subscriber_count(&self) -> usize {
		self.subscribers.len()
	}

	pub fn snapshot(&self, from_revision: Option<Revision>) -> ElementSnapshot {
		let elements = match from_revision {
			None => self.elements.values().cloned().collect(),
			Some(r) => self
				.elements
				.values()
				.filter(|e| e.revision.get() > r.get())
				.cloned()
				.collect(),
		};
		ElementSnapshot {
			elements,
			last_revision: self.last_revision,
		}
	}

	/// Fan out `update` to every subscriber, skipping `originator` unless
	/// `also_notify_writer` (§4.7). A send failure (subscriber's session
	/// already gone) is logged and skipped for that subscriber only — a
	/// resource never lets one dead subscriber's channel break fan-out to
	/// the rest (§7).
	pub fn notify(
		&self,
		resource_id: ResourceId,
		update: Vec<ResourceElement>,
		originator: Option<SubscriberId>,
		also_notify_writer: bool,
	) {
		if update.is_empty() {
			return;
		}
		for (subscriber, sender) in &self.subscribers {
			if !also_notify_writer && Some(*subscriber) == originator {
				continue;
			}
			let notification = Notification {
				resource_id,
				update: update.clone(),
				revision: self.last_revision,
				error: false,
				reason: None,
			};
			if sender.send(notification).is_err() {
				tracing::debug!(?subscriber, "dropping notification for gone subscriber");
			}
		}
	}
}

/// Per-resource-kind behaviour driven by [`run_actor`]: how to load persisted
/// state at startup and how to apply a write batch. Everything else
/// (subscribe bookkeeping, the ready-queue, fan-out) is common and lives in
/// [`ResourceCore`]/[`run_actor`].
#[async_trait]
pub trait ResourceKind: Send {
	/// Load persisted state into `core`, then mark it ready. Queued requests
	/// that arrived before this completes are replayed, in arrival order,
	/// once this returns (§4.7 `executeWhenReady`).
	async fn load(&mut self, core: &mut ResourceCore);

	/// Apply one write batch: one revision for the whole batch, persisted,
	/// with the resulting element set to fan out. `also_notify_writer`
	/// controls whether the fan-out also reaches `originator`.
	async fn apply_write(
		&mut self,
		core: &mut ResourceCore,
		id: ResourceId,
		originator: SubscriberId,
		entries: Vec<WriteEntry>,
	) -> Result<(WriteAck, Vec<ResourceElement>), ResourceError>;

	fn also_notify_writer(&self) -> bool {
		false
	}

	/// Fires at the 0→1 and 1→0 subscriber-count transitions (§3 Lifecycles).
	async fn on_acquire(&mut self) {}
	async fn on_purge(&mut self) {}

	/// Identifier Registry operations (§4.3 Design Notes); only
	/// [`app_state::AppStateResource`] overrides these.
	async fn define_template(&mut self, _entry: TemplateEntry) -> Result<TemplateId, ResourceError> {
		Err(ResourceError::UnsupportedOperation)
	}
	async fn define_index(&mut self, _entry: IndexEntry) -> Result<IndexId, ResourceError> {
		Err(ResourceError::UnsupportedOperation)
	}
	async fn get_template_entry(&self, _id: TemplateId) -> Result<Option<TemplateEntry>, ResourceError> {
		Err(ResourceError::UnsupportedOperation)
	}
	async fn get_index_entry(&self, _id: IndexId) -> Result<Option<IndexEntry>, ResourceError> {
		Err(ResourceError::UnsupportedOperation)
	}

	/// `removeTable` (§4.7.2): drop all persisted state and emit tombstones
	/// for every element currently held. Only meaningful for table resources.
	async fn remove(&mut self, _core: &mut ResourceCore, _id: ResourceId) -> Result<(), ResourceError> {
		Err(ResourceError::UnsupportedOperation)
	}
}

/// Spawn the actor task for one resource. Returns a handle immediately;
/// `kind.load` runs inside the task, so any request sent before loading
/// completes is queued by `run_actor` itself (mirroring `executeWhenReady`
/// applying even to the very first requests).
pub fn spawn<K: ResourceKind + 'static>(id: ResourceId, mut kind: K) -> ResourceHandle {
	let (sender, receiver) = mpsc::unbounded_channel();
	tokio::spawn(async move {
		run_actor(id, &mut kind, receiver).await;
	});
	ResourceHandle { id, sender }
}

async fn run_actor<K: ResourceKind>(
	id: ResourceId,
	kind: &mut K,
	mut receiver: mpsc::UnboundedReceiver<Request>,
) {
	let mut core = ResourceCore::default();
	kind.load(&mut core).await;
	core.ready = true;
	let queued = std::mem::take(&mut core.pending);
	for request in queued {
		handle_request(id, kind, &mut core, request).await;
	}

	while let Some(request) = receiver.recv().await {
		if !core.ready {
			core.pending.push(request);
			continue;
		}
		handle_request(id, kind, &mut core, request).await;
	}
}

async fn handle_request<K: ResourceKind>(
	id: ResourceId,
	kind: &mut K,
	core: &mut ResourceCore,
	request: Request,
) {
	match request {
		Request::Subscribe { notify, reply } => {
			let was_empty = core.subscriber_count() == 0;
			let subscriber = core.register_subscriber(notify);
			if was_empty {
				kind.on_acquire().await;
			}
			let _ = reply.send(subscriber);
		}
		Request::Unsubscribe { subscriber } => {
			core.remove_subscriber(subscriber);
			if core.subscriber_count() == 0 {
				kind.on_purge().await;
			}
		}
		Request::ReleaseResource { subscriber } => {
			core.remove_subscriber(subscriber);
			if core.subscriber_count() == 0 {
				kind.on_purge().await;
			}
		}
		Request::GetAllElements { from_revision, reply } => {
			let _ = reply.send(core.snapshot(from_revision));
		}
		Request::Write {
			originator,
			entries,
			reply,
		} => {
			let outcome = kind.apply_write(core, id, originator, entries).await;
			let result = match outcome {
				Ok((ack, update)) => {
					core.notify(id, update, Some(originator), kind.also_notify_writer());
					Ok(ack)
				}
				Err(e) => Err(e),
			};
			let _ = reply.send(result);
		}
		Request::DefineTemplate { entry, reply } => {
			let _ = reply.send(kind.define_template(entry).await);
		}
		Request::DefineIndex { entry, reply } => {
			let _ = reply.send(kind.define_index(entry).await);
		}
		Request::GetTemplateEntry { id, reply } => {
			let _ = reply.send(kind.get_template_entry(id).await);
		}
		Request::GetIndexEntry { id, reply } => {
			let _ = reply.send(kind.get_index_entry(id).await);
		}
		Request::Remove { reply } => {
			let _ = reply.send(kind.remove(core, id).await);
		}
	}
}
