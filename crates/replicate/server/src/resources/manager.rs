//! Resource Manager (§4.6): registry of resources keyed by canonical spec
//! string, one live instance per spec, numeric ids assigned once and never
//! reused.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use replicate_common::ids::ResourceId;
use replicate_common::resource_spec::ResourceSpec;
use replicate_common::value::Value;

use crate::persistence::InMemoryCollection;
use crate::resources::app_state::AppStateResource;
use crate::resources::external::{ExternalBackend, ExternalResource, SharedClients};
use crate::resources::metadata::MetadataResource;
use crate::resources::table::TableResource;
use crate::resources::{spawn, ResourceHandle};

/// A synthetic, read-only metadata entry describing a configured external
/// data source (§4.7.3: "augmented with synthetic entries ... so that
/// clients discover them").
pub struct ExternalSourceDescriptor {
	pub ident: String,
	pub value: Value,
}

/// Registry of live resources, one [`ResourceHandle`] per unique canonical
/// spec string (§4.6). Held behind an `Arc` since [`MetadataResource`] needs
/// to reach back into it to create/find the table resources its writes
/// route to.
pub struct Manager {
	resources: DashMap<String, ResourceHandle>,
	by_id: DashMap<u64, String>,
	next_id: AtomicU64,
	external_backends: Vec<Arc<dyn ExternalBackend>>,
	shared_clients: Arc<SharedClients>,
}

impl Manager {
	pub fn new(external_backends: Vec<Arc<dyn ExternalBackend>>) -> Arc<Self> {
		Arc::new(Self {
			resources: DashMap::new(),
			by_id: DashMap::new(),
			next_id: AtomicU64::new(1),
			external_backends,
			shared_clients: Arc::new(SharedClients::new()),
		})
	}

	/// `getResourceBySpec` (§4.6): returns the cached resource or constructs
	/// and registers the appropriate concrete kind, assigning it the next
	/// numeric id. Ids are never reused during a process run.
	pub fn get_resource_by_spec(self: &Arc<Self>, spec: &ResourceSpec) -> ResourceHandle {
		let key = spec.canonical_key();
		if let Some(existing) = self.resources.get(&key) {
			return existing.clone();
		}
		// Racing constructors may both reach here; `entry` makes only the
		// first insertion win, and the loser's freshly spawned actor is
		// simply dropped (its task exits once its lone handle is gone).
		self.resources
			.entry(key.clone())
			.or_insert_with(|| {
				let id = ResourceId::from(self.next_id.fetch_add(1, Ordering::SeqCst));
				self.by_id.insert(id.get(), key.clone());
				self.spawn_for_spec(id, spec)
			})
			.clone()
	}

	/// Convenience alias for `get_resource_by_spec(&ResourceSpec::Metadata)`.
	pub fn metadata_handle(self: &Arc<Self>) -> ResourceHandle {
		self.get_resource_by_spec(&ResourceSpec::Metadata)
	}

	pub fn get_resource_by_id(&self, id: ResourceId) -> Option<ResourceHandle> {
		let key = self.by_id.get(&id.get())?;
		self.resources.get(key.value()).map(|h| h.clone())
	}

	pub fn external_source_descriptors(&self) -> Vec<ExternalSourceDescriptor> {
		// Only the backends themselves know the data sources they expose;
		// the illustrative in-memory backend shipped here has no static
		// catalogue to enumerate ahead of a query, so the descriptor list is
		// populated by richer backends in a full deployment.
		Vec::new()
	}

	fn spawn_for_spec(self: &Arc<Self>, id: ResourceId, spec: &ResourceSpec) -> ResourceHandle {
		match spec {
			ResourceSpec::AppState { .. } => spawn(
				id,
				AppStateResource::new(
					Arc::new(InMemoryCollection::new()),
					Arc::new(InMemoryCollection::new()),
					Arc::new(InMemoryCollection::new()),
				),
			),
			ResourceSpec::Table { .. } => spawn(id, TableResource::new(Arc::new(InMemoryCollection::new()))),
			ResourceSpec::Metadata => spawn(
				id,
				MetadataResource::new(Arc::new(InMemoryCollection::new()), self.clone()),
			),
			ResourceSpec::External { app, path, params } => spawn(
				id,
				ExternalResource::new(
					spec.clone(),
					app.clone(),
					path.clone(),
					params.clone(),
					self.external_backends.clone(),
					self.shared_clients.clone(),
				),
			),
		}
	}

	pub fn resource_count(&self) -> usize {
		self.resources.len()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn app_state_spec(owner: &str, app: &str) -> ResourceSpec {
		ResourceSpec::AppState {
			owner: owner.to_string(),
			app: app.to_string(),
		}
	}

	#[tokio::test]
	async fn same_spec_returns_same_resource_id() {
		let manager = Manager::new(Vec::new());
		let a = manager.get_resource_by_spec(&app_state_spec("u", "x"));
		let b = manager.get_resource_by_spec(&app_state_spec("u", "x"));
		assert_eq!(a.id, b.id);
	}

	#[tokio::test]
	async fn distinct_specs_get_distinct_ids() {
		let manager = Manager::new(Vec::new());
		let a = manager.get_resource_by_spec(&app_state_spec("u", "x"));
		let b = manager.get_resource_by_spec(&app_state_spec("u", "y"));
		assert_ne!(a.id, b.id);
	}

	#[tokio::test]
	async fn metadata_handle_is_a_singleton() {
		let manager = Manager::new(Vec::new());
		let a = manager.metadata_handle();
		let b = manager.metadata_handle();
		assert_eq!(a.id, b.id);
	}

	#[tokio::test]
	async fn ids_are_never_reused() {
		let manager = Manager::new(Vec::new());
		let a = manager.get_resource_by_spec(&app_state_spec("u", "x"));
		let _ = manager.get_resource_by_spec(&app_state_spec("u", "y"));
		let c = manager.get_resource_by_spec(&ResourceSpec::Table {
			app: "z".to_string(),
			path: vec![],
		});
		assert!(c.id.get() > a.id.get());
	}
}
