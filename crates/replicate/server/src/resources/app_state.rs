//! `AppStateResource` (§4.7.1) and its Identifier Registry ("Paid Manager",
//! Glossary): the persistent, content-addressed allocator of template and
//! index ids shared by every connection subscribed to one app-state
//! resource.
//!
//! Elements are keyed by the composite `templateId:indexId:path` ident,
//! built from *canonical* (resource-global) ids — distinct from the
//! per-connection numbering a [`replicate_common::identifiers::IdentifierChannel`]
//! uses to talk to one peer. [`crate::session`] is responsible for
//! translating between the two; this module only ever sees canonical ids.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use replicate_common::element::ResourceElement;
use replicate_common::identifiers::{IndexEntry, TemplateEntry};
use replicate_common::ids::{IndexId, ResourceId, Revision, SubscriberId, TemplateId, ROOT_ID};
use replicate_common::value::Value;

use crate::error::ResourceError;
use crate::persistence::Collection;
use crate::resources::{ResourceCore, ResourceKind, WriteAck, WriteEntry};

/// Content-addressed, persistent directory of template/index entries for one
/// app-state resource. Two equivalent definitions (same parent/child-type/
/// name/referred-id) from different connections dedupe to the same
/// canonical id, which is what lets `templateId:indexId:path` idents agree
/// across clients describing the same logical structural position.
#[derive(Debug, Default)]
pub struct PaidManager {
	templates: HashMap<TemplateId, TemplateEntry>,
	templates_rev: HashMap<TemplateEntry, TemplateId>,
	next_template: u32,
	indices: HashMap<IndexId, IndexEntry>,
	indices_rev: HashMap<IndexEntry, IndexId>,
	next_index: u32,
}

impl PaidManager {
	pub fn new() -> Self {
		Self {
			next_template: ROOT_ID + 1,
			next_index: ROOT_ID + 1,
			..Default::default()
		}
	}

	pub fn seed_template(&mut self, id: TemplateId, entry: TemplateEntry) {
		self.next_template = self.next_template.max(id.get() + 1);
		self.templates_rev.insert(entry.clone(), id);
		self.templates.insert(id, entry);
	}

	pub fn seed_index(&mut self, id: IndexId, entry: IndexEntry) {
		self.next_index = self.next_index.max(id.get() + 1);
		self.indices_rev.insert(entry.clone(), id);
		self.indices.insert(id, entry);
	}

	pub fn get_or_allocate_template(&mut self, entry: TemplateEntry) -> (TemplateId, bool) {
		if let Some(id) = self.templates_rev.get(&entry) {
			return (*id, false);
		}
		let id = TemplateId::from(self.next_template);
		self.next_template += 1;
		self.templates_rev.insert(entry.clone(), id);
		self.templates.insert(id, entry);
		(id, true)
	}

	pub fn get_or_allocate_index(&mut self, entry: IndexEntry) -> (IndexId, bool) {
		if let Some(id) = self.indices_rev.get(&entry) {
			return (*id, false);
		}
		let id = IndexId::from(self.next_index);
		self.next_index += 1;
		self.indices_rev.insert(entry.clone(), id);
		self.indices.insert(id, entry);
		(id, true)
	}

	pub fn get_template(&self, id: TemplateId) -> Option<TemplateEntry> {
		self.templates.get(&id).cloned()
	}

	pub fn get_index(&self, id: IndexId) -> Option<IndexEntry> {
		self.indices.get(&id).cloned()
	}
}

pub struct AppStateResource {
	data: Arc<dyn Collection>,
	templates_collection: Arc<dyn Collection>,
	indices_collection: Arc<dyn Collection>,
	paid: PaidManager,
}

impl AppStateResource {
	pub fn new(
		data: Arc<dyn Collection>,
		templates_collection: Arc<dyn Collection>,
		indices_collection: Arc<dyn Collection>,
	) -> Self {
		Self {
			data,
			templates_collection,
			indices_collection,
			paid: PaidManager::new(),
		}
	}
}

fn parse_ident(ident: &str) -> Option<(TemplateId, IndexId, String)> {
	let mut parts = ident.splitn(3, ':');
	let template: u32 = parts.next()?.parse().ok()?;
	let index: u32 = parts.next()?.parse().ok()?;
	let path = parts.next()?.to_string();
	Some((TemplateId::from(template), IndexId::from(index), path))
}

#[async_trait]
impl ResourceKind for AppStateResource {
	async fn load(&mut self, core: &mut ResourceCore) {
		if let Ok(records) = self.templates_collection.scan().await {
			for record in records {
				if let (Ok(id), Ok(entry)) = (
					record.id.parse::<u32>(),
					serde_json::from_value::<TemplateEntry>(record.value),
				) {
					self.paid.seed_template(TemplateId::from(id), entry);
				}
			}
		}
		if let Ok(records) = self.indices_collection.scan().await {
			for record in records {
				if let (Ok(id), Ok(entry)) = (
					record.id.parse::<u32>(),
					serde_json::from_value::<IndexEntry>(record.value),
				) {
					self.paid.seed_index(IndexId::from(id), entry);
				}
			}
		}
		if let Ok(records) = self.data.scan().await {
			for record in records {
				let Some((_, _, _)) = parse_ident(&record.id) else {
					continue;
				};
				if let Ok(value) = serde_json::from_value::<WireValue>(record.value) {
					core.elements.insert(
						record.id.clone(),
						ResourceElement {
							ident: record.id,
							value: value.0,
							revision: Revision::from(record.revision),
							rev_timestamp: record.rev_timestamp,
						},
					);
					core.last_revision = core.last_revision.max(Revision::from(record.revision));
				}
			}
		}
	}

	async fn apply_write(
		&mut self,
		core: &mut ResourceCore,
		_id: ResourceId,
		_originator: SubscriberId,
		entries: Vec<WriteEntry>,
	) -> Result<(WriteAck, Vec<ResourceElement>), ResourceError> {
		if entries.is_empty() {
			return Ok((
				WriteAck {
					revision: core.last_revision,
					info: serde_json::Value::Null,
				},
				Vec::new(),
			));
		}
		let revision = core.last_revision.next();
		let now = Utc::now();
		let mut updated = Vec::with_capacity(entries.len());
		for entry in entries {
			let element = ResourceElement {
				ident: entry.ident.clone(),
				value: entry.value,
				revision,
				rev_timestamp: now,
			};
			if element.is_deleted() {
				self.data
					.delete(&entry.ident)
					.await
					.map_err(|e| ResourceError::Persistence(e.into()))?;
				core.elements.remove(&entry.ident);
			} else {
				self.data
					.put(crate::persistence::Record {
						id: entry.ident.clone(),
						value: serde_json::to_value(WireValue(element.value.clone())).unwrap(),
						revision: revision.get(),
						rev_timestamp: now,
					})
					.await
					.map_err(|e| ResourceError::Persistence(e.into()))?;
				core.elements.insert(entry.ident.clone(), element.clone());
			}
			updated.push(element);
		}
		core.last_revision = revision;
		Ok((
			WriteAck {
				revision,
				info: serde_json::Value::Null,
			},
			updated,
		))
	}

	async fn define_template(&mut self, entry: TemplateEntry) -> Result<TemplateId, ResourceError> {
		let (id, is_new) = self.paid.get_or_allocate_template(entry.clone());
		if is_new {
			self.templates_collection
				.put(crate::persistence::Record {
					id: id.get().to_string(),
					value: serde_json::to_value(&entry).unwrap(),
					revision: 0,
					rev_timestamp: Utc::now(),
				})
				.await
				.map_err(|e| ResourceError::Persistence(e.into()))?;
		}
		Ok(id)
	}

	async fn define_index(&mut self, entry: IndexEntry) -> Result<IndexId, ResourceError> {
		let (id, is_new) = self.paid.get_or_allocate_index(entry.clone());
		if is_new {
			self.indices_collection
				.put(crate::persistence::Record {
					id: id.get().to_string(),
					value: serde_json::to_value(&entry).unwrap(),
					revision: 0,
					rev_timestamp: Utc::now(),
				})
				.await
				.map_err(|e| ResourceError::Persistence(e.into()))?;
		}
		Ok(id)
	}

	async fn get_template_entry(&self, id: TemplateId) -> Result<Option<TemplateEntry>, ResourceError> {
		Ok(self.paid.get_template(id))
	}

	async fn get_index_entry(&self, id: IndexId) -> Result<Option<IndexEntry>, ResourceError> {
		Ok(self.paid.get_index(id))
	}
}

/// `Value` doesn't derive `Serialize`/`Deserialize` (its wire form depends on
/// an `IdentifierChannel`, §4.4); app-state persistence has no channel to
/// consult since element references are always stored with already-canonical
/// ids, so this is a minimal direct `serde_json` mirror used only at the
/// persistence boundary.
pub(crate) struct WireValue(pub Value);

impl serde::Serialize for WireValue {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		let mut channel = replicate_common::identifiers::IdentifierChannel::new();
		let json = self
			.0
			.marshal(&mut channel)
			.map_err(serde::ser::Error::custom)?;
		json.serialize(serializer)
	}
}

impl<'de> serde::Deserialize<'de> for WireValue {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let json = serde_json::Value::deserialize(deserializer)?;
		let mut channel = replicate_common::identifiers::IdentifierChannel::new();
		let value = Value::unmarshal(&json, &mut channel).map_err(serde::de::Error::custom)?;
		Ok(WireValue(value))
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::persistence::InMemoryCollection;
	use replicate_common::identifiers::ChildType;

	fn resource() -> AppStateResource {
		AppStateResource::new(
			Arc::new(InMemoryCollection::new()),
			Arc::new(InMemoryCollection::new()),
			Arc::new(InMemoryCollection::new()),
		)
	}

	#[test]
	fn paid_manager_dedups_equivalent_templates() {
		let mut paid = PaidManager::new();
		let entry = TemplateEntry {
			parent_id: TemplateId::from(ROOT_ID),
			child_type: ChildType::Single,
			child_name: "m".to_string(),
			referred_id: None,
		};
		let (a, new_a) = paid.get_or_allocate_template(entry.clone());
		let (b, new_b) = paid.get_or_allocate_template(entry);
		assert_eq!(a, b);
		assert!(new_a);
		assert!(!new_b);
	}

	#[tokio::test]
	async fn write_assigns_one_revision_per_batch() {
		let mut res = resource();
		let mut core = ResourceCore::default();
		res.load(&mut core).await;
		let entries = vec![
			WriteEntry {
				ident: "2:1:a".to_string(),
				value: Value::Str("x".to_string()),
			},
			WriteEntry {
				ident: "2:1:b".to_string(),
				value: Value::Str("y".to_string()),
			},
		];
		let (ack, updated) = res
			.apply_write(&mut core, ResourceId::from(1), SubscriberId::from(1), entries)
			.await
			.unwrap();
		assert_eq!(ack.revision.get(), 1);
		assert!(updated.iter().all(|e| e.revision.get() == 1));
	}

	#[tokio::test]
	async fn empty_write_does_not_advance_revision() {
		let mut res = resource();
		let mut core = ResourceCore::default();
		res.load(&mut core).await;
		let (ack, updated) = res
			.apply_write(&mut core, ResourceId::from(1), SubscriberId::from(1), vec![])
			.await
			.unwrap();
		assert_eq!(ack.revision.get(), 0);
		assert!(updated.is_empty());
	}

	#[tokio::test]
	async fn deletion_sentinel_removes_element() {
		let mut res = resource();
		let mut core = ResourceCore::default();
		res.load(&mut core).await;
		res.apply_write(
			&mut core,
			ResourceId::from(1),
			SubscriberId::from(1),
			vec![WriteEntry {
				ident: "2:1:a".to_string(),
				value: Value::Str("x".to_string()),
			}],
		)
		.await
		.unwrap();
		assert!(core.elements.contains_key("2:1:a"));
		res.apply_write(
			&mut core,
			ResourceId::from(1),
			SubscriberId::from(1),
			vec![WriteEntry {
				ident: "2:1:a".to_string(),
				value: Value::Delete,
			}],
		)
		.await
		.unwrap();
		assert!(!core.elements.contains_key("2:1:a"));
	}
}
