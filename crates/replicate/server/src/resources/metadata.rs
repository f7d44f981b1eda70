//! `MetadataResource` (§4.7.3): the global singleton describing every table.
//! Embeds routing to the backing table resources through the [`Manager`]
//! and the id-allocation / merge-not-replace semantics of §4.7.3.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use replicate_common::element::ResourceElement;
use replicate_common::ids::{ResourceId, Revision, SubscriberId};
use replicate_common::resource_spec::ResourceSpec;
use replicate_common::value::{Number, Value};

use crate::error::ResourceError;
use crate::persistence::Collection;
use crate::resources::manager::Manager;
use crate::resources::{ResourceCore, ResourceKind, WriteAck, WriteEntry};

/// Derives the canonical table spec an embedded-table id is reachable
/// under, so a client can later `subscribe({ type: "table", app:
/// "metadata:<id>" })` to the same resource the metadata record routed its
/// `data` to.
pub fn table_spec_for_id(table_id: u64) -> ResourceSpec {
	ResourceSpec::Table {
		app: format!("metadata:{table_id}"),
		path: Vec::new(),
	}
}

pub struct MetadataResource {
	records: Arc<dyn Collection>,
	manager: Arc<Manager>,
	next_table_id: AtomicU64,
}

impl MetadataResource {
	pub fn new(records: Arc<dyn Collection>, manager: Arc<Manager>) -> Self {
		Self {
			records,
			manager,
			next_table_id: AtomicU64::new(1),
		}
	}

	fn merge(existing: Option<&Value>, update: &BTreeMap<String, Value>) -> Value {
		let mut fields = match existing {
			Some(Value::AttributeValueRecord(m)) => m.clone(),
			_ => BTreeMap::new(),
		};
		for (k, v) in update {
			fields.insert(k.clone(), v.clone());
		}
		Value::AttributeValueRecord(fields)
	}
}

/// One parsed metadata write-list entry.
struct MetadataWriteItem {
	/// The client-supplied temp id, present only when the entry carries no
	/// existing table id and a fresh one must be allocated.
	client_temp_id: Option<String>,
	table_id: Option<u64>,
	remove: bool,
	data: Option<Value>,
	fields: BTreeMap<String, Value>,
}

fn parse_entry(entry: &WriteEntry) -> MetadataWriteItem {
	let mut fields = match &entry.value {
		Value::AttributeValueRecord(m) => m.clone(),
		_ => BTreeMap::new(),
	};
	let remove = matches!(fields.remove("remove"), Some(Value::Bool(true)));
	let data = fields.remove("data");
	let table_id = entry.ident.parse::<u64>().ok();
	MetadataWriteItem {
		client_temp_id: if table_id.is_none() { Some(entry.ident.clone()) } else { None },
		table_id,
		remove,
		data,
		fields,
	}
}

#[async_trait]
impl ResourceKind for MetadataResource {
	async fn load(&mut self, core: &mut ResourceCore) {
		if let Ok(records) = self.records.scan().await {
			for record in records {
				if let (Ok(id), Ok(value)) = (
					record.id.parse::<u64>(),
					serde_json::from_value::<super::app_state::WireValue>(record.value),
				) {
					self.next_table_id.fetch_max(id + 1, Ordering::SeqCst);
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

		// Synthesize one read-only entry per configured external data source
		// (§4.7.3) so clients discover them without a dedicated listing call.
		for source in self.manager.external_source_descriptors() {
			core.elements.insert(
				source.ident.clone(),
				ResourceElement {
					ident: source.ident,
					value: source.value,
					revision: core.last_revision,
					rev_timestamp: Utc::now(),
				},
			);
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
		let mut info = serde_json::Map::new();

		for entry in entries {
			let item = parse_entry(&entry);

			if item.remove {
				if let Some(table_id) = item.table_id {
					let spec = table_spec_for_id(table_id);
					let handle = self.manager.get_resource_by_spec(&spec);
					let _ = handle.remove().await;
				}
				let ident = item.table_id.map(|id| id.to_string()).unwrap_or(entry.ident.clone());
				self.records
					.delete(&ident)
					.await
					.map_err(|e| ResourceError::Persistence(e.into()))?;
				let tombstone = ResourceElement {
					ident: ident.clone(),
					value: Value::Delete,
					revision,
					rev_timestamp: now,
				};
				core.elements.remove(&ident);
				updated.push(tombstone);
				continue;
			}

			let table_id = match item.table_id {
				Some(id) => id,
				None => self.next_table_id.fetch_add(1, Ordering::SeqCst),
			};
			let ident = table_id.to_string();

			if let Some(data) = item.data {
				let spec = table_spec_for_id(table_id);
				let handle = self.manager.get_resource_by_spec(&spec);
				if let Value::OrderedSet(list) = data {
					let table_entries = list
						.into_iter()
						.enumerate()
						.map(|(i, value)| WriteEntry {
							ident: if i == 0 { String::new() } else { i.to_string() },
							value,
						})
						.collect();
					let _ = handle.write(SubscriberId::from(0), table_entries).await;
				}
			}

			let merged = Self::merge(core.elements.get(&ident).map(|e| &e.value), &item.fields);
			self.records
				.put(crate::persistence::Record {
					id: ident.clone(),
					value: serde_json::to_value(super::app_state::WireValue(merged.clone())).unwrap(),
					revision: revision.get(),
					rev_timestamp: now,
				})
				.await
				.map_err(|e| ResourceError::Persistence(e.into()))?;

			let element = ResourceElement {
				ident: ident.clone(),
				value: merged,
				revision,
				rev_timestamp: now,
			};
			core.elements.insert(ident.clone(), element.clone());
			updated.push(element);

			if let Some(temp_id) = item.client_temp_id {
				info.insert(temp_id, serde_json::json!(table_id));
			}
		}

		core.last_revision = revision;
		Ok((
			WriteAck {
				revision,
				info: serde_json::Value::Object(info),
			},
			updated,
		))
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::persistence::InMemoryCollection;

	fn resource() -> MetadataResource {
		MetadataResource::new(Arc::new(InMemoryCollection::new()), Manager::new(Vec::new()))
	}

	#[tokio::test]
	async fn embedded_table_write_without_id_allocates_fresh_id_and_returns_it_in_info() {
		let mut res = resource();
		let mut core = ResourceCore::default();
		res.load(&mut core).await;

		let mut fields = BTreeMap::new();
		fields.insert("name".to_string(), Value::Str("orders".to_string()));
		let entries = vec![WriteEntry {
			ident: "clientTemp1".to_string(),
			value: Value::AttributeValueRecord(fields),
		}];
		let (ack, updated) = res
			.apply_write(&mut core, ResourceId::from(1), SubscriberId::from(1), entries)
			.await
			.unwrap();
		assert_eq!(updated.len(), 1);
		let info = ack.info.as_object().unwrap();
		assert!(info.contains_key("clientTemp1"));
	}

	#[tokio::test]
	async fn remove_true_tombstones_metadata_record() {
		let mut res = resource();
		let mut core = ResourceCore::default();
		res.load(&mut core).await;
		let mut fields = BTreeMap::new();
		fields.insert("name".to_string(), Value::Str("orders".to_string()));
		res.apply_write(
			&mut core,
			ResourceId::from(1),
			SubscriberId::from(1),
			vec![WriteEntry {
				ident: "clientTemp1".to_string(),
				value: Value::AttributeValueRecord(fields),
			}],
		)
		.await
		.unwrap();
		let table_id = core
			.elements
			.keys()
			.find_map(|k| k.parse::<u64>().ok())
			.expect("an allocated table id");

		let mut remove_fields = BTreeMap::new();
		remove_fields.insert("remove".to_string(), Value::Bool(true));
		let (_, updated) = res
			.apply_write(
				&mut core,
				ResourceId::from(1),
				SubscriberId::from(1),
				vec![WriteEntry {
					ident: table_id.to_string(),
					value: Value::AttributeValueRecord(remove_fields),
				}],
			)
			.await
			.unwrap();
		assert!(updated.iter().any(|e| e.is_deleted()));
	}
}
