//! `TableResource` (§4.7.2): one record at path `[]` holding the table
//! `mapping`, plus one record per column path holding its compressed
//! values. A write replaces the whole table atomically.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use replicate_common::element::ResourceElement;
use replicate_common::ids::{ResourceId, Revision, SubscriberId};
use replicate_common::value::{Number, Value};
use serde_json::Value as Json;

use crate::error::ResourceError;
use crate::persistence::{Collection, Record};
use crate::resources::compression::{build_dictionary, compress_column, should_build_dictionary};
use crate::resources::{ResourceCore, ResourceKind, WriteAck, WriteEntry};

/// Path `[]`'s ident, by convention the empty string (no column name can
/// collide with it since column paths are always non-empty).
pub const MAPPING_IDENT: &str = "";

pub struct TableResource {
	records: Arc<dyn Collection>,
}

impl TableResource {
	pub fn new(records: Arc<dyn Collection>) -> Self {
		Self { records }
	}
}

fn value_to_cell(v: &Value) -> Json {
	match v {
		Value::Str(s) => Json::String(s.clone()),
		Value::Number(Number::Finite(f)) => serde_json::json!(f),
		Value::Bool(b) => Json::Bool(*b),
		_ => Json::Null,
	}
}

fn cell_to_value(j: &Json) -> Value {
	match j {
		Json::Null => Value::Empty,
		Json::Bool(b) => Value::Bool(*b),
		Json::Number(n) => Value::Number(Number::Finite(n.as_f64().unwrap_or(0.0))),
		Json::String(s) => Value::Str(s.clone()),
		_ => Value::Empty,
	}
}

/// A parsed write-list item: either the `[]` mapping or one column.
enum TableWriteItem {
	Mapping { nr_data_elements: u64, first_id: u64, column_paths: Vec<String> },
	Column { path: String, values: Vec<Json> },
}

fn parse_write_entry(entry: &WriteEntry) -> Option<TableWriteItem> {
	let Value::AttributeValueRecord(fields) = &entry.value else {
		return None;
	};
	if entry.ident == MAPPING_IDENT {
		let nr_data_elements = match fields.get("nrDataElements") {
			Some(Value::Number(Number::Finite(f))) => *f as u64,
			_ => 0,
		};
		let first_id = match fields.get("firstId") {
			Some(Value::Number(Number::Finite(f))) => *f as u64,
			_ => 0,
		};
		let column_paths = match fields.get("columnPaths") {
			Some(Value::OrderedSet(items)) => items
				.iter()
				.filter_map(|v| match v {
					Value::Str(s) => Some(s.clone()),
					_ => None,
				})
				.collect(),
			_ => Vec::new(),
		};
		Some(TableWriteItem::Mapping {
			nr_data_elements,
			first_id,
			column_paths,
		})
	} else {
		let values = match fields.get("values") {
			Some(Value::OrderedSet(items)) => items.iter().map(value_to_cell).collect(),
			_ => Vec::new(),
		};
		Some(TableWriteItem::Column {
			path: entry.ident.clone(),
			values,
		})
	}
}

fn mapping_value(nr_data_elements: u64, first_id: u64, column_paths: &[String]) -> Value {
	let mut fields = BTreeMap::new();
	fields.insert(
		"nrDataElements".to_string(),
		Value::Number(Number::Finite(nr_data_elements as f64)),
	);
	fields.insert("firstId".to_string(), Value::Number(Number::Finite(first_id as f64)));
	fields.insert(
		"columnPaths".to_string(),
		Value::OrderedSet(column_paths.iter().cloned().map(Value::Str).collect()),
	);
	Value::AttributeValueRecord(fields)
}

fn column_value(values: &[Json]) -> Value {
	let runs = compress_column(values);
	let ranges: Vec<Value> = runs
		.iter()
		.map(|run| {
			let mut fields = BTreeMap::new();
			fields.insert(
				"offset".to_string(),
				Value::Number(Number::Finite(run.offset as f64)),
			);
			fields.insert(
				"values".to_string(),
				Value::OrderedSet(run.values.iter().map(cell_to_value).collect()),
			);
			Value::AttributeValueRecord(fields)
		})
		.collect();
	let mut fields = BTreeMap::new();
	fields.insert("ranges".to_string(), Value::OrderedSet(ranges));
	if should_build_dictionary(values) {
		let dict = build_dictionary(values);
		let mut dict_fields = BTreeMap::new();
		for (k, v) in dict {
			dict_fields.insert(k, cell_to_value(&v));
		}
		fields.insert("indexedValues".to_string(), Value::AttributeValueRecord(dict_fields));
	}
	Value::AttributeValueRecord(fields)
}

#[async_trait]
impl ResourceKind for TableResource {
	async fn load(&mut self, core: &mut ResourceCore) {
		if let Ok(records) = self.records.scan().await {
			for record in records {
				// These were persisted by this resource's own `apply_write`,
				// so the round-trip through the app-state `WireValue` codec is
				// safe here too (no element references ever appear in table
				// payloads).
				if let Ok(value) =
					serde_json::from_value::<super::app_state::WireValue>(record.value)
				{
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

	fn also_notify_writer(&self) -> bool {
		true
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

		self.records
			.clear()
			.await
			.map_err(|e| ResourceError::Persistence(e.into()))?;
		core.elements.clear();

		let mut column_paths: Vec<String> = Vec::new();
		let mut nr_data_elements: u64 = 0;
		let mut first_id: u64 = 0;
		let mut columns: Vec<(String, Vec<Json>)> = Vec::new();

		for entry in &entries {
			match parse_write_entry(entry) {
				Some(TableWriteItem::Mapping {
					nr_data_elements: n,
					first_id: f,
					column_paths: paths,
				}) => {
					nr_data_elements = n;
					first_id = f;
					column_paths = paths;
				}
				Some(TableWriteItem::Column { path, values }) => columns.push((path, values)),
				None => {}
			}
		}

		let mut updated = Vec::with_capacity(1 + columns.len());
		let mapping = ResourceElement {
			ident: MAPPING_IDENT.to_string(),
			value: mapping_value(nr_data_elements, first_id, &column_paths),
			revision,
			rev_timestamp: now,
		};
		self.persist(&mapping).await?;
		core.elements.insert(mapping.ident.clone(), mapping.clone());
		updated.push(mapping);

		for (path, values) in columns {
			let element = ResourceElement {
				ident: path,
				value: column_value(&values),
				revision,
				rev_timestamp: now,
			};
			self.persist(&element).await?;
			core.elements.insert(element.ident.clone(), element.clone());
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

	/// `removeTable` (§4.7.2): drop the collection and tombstone every
	/// element currently held so subscribers see the removal.
	async fn remove(&mut self, core: &mut ResourceCore, id: ResourceId) -> Result<(), ResourceError> {
		self.records
			.clear()
			.await
			.map_err(|e| ResourceError::Persistence(e.into()))?;
		let removed: Vec<String> = core.elements.keys().cloned().collect();
		core.elements.clear();
		core.last_revision = core.last_revision.next();
		let tombstones: Vec<ResourceElement> = removed
			.into_iter()
			.map(|ident| ResourceElement {
				ident,
				value: Value::Delete,
				revision: core.last_revision,
				rev_timestamp: Utc::now(),
			})
			.collect();
		core.notify(id, tombstones, None, true);
		Ok(())
	}
}

impl TableResource {
	async fn persist(&self, element: &ResourceElement) -> Result<(), ResourceError> {
		self.records
			.put(Record {
				id: element.ident.clone(),
				value: serde_json::to_value(super::app_state::WireValue(element.value.clone()))
					.unwrap(),
				revision: element.revision.get(),
				rev_timestamp: element.rev_timestamp,
			})
			.await
			.map_err(|e| ResourceError::Persistence(e.into()))
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::persistence::InMemoryCollection;

	fn mapping_entry(nr: u64, cols: &[&str]) -> WriteEntry {
		WriteEntry {
			ident: MAPPING_IDENT.to_string(),
			value: mapping_value(nr, 1, &cols.iter().map(|s| s.to_string()).collect::<Vec<_>>()),
		}
	}

	fn column_entry(path: &str, values: Vec<Json>) -> WriteEntry {
		let mut fields = BTreeMap::new();
		fields.insert(
			"values".to_string(),
			Value::OrderedSet(values.iter().map(cell_to_value).collect()),
		);
		WriteEntry {
			ident: path.to_string(),
			value: Value::AttributeValueRecord(fields),
		}
	}

	#[tokio::test]
	async fn replace_writes_mapping_and_columns_at_same_revision() {
		let mut res = TableResource::new(Arc::new(InMemoryCollection::new()));
		let mut core = ResourceCore::default();
		res.load(&mut core).await;

		let entries = vec![
			mapping_entry(3, &["a"]),
			column_entry("a", vec![serde_json::json!(10), serde_json::json!(20), serde_json::json!(30)]),
		];
		let (ack, updated) = res
			.apply_write(&mut core, ResourceId::from(1), SubscriberId::from(1), entries)
			.await
			.unwrap();
		assert_eq!(ack.revision.get(), 1);
		assert_eq!(updated.len(), 2);
		assert!(updated.iter().all(|e| e.revision.get() == 1));
		assert!(core.elements.contains_key(MAPPING_IDENT));
		assert!(core.elements.contains_key("a"));
	}

	#[tokio::test]
	async fn also_notify_writer_is_true_for_tables() {
		let res = TableResource::new(Arc::new(InMemoryCollection::new()));
		assert!(res.also_notify_writer());
	}

	#[tokio::test]
	async fn empty_table_write_still_emits_mapping_update() {
		let mut res = TableResource::new(Arc::new(InMemoryCollection::new()));
		let mut core = ResourceCore::default();
		res.load(&mut core).await;
		let (_, updated) = res
			.apply_write(
				&mut core,
				ResourceId::from(1),
				SubscriberId::from(1),
				vec![mapping_entry(0, &[])],
			)
			.await
			.unwrap();
		assert_eq!(updated.len(), 1);
		assert_eq!(updated[0].ident, MAPPING_IDENT);
	}

	#[tokio::test]
	async fn genuinely_empty_write_list_is_a_no_op() {
		let mut res = TableResource::new(Arc::new(InMemoryCollection::new()));
		let mut core = ResourceCore::default();
		res.load(&mut core).await;
		res.apply_write(
			&mut core,
			ResourceId::from(1),
			SubscriberId::from(1),
			vec![mapping_entry(1, &["a"]), column_entry("a", vec![serde_json::json!(1)])],
		)
		.await
		.unwrap();
		let revision_before = core.last_revision;

		let (ack, updated) = res
			.apply_write(&mut core, ResourceId::from(1), SubscriberId::from(1), vec![])
			.await
			.unwrap();
		assert!(updated.is_empty());
		assert_eq!(ack.revision, revision_before);
		assert_eq!(core.last_revision, revision_before);
		assert!(core.elements.contains_key("a"));
	}

	#[tokio::test]
	async fn remove_table_clears_state_and_emits_tombstones() {
		let mut res = TableResource::new(Arc::new(InMemoryCollection::new()));
		let mut core = ResourceCore::default();
		res.load(&mut core).await;
		res.apply_write(
			&mut core,
			ResourceId::from(1),
			SubscriberId::from(1),
			vec![mapping_entry(1, &["a"]), column_entry("a", vec![serde_json::json!(1)])],
		)
		.await
		.unwrap();
		ResourceKind::remove(&mut res, &mut core, ResourceId::from(1)).await.unwrap();
		assert!(core.elements.is_empty());
	}
}
