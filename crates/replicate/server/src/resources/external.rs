//! `ExternalResource` (§4.7.4): read-only, backed by a shared,
//! parameter-keyed client to an external data source. Grounded on §9 Design
//! Notes' "Pluggable external backends": `accepts(spec, path) -> bool`,
//! `construct(spec, params, path) -> ExternalDataSource`, shared by a keyed,
//! ref-counted cache.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use replicate_common::element::ResourceElement;
use replicate_common::ids::{ResourceId, Revision, SubscriberId};
use replicate_common::resource_spec::ResourceSpec;
use replicate_common::value::{Number, Value};
use serde_json::Value as Json;

use crate::error::ResourceError;
use crate::resources::compression::{build_dictionary, compress_column, should_build_dictionary};
use crate::resources::table::MAPPING_IDENT;
use crate::resources::{ResourceCore, ResourceKind, WriteAck, WriteEntry};

/// One row of external data: an opaque attribute map.
pub type ExternalRow = BTreeMap<String, Json>;

/// Column name the `[]` mapping synthesizes a row-index identity column
/// under when the backend's own rows don't already carry one (§4.7.4).
const RECORD_ID_COLUMN: &str = "recordId";

/// A live connection to an external backend, as described in §9 Design
/// Notes. `destroy` fires when the reference count returns to zero.
#[async_trait]
pub trait ExternalDataSource: Send + Sync {
	async fn get_data(&self) -> Result<Vec<ExternalRow>, ResourceError>;
	async fn destroy(&self) {}
}

/// A pluggable backend family: decides whether it handles a given spec/path,
/// and constructs the matching [`ExternalDataSource`].
#[async_trait]
pub trait ExternalBackend: Send + Sync {
	fn accepts(&self, app: &str, path: &[String]) -> bool;
	async fn construct(
		&self,
		app: &str,
		path: &[String],
		params: &Json,
	) -> Result<Arc<dyn ExternalDataSource>, ResourceError>;
}

/// One illustrative in-memory backend: serves whatever rows were registered
/// for an `app` name, ignoring `path`/`params`. Stands in for a real
/// warehouse-query driver (§1 Non-goals).
pub struct InMemoryBackend {
	tables: BTreeMap<String, Vec<ExternalRow>>,
}

impl InMemoryBackend {
	pub fn new(tables: BTreeMap<String, Vec<ExternalRow>>) -> Self {
		Self { tables }
	}
}

#[async_trait]
impl ExternalBackend for InMemoryBackend {
	fn accepts(&self, app: &str, _path: &[String]) -> bool {
		self.tables.contains_key(app)
	}

	async fn construct(
		&self,
		app: &str,
		_path: &[String],
		_params: &Json,
	) -> Result<Arc<dyn ExternalDataSource>, ResourceError> {
		let rows = self.tables.get(app).cloned().unwrap_or_default();
		Ok(Arc::new(StaticDataSource { rows }))
	}
}

struct StaticDataSource {
	rows: Vec<ExternalRow>,
}

#[async_trait]
impl ExternalDataSource for StaticDataSource {
	async fn get_data(&self) -> Result<Vec<ExternalRow>, ResourceError> {
		Ok(self.rows.clone())
	}
}

/// Dedup key for the shared backend-client cache: `id + JSON(params)` (§9
/// Design Notes), where `id` is the resource's canonical spec string.
fn share_key(spec: &ResourceSpec) -> String {
	spec.canonical_key()
}

/// The process-wide cache of live external-backend clients, ref-counted so
/// the last unsubscribing resource tears its client down.
#[derive(Default)]
pub struct SharedClients {
	clients: dashmap::DashMap<String, (Arc<dyn ExternalDataSource>, Arc<AtomicUsize>)>,
}

impl SharedClients {
	pub fn new() -> Self {
		Self::default()
	}

	async fn acquire(
		&self,
		spec: &ResourceSpec,
		backends: &[Arc<dyn ExternalBackend>],
		app: &str,
		path: &[String],
		params: &Json,
	) -> Result<Arc<dyn ExternalDataSource>, ResourceError> {
		let key = share_key(spec);
		if let Some(entry) = self.clients.get(&key) {
			entry.1.fetch_add(1, Ordering::SeqCst);
			return Ok(entry.0.clone());
		}
		let backend = backends
			.iter()
			.find(|b| b.accepts(app, path))
			.ok_or_else(|| ResourceError::BackendUnavailable(eyre::eyre!("no backend accepts app {app}")))?;
		let client = backend.construct(app, path, params).await?;
		self.clients.insert(key, (client.clone(), Arc::new(AtomicUsize::new(1))));
		Ok(client)
	}

	async fn release(&self, spec: &ResourceSpec) {
		let key = share_key(spec);
		let should_remove = match self.clients.get(&key) {
			Some(entry) => entry.1.fetch_sub(1, Ordering::SeqCst) == 1,
			None => false,
		};
		if should_remove {
			if let Some((_, (client, _))) = self.clients.remove(&key) {
				client.destroy().await;
			}
		}
	}
}

fn value_to_cell(v: &Json) -> Value {
	match v {
		Json::String(s) => Value::Str(s.clone()),
		Json::Number(n) => Value::Number(Number::Finite(n.as_f64().unwrap_or(0.0))),
		Json::Bool(b) => Value::Bool(*b),
		_ => Value::Empty,
	}
}

pub struct ExternalResource {
	spec: ResourceSpec,
	app: String,
	path: Vec<String>,
	params: Json,
	backends: Vec<Arc<dyn ExternalBackend>>,
	shared: Arc<SharedClients>,
	client: Option<Arc<dyn ExternalDataSource>>,
}

impl ExternalResource {
	pub fn new(
		spec: ResourceSpec,
		app: String,
		path: Vec<String>,
		params: Json,
		backends: Vec<Arc<dyn ExternalBackend>>,
		shared: Arc<SharedClients>,
	) -> Self {
		Self {
			spec,
			app,
			path,
			params,
			backends,
			shared,
			client: None,
		}
	}

	fn row_column(rows: &[ExternalRow], path: &[String]) -> Vec<Json> {
		let key = path.last().cloned().unwrap_or_default();
		rows.iter().map(|row| row.get(&key).cloned().unwrap_or(Json::Null)).collect()
	}
}

#[async_trait]
impl ResourceKind for ExternalResource {
	async fn load(&mut self, core: &mut ResourceCore) {
		let client = match self
			.shared
			.acquire(&self.spec, &self.backends, &self.app, &self.path, &self.params)
			.await
		{
			Ok(c) => c,
			Err(e) => {
				tracing::warn!(error = %e, "external backend construction failed");
				return;
			}
		};
		let rows = match client.get_data().await {
			Ok(rows) => rows,
			Err(e) => {
				tracing::warn!(error = %e, "external backend query failed");
				self.client = Some(client);
				return;
			}
		};
		self.client = Some(client);

		let now = Utc::now();
		let revision = Revision::from(1);

		let mut columns: Vec<String> = Vec::new();
		for row in &rows {
			for key in row.keys() {
				if !columns.contains(key) {
					columns.push(key.clone());
				}
			}
		}
		columns.sort();

		// spec §4.7.4: path `[]` names a synthetic `recordId` column when the
		// backend's rows don't already have one of their own.
		let synthetic_record_id = !columns.iter().any(|c| c.as_str() == RECORD_ID_COLUMN);
		if synthetic_record_id {
			columns.push(RECORD_ID_COLUMN.to_string());
			columns.sort();
		}

		let mut mapping_fields = BTreeMap::new();
		mapping_fields.insert(
			"nrDataElements".to_string(),
			Value::Number(Number::Finite(rows.len() as f64)),
		);
		mapping_fields.insert("firstId".to_string(), Value::Number(Number::Finite(0.0)));
		mapping_fields.insert(
			"columnPaths".to_string(),
			Value::OrderedSet(columns.iter().cloned().map(Value::Str).collect()),
		);
		core.elements.insert(
			MAPPING_IDENT.to_string(),
			ResourceElement {
				ident: MAPPING_IDENT.to_string(),
				value: Value::AttributeValueRecord(mapping_fields),
				revision,
				rev_timestamp: now,
			},
		);

		for column_path in &columns {
			let column = if synthetic_record_id && column_path.as_str() == RECORD_ID_COLUMN {
				(0..rows.len() as i64).map(Json::from).collect()
			} else {
				Self::row_column(&rows, std::slice::from_ref(column_path))
			};
			let runs = compress_column(&column);
			let mut ranges = Vec::new();
			for run in &runs {
				let mut fields = BTreeMap::new();
				fields.insert("offset".to_string(), Value::Number(Number::Finite(run.offset as f64)));
				fields.insert(
					"values".to_string(),
					Value::OrderedSet(run.values.iter().map(value_to_cell).collect()),
				);
				ranges.push(Value::AttributeValueRecord(fields));
			}
			let mut fields = BTreeMap::new();
			fields.insert("ranges".to_string(), Value::OrderedSet(ranges));
			if should_build_dictionary(&column) {
				let dict = build_dictionary(&column);
				let mut dict_fields = BTreeMap::new();
				for (k, v) in dict {
					dict_fields.insert(k, value_to_cell(&v));
				}
				fields.insert("indexedValues".to_string(), Value::AttributeValueRecord(dict_fields));
			}
			core.elements.insert(
				column_path.clone(),
				ResourceElement {
					ident: column_path.clone(),
					value: Value::AttributeValueRecord(fields),
					revision,
					rev_timestamp: now,
				},
			);
		}
		core.last_revision = revision;
	}

	async fn apply_write(
		&mut self,
		_core: &mut ResourceCore,
		_id: ResourceId,
		_originator: SubscriberId,
		_entries: Vec<WriteEntry>,
	) -> Result<(WriteAck, Vec<ResourceElement>), ResourceError> {
		Err(ResourceError::UnsupportedOperation)
	}

	async fn on_purge(&mut self) {
		self.shared.release(&self.spec).await;
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn backend() -> Arc<dyn ExternalBackend> {
		let mut tables = BTreeMap::new();
		tables.insert(
			"orders".to_string(),
			vec![
				BTreeMap::from([("amount".to_string(), serde_json::json!(10))]),
				BTreeMap::from([("amount".to_string(), serde_json::json!(20))]),
			],
		);
		Arc::new(InMemoryBackend::new(tables))
	}

	#[tokio::test]
	async fn load_builds_mapping_and_column_elements() {
		let spec = ResourceSpec::External {
			app: "orders".to_string(),
			path: vec![],
			params: Json::Null,
		};
		let mut res = ExternalResource::new(
			spec,
			"orders".to_string(),
			vec![],
			Json::Null,
			vec![backend()],
			Arc::new(SharedClients::new()),
		);
		let mut core = ResourceCore::default();
		res.load(&mut core).await;
		assert!(core.elements.contains_key(MAPPING_IDENT));
		assert!(core.elements.contains_key("amount"));
	}

	#[tokio::test]
	async fn write_is_unsupported() {
		let spec = ResourceSpec::External {
			app: "orders".to_string(),
			path: vec![],
			params: Json::Null,
		};
		let mut res = ExternalResource::new(
			spec,
			"orders".to_string(),
			vec![],
			Json::Null,
			vec![backend()],
			Arc::new(SharedClients::new()),
		);
		let mut core = ResourceCore::default();
		let err = res
			.apply_write(&mut core, ResourceId::from(1), SubscriberId::from(1), vec![])
			.await
			.unwrap_err();
		assert!(matches!(err, ResourceError::UnsupportedOperation));
	}
}
