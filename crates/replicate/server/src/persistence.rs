//! The document-store backing is an external collaborator (§1 Non-goals);
//! `Collection` stands in for it as an ordered key-value abstraction, with
//! one in-memory implementation provided as the default/only backing.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value as Json;

/// One persisted record, as laid out in §6.3: an opaque `value` plus the
/// revision/timestamp metadata every collection record carries.
#[derive(Debug, Clone)]
pub struct Record {
	pub id: String,
	pub value: Json,
	pub revision: u64,
	pub rev_timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum CollectionError {
	#[error("i/o error: {0}")]
	Io(String),
}

/// An ordered key-value collection: the persistence unit a resource reads
/// from and writes to. Keys sort lexicographically so `scan` can return
/// elements in a stable order; real backends are expected to offer the
/// same guarantee.
#[async_trait]
pub trait Collection: Send + Sync {
	async fn get(&self, id: &str) -> Result<Option<Record>, CollectionError>;
	async fn put(&self, record: Record) -> Result<(), CollectionError>;
	async fn delete(&self, id: &str) -> Result<(), CollectionError>;
	async fn scan(&self) -> Result<Vec<Record>, CollectionError>;
	/// Drop every record in the collection, e.g. for `TableResource`'s
	/// atomic replace-on-write or `removeTable`.
	async fn clear(&self) -> Result<(), CollectionError>;
}

/// The default/only backing implementation: everything lives in a
/// `BTreeMap` guarded by a `Mutex`, matching what the spec calls "an ordered
/// key-value collection abstraction" in lieu of the real document store.
#[derive(Debug, Default)]
pub struct InMemoryCollection {
	records: Mutex<BTreeMap<String, Record>>,
}

impl InMemoryCollection {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl Collection for InMemoryCollection {
	async fn get(&self, id: &str) -> Result<Option<Record>, CollectionError> {
		Ok(self.records.lock().unwrap().get(id).cloned())
	}

	async fn put(&self, record: Record) -> Result<(), CollectionError> {
		self.records.lock().unwrap().insert(record.id.clone(), record);
		Ok(())
	}

	async fn delete(&self, id: &str) -> Result<(), CollectionError> {
		self.records.lock().unwrap().remove(id);
		Ok(())
	}

	async fn scan(&self) -> Result<Vec<Record>, CollectionError> {
		Ok(self.records.lock().unwrap().values().cloned().collect())
	}

	async fn clear(&self) -> Result<(), CollectionError> {
		self.records.lock().unwrap().clear();
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn record(id: &str) -> Record {
		Record {
			id: id.to_string(),
			value: serde_json::json!({"x": 1}),
			revision: 1,
			rev_timestamp: chrono::Utc::now(),
		}
	}

	#[tokio::test]
	async fn put_then_get_roundtrips() {
		let collection = InMemoryCollection::new();
		collection.put(record("a")).await.unwrap();
		let got = collection.get("a").await.unwrap().unwrap();
		assert_eq!(got.id, "a");
	}

	#[tokio::test]
	async fn clear_drops_everything() {
		let collection = InMemoryCollection::new();
		collection.put(record("a")).await.unwrap();
		collection.put(record("b")).await.unwrap();
		collection.clear().await.unwrap();
		assert!(collection.scan().await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn delete_removes_one_record() {
		let collection = InMemoryCollection::new();
		collection.put(record("a")).await.unwrap();
		collection.put(record("b")).await.unwrap();
		collection.delete("a").await.unwrap();
		let remaining = collection.scan().await.unwrap();
		assert_eq!(remaining.len(), 1);
		assert_eq!(remaining[0].id, "b");
	}
}
