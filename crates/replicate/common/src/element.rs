//! `ResourceElement`: the unit of update (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::Revision;
use crate::value::Value;

/// An element as held by a resource: `ident` is a string key unique within
/// the resource, `value` may be [`Value::Delete`], `revision` is assigned on
/// write, and `rev_timestamp` is informational only.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceElement {
	pub ident: String,
	pub value: Value,
	pub revision: Revision,
	pub rev_timestamp: DateTime<Utc>,
}

impl ResourceElement {
	pub fn is_deleted(&self) -> bool {
		matches!(self.value, Value::Delete)
	}
}

/// A revision-ordered pair used in `resourceUpdate`/`writeAck` wire payloads
/// to describe how far a subscriber has been brought up to date.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LastRevision(pub u64);

impl From<Revision> for LastRevision {
	fn from(r: Revision) -> Self {
		LastRevision(r.get())
	}
}
