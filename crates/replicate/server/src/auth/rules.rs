//! `RuleStore` and the resolution algorithm (§4.5): `(owner, type, name) ->
//! accessor -> allow|deny`, with a `*` wildcard accessor and a `(owner, *,
//! *)` per-owner fallback rule.

use std::collections::HashMap;
use std::sync::RwLock;

/// The resource kind a rule is scoped to, or `*` (any kind) for the
/// per-owner fallback.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum RuleKind {
	AppState,
	Table,
	Metadata,
	External,
	Any,
}

/// `*` matches any resource name within its `(owner, kind)` scope.
const WILDCARD_NAME: &str = "*";
const WILDCARD_ACCESSOR: &str = "*";

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
struct RuleKey {
	owner: String,
	kind: RuleKind,
	name: String,
}

/// In-memory rule store: `(owner, kind, name) -> accessor -> allow`. A real
/// deployment would back this by a `Collection`; the persistence mechanism
/// is irrelevant to the resolution algorithm below, which is what §4.5
/// actually specifies.
#[derive(Debug, Default)]
pub struct RuleStore {
	rules: RwLock<HashMap<RuleKey, HashMap<String, bool>>>,
}

impl RuleStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set_rule(&self, owner: &str, kind: RuleKind, name: &str, accessor: &str, allow: bool) {
		let key = RuleKey {
			owner: owner.to_string(),
			kind,
			name: name.to_string(),
		};
		self.rules
			.write()
			.unwrap()
			.entry(key)
			.or_default()
			.insert(accessor.to_string(), allow);
	}

	fn lookup(&self, owner: &str, kind: RuleKind, name: &str, accessor: &str) -> Option<bool> {
		let key = RuleKey {
			owner: owner.to_string(),
			kind,
			name: name.to_string(),
		};
		let rules = self.rules.read().unwrap();
		let accessors = rules.get(&key)?;
		accessors
			.get(accessor)
			.or_else(|| accessors.get(WILDCARD_ACCESSOR))
			.copied()
	}

	/// Resolve `(owner, type, name, accessor)` per the exact six-step
	/// algorithm of §4.5.
	pub fn resolve(
		&self,
		owner: &str,
		kind: RuleKind,
		name: &str,
		accessor: &str,
		public_data_access: bool,
		owner_always_allowed: bool,
	) -> bool {
		// 1. Per-owner wildcard rule; remember whether it was an explicit allow.
		let wildcard_verdict = self.lookup(owner, RuleKind::Any, WILDCARD_NAME, accessor);
		if wildcard_verdict == Some(false) {
			return false;
		}
		let wildcard_explicit_allow = wildcard_verdict == Some(true);

		// 2. Specific rule overrides.
		if let Some(verdict) = self.lookup(owner, kind, name, accessor) {
			return verdict;
		}

		// 3.
		if wildcard_explicit_allow {
			return true;
		}

		// 4.
		if owner_always_allowed && accessor == owner {
			return true;
		}

		// 5.
		if public_data_access && matches!(kind, RuleKind::Table | RuleKind::Metadata) {
			return true;
		}

		// 6.
		false
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn owner_wildcard_deny_overrides_a_specific_allow_rule() {
		// Step 1 ("if deny, deny") is an unconditional gate that runs
		// before step 2 ever consults the specific rule.
		let store = RuleStore::new();
		store.set_rule("alice", RuleKind::Any, WILDCARD_NAME, "bob", false);
		store.set_rule("alice", RuleKind::AppState, "x", "bob", true);
		assert!(!store.resolve("alice", RuleKind::AppState, "x", "bob", false, true));
	}

	#[test]
	fn specific_rule_overrides_wildcard_allow() {
		let store = RuleStore::new();
		store.set_rule("alice", RuleKind::Any, WILDCARD_NAME, "bob", true);
		store.set_rule("alice", RuleKind::AppState, "x", "bob", false);
		assert!(!store.resolve("alice", RuleKind::AppState, "x", "bob", false, true));
	}

	#[test]
	fn explicit_wildcard_allow_covers_unlisted_resource() {
		let store = RuleStore::new();
		store.set_rule("alice", RuleKind::Any, WILDCARD_NAME, "bob", true);
		assert!(store.resolve("alice", RuleKind::AppState, "y", "bob", false, true));
	}

	#[test]
	fn owner_is_allowed_by_default() {
		let store = RuleStore::new();
		assert!(store.resolve("alice", RuleKind::AppState, "x", "alice", false, true));
	}

	#[test]
	fn owner_default_allow_can_be_disabled() {
		let store = RuleStore::new();
		assert!(!store.resolve("alice", RuleKind::AppState, "x", "alice", false, false));
	}

	#[test]
	fn public_data_access_allows_table_and_metadata_but_not_app_state() {
		let store = RuleStore::new();
		assert!(store.resolve("alice", RuleKind::Table, "x", "stranger", true, true));
		assert!(store.resolve("alice", RuleKind::Metadata, "x", "stranger", true, true));
		assert!(!store.resolve("alice", RuleKind::AppState, "x", "stranger", true, true));
	}

	#[test]
	fn unauthorized_accessor_denied_by_default() {
		let store = RuleStore::new();
		assert!(!store.resolve("alice", RuleKind::AppState, "x", "stranger", false, true));
	}

	#[test]
	fn denial_scenario_from_end_to_end_spec() {
		// Accessor "bob" subscribes to (owner: "alice", type: "appState", app: "x");
		// rule store contains (alice, *, *) -> { bob: false }.
		let store = RuleStore::new();
		store.set_rule("alice", RuleKind::Any, WILDCARD_NAME, "bob", false);
		assert!(!store.resolve("alice", RuleKind::AppState, "x", "bob", false, true));
	}
}
