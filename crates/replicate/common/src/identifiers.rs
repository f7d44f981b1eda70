//! Per-connection template/index identifier remapping (§4.3).
//!
//! Each peer allocates ids in its own numeric space starting at 2; id 1 is
//! the shared root, pre-seeded on every connection. Before a message uses an
//! id, the sender must have transmitted a `define` recursively declaring
//! that id and all its transitive dependencies, in topological order.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{IndexId, TemplateId, ROOT_ID};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ChildType {
	Single,
	Set,
	Intersection,
}

/// `(parentId, childType, childName, referredId?)`; the root has id 1.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TemplateEntry {
	pub parent_id: TemplateId,
	pub child_type: ChildType,
	pub child_name: String,
	pub referred_id: Option<TemplateId>,
}

impl TemplateEntry {
	fn dependencies(&self) -> impl Iterator<Item = TemplateId> {
		[Some(self.parent_id), self.referred_id].into_iter().flatten()
	}
}

/// `(prefixId, append?: string, compose?: id)`; exactly one of `append` or
/// `compose` is present for non-root entries; root is id 1.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct IndexEntry {
	pub prefix_id: IndexId,
	pub append: Option<String>,
	pub compose: Option<IndexId>,
}

impl IndexEntry {
	fn dependencies(&self) -> impl Iterator<Item = IndexId> {
		[Some(self.prefix_id), self.compose].into_iter().flatten()
	}
}

#[derive(Debug, Error)]
pub enum IdentifierChannelError {
	#[error("unknown local template id {0}")]
	UnknownLocalTemplate(TemplateId),
	#[error("unknown local index id {0}")]
	UnknownLocalIndex(IndexId),
	#[error("unknown remote template id {0}")]
	UnknownRemoteTemplate(TemplateId),
	#[error("unknown remote index id {0}")]
	UnknownRemoteIndex(IndexId),
	#[error("template entry {0} references undefined dependency")]
	DanglingTemplateDependency(TemplateId),
	#[error("index entry {0} references undefined dependency")]
	DanglingIndexDependency(IndexId),
}

/// A definition to be flushed to the peer via a `define` message, in
/// topological order (dependencies first).
#[derive(Debug, Clone)]
pub enum PendingDefinition {
	Template(TemplateId, TemplateEntry),
	Index(IndexId, IndexEntry),
}

/// Per-connection bidirectional remapping of template/index ids.
///
/// Locally minted entries are the ones this peer has allocated (e.g. while
/// marshalling an app-state write); remote entries arrive via `define`
/// messages from the peer and are assigned fresh local ids on receipt, with
/// `remote_to_local` recording the correspondence for subsequent
/// unmarshalling.
#[derive(Debug)]
pub struct IdentifierChannel {
	local_templates: HashMap<TemplateId, TemplateEntry>,
	local_indices: HashMap<IndexId, IndexEntry>,
	next_local_template: u32,
	next_local_index: u32,

	/// ids (local numbering) already sent to the peer on this connection.
	defined_on_wire_templates: std::collections::HashSet<TemplateId>,
	defined_on_wire_indices: std::collections::HashSet<IndexId>,

	/// unmarshalling: peer id -> local id.
	remote_to_local_templates: HashMap<TemplateId, TemplateId>,
	remote_to_local_indices: HashMap<IndexId, IndexId>,

	pending_templates: Vec<PendingDefinition>,
	pending_indices: Vec<PendingDefinition>,
}

impl Default for IdentifierChannel {
	fn default() -> Self {
		Self::new()
	}
}

impl IdentifierChannel {
	pub fn new() -> Self {
		let mut defined_templates = std::collections::HashSet::new();
		defined_templates.insert(TemplateId::from(ROOT_ID));
		let mut defined_indices = std::collections::HashSet::new();
		defined_indices.insert(IndexId::from(ROOT_ID));

		let mut remote_templates = HashMap::new();
		remote_templates.insert(TemplateId::from(ROOT_ID), TemplateId::from(ROOT_ID));
		let mut remote_indices = HashMap::new();
		remote_indices.insert(IndexId::from(ROOT_ID), IndexId::from(ROOT_ID));

		Self {
			local_templates: HashMap::new(),
			local_indices: HashMap::new(),
			next_local_template: ROOT_ID + 1,
			next_local_index: ROOT_ID + 1,
			defined_on_wire_templates: defined_templates,
			defined_on_wire_indices: defined_indices,
			remote_to_local_templates: remote_templates,
			remote_to_local_indices: remote_indices,
			pending_templates: Vec::new(),
			pending_indices: Vec::new(),
		}
	}

	/// Allocate a new local template id and register `entry` for it.
	pub fn allocate_template(&mut self, entry: TemplateEntry) -> TemplateId {
		let id = TemplateId::from(self.next_local_template);
		self.next_local_template += 1;
		self.local_templates.insert(id, entry);
		id
	}

	pub fn allocate_index(&mut self, entry: IndexEntry) -> IndexId {
		let id = IndexId::from(self.next_local_index);
		self.next_local_index += 1;
		self.local_indices.insert(id, entry);
		id
	}

	/// Idempotent: recursively defines `id`'s dependencies (depth-first,
	/// iterative — per the "arena, not recursive closures" note), appending
	/// each not-yet-defined ancestor before `id` itself, so the resulting
	/// `pending_templates` queue is already in topological order.
	pub fn define_template(&mut self, id: TemplateId) -> Result<(), IdentifierChannelError> {
		if self.defined_on_wire_templates.contains(&id) {
			return Ok(());
		}
		let mut stack = vec![(id, false)];
		let mut seen = std::collections::HashSet::new();
		while let Some((current, children_pushed)) = stack.pop() {
			if self.defined_on_wire_templates.contains(&current) {
				continue;
			}
			let entry = self
				.local_templates
				.get(&current)
				.ok_or(IdentifierChannelError::UnknownLocalTemplate(current))?
				.clone();
			if !children_pushed {
				if !seen.insert(current) {
					continue;
				}
				stack.push((current, true));
				for dep in entry.dependencies() {
					if !self.defined_on_wire_templates.contains(&dep) {
						stack.push((dep, false));
					}
				}
			} else {
				self.defined_on_wire_templates.insert(current);
				self.pending_templates
					.push(PendingDefinition::Template(current, entry));
			}
		}
		Ok(())
	}

	pub fn define_index(&mut self, id: IndexId) -> Result<(), IdentifierChannelError> {
		if self.defined_on_wire_indices.contains(&id) {
			return Ok(());
		}
		let mut stack = vec![(id, false)];
		let mut seen = std::collections::HashSet::new();
		while let Some((current, children_pushed)) = stack.pop() {
			if self.defined_on_wire_indices.contains(&current) {
				continue;
			}
			let entry = self
				.local_indices
				.get(&current)
				.ok_or(IdentifierChannelError::UnknownLocalIndex(current))?
				.clone();
			if !children_pushed {
				if !seen.insert(current) {
					continue;
				}
				stack.push((current, true));
				for dep in entry.dependencies() {
					if !self.defined_on_wire_indices.contains(&dep) {
						stack.push((dep, false));
					}
				}
			} else {
				self.defined_on_wire_indices.insert(current);
				self.pending_indices
					.push(PendingDefinition::Index(current, entry));
			}
		}
		Ok(())
	}

	/// Drain the definitions that must be flushed before the next data
	/// message referencing them, in topological order.
	pub fn take_pending_definitions(&mut self) -> Vec<PendingDefinition> {
		let mut out = std::mem::take(&mut self.pending_templates);
		out.append(&mut self.pending_indices);
		out
	}

	pub fn translate_template(&self, id: TemplateId) -> Result<TemplateId, IdentifierChannelError> {
		self.remote_to_local_templates
			.get(&id)
			.copied()
			.ok_or(IdentifierChannelError::UnknownRemoteTemplate(id))
	}

	pub fn translate_index(&self, id: IndexId) -> Result<IndexId, IdentifierChannelError> {
		self.remote_to_local_indices
			.get(&id)
			.copied()
			.ok_or(IdentifierChannelError::UnknownRemoteIndex(id))
	}

	/// On receiving a `define`, translate all referenced peer ids to local
	/// ids first, then obtain (or allocate) the local entry.
	pub fn add_remote_template_definition(
		&mut self,
		remote_id: TemplateId,
		remote_entry: TemplateEntry,
	) -> Result<TemplateId, IdentifierChannelError> {
		if let Some(local) = self.remote_to_local_templates.get(&remote_id) {
			return Ok(*local);
		}
		let local_parent = self.translate_template(remote_entry.parent_id)?;
		let local_referred = remote_entry
			.referred_id
			.map(|r| self.translate_template(r))
			.transpose()?;
		let local_entry = TemplateEntry {
			parent_id: local_parent,
			child_type: remote_entry.child_type,
			child_name: remote_entry.child_name,
			referred_id: local_referred,
		};
		let local_id = self.allocate_template(local_entry);
		self.remote_to_local_templates.insert(remote_id, local_id);
		Ok(local_id)
	}

	pub fn add_remote_index_definition(
		&mut self,
		remote_id: IndexId,
		remote_entry: IndexEntry,
	) -> Result<IndexId, IdentifierChannelError> {
		if let Some(local) = self.remote_to_local_indices.get(&remote_id) {
			return Ok(*local);
		}
		let local_prefix = self.translate_index(remote_entry.prefix_id)?;
		let local_compose = remote_entry
			.compose
			.map(|c| self.translate_index(c))
			.transpose()?;
		let local_entry = IndexEntry {
			prefix_id: local_prefix,
			append: remote_entry.append,
			compose: local_compose,
		};
		let local_id = self.allocate_index(local_entry);
		self.remote_to_local_indices.insert(remote_id, local_id);
		Ok(local_id)
	}

	/// Invoked on reconnect; clears all state so both sides re-establish
	/// definitions from scratch.
	pub fn reset(&mut self) {
		*self = Self::new();
	}

	/// Registers `entry` under an id minted elsewhere (e.g. a resource's
	/// persistent allocator) rather than by [`Self::allocate_template`]'s own
	/// counter. Used when this channel's "local" numbering must agree with a
	/// resource-wide canonical id instead of a purely per-connection one.
	pub fn register_local_template(&mut self, id: TemplateId, entry: TemplateEntry) {
		self.next_local_template = self.next_local_template.max(id.get() + 1);
		self.local_templates.insert(id, entry);
	}

	pub fn register_local_index(&mut self, id: IndexId, entry: IndexEntry) {
		self.next_local_index = self.next_local_index.max(id.get() + 1);
		self.local_indices.insert(id, entry);
	}

	/// Records that the peer's `remote_id` corresponds to the already-known
	/// local/canonical `local_id`, without allocating a fresh one.
	pub fn register_remote_template(&mut self, remote_id: TemplateId, local_id: TemplateId) {
		self.remote_to_local_templates.insert(remote_id, local_id);
	}

	pub fn register_remote_index(&mut self, remote_id: IndexId, local_id: IndexId) {
		self.remote_to_local_indices.insert(remote_id, local_id);
	}

	/// True if `id` is already known in this channel's local numbering,
	/// either as something allocated here or already sent/received on the
	/// wire. Used to recognise an id a peer echoes back unchanged because
	/// the local and canonical numbering coincide (app-state resources).
	pub fn known_local_template(&self, id: TemplateId) -> bool {
		id == TemplateId::from(ROOT_ID) || self.local_templates.contains_key(&id) || self.defined_on_wire_templates.contains(&id)
	}

	pub fn known_local_index(&self, id: IndexId) -> bool {
		id == IndexId::from(ROOT_ID) || self.local_indices.contains_key(&id) || self.defined_on_wire_indices.contains(&id)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn leaf_template(parent: TemplateId, name: &str) -> TemplateEntry {
		TemplateEntry {
			parent_id: parent,
			child_type: ChildType::Single,
			child_name: name.to_string(),
			referred_id: None,
		}
	}

	#[test]
	fn root_is_preseeded() {
		let channel = IdentifierChannel::new();
		assert_eq!(
			channel.translate_template(TemplateId::from(ROOT_ID)).unwrap(),
			TemplateId::from(ROOT_ID)
		);
		assert_eq!(
			channel.translate_index(IndexId::from(ROOT_ID)).unwrap(),
			IndexId::from(ROOT_ID)
		);
	}

	#[test]
	fn define_template_is_idempotent_and_topological() {
		let mut channel = IdentifierChannel::new();
		let root = TemplateId::from(ROOT_ID);
		let mid = channel.allocate_template(leaf_template(root, "mid"));
		let leaf = channel.allocate_template(leaf_template(mid, "leaf"));

		channel.define_template(leaf).unwrap();
		let pending = channel.take_pending_definitions();
		let ids: Vec<TemplateId> = pending
			.iter()
			.map(|d| match d {
				PendingDefinition::Template(id, _) => *id,
				_ => panic!("expected template"),
			})
			.collect();
		assert_eq!(ids, vec![mid, leaf]);

		// idempotent: defining again yields nothing new
		channel.define_template(leaf).unwrap();
		assert!(channel.take_pending_definitions().is_empty());
	}

	#[test]
	fn remote_definition_round_trips() {
		let mut sender = IdentifierChannel::new();
		let root = TemplateId::from(ROOT_ID);
		let t = sender.allocate_template(leaf_template(root, "x"));
		sender.define_template(t).unwrap();
		let defs = sender.take_pending_definitions();

		let mut receiver = IdentifierChannel::new();
		let mut local_t = None;
		for def in defs {
			if let PendingDefinition::Template(remote_id, entry) = def {
				local_t = Some(
					receiver
						.add_remote_template_definition(remote_id, entry)
						.unwrap(),
				);
			}
		}
		let local_t = local_t.unwrap();
		assert_eq!(receiver.translate_template(t).unwrap(), local_t);
	}

	#[test]
	fn reset_clears_state() {
		let mut channel = IdentifierChannel::new();
		let root = TemplateId::from(ROOT_ID);
		let t = channel.allocate_template(leaf_template(root, "x"));
		channel.define_template(t).unwrap();
		assert!(!channel.take_pending_definitions().is_empty());

		channel.reset();
		assert!(channel
			.translate_template(TemplateId::from(ROOT_ID))
			.is_ok());
		assert!(channel.translate_template(t).is_err());
	}
}
