//! The value language and its XDR-style marshalling (§4.4).
//!
//! Every value carries a `type` tag on the wire; marshalling is parametrised
//! by an [`IdentifierChannel`] because [`Value::ElementReference`] and the
//! channel-referencing comparison clauses must translate ids between peers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use thiserror::Error;

use crate::identifiers::IdentifierChannel;
use crate::ids::{IndexId, TemplateId};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct ElementReference {
	pub template_id: TemplateId,
	pub index_id: IndexId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Number {
	Finite(f64),
	Infinity,
	NegInfinity,
	NaN,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BoundKind {
	Open,
	Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bound {
	pub value: Box<Value>,
	pub kind: BoundKind,
}

/// The value language: primitives, ordered sets, ranges, negations,
/// attribute-value records, element references, and comparison functions.
/// `Delete` is the deletion sentinel (§9 Design Notes): kept as a distinct
/// variant all the way to the persistence boundary, never collapsed to a
/// bare `null` early.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
	Str(String),
	Number(Number),
	Bool(bool),
	Empty,
	Projector,
	OrderedSet(Vec<Value>),
	Range {
		lo: Option<Bound>,
		hi: Option<Bound>,
	},
	Negation(Vec<Value>),
	Substring(String),
	ComparisonFunction {
		clauses: Vec<Value>,
		ascending: bool,
	},
	AttributeValueRecord(BTreeMap<String, Value>),
	ElementReference(ElementReference),
	Delete,
}

#[derive(Debug, Error)]
pub enum ValueCodecError {
	#[error("unknown value type tag: {0}")]
	UnknownTag(String),
	#[error("missing field {0} on value")]
	MissingField(&'static str),
	#[error("malformed field {0}")]
	MalformedField(&'static str),
	#[error(transparent)]
	Identifier(#[from] crate::identifiers::IdentifierChannelError),
}

impl Value {
	/// Marshal into the `{ type, ...fields }` wire representation, consulting
	/// `channel` for [`Value::ElementReference`] and for comparison-function
	/// clauses that may themselves reference the channel.
	pub fn marshal(&self, channel: &mut IdentifierChannel) -> Result<Json, ValueCodecError> {
		Ok(match self {
			Value::Str(s) => json!({"type": "str", "value": s}),
			Value::Number(n) => match n {
				Number::Finite(f) => json!({"type": "number", "value": f}),
				Number::Infinity => json!({"type": "number", "value": "Infinity"}),
				Number::NegInfinity => json!({"type": "number", "value": "-Infinity"}),
				Number::NaN => json!({"type": "number", "value": "NaN"}),
			},
			Value::Bool(b) => json!({"type": "bool", "value": b}),
			Value::Empty => json!({"type": "empty"}),
			Value::Projector => json!({"type": "projector"}),
			Value::OrderedSet(items) => {
				let marshalled: Result<Vec<_>, _> =
					items.iter().map(|v| v.marshal(channel)).collect();
				json!({"type": "orderedSet", "value": marshalled?})
			}
			Value::Range { lo, hi } => {
				json!({
					"type": "range",
					"lo": marshal_bound(lo.as_ref(), channel)?,
					"hi": marshal_bound(hi.as_ref(), channel)?,
				})
			}
			Value::Negation(items) => {
				let marshalled: Result<Vec<_>, _> =
					items.iter().map(|v| v.marshal(channel)).collect();
				json!({"type": "negation", "value": marshalled?})
			}
			Value::Substring(s) => json!({"type": "substring", "value": s}),
			Value::ComparisonFunction { clauses, ascending } => {
				let marshalled: Result<Vec<_>, _> =
					clauses.iter().map(|v| v.marshal(channel)).collect();
				json!({"type": "comparisonFunction", "clauses": marshalled?, "ascending": ascending})
			}
			Value::AttributeValueRecord(map) => {
				let mut obj = serde_json::Map::new();
				for (k, v) in map {
					obj.insert(k.clone(), v.marshal(channel)?);
				}
				json!({"type": "attributeValueRecord", "value": obj})
			}
			Value::ElementReference(reference) => {
				channel.define_template(reference.template_id)?;
				channel.define_index(reference.index_id)?;
				json!({
					"type": "elementReference",
					"templateId": reference.template_id.get(),
					"indexId": reference.index_id.get(),
				})
			}
			Value::Delete => json!({"type": "xdrDelete"}),
		})
	}

	/// Unmarshal from the `{ type, ...fields }` wire representation.
	pub fn unmarshal(json: &Json, channel: &mut IdentifierChannel) -> Result<Value, ValueCodecError> {
		let tag = json
			.get("type")
			.and_then(Json::as_str)
			.ok_or(ValueCodecError::MissingField("type"))?;
		Ok(match tag {
			"str" => Value::Str(
				field_str(json, "value")?,
			),
			"number" => match json.get("value").ok_or(ValueCodecError::MissingField("value"))? {
				Json::String(s) if s == "Infinity" => Value::Number(Number::Infinity),
				Json::String(s) if s == "-Infinity" => Value::Number(Number::NegInfinity),
				Json::String(s) if s == "NaN" => Value::Number(Number::NaN),
				Json::Number(n) => Value::Number(Number::Finite(
					n.as_f64().ok_or(ValueCodecError::MalformedField("value"))?,
				)),
				_ => return Err(ValueCodecError::MalformedField("value")),
			},
			"bool" => Value::Bool(
				json.get("value")
					.and_then(Json::as_bool)
					.ok_or(ValueCodecError::MissingField("value"))?,
			),
			"empty" => Value::Empty,
			"projector" => Value::Projector,
			"orderedSet" => {
				let items = json
					.get("value")
					.and_then(Json::as_array)
					.ok_or(ValueCodecError::MissingField("value"))?;
				let mut out = Vec::with_capacity(items.len());
				for item in items {
					out.push(Value::unmarshal(item, channel)?);
				}
				Value::OrderedSet(out)
			}
			"range" => Value::Range {
				lo: unmarshal_bound(json.get("lo"), channel)?,
				hi: unmarshal_bound(json.get("hi"), channel)?,
			},
			"negation" => {
				let items = json
					.get("value")
					.and_then(Json::as_array)
					.ok_or(ValueCodecError::MissingField("value"))?;
				let mut out = Vec::with_capacity(items.len());
				for item in items {
					out.push(Value::unmarshal(item, channel)?);
				}
				Value::Negation(out)
			}
			"substring" => Value::Substring(field_str(json, "value")?),
			"comparisonFunction" => {
				let clauses = json
					.get("clauses")
					.and_then(Json::as_array)
					.ok_or(ValueCodecError::MissingField("clauses"))?;
				let mut out = Vec::with_capacity(clauses.len());
				for clause in clauses {
					out.push(Value::unmarshal(clause, channel)?);
				}
				let ascending = json
					.get("ascending")
					.and_then(Json::as_bool)
					.ok_or(ValueCodecError::MissingField("ascending"))?;
				Value::ComparisonFunction {
					clauses: out,
					ascending,
				}
			}
			"attributeValueRecord" => {
				let obj = json
					.get("value")
					.and_then(Json::as_object)
					.ok_or(ValueCodecError::MissingField("value"))?;
				let mut map = BTreeMap::new();
				for (k, v) in obj {
					map.insert(k.clone(), Value::unmarshal(v, channel)?);
				}
				Value::AttributeValueRecord(map)
			}
			"elementReference" => {
				let template_id = field_u32(json, "templateId")?;
				let index_id = field_u32(json, "indexId")?;
				let template_id = channel.translate_template(TemplateId::from(template_id))?;
				let index_id = channel.translate_index(IndexId::from(index_id))?;
				Value::ElementReference(ElementReference {
					template_id,
					index_id,
				})
			}
			"xdrDelete" => Value::Delete,
			other => return Err(ValueCodecError::UnknownTag(other.to_string())),
		})
	}
}

fn field_str(json: &Json, field: &'static str) -> Result<String, ValueCodecError> {
	json.get(field)
		.and_then(Json::as_str)
		.map(str::to_string)
		.ok_or(ValueCodecError::MissingField(field))
}

fn field_u32(json: &Json, field: &'static str) -> Result<u32, ValueCodecError> {
	json.get(field)
		.and_then(Json::as_u64)
		.and_then(|v| u32::try_from(v).ok())
		.ok_or(ValueCodecError::MissingField(field))
}

fn marshal_bound(
	bound: Option<&Bound>,
	channel: &mut IdentifierChannel,
) -> Result<Json, ValueCodecError> {
	Ok(match bound {
		None => Json::Null,
		Some(b) => json!({
			"value": b.value.marshal(channel)?,
			"closed": matches!(b.kind, BoundKind::Closed),
		}),
	})
}

fn unmarshal_bound(
	json: Option<&Json>,
	channel: &mut IdentifierChannel,
) -> Result<Option<Bound>, ValueCodecError> {
	match json {
		None | Some(Json::Null) => Ok(None),
		Some(obj) => {
			let value = obj.get("value").ok_or(ValueCodecError::MissingField("value"))?;
			let closed = obj
				.get("closed")
				.and_then(Json::as_bool)
				.ok_or(ValueCodecError::MissingField("closed"))?;
			Ok(Some(Bound {
				value: Box::new(Value::unmarshal(value, channel)?),
				kind: if closed { BoundKind::Closed } else { BoundKind::Open },
			}))
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn roundtrip(value: Value) {
		let mut channel = IdentifierChannel::new();
		let json = value.marshal(&mut channel).unwrap();
		let back = Value::unmarshal(&json, &mut channel).unwrap();
		assert_eq!(value, back);
	}

	#[test]
	fn primitives_roundtrip() {
		roundtrip(Value::Str("hi".into()));
		roundtrip(Value::Number(Number::Finite(3.5)));
		roundtrip(Value::Number(Number::Infinity));
		roundtrip(Value::Number(Number::NegInfinity));
		roundtrip(Value::Number(Number::NaN));
		roundtrip(Value::Bool(true));
		roundtrip(Value::Empty);
		roundtrip(Value::Projector);
		roundtrip(Value::Delete);
	}

	#[test]
	fn ordered_set_and_negation_roundtrip() {
		roundtrip(Value::OrderedSet(vec![Value::Str("a".into()), Value::Bool(false)]));
		roundtrip(Value::Negation(vec![Value::Str("a".into())]));
	}

	#[test]
	fn range_roundtrips_with_open_and_closed_bounds() {
		roundtrip(Value::Range {
			lo: Some(Bound {
				value: Box::new(Value::Number(Number::Finite(1.0))),
				kind: BoundKind::Closed,
			}),
			hi: Some(Bound {
				value: Box::new(Value::Number(Number::Finite(10.0))),
				kind: BoundKind::Open,
			}),
		});
		roundtrip(Value::Range { lo: None, hi: None });
	}

	#[test]
	fn attribute_value_record_roundtrips() {
		let mut map = BTreeMap::new();
		map.insert("a".to_string(), Value::Str("x".into()));
		map.insert("b".to_string(), Value::Bool(true));
		roundtrip(Value::AttributeValueRecord(map));
	}

	#[test]
	fn comparison_function_roundtrips() {
		roundtrip(Value::ComparisonFunction {
			clauses: vec![Value::Str("a".into())],
			ascending: false,
		});
	}

	#[test]
	fn element_reference_roundtrips_after_definition() {
		let mut channel = IdentifierChannel::new();
		use crate::identifiers::{ChildType, TemplateEntry};
		let t = channel.allocate_template(TemplateEntry {
			parent_id: TemplateId::from(crate::ids::ROOT_ID),
			child_type: ChildType::Single,
			child_name: "x".into(),
			referred_id: None,
		});
		let value = Value::ElementReference(ElementReference {
			template_id: t,
			index_id: IndexId::from(crate::ids::ROOT_ID),
		});
		let json = value.marshal(&mut channel).unwrap();
		let back = Value::unmarshal(&json, &mut channel).unwrap();
		assert_eq!(value, back);
	}
}
