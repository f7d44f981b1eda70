//! Column compression for table-like resources (§4.7.5): run-length encoding
//! plus an optional indexed-values dictionary.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde_json::Value as Json;

/// One run of consecutive defined values starting at `offset`; stretches of
/// `null` between runs are not stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueRun {
	pub offset: usize,
	pub values: Vec<Json>,
}

/// Consecutive defined values within `3` positions of each other are
/// coalesced into one run; a gap of more than 3 `null`s starts a new run.
const COALESCE_GAP: usize = 3;

/// Run-length compress a sparse column. `column[i] == Json::Null` denotes
/// "no value at position i" (the `null -> undefined` convention of §8).
pub fn compress_column(column: &[Json]) -> Vec<ValueRun> {
	let mut runs = Vec::new();
	let mut current: Option<ValueRun> = None;
	let mut gap = 0usize;

	for (i, value) in column.iter().enumerate() {
		if matches!(value, Json::Null) {
			gap += 1;
			continue;
		}
		match &mut current {
			Some(run) if gap <= COALESCE_GAP => {
				// Pad the coalesced gap with nulls so positions stay aligned.
				for _ in 0..gap {
					run.values.push(Json::Null);
				}
				run.values.push(value.clone());
			}
			_ => {
				if let Some(run) = current.take() {
					runs.push(run);
				}
				current = Some(ValueRun {
					offset: i,
					values: vec![value.clone()],
				});
			}
		}
		gap = 0;
	}
	if let Some(run) = current.take() {
		runs.push(run);
	}
	runs
}

/// Inverse of [`compress_column`]: expand runs back into a `len`-long column
/// with `Json::Null` at every position not covered by a run.
pub fn decompress_column(runs: &[ValueRun], len: usize) -> Vec<Json> {
	let mut out = vec![Json::Null; len];
	for run in runs {
		for (offset, value) in run.values.iter().enumerate() {
			let pos = run.offset + offset;
			if pos < len {
				out[pos] = value.clone();
			}
		}
	}
	out
}

/// Total order over dictionary values: by type-name first, then by natural
/// comparison within a type (§4.7.5).
fn type_name(value: &Json) -> &'static str {
	match value {
		Json::Null => "null",
		Json::Bool(_) => "bool",
		Json::Number(_) => "number",
		Json::String(_) => "string",
		Json::Array(_) => "array",
		Json::Object(_) => "object",
	}
}

fn compare_values(a: &Json, b: &Json) -> Ordering {
	type_name(a).cmp(type_name(b)).then_with(|| match (a, b) {
		(Json::Number(x), Json::Number(y)) => x
			.as_f64()
			.partial_cmp(&y.as_f64())
			.unwrap_or(Ordering::Equal),
		(Json::String(x), Json::String(y)) => x.cmp(y),
		(Json::Bool(x), Json::Bool(y)) => x.cmp(y),
		_ => Ordering::Equal,
	})
}

/// Decide whether a dictionary is worth building for `column` (§4.7.5):
/// unique values must be at most half the column length, and the estimated
/// compressed size (keys + `ceil(log10(unique))` digits per cell) must be
/// strictly smaller than the raw size.
pub fn should_build_dictionary(column: &[Json]) -> bool {
	let defined: Vec<&Json> = column.iter().filter(|v| !matches!(v, Json::Null)).collect();
	if defined.is_empty() {
		return false;
	}
	let mut unique: Vec<&Json> = Vec::new();
	for value in &defined {
		if !unique.iter().any(|u| *u == value) {
			unique.push(value);
		}
	}
	if unique.len() * 2 > column.len() {
		return false;
	}
	let digits = digit_width(unique.len());
	let estimated = unique.len() * average_digit_length(&unique) + defined.len() * digits;
	let raw = defined.iter().map(|v| average_digit_length(&[*v])).sum::<usize>();
	estimated < raw
}

fn digit_width(n: usize) -> usize {
	if n <= 1 {
		1
	} else {
		((n as f64).log10().ceil() as usize).max(1)
	}
}

fn average_digit_length(values: &[&Json]) -> usize {
	if values.is_empty() {
		return 0;
	}
	let total: usize = values
		.iter()
		.map(|v| match v {
			Json::String(s) => s.len(),
			Json::Number(n) => n.to_string().len(),
			Json::Bool(_) => 5,
			_ => v.to_string().len(),
		})
		.sum();
	total / values.len()
}

/// Build a dictionary: sorted unique values, each assigned its position as a
/// compact integer key.
pub fn build_dictionary(column: &[Json]) -> BTreeMap<String, Json> {
	let mut unique: Vec<Json> = Vec::new();
	for value in column {
		if matches!(value, Json::Null) {
			continue;
		}
		if !unique.contains(value) {
			unique.push(value.clone());
		}
	}
	unique.sort_by(compare_values);
	unique
		.into_iter()
		.enumerate()
		.map(|(i, v)| (i.to_string(), v))
		.collect()
}

#[cfg(test)]
mod test {
	use super::*;
	use serde_json::json;

	#[test]
	fn compress_decompress_roundtrips() {
		let column = vec![
			Json::Null,
			json!(1),
			json!(2),
			Json::Null,
			Json::Null,
			json!(3),
			Json::Null,
			Json::Null,
			Json::Null,
			Json::Null,
			json!(4),
		];
		let runs = compress_column(&column);
		let back = decompress_column(&runs, column.len());
		assert_eq!(back, column);
	}

	#[test]
	fn coalesces_small_gaps_into_one_run() {
		let column = vec![json!(1), Json::Null, Json::Null, json!(2)];
		let runs = compress_column(&column);
		assert_eq!(runs.len(), 1);
		assert_eq!(runs[0].values, vec![json!(1), Json::Null, Json::Null, json!(2)]);
	}

	#[test]
	fn splits_on_large_gaps() {
		let column = vec![json!(1), Json::Null, Json::Null, Json::Null, Json::Null, json!(2)];
		let runs = compress_column(&column);
		assert_eq!(runs.len(), 2);
	}

	#[test]
	fn dictionary_not_worth_it_for_all_unique_values() {
		let column: Vec<Json> = (0..10).map(|i| json!(format!("unique-{i}"))).collect();
		assert!(!should_build_dictionary(&column));
	}

	#[test]
	fn dictionary_worth_it_for_low_cardinality_column() {
		let column: Vec<Json> = (0..100)
			.map(|i| json!(if i % 2 == 0 { "alpha" } else { "beta" }))
			.collect();
		assert!(should_build_dictionary(&column));
		let dict = build_dictionary(&column);
		assert_eq!(dict.len(), 2);
	}

	#[test]
	fn dictionary_values_sorted_by_type_then_natural_order() {
		let column = vec![json!("b"), json!("a"), json!(2), json!(1)];
		let dict = build_dictionary(&column);
		let values: Vec<&Json> = dict.values().collect();
		assert_eq!(values, vec![&json!(1), &json!(2), &json!("a"), &json!("b")]);
	}
}
