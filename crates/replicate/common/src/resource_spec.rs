//! `ResourceSpec` (§3) and its canonical spec-string encoding (§4.6), shared
//! by the client (to name a subscription) and the server (to key its
//! resource registry).

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// `{ type: "appState"|"table"|"metadata", owner?, app?, path?: string[], params?: any }`
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ResourceSpec {
	#[serde(rename = "appState")]
	AppState { owner: String, app: String },
	#[serde(rename = "table")]
	Table {
		app: String,
		#[serde(default)]
		path: Vec<String>,
	},
	#[serde(rename = "metadata")]
	Metadata,
	#[serde(rename = "external")]
	External {
		app: String,
		#[serde(default)]
		path: Vec<String>,
		#[serde(default)]
		params: Json,
	},
}

/// Characters escaped in the app-state `owner`/`app` components so that the
/// canonical spec-string can always be unambiguously split on `.`.
const ESCAPE: &AsciiSet = &CONTROLS.add(b'.').add(b'%');

fn escape_component(s: &str) -> String {
	utf8_percent_encode(s, ESCAPE).to_string()
}

fn encode_path(path: &[String]) -> String {
	path.iter()
		.map(|segment| utf8_percent_encode(segment, percent_encoding::NON_ALPHANUMERIC).to_string())
		.collect::<Vec<_>>()
		.join("/")
}

impl ResourceSpec {
	/// The canonical string this spec is keyed by in the resource registry.
	pub fn canonical_key(&self) -> String {
		match self {
			ResourceSpec::AppState { owner, app } => {
				format!(
					"rrm.appState.{}.{}",
					escape_component(owner),
					escape_component(app)
				)
			}
			ResourceSpec::Table { app, path } => {
				format!("tables.{}.{}", app, encode_path(path))
			}
			ResourceSpec::Metadata => "metadata".to_string(),
			ResourceSpec::External { app, path, params } => {
				// Ordered parameter values, not arbitrary key order, so that
				// two requests with identical parameters in different
				// insertion order still dedup to the same key.
				let ordered_params = match params {
					Json::Object(map) => {
						let mut entries: Vec<_> = map.iter().collect();
						entries.sort_by(|a, b| a.0.cmp(b.0));
						Json::Array(entries.into_iter().map(|(_, v)| v.clone()).collect())
					}
					other => other.clone(),
				};
				format!(
					"external.{}.{}?{}",
					app,
					encode_path(path),
					ordered_params
				)
			}
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn app_state_key_escapes_dots() {
		let spec = ResourceSpec::AppState {
			owner: "a.b".to_string(),
			app: "x".to_string(),
		};
		assert_eq!(spec.canonical_key(), "rrm.appState.a%2Eb.x");
	}

	#[test]
	fn table_key_encodes_path() {
		let spec = ResourceSpec::Table {
			app: "myapp".to_string(),
			path: vec!["a b".to_string(), "c".to_string()],
		};
		assert_eq!(spec.canonical_key(), "tables.myapp.a%20b/c");
	}

	#[test]
	fn metadata_key_is_constant() {
		assert_eq!(ResourceSpec::Metadata.canonical_key(), "metadata");
	}

	#[test]
	fn external_key_orders_params_by_key() {
		let params = serde_json::json!({"b": 2, "a": 1});
		let spec = ResourceSpec::External {
			app: "wh".to_string(),
			path: vec![],
			params: params.clone(),
		};
		let spec_reordered = ResourceSpec::External {
			app: "wh".to_string(),
			path: vec![],
			params: serde_json::json!({"a": 1, "b": 2}),
		};
		assert_eq!(spec.canonical_key(), spec_reordered.canonical_key());
	}
}
