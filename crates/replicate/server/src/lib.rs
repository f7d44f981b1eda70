//! The replicate sync server (§6): wires together the resource [`Manager`],
//! the [`session::AuthContext`], and the `ws`/`wss` [`shell`] listener that
//! drives one [`session::Session`] per connection.

pub mod auth;
pub mod config;
pub mod error;
pub mod persistence;
pub mod resources;
pub mod session;
pub mod shell;

use std::collections::BTreeMap;
use std::sync::Arc;

use color_eyre::eyre::{Context, Result};

pub use config::Args;
use resources::external::{ExternalBackend, ExternalRow, InMemoryBackend};
use resources::Manager;
use session::AuthContext;

/// Loads the optional `external_data_source_config_path` (§6.4) into an
/// [`InMemoryBackend`]: a JSON object mapping app name to a list of row
/// objects, standing in for a real external-source driver (§1 Non-goals).
fn load_external_backends(args: &Args) -> Result<Vec<Arc<dyn ExternalBackend>>> {
	let Some(path) = &args.external_data_source_config_path else {
		return Ok(Vec::new());
	};
	let contents = std::fs::read_to_string(path)
		.with_context(|| format!("failed to read external_data_source_config_path {}", path.display()))?;
	let tables: BTreeMap<String, Vec<ExternalRow>> =
		serde_json::from_str(&contents).context("failed to parse external_data_source_config_path as JSON")?;
	Ok(vec![Arc::new(InMemoryBackend::new(tables))])
}

fn init_logging(args: &Args) {
	use tracing_subscriber::filter::LevelFilter;
	use tracing_subscriber::EnvFilter;

	let default_level = match args.debug_level {
		i32::MIN..=0 => LevelFilter::INFO,
		1 => LevelFilter::DEBUG,
		_ => LevelFilter::TRACE,
	};
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
	let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Builds the server's collaborators from `args` and runs the listener
/// until shutdown (§5, §6.4).
pub async fn main(args: Args) -> Result<()> {
	color_eyre::install()?;
	init_logging(&args);

	let records = Arc::new(persistence::InMemoryCollection::new());
	let credentials = auth::build_credential_store(&args, records)?;
	let auth = Arc::new(AuthContext {
		rules: auth::RuleStore::new(),
		credentials,
		public_data_access: args.public_data_access,
		local_mode: args.local_mode,
	});

	let external_backends = load_external_backends(&args)?;
	let manager = Manager::new(external_backends);

	shell::run(Arc::new(args), manager, auth).await
}
