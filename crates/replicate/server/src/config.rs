//! CLI/configuration surface (§6.4), via `clap`'s `Parser` derive as the
//! teacher's own `Args` struct already does.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum Protocol {
	Ws,
	Wss,
}

/// Runs a replicate sync server.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Args {
	/// Whether to accept plain `ws` or TLS-wrapped `wss` connections. `wss`
	/// requires the caller to supply an already-built TLS acceptor;
	/// certificate loading from `certificate_path`/`private_key_path` is the
	/// caller's responsibility.
	#[clap(long, value_enum, default_value = "ws")]
	pub protocol: Protocol,

	/// Sets a custom port number.
	#[clap(short, long)]
	pub port: Option<u16>,

	#[clap(long)]
	pub certificate_path: Option<PathBuf>,

	#[clap(long)]
	pub private_key_path: Option<PathBuf>,

	/// Logical database/persistence namespace. The in-memory `Collection`
	/// implementation uses this only for log correlation.
	#[clap(long, default_value = "replicate")]
	pub db_name: String,

	/// Skip authentication entirely; every session's `user` is `None`.
	#[clap(long)]
	pub local_mode: bool,

	/// Table/metadata resources are readable without authorization (§4.5
	/// step 5).
	#[clap(long)]
	pub public_data_access: bool,

	/// Allow `createAccount` to add new users.
	#[clap(long)]
	pub allow_adding_users: bool,

	/// Use a flat `user:password`-per-line file for credentials instead of
	/// the database-backed hash store.
	#[clap(long)]
	pub use_auth_files: bool,

	#[clap(long)]
	pub base_auth_dir: Option<PathBuf>,

	/// An additional plaintext port to listen on, e.g. for a local
	/// health-check/manager connection alongside the main listener.
	#[clap(long)]
	pub extra_local_port: Option<u16>,

	#[clap(long)]
	pub external_data_source_config_path: Option<PathBuf>,

	#[clap(long, default_value_t = 0)]
	pub debug_level: i32,

	/// Maximum payload per framed-transport segment; default is 16000 minus
	/// the header length, per §6.1.
	#[clap(long, default_value_t = replicate_common::framed::DEFAULT_MAX_SEGMENT_SIZE)]
	pub max_segment_size: usize,

	/// Outbound message pool flush threshold.
	#[clap(long, default_value_t = 32)]
	pub pool_size: usize,

	/// Outbound message pool flush delay, in milliseconds.
	#[clap(long, default_value_t = 50)]
	pub pool_delay_ms: u64,
}

impl Default for Args {
	fn default() -> Self {
		Self {
			protocol: Protocol::Ws,
			port: None,
			certificate_path: None,
			private_key_path: None,
			db_name: "replicate".to_string(),
			local_mode: false,
			public_data_access: false,
			allow_adding_users: false,
			use_auth_files: false,
			base_auth_dir: None,
			extra_local_port: None,
			external_data_source_config_path: None,
			debug_level: 0,
			max_segment_size: replicate_common::framed::DEFAULT_MAX_SEGMENT_SIZE,
			pool_size: 32,
			pool_delay_ms: 50,
		}
	}
}
