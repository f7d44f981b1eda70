//! Authorization (§4.5): the `RuleStore` resolution algorithm plus the
//! `CredentialStore` family used to verify a `login`/`createAccount` call.

pub mod credentials;
pub mod rules;

pub use credentials::{Credentials, CredentialStore, DbCredentialStore, FileCredentialStore};
pub use rules::{RuleKind, RuleStore};

use std::path::Path;
use std::sync::Arc;

use crate::config::Args;
use crate::persistence::Collection;

/// Builds the configured [`CredentialStore`] (§6.4 `use_auth_files` /
/// `base_auth_dir`): a flat file under `base_auth_dir` when `use_auth_files`
/// is set, otherwise the database-backed hash store.
pub fn build_credential_store(args: &Args, records: Arc<dyn Collection>) -> std::io::Result<Arc<dyn CredentialStore>> {
	if args.use_auth_files {
		let dir = args.base_auth_dir.clone().unwrap_or_else(|| Path::new(".").to_path_buf());
		let contents = std::fs::read_to_string(dir.join("passwd")).unwrap_or_default();
		Ok(Arc::new(FileCredentialStore::from_contents(&contents, args.allow_adding_users)))
	} else {
		Ok(Arc::new(DbCredentialStore::new(records, args.allow_adding_users)))
	}
}
