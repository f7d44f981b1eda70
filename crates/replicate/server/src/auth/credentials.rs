//! `CredentialStore` (§4.5, §9 Design Notes "Authentication store"): one
//! interface, two implementations sharing it — a flat-file store for
//! `useAuthFiles` and a database-backed hash store using `pbkdf2`/`sha2`
//! (password hashing *primitives* are an explicit Non-goal; we call into
//! those crates rather than hand-rolling HMAC/PBKDF2).

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

use crate::error::AuthError;
use crate::persistence::Collection;

/// Either form of credential the server accepts (§4.5): a bearer
/// `user:password` pair, or an opaque session-cookie token already resolved
/// to a username by an external hook.
#[derive(Debug, Clone)]
pub enum Credentials {
	Bearer { username: String, password: String },
	Session { token: String },
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
	async fn verify(&self, credentials: &Credentials) -> Result<String, AuthError>;
	async fn create(&self, username: &str, password: &str, email: &str) -> Result<(), AuthError>;
}

fn valid_email(email: &str) -> bool {
	let Some((local, domain)) = email.split_once('@') else {
		return false;
	};
	!local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
}

/// Parses a `user:password`-per-line flat file (the `useAuthFiles` config
/// path, §6.4/§9 Design Notes).
pub struct FileCredentialStore {
	users: RwLock<HashMap<String, String>>,
	allow_adding_users: bool,
}

impl FileCredentialStore {
	pub fn from_contents(contents: &str, allow_adding_users: bool) -> Self {
		let mut users = HashMap::new();
		for line in contents.lines() {
			let line = line.trim();
			if line.is_empty() || line.starts_with('#') {
				continue;
			}
			if let Some((user, password)) = line.split_once(':') {
				users.insert(user.to_string(), password.to_string());
			}
		}
		Self {
			users: RwLock::new(users),
			allow_adding_users,
		}
	}
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
	async fn verify(&self, credentials: &Credentials) -> Result<String, AuthError> {
		let Credentials::Bearer { username, password } = credentials else {
			return Err(AuthError::NotAuthenticated);
		};
		let users = self.users.read().unwrap();
		match users.get(username) {
			Some(stored) if stored == password => Ok(username.clone()),
			Some(_) => Err(AuthError::BadPassword),
			None => Err(AuthError::NotAuthenticated),
		}
	}

	async fn create(&self, username: &str, password: &str, email: &str) -> Result<(), AuthError> {
		if !self.allow_adding_users {
			return Err(AuthError::NotAuthorized);
		}
		if !valid_email(email) {
			return Err(AuthError::BadEmail);
		}
		let mut users = self.users.write().unwrap();
		if users.contains_key(username) {
			return Err(AuthError::DuplicateAccount);
		}
		users.insert(username.to_string(), password.to_string());
		Ok(())
	}
}

/// One `user \t algorithm \t iterations \t salt \t digest` record as read
/// from the `Collection`-backed hash store (§4.5).
struct HashRecord {
	username: String,
	iterations: u32,
	salt: Vec<u8>,
	digest: Vec<u8>,
}

fn parse_record(raw: &str) -> Option<HashRecord> {
	let mut fields = raw.split('\t');
	let username = fields.next()?.to_string();
	let algorithm = fields.next()?;
	if algorithm != "pbkdf2-sha256" {
		return None;
	}
	let iterations: u32 = fields.next()?.parse().ok()?;
	let salt = hex_decode(fields.next()?)?;
	let digest = hex_decode(fields.next()?)?;
	Some(HashRecord {
		username,
		iterations,
		salt,
		digest,
	})
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
	if s.len() % 2 != 0 {
		return None;
	}
	(0..s.len())
		.step_by(2)
		.map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
		.collect()
}

fn hex_encode(bytes: &[u8]) -> String {
	bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Constant-time byte comparison: an unequal-length or mismatched-content
/// digest must not short-circuit in a way that leaks timing information
/// about *where* the mismatch is.
fn digests_match(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}
	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}
	diff == 0
}

const DEFAULT_ITERATIONS: u32 = 100_000;
const DIGEST_LEN: usize = 32;

/// Database-backed hash store: `Collection`-persisted `user -> record`
/// lines, verified by re-running PBKDF2-HMAC-SHA256 via `pbkdf2::pbkdf2_hmac`
/// and comparing digests.
pub struct DbCredentialStore {
	records: std::sync::Arc<dyn Collection>,
	allow_adding_users: bool,
}

impl DbCredentialStore {
	pub fn new(records: std::sync::Arc<dyn Collection>, allow_adding_users: bool) -> Self {
		Self {
			records,
			allow_adding_users,
		}
	}
}

#[async_trait]
impl CredentialStore for DbCredentialStore {
	async fn verify(&self, credentials: &Credentials) -> Result<String, AuthError> {
		let Credentials::Bearer { username, password } = credentials else {
			return Err(AuthError::NotAuthenticated);
		};
		let record = self
			.records
			.get(username)
			.await
			.map_err(|e| AuthError::Store(e.into()))?
			.ok_or(AuthError::NotAuthenticated)?;
		let raw = record.value.as_str().ok_or(AuthError::NotAuthenticated)?;
		let parsed = parse_record(raw).ok_or(AuthError::NotAuthenticated)?;
		if parsed.username != *username {
			return Err(AuthError::NotAuthenticated);
		}
		let mut computed = vec![0u8; parsed.digest.len()];
		pbkdf2_hmac::<Sha256>(password.as_bytes(), &parsed.salt, parsed.iterations, &mut computed);
		if digests_match(&computed, &parsed.digest) {
			Ok(parsed.username)
		} else {
			Err(AuthError::BadPassword)
		}
	}

	async fn create(&self, username: &str, password: &str, email: &str) -> Result<(), AuthError> {
		if !self.allow_adding_users {
			return Err(AuthError::NotAuthorized);
		}
		if !valid_email(email) {
			return Err(AuthError::BadEmail);
		}
		if self
			.records
			.get(username)
			.await
			.map_err(|e| AuthError::Store(e.into()))?
			.is_some()
		{
			return Err(AuthError::DuplicateAccount);
		}
		let mut salt = vec![0u8; 16];
		rand::thread_rng().fill_bytes(&mut salt);
		let mut digest = vec![0u8; DIGEST_LEN];
		pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, DEFAULT_ITERATIONS, &mut digest);
		let raw = format!(
			"{username}\tpbkdf2-sha256\t{DEFAULT_ITERATIONS}\t{}\t{}",
			hex_encode(&salt),
			hex_encode(&digest)
		);
		self.records
			.put(crate::persistence::Record {
				id: username.to_string(),
				value: serde_json::Value::String(raw),
				revision: 0,
				rev_timestamp: chrono::Utc::now(),
			})
			.await
			.map_err(|e| AuthError::Store(e.into()))?;
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::persistence::InMemoryCollection;

	#[tokio::test]
	async fn file_store_accepts_correct_password() {
		let store = FileCredentialStore::from_contents("alice:hunter2\n", false);
		let result = store
			.verify(&Credentials::Bearer {
				username: "alice".to_string(),
				password: "hunter2".to_string(),
			})
			.await;
		assert_eq!(result.unwrap(), "alice");
	}

	#[tokio::test]
	async fn file_store_rejects_wrong_password() {
		let store = FileCredentialStore::from_contents("alice:hunter2\n", false);
		let result = store
			.verify(&Credentials::Bearer {
				username: "alice".to_string(),
				password: "wrong".to_string(),
			})
			.await;
		assert!(matches!(result, Err(AuthError::BadPassword)));
	}

	#[tokio::test]
	async fn file_store_create_requires_allow_adding_users() {
		let store = FileCredentialStore::from_contents("", false);
		let result = store.create("bob", "pw", "bob@example.com").await;
		assert!(matches!(result, Err(AuthError::NotAuthorized)));
	}

	#[tokio::test]
	async fn db_store_roundtrips_hash_verification() {
		let records = std::sync::Arc::new(InMemoryCollection::new());
		let store = DbCredentialStore::new(records, true);
		store.create("alice", "hunter2", "alice@example.com").await.unwrap();
		let ok = store
			.verify(&Credentials::Bearer {
				username: "alice".to_string(),
				password: "hunter2".to_string(),
			})
			.await;
		assert_eq!(ok.unwrap(), "alice");

		let bad = store
			.verify(&Credentials::Bearer {
				username: "alice".to_string(),
				password: "wrong".to_string(),
			})
			.await;
		assert!(matches!(bad, Err(AuthError::BadPassword)));
	}

	#[tokio::test]
	async fn db_store_rejects_duplicate_account() {
		let records = std::sync::Arc::new(InMemoryCollection::new());
		let store = DbCredentialStore::new(records, true);
		store.create("alice", "hunter2", "alice@example.com").await.unwrap();
		let second = store.create("alice", "other", "alice@example.com").await;
		assert!(matches!(second, Err(AuthError::DuplicateAccount)));
	}

	#[test]
	fn rejects_malformed_emails() {
		assert!(!valid_email("not-an-email"));
		assert!(!valid_email("a@b"));
		assert!(valid_email("a@b.com"));
	}
}
