//! Bearer credential encoding shared by client and server (§4.5): a bearer
//! authorization header carries `user:password` base64-encoded.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BearerCredentialsError {
	#[error("invalid base64")]
	InvalidBase64,
	#[error("invalid utf-8")]
	InvalidUtf8,
	#[error("missing ':' separator between user and password")]
	MissingSeparator,
}

/// A decoded `user:password` pair, as carried by a bearer authorization
/// header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerCredentials {
	pub username: String,
	pub password: String,
}

impl BearerCredentials {
	pub fn encode(&self) -> String {
		STANDARD.encode(format!("{}:{}", self.username, self.password))
	}

	pub fn decode(encoded: &str) -> Result<Self, BearerCredentialsError> {
		let raw = STANDARD
			.decode(encoded)
			.map_err(|_| BearerCredentialsError::InvalidBase64)?;
		let s = String::from_utf8(raw).map_err(|_| BearerCredentialsError::InvalidUtf8)?;
		let (username, password) = s
			.split_once(':')
			.ok_or(BearerCredentialsError::MissingSeparator)?;
		Ok(Self {
			username: username.to_string(),
			password: password.to_string(),
		})
	}

	/// Render the full `Authorization: Bearer <...>` header value.
	pub fn to_header_value(&self) -> String {
		format!("Bearer {}", self.encode())
	}

	/// Parse a full `Authorization: Bearer <...>` header value.
	pub fn from_header_value(header: &str) -> Result<Self, BearerCredentialsError> {
		let encoded = header
			.strip_prefix("Bearer ")
			.ok_or(BearerCredentialsError::MissingSeparator)?;
		Self::decode(encoded)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn header_roundtrips() {
		let creds = BearerCredentials {
			username: "alice".to_string(),
			password: "hunter2".to_string(),
		};
		let header = creds.to_header_value();
		let back = BearerCredentials::from_header_value(&header).unwrap();
		assert_eq!(creds, back);
	}

	#[test]
	fn decode_rejects_missing_separator() {
		let encoded = STANDARD.encode("nopassword");
		assert!(matches!(
			BearerCredentials::decode(&encoded),
			Err(BearerCredentialsError::MissingSeparator)
		));
	}
}
