//! Error kinds at each module boundary (§7), `thiserror`-typed as the
//! teacher's split between library errors (`thiserror`) and binary-level
//! reporting (`color-eyre`) already does.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
	#[error("not authenticated")]
	NotAuthenticated,
	#[error("not authorized")]
	NotAuthorized,
	#[error("bad password")]
	BadPassword,
	#[error("account already exists")]
	DuplicateAccount,
	#[error("invalid email")]
	BadEmail,
	#[error("credential store error: {0}")]
	Store(#[source] eyre::Error),
}

#[derive(Debug, Error)]
pub enum ResourceError {
	#[error("persistence error: {0}")]
	Persistence(#[source] eyre::Error),
	#[error("backend data unavailable: {0}")]
	BackendUnavailable(#[source] eyre::Error),
	#[error("resource was already released")]
	AlreadyReleased,
	#[error("unknown subscriber id")]
	UnknownSubscriber,
	#[error("operation not supported by this resource kind")]
	UnsupportedOperation,
	#[error("unknown table id {0}")]
	UnknownTable(u64),
}

#[derive(Debug, Error)]
pub enum SessionError {
	#[error(transparent)]
	Auth(#[from] AuthError),
	#[error(transparent)]
	Resource(#[from] ResourceError),
	#[error(transparent)]
	Codec(#[from] replicate_common::value::ValueCodecError),
	#[error(transparent)]
	Identifier(#[from] replicate_common::identifiers::IdentifierChannelError),
	#[error("protocol violation: {0}")]
	Protocol(String),
}
