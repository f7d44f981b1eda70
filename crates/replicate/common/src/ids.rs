//! Identifiers used throughout the wire protocol.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! make_uuid {
    {$(
        $(#[$meta:meta])*
        $vis:vis struct $ident:ident;
    )*} => {$(
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
        $vis struct $ident(Uuid);

        impl $ident {
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn uuid(&self) -> &Uuid {
                &self.0
            }

            pub fn into_uuid(self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $ident {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    )*}
}

make_uuid! {
	/// Identifies a connection for the lifetime of a session. Not stable across
	/// reconnects; purely for correlating logs and in-memory bookkeeping.
	pub struct ClientId;
}

macro_rules! make_numeric_id {
    {$(
        $(#[$meta:meta])*
        $vis:vis struct $ident:ident($repr:ty);
    )*} => {$(
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        $vis struct $ident(pub $repr);

        impl $ident {
            pub fn get(self) -> $repr {
                self.0
            }
        }

        impl fmt::Display for $ident {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<$repr> for $ident {
            fn from(value: $repr) -> Self {
                Self(value)
            }
        }
    )*}
}

make_numeric_id! {
	/// A server-local numeric id for a [`Resource`](crate::resource_spec::ResourceSpec).
	/// Assigned once per unique spec and never reused during a server run.
	pub struct ResourceId(u64);

	/// Identifies a registration of `(connection, subscriber)` within a resource.
	/// Unique within that resource, not globally.
	pub struct SubscriberId(u64);

	/// Identifies a resource within the scope of a single connection, chosen by the
	/// client. Maps to a `(ResourceId, SubscriberId)` pair in [`Session`](crate::Session)
	/// bookkeeping on the server.
	pub struct ClientResourceId(u64);

	/// The monotonically increasing per-resource revision assigned to writes.
	pub struct Revision(u64);

	/// A strictly increasing message sequence number, assigned on the outbound side of
	/// a connection. Zero is reserved for flow acknowledgements.
	pub struct SequenceNr(u64);

	/// Identifies a template entry in the identifier channel. `1` is the shared root,
	/// pre-seeded on every connection; peer allocation starts at `2`.
	pub struct TemplateId(u32);

	/// Identifies an index entry in the identifier channel. `1` is the shared root,
	/// pre-seeded on every connection; peer allocation starts at `2`.
	pub struct IndexId(u32);
}

impl Revision {
	pub fn next(self) -> Self {
		Self(self.0 + 1)
	}
}

impl SequenceNr {
	pub const FLOW_ACK: Self = Self(0);

	pub fn is_flow_ack(self) -> bool {
		self == Self::FLOW_ACK
	}
}

/// The shared root id for both template and index spaces.
pub const ROOT_ID: u32 = 1;

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn revision_next_increases() {
		let r = Revision(0);
		assert_eq!(r.next(), Revision(1));
		assert_eq!(r.next().next(), Revision(2));
	}

	#[test]
	fn sequence_nr_flow_ack() {
		assert!(SequenceNr::FLOW_ACK.is_flow_ack());
		assert!(!SequenceNr(1).is_flow_ack());
	}
}
