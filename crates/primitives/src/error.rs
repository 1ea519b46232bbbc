//! Error taxonomy shared by catalogs, the invoker and dispatch.

use std::fmt;

use bytes::Bytes;

/// A convenient type alias for `Result` with `E` = [`enum@Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure kinds reserved for catalog errors crossing peer boundaries.
pub mod kinds {
	/// Session gone.
	pub const NOT_FOUND: &str = "ravel.not_found";
	/// Read raced a concurrent write.
	pub const STALE_FETCH: &str = "ravel.stale_fetch";
	/// Write raced a concurrent write.
	pub const STALE_UPDATE: &str = "ravel.stale_update";
	/// Write touched frozen keys; the message lists them comma-separated.
	pub const FROZEN_ATTRIBUTES: &str = "ravel.frozen_attributes";
}

/// Application-defined, expected server-side error.
///
/// Part of a command's public contract: the kind is a stable identifier, the
/// message is human readable and the payload is opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
	/// Stable failure type identifier.
	pub kind: String,
	/// Human readable description.
	pub message: String,
	/// Optional structured detail.
	pub payload: Bytes,
}

impl Failure {
	/// Creates a failure without payload.
	pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			kind: kind.into(),
			message: message.into(),
			payload: Bytes::new(),
		}
	}

	/// Attaches a payload.
	#[must_use]
	pub fn with_payload(mut self, payload: Bytes) -> Self {
		self.payload = payload;
		self
	}
}

impl fmt::Display for Failure {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}: {}", self.kind, self.message)
	}
}

/// Possible errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	/// The session or target is gone.
	#[error("session not found")]
	NotFound,
	/// A read raced a concurrent write; refresh and retry.
	#[error("stale fetch: attribute changed after the requested revision")]
	StaleFetch,
	/// A write raced a concurrent write; refresh and retry.
	#[error("stale update: revision is no longer current")]
	StaleUpdate,
	/// A write tried to change frozen attributes.
	#[error("frozen attributes: {}", .keys.join(", "))]
	FrozenAttributes {
		/// Offending keys.
		keys: Vec<String>,
	},
	/// Expected, application-defined remote error.
	#[error("{0}")]
	Failure(Failure),
	/// Unexpected remote error, opaque to the caller.
	#[error("unexpected remote error: {0}")]
	Unexpected(String),
	/// The call's deadline passed before a reply arrived.
	#[error("deadline exceeded")]
	DeadlineExceeded,
	/// The caller cancelled the call.
	#[error("call cancelled")]
	Cancelled,
	/// The transport failed or the connection was lost.
	#[error("transport error: {0}")]
	Transport(String),
	/// The component's loop stopped.
	#[error("service stopped")]
	ServiceStopped,
	/// Namespace failed validation.
	#[error("invalid namespace {name:?}: {reason}")]
	InvalidNamespace {
		/// Rejected namespace.
		name: String,
		/// Validation rule that failed.
		reason: &'static str,
	},
	/// Payload could not be encoded or decoded.
	#[error("codec error: {0}")]
	Codec(String),
}

impl Error {
	/// Returns true for races resolved by refreshing to the latest revision
	/// and redoing the operation.
	#[must_use]
	pub fn should_retry(&self) -> bool {
		matches!(self, Self::StaleFetch | Self::StaleUpdate)
	}

	/// Encodes catalog errors as reserved failures for the wire.
	///
	/// Returns `None` for errors without a reserved encoding.
	#[must_use]
	pub fn to_reserved_failure(&self) -> Option<Failure> {
		let failure = match self {
			Self::NotFound => Failure::new(kinds::NOT_FOUND, self.to_string()),
			Self::StaleFetch => Failure::new(kinds::STALE_FETCH, self.to_string()),
			Self::StaleUpdate => Failure::new(kinds::STALE_UPDATE, self.to_string()),
			Self::FrozenAttributes { keys } => {
				let encoded = postcard::to_allocvec(keys).map(Bytes::from).unwrap_or_default();
				Failure::new(kinds::FROZEN_ATTRIBUTES, self.to_string()).with_payload(encoded)
			}
			Self::Failure(failure) => failure.clone(),
			_ => return None,
		};
		Some(failure)
	}

	/// Decodes a received failure, restoring reserved kinds to their variants.
	///
	/// Frozen attribute keys travel in the payload; the message is for humans.
	#[must_use]
	pub fn from_failure(failure: Failure) -> Self {
		match failure.kind.as_str() {
			kinds::NOT_FOUND => Self::NotFound,
			kinds::STALE_FETCH => Self::StaleFetch,
			kinds::STALE_UPDATE => Self::StaleUpdate,
			kinds::FROZEN_ATTRIBUTES => match postcard::from_bytes::<Vec<String>>(&failure.payload) {
				Ok(keys) => Self::FrozenAttributes { keys },
				Err(error) => Self::Codec(format!("frozen attribute keys: {error}")),
			},
			_ => Self::Failure(failure),
		}
	}
}
