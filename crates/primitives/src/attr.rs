//! Session attributes and their revision metadata.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A key/value pair carried by a session, optionally frozen (write-once).
///
/// An empty, unfrozen value means the key was never set or has been deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attr {
	/// Attribute key.
	pub key: String,
	/// Attribute value; empty means unset.
	pub value: String,
	/// Frozen attributes never change value again.
	pub frozen: bool,
}

impl Attr {
	/// Assigns `value` to `key`.
	pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
		Self {
			key: key.into(),
			value: value.into(),
			frozen: false,
		}
	}

	/// Assigns `value` to `key` and freezes it for the rest of the session.
	pub fn freeze(key: impl Into<String>, value: impl Into<String>) -> Self {
		Self {
			key: key.into(),
			value: value.into(),
			frozen: true,
		}
	}

	/// Clears `key`.
	pub fn delete(key: impl Into<String>) -> Self {
		Self::empty(key)
	}

	/// The empty attribute for `key`.
	pub fn empty(key: impl Into<String>) -> Self {
		Self {
			key: key.into(),
			..Self::default()
		}
	}

	/// Returns true when the value is unset.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.value.is_empty()
	}
}

/// Attributes keyed by attribute key.
pub type AttrTable = BTreeMap<String, Attr>;

/// An attribute plus the revisions at which it was created and last changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrMeta {
	/// Current attribute state.
	pub attr: Attr,
	/// Revision that first stored the key; 0 for keys never stored.
	pub created_at: u64,
	/// Revision of the last change to the key.
	pub updated_at: u64,
}

impl AttrMeta {
	/// Metadata for a key the table has never stored.
	pub fn missing(key: impl Into<String>) -> Self {
		Self {
			attr: Attr::empty(key),
			created_at: 0,
			updated_at: 0,
		}
	}

	/// Returns true if the table has never stored the key.
	#[must_use]
	pub fn is_missing(&self) -> bool {
		self.created_at == 0
	}

	/// Answers what the attribute looked like at revision `rev`.
	///
	/// Keys created after `rev` read as empty. A key changed after `rev`
	/// cannot be reconstructed and fails with [`Error::StaleFetch`].
	pub fn as_of(&self, rev: u64) -> Result<Attr> {
		if self.is_missing() || self.created_at > rev {
			return Ok(Attr::empty(self.attr.key.clone()));
		}
		if self.updated_at > rev {
			return Err(Error::StaleFetch);
		}
		Ok(self.attr.clone())
	}
}

/// Attribute metadata keyed by attribute key.
pub type AttrMetaTable = BTreeMap<String, AttrMeta>;

#[cfg(test)]
mod tests {
	use super::*;

	fn meta(value: &str, created_at: u64, updated_at: u64) -> AttrMeta {
		AttrMeta {
			attr: Attr::set("k", value),
			created_at,
			updated_at,
		}
	}

	#[test]
	fn missing_keys_read_empty_at_any_revision() {
		let m = AttrMeta::missing("k");
		assert_eq!(m.as_of(0), Ok(Attr::empty("k")));
		assert_eq!(m.as_of(42), Ok(Attr::empty("k")));
	}

	#[test]
	fn keys_created_later_read_empty() {
		assert_eq!(meta("v", 2, 2).as_of(1), Ok(Attr::empty("k")));
	}

	#[test]
	fn keys_updated_later_are_stale() {
		assert_eq!(meta("v", 1, 3).as_of(2), Err(Error::StaleFetch));
	}

	#[test]
	fn unchanged_keys_read_their_value() {
		assert_eq!(meta("v", 1, 2).as_of(2), Ok(Attr::set("k", "v")));
		assert_eq!(meta("v", 1, 2).as_of(9), Ok(Attr::set("k", "v")));
	}
}
