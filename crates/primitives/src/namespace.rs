//! Validated routing domains for commands and notifications.

use std::fmt;

use crate::{Error, Result};

/// Leading character reserved for namespaces used by the middleware itself.
pub const RESERVED_PREFIX: char = '.';

/// A routing domain under which handlers are registered.
///
/// Application namespaces are non-empty, do not start with
/// [`RESERVED_PREFIX`], and use only ASCII alphanumerics, `_`, `-`, `.`, `:`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Namespace(String);

impl Namespace {
	/// Validates an application namespace.
	pub fn new(name: impl Into<String>) -> Result<Self> {
		let name = name.into();
		if name.is_empty() {
			return Err(Error::InvalidNamespace {
				name,
				reason: "must not be empty",
			});
		}
		if name.starts_with(RESERVED_PREFIX) {
			return Err(Error::InvalidNamespace {
				name,
				reason: "leading '.' is reserved",
			});
		}
		if !name.chars().all(is_namespace_char) {
			return Err(Error::InvalidNamespace {
				name,
				reason: "allowed characters are alphanumerics, '_', '-', '.', ':'",
			});
		}
		Ok(Self(name))
	}

	/// Builds a middleware-internal namespace by prefixing [`RESERVED_PREFIX`].
	///
	/// # Panics
	///
	/// Panics if `name` is not itself a valid application namespace.
	#[must_use]
	pub fn reserved(name: &str) -> Self {
		assert!(Self::new(name).is_ok(), "invalid reserved namespace {name:?}");
		Self(format!("{RESERVED_PREFIX}{name}"))
	}

	/// Returns true for middleware-internal namespaces.
	#[must_use]
	pub fn is_reserved(&self) -> bool {
		self.0.starts_with(RESERVED_PREFIX)
	}

	/// Returns the namespace text.
	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

fn is_namespace_char(c: char) -> bool {
	c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')
}

impl fmt::Display for Namespace {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl TryFrom<&str> for Namespace {
	type Error = Error;

	fn try_from(value: &str) -> Result<Self> {
		Self::new(value)
	}
}
