//! Structured change sets produced by committed catalog updates.

use std::fmt;

use crate::Attr;

/// How one key changed in a committed update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
	/// Key stored for the first time.
	Created,
	/// Existing key received a new value.
	Updated,
	/// Key frozen with a non-empty value.
	Frozen,
	/// Key cleared.
	Emptied,
	/// Key cleared and frozen empty.
	EmptiedFrozen,
}

/// One key's change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
	/// Changed key.
	pub key: String,
	/// Value after the change.
	pub value: String,
	/// Kind of change.
	pub kind: DiffKind,
}

impl DiffEntry {
	/// Classifies the change of `attr`; `created` is true when the key was not
	/// stored before.
	#[must_use]
	pub fn classify(attr: &Attr, created: bool) -> Self {
		let kind = match (attr.is_empty(), attr.frozen) {
			(true, true) => DiffKind::EmptiedFrozen,
			(true, false) => DiffKind::Emptied,
			(false, true) => DiffKind::Frozen,
			(false, false) if created => DiffKind::Created,
			(false, false) => DiffKind::Updated,
		};
		Self {
			key: attr.key.clone(),
			value: attr.value.clone(),
			kind,
		}
	}
}

impl fmt::Display for DiffEntry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.kind {
			DiffKind::Created => write!(f, "+{}={}", self.key, self.value),
			DiffKind::Updated => write!(f, "{}={}", self.key, self.value),
			DiffKind::Frozen => write!(f, "{}@{}", self.key, self.value),
			DiffKind::Emptied => write!(f, "-{}", self.key),
			DiffKind::EmptiedFrozen => write!(f, "!{}", self.key),
		}
	}
}

/// Ordered change set of one committed update.
///
/// Displays compactly, entries separated by spaces: `+a=1 b=2 c@3 -d !e`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff(pub Vec<DiffEntry>);

impl Diff {
	/// Returns true when nothing changed.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// Iterates the entries in commit order.
	pub fn iter(&self) -> impl Iterator<Item = &DiffEntry> {
		self.0.iter()
	}
}

impl fmt::Display for Diff {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for (i, entry) in self.0.iter().enumerate() {
			if i > 0 {
				f.write_str(" ")?;
			}
			entry.fmt(f)?;
		}
		Ok(())
	}
}
