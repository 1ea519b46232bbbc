//! Authoritative attribute table of a session owned by this peer.

use std::sync::Arc;

use parking_lot::Mutex;
use ravel_primitives::{Attr, AttrMeta, AttrMetaTable, AttrTable, Diff, DiffEntry, Error, MessageId, Result, SessionId, SessionRef};
use tokio_util::sync::CancellationToken;

use crate::revision::Revision;

/// Live table and revision counter of one local session.
///
/// Every mutation goes through a compare-and-swap on the revision number:
/// callers name the revision they based their change on and lose with
/// [`Error::StaleUpdate`] if another update committed first.
#[derive(Debug)]
pub struct LocalCatalog {
	id: SessionId,
	state: Mutex<CatalogState>,
	closed: CancellationToken,
}

#[derive(Debug, Default)]
struct CatalogState {
	rev: u64,
	table: AttrMetaTable,
	msg_seq: u64,
	closed: bool,
}

/// Outcome of a committed update.
#[derive(Debug)]
pub(crate) struct Applied {
	pub rev: u64,
	pub diff: Diff,
	pub metas: Vec<AttrMeta>,
}

impl CatalogState {
	fn check(&self, reference: SessionRef) -> Result<()> {
		if self.closed {
			return Err(Error::NotFound);
		}
		if reference.rev != self.rev {
			return Err(Error::StaleUpdate);
		}
		Ok(())
	}

	fn meta(&self, key: &str) -> AttrMeta {
		self.table.get(key).cloned().unwrap_or_else(|| AttrMeta::missing(key))
	}
}

impl LocalCatalog {
	/// Creates the empty catalog of a new session at revision 0.
	#[must_use]
	pub fn new(id: SessionId) -> Arc<Self> {
		Arc::new(Self {
			id,
			state: Mutex::new(CatalogState::default()),
			closed: CancellationToken::new(),
		})
	}

	/// Session this catalog belongs to.
	#[must_use]
	pub fn id(&self) -> SessionId {
		self.id
	}

	/// Current revision.
	pub fn head(self: &Arc<Self>) -> Result<Revision> {
		let state = self.state.lock();
		if state.closed {
			return Err(Error::NotFound);
		}
		Ok(Revision::local(Arc::clone(self), self.id.at(state.rev), false))
	}

	/// View at `reference`: the current revision, or a read-only historical
	/// view for an older one.
	pub fn at(self: &Arc<Self>, reference: SessionRef) -> Result<Revision> {
		let state = self.state.lock();
		if state.closed || reference.session != self.id || reference.rev > state.rev {
			return Err(Error::NotFound);
		}
		Ok(Revision::local(Arc::clone(self), reference, reference.rev < state.rev))
	}

	/// Reads `keys` as of revision `rev`.
	pub fn read(&self, rev: u64, keys: &[&str]) -> Result<AttrTable> {
		let state = self.state.lock();
		if state.closed {
			return Err(Error::NotFound);
		}
		keys.iter()
			.map(|key| Ok(((*key).to_string(), state.meta(key).as_of(rev)?)))
			.collect()
	}

	/// Current revision and raw metadata of `keys`, for serving remote caches.
	pub fn metas(&self, keys: &[String]) -> Result<(u64, Vec<AttrMeta>)> {
		let state = self.state.lock();
		if state.closed {
			return Err(Error::NotFound);
		}
		Ok((state.rev, keys.iter().map(|key| state.meta(key)).collect()))
	}

	/// Snapshot of the whole table at the current revision.
	pub fn attrs(&self) -> Result<(SessionRef, AttrMetaTable)> {
		let state = self.state.lock();
		if state.closed {
			return Err(Error::NotFound);
		}
		Ok((self.id.at(state.rev), state.table.clone()))
	}

	/// Applies `attrs` on top of `reference`, which must be the current
	/// revision.
	///
	/// The whole update is rejected with [`Error::FrozenAttributes`] if it
	/// would change any frozen value. Changes that leave the table as it is
	/// are skipped; if nothing remains the current revision is returned
	/// unchanged with an empty diff. An empty batch returns the view of
	/// `reference` itself, as [`LocalCatalog::at`] would.
	pub fn try_update(self: &Arc<Self>, reference: SessionRef, attrs: Vec<Attr>) -> Result<(Revision, Diff)> {
		if attrs.is_empty() {
			return Ok((self.at(reference)?, Diff::default()));
		}
		let applied = self.apply(reference, attrs)?;
		Ok((Revision::local(Arc::clone(self), self.id.at(applied.rev), false), applied.diff))
	}

	pub(crate) fn apply(&self, reference: SessionRef, attrs: Vec<Attr>) -> Result<Applied> {
		let mut state = self.state.lock();
		state.check(reference)?;

		let mut frozen = Vec::new();
		let mut changes = Vec::new();
		for attr in attrs {
			match state.table.get(&attr.key) {
				Some(current) if current.attr.frozen => {
					if current.attr.value != attr.value {
						frozen.push(attr.key);
					}
				}
				Some(current) if current.attr.value == attr.value && current.attr.frozen == attr.frozen => {}
				None if attr.is_empty() && !attr.frozen => {}
				current => {
					let created = current.is_none_or(|meta| meta.attr.is_empty());
					changes.push((attr, created));
				}
			}
		}
		if !frozen.is_empty() {
			frozen.sort();
			frozen.dedup();
			return Err(Error::FrozenAttributes { keys: frozen });
		}
		if changes.is_empty() {
			return Ok(Applied {
				rev: state.rev,
				diff: Diff::default(),
				metas: Vec::new(),
			});
		}

		let rev = state.rev + 1;
		let mut diff = Vec::with_capacity(changes.len());
		let mut metas = Vec::with_capacity(changes.len());
		for (attr, created) in changes {
			diff.push(DiffEntry::classify(&attr, created));
			let meta = state.table.entry(attr.key.clone()).or_insert_with(|| AttrMeta {
				attr: attr.clone(),
				created_at: rev,
				updated_at: rev,
			});
			meta.attr = attr;
			meta.updated_at = rev;
			metas.push(meta.clone());
		}
		state.rev = rev;
		state.msg_seq = 0;
		let diff = Diff(diff);
		tracing::debug!(session = %self.id, rev, %diff, "catalog.update");
		Ok(Applied { rev, diff, metas })
	}

	/// Closes the session at `reference`, which must be the current revision.
	pub fn try_close(&self, reference: SessionRef) -> Result<()> {
		{
			let mut state = self.state.lock();
			state.check(reference)?;
			state.closed = true;
			state.table.clear();
		}
		tracing::debug!(session = %self.id, rev = reference.rev, "catalog.close");
		self.closed.cancel();
		Ok(())
	}

	/// Closes the session regardless of its revision. Used when the owning
	/// peer goes away.
	pub(crate) fn destroy(&self) {
		{
			let mut state = self.state.lock();
			if state.closed {
				return;
			}
			state.closed = true;
			state.table.clear();
		}
		tracing::debug!(session = %self.id, "catalog.destroyed");
		self.closed.cancel();
	}

	/// Allocates the id of the next outbound message at the current revision.
	pub fn next_message_id(&self) -> Result<MessageId> {
		let mut state = self.state.lock();
		if state.closed {
			return Err(Error::NotFound);
		}
		state.msg_seq += 1;
		Ok(MessageId::new(self.id.at(state.rev), state.msg_seq))
	}

	/// Returns true once closed.
	#[must_use]
	pub fn is_closed(&self) -> bool {
		self.closed.is_cancelled()
	}

	/// Resolves once closed.
	pub async fn closed(&self) {
		self.closed.cancelled().await;
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use ravel_primitives::PeerId;

	use super::*;

	fn catalog() -> Arc<LocalCatalog> {
		LocalCatalog::new(SessionId::new(PeerId::from_raw(0xdead_beef), 1))
	}

	#[test]
	fn updates_advance_one_revision_and_report_a_diff() {
		let catalog = catalog();
		let r0 = catalog.head().unwrap();
		let (r1, diff) = catalog.try_update(r0.reference(), vec![Attr::set("a", "1")]).unwrap();
		assert_eq!(r1.reference().rev, 1);
		assert_eq!(diff.to_string(), "+a=1");

		let (r2, diff) = catalog
			.try_update(r1.reference(), vec![Attr::set("a", "2"), Attr::freeze("b", "x"), Attr::delete("c")])
			.unwrap();
		assert_eq!(r2.reference().rev, 2);
		assert_eq!(diff.to_string(), "a=2 b@x");
	}

	#[test]
	fn concurrent_updates_from_one_revision_have_one_winner() {
		let catalog = catalog();
		let r0 = catalog.head().unwrap().reference();
		assert!(catalog.try_update(r0, vec![Attr::set("a", "1")]).is_ok());
		assert_eq!(catalog.try_update(r0, vec![Attr::set("a", "9")]).unwrap_err(), Error::StaleUpdate);
		assert_eq!(catalog.read(1, &["a"]).unwrap()["a"], Attr::set("a", "1"));
	}

	#[test]
	fn frozen_values_never_change() {
		let catalog = catalog();
		let r0 = catalog.head().unwrap().reference();
		let (r1, _) = catalog.try_update(r0, vec![Attr::freeze("x", "y")]).unwrap();

		let err = catalog
			.try_update(r1.reference(), vec![Attr::set("x", "z"), Attr::set("other", "1")])
			.unwrap_err();
		assert_eq!(err, Error::FrozenAttributes { keys: vec!["x".into()] });
		assert_eq!(catalog.head().unwrap().reference().rev, 1);
		assert_eq!(catalog.read(1, &["x", "other"]).unwrap()["other"], Attr::empty("other"));

		let (same, diff) = catalog.try_update(r1.reference(), vec![Attr::set("x", "y")]).unwrap();
		assert_eq!(same.reference().rev, 1);
		assert!(diff.is_empty());
	}

	#[test]
	fn empty_and_no_op_updates_keep_the_revision() {
		let catalog = catalog();
		let r0 = catalog.head().unwrap().reference();
		let (same, _) = catalog.try_update(r0, Vec::new()).unwrap();
		assert_eq!(same.reference(), r0);
		let (same, _) = catalog.try_update(r0, vec![Attr::delete("never-set")]).unwrap();
		assert_eq!(same.reference(), r0);
	}

	#[test]
	fn empty_updates_still_check_the_reference() {
		let catalog = catalog();
		let r0 = catalog.head().unwrap().reference();
		let (r1, _) = catalog.try_update(r0, vec![Attr::set("a", "1")]).unwrap();

		let (old, diff) = catalog.try_update(r0, Vec::new()).unwrap();
		assert!(old.is_historical());
		assert!(diff.is_empty());
		assert!(!catalog.try_update(r1.reference(), Vec::new()).unwrap().0.is_historical());

		let future = SessionRef { rev: 5, ..r0 };
		assert_eq!(catalog.try_update(future, Vec::new()).unwrap_err(), Error::NotFound);
		let other = SessionId::new(PeerId::from_raw(7), 1).at(0);
		assert_eq!(catalog.try_update(other, Vec::new()).unwrap_err(), Error::NotFound);

		catalog.try_close(r1.reference()).unwrap();
		assert_eq!(catalog.try_update(r1.reference(), Vec::new()).unwrap_err(), Error::NotFound);
	}

	#[test]
	fn historical_reads_follow_creation_and_update_revisions() {
		let catalog = catalog();
		let r0 = catalog.head().unwrap().reference();
		let (r1, _) = catalog.try_update(r0, vec![Attr::set("a", "1")]).unwrap();
		catalog.try_update(r1.reference(), vec![Attr::set("b", "2"), Attr::set("a", "3")]).unwrap();

		assert_eq!(catalog.read(1, &["b"]).unwrap()["b"], Attr::empty("b"));
		assert_eq!(catalog.read(0, &["a"]).unwrap()["a"], Attr::empty("a"));
		assert_eq!(catalog.read(1, &["a"]).unwrap_err(), Error::StaleFetch);
		assert_eq!(catalog.read(2, &["a"]).unwrap()["a"], Attr::set("a", "3"));
	}

	#[test]
	fn message_ids_restart_after_each_update() {
		let catalog = catalog();
		let r0 = catalog.head().unwrap().reference();
		assert_eq!(catalog.next_message_id().unwrap().to_string(), "00000000deadbeef.1@0#1");
		assert_eq!(catalog.next_message_id().unwrap().seq, 2);
		catalog.try_update(r0, vec![Attr::set("k", "v")]).unwrap();
		assert_eq!(catalog.next_message_id().unwrap().to_string(), "00000000deadbeef.1@1#1");
	}

	#[test]
	fn close_requires_the_current_revision_and_is_final() {
		let catalog = catalog();
		let r0 = catalog.head().unwrap().reference();
		let (r1, _) = catalog.try_update(r0, vec![Attr::set("k", "v")]).unwrap();
		assert_eq!(catalog.try_close(r0), Err(Error::StaleUpdate));
		catalog.try_close(r1.reference()).unwrap();

		assert!(catalog.is_closed());
		assert_eq!(catalog.head().unwrap_err(), Error::NotFound);
		assert_eq!(catalog.read(1, &["k"]).unwrap_err(), Error::NotFound);
		assert_eq!(catalog.try_close(r1.reference()), Err(Error::NotFound));
		assert_eq!(catalog.next_message_id().unwrap_err(), Error::NotFound);
	}

	#[tokio::test]
	async fn destroy_closes_at_any_revision() {
		let catalog = catalog();
		let r0 = catalog.head().unwrap().reference();
		catalog.try_update(r0, vec![Attr::set("k", "v")]).unwrap();

		catalog.destroy();
		catalog.closed().await;
		assert!(catalog.is_closed());
		assert_eq!(catalog.head().unwrap_err(), Error::NotFound);
		assert_eq!(catalog.read(1, &["k"]).unwrap_err(), Error::NotFound);
		catalog.destroy();
	}
}
