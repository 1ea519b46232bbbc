//! Immutable views of a session's attributes at one revision.

use std::sync::Arc;

use ravel_primitives::{Attr, AttrTable, Error, Result, SessionId, SessionRef};
use ravel_rpc::CallContext;

use crate::local::LocalCatalog;
use crate::remote::RemoteCatalog;

/// A session as of one revision.
///
/// Reads answer as of [`Revision::reference`]. Writes compare-and-swap on it:
/// they succeed only if no other update committed since, and yield a new
/// `Revision` rather than changing this one.
#[derive(Debug, Clone)]
pub struct Revision {
	reference: SessionRef,
	source: Source,
}

#[derive(Debug, Clone)]
enum Source {
	Local { catalog: Arc<LocalCatalog>, historical: bool },
	Remote(Arc<RemoteCatalog>),
}

impl Revision {
	pub(crate) fn local(catalog: Arc<LocalCatalog>, reference: SessionRef, historical: bool) -> Self {
		Self {
			reference,
			source: Source::Local { catalog, historical },
		}
	}

	pub(crate) fn remote(catalog: Arc<RemoteCatalog>, reference: SessionRef) -> Self {
		Self {
			reference,
			source: Source::Remote(catalog),
		}
	}

	/// Session and revision number of this view.
	#[must_use]
	pub fn reference(&self) -> SessionRef {
		self.reference
	}

	/// Session this view belongs to.
	#[must_use]
	pub fn session(&self) -> SessionId {
		self.reference.session
	}

	/// Revision number.
	#[must_use]
	pub fn rev(&self) -> u64 {
		self.reference.rev
	}

	/// Returns true if the session lives on this peer.
	#[must_use]
	pub fn is_local(&self) -> bool {
		matches!(self.source, Source::Local { .. })
	}

	/// Returns true for a read-only view of an older local revision.
	#[must_use]
	pub fn is_historical(&self) -> bool {
		matches!(self.source, Source::Local { historical: true, .. })
	}

	/// Reads one attribute. A key that did not exist at this revision reads
	/// as an empty attribute.
	pub async fn get(&self, ctx: &CallContext, key: &str) -> Result<Attr> {
		let mut table = self.get_many(ctx, &[key]).await?;
		Ok(table.remove(key).unwrap_or_else(|| Attr::empty(key)))
	}

	/// Reads several attributes.
	///
	/// Fails with [`Error::StaleFetch`] if any of them changed after this
	/// revision.
	pub async fn get_many(&self, ctx: &CallContext, keys: &[&str]) -> Result<AttrTable> {
		match &self.source {
			Source::Local { catalog, .. } => catalog.read(self.reference.rev, keys),
			Source::Remote(catalog) => catalog.fetch(ctx, self.reference.rev, keys).await,
		}
	}

	/// Applies `attrs` and returns the resulting revision.
	///
	/// An empty update returns this revision unchanged.
	pub async fn update(&self, ctx: &CallContext, attrs: Vec<Attr>) -> Result<Self> {
		if attrs.is_empty() {
			return Ok(self.clone());
		}
		match &self.source {
			Source::Local { historical: true, .. } => Err(Error::StaleUpdate),
			Source::Local { catalog, .. } => catalog.try_update(self.reference, attrs).map(|(revision, _)| revision),
			Source::Remote(catalog) => catalog.try_update(ctx, self.reference.rev, attrs).await,
		}
	}

	/// Closes the session. Every later operation on it fails with
	/// [`Error::NotFound`].
	pub async fn close(&self, ctx: &CallContext) -> Result<()> {
		match &self.source {
			Source::Local { historical: true, .. } => Err(Error::StaleUpdate),
			Source::Local { catalog, .. } => catalog.try_close(self.reference),
			Source::Remote(catalog) => catalog.try_close(ctx, self.reference.rev).await,
		}
	}

	/// Current revision of the session.
	pub async fn refresh(&self, ctx: &CallContext) -> Result<Self> {
		match &self.source {
			Source::Local { catalog, .. } => catalog.head(),
			Source::Remote(catalog) => catalog.head(ctx).await,
		}
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use ravel_primitives::PeerId;

	use super::*;

	#[tokio::test]
	async fn historical_views_are_read_only() {
		let ctx = CallContext::background();
		let catalog = LocalCatalog::new(SessionId::new(PeerId::from_raw(1), 1));
		let r0 = catalog.head().unwrap();
		let r1 = r0.update(&ctx, vec![Attr::set("a", "1")]).await.unwrap();
		r1.update(&ctx, vec![Attr::set("b", "2")]).await.unwrap();

		let view = catalog.at(r1.reference()).unwrap();
		assert!(view.is_historical());
		assert_eq!(view.get(&ctx, "a").await.unwrap(), Attr::set("a", "1"));
		assert_eq!(view.get(&ctx, "b").await.unwrap(), Attr::empty("b"));
		assert_eq!(view.update(&ctx, vec![Attr::set("c", "3")]).await.unwrap_err(), Error::StaleUpdate);
		assert_eq!(view.close(&ctx).await, Err(Error::StaleUpdate));
		assert_eq!(view.update(&ctx, Vec::new()).await.unwrap().reference(), r1.reference());

		let head = view.refresh(&ctx).await.unwrap();
		assert_eq!(head.rev(), 2);
		assert!(!head.is_historical());
	}

	#[tokio::test]
	async fn losers_retry_after_refresh() {
		let ctx = CallContext::background();
		let catalog = LocalCatalog::new(SessionId::new(PeerId::from_raw(1), 1));
		let r0 = catalog.head().unwrap();
		let other = r0.clone();

		let r1 = r0.update(&ctx, vec![Attr::set("a", "1")]).await.unwrap();
		let err = other.update(&ctx, vec![Attr::set("a", "2")]).await.unwrap_err();
		assert!(err.should_retry());

		let fresh = other.refresh(&ctx).await.unwrap();
		assert_eq!(fresh.reference(), r1.reference());
		assert_eq!(fresh.get(&ctx, "a").await.unwrap().value, "1");
		let r2 = fresh.update(&ctx, vec![Attr::set("a", "2")]).await.unwrap();
		assert_eq!(r2.rev(), 2);
	}
}
