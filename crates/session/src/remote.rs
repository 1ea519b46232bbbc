//! Caches of sessions owned by other peers.
//!
//! A [`RemoteCatalog`] is never authoritative. It remembers attribute
//! metadata fetched from the owner together with the revision it was fetched
//! at, and answers reads from that cache while the entry is provably valid:
//! the attribute is frozen, or the requested revision is not newer than the
//! fetch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ravel_primitives::{Attr, AttrMeta, AttrTable, Error, Result, SessionId, SessionRef};
use ravel_rpc::CallContext;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::proto::{CatalogLink, CatalogReply};
use crate::revision::Revision;

/// Generation of a cached item in the two-generation sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Age {
	Young,
	Old,
}

#[derive(Debug)]
struct CacheEntry {
	meta: AttrMeta,
	fetched_at: u64,
	age: Age,
}

impl CacheEntry {
	fn valid_for(&self, rev: u64) -> bool {
		self.meta.attr.frozen || rev <= self.fetched_at
	}
}

#[derive(Debug)]
struct RemoteState {
	highest_seen: u64,
	cache: HashMap<String, CacheEntry>,
	closed: bool,
	age: Age,
}

impl RemoteState {
	fn ensure_open(&mut self) -> Result<()> {
		if self.closed {
			return Err(Error::NotFound);
		}
		self.age = Age::Young;
		Ok(())
	}

	/// Caches every attribute of `reply`, returning them keyed.
	fn absorb(&mut self, reply: CatalogReply) -> Vec<AttrMeta> {
		self.highest_seen = self.highest_seen.max(reply.head);
		for meta in &reply.attrs {
			self.cache.insert(
				meta.attr.key.clone(),
				CacheEntry {
					meta: meta.clone(),
					fetched_at: reply.head,
					age: Age::Young,
				},
			);
		}
		reply.attrs
	}
}

/// Cache of one remote session's catalog.
#[derive(Debug)]
pub struct RemoteCatalog {
	id: SessionId,
	link: CatalogLink,
	state: Mutex<RemoteState>,
}

impl RemoteCatalog {
	fn new(id: SessionId, link: CatalogLink) -> Arc<Self> {
		Arc::new(Self {
			id,
			link,
			state: Mutex::new(RemoteState {
				highest_seen: 0,
				cache: HashMap::new(),
				closed: false,
				age: Age::Young,
			}),
		})
	}

	/// Session this cache mirrors.
	#[must_use]
	pub fn id(&self) -> SessionId {
		self.id
	}

	/// Highest revision observed so far.
	#[must_use]
	pub fn highest_seen(&self) -> u64 {
		self.state.lock().highest_seen
	}

	/// Returns true once the owner reported the session gone.
	#[must_use]
	pub fn is_closed(&self) -> bool {
		self.state.lock().closed
	}

	/// Number of cached attributes.
	#[must_use]
	pub fn cached(&self) -> usize {
		self.state.lock().cache.len()
	}

	/// Records that revision `rev` exists.
	pub fn observe(&self, rev: u64) {
		let mut state = self.state.lock();
		state.highest_seen = state.highest_seen.max(rev);
		state.age = Age::Young;
	}

	/// Learns the current revision from the owner.
	pub async fn head(self: &Arc<Self>, ctx: &CallContext) -> Result<Revision> {
		self.state.lock().ensure_open()?;
		let reply = self.settle(self.link.fetch(ctx, self.id, Vec::new()).await)?;
		let head = reply.head;
		self.state.lock().absorb(reply);
		Ok(Revision::remote(Arc::clone(self), self.id.at(head)))
	}

	/// Reads `keys` as of `rev`, going to the owner only for keys the cache
	/// cannot answer.
	///
	/// Fails with [`Error::StaleFetch`] if any key changed after `rev`; the
	/// freshly fetched metadata is cached regardless.
	pub async fn fetch(&self, ctx: &CallContext, rev: u64, keys: &[&str]) -> Result<AttrTable> {
		let mut table = AttrTable::new();
		let mut stale = false;
		let mut missing = Vec::new();
		{
			let mut state = self.state.lock();
			state.ensure_open()?;
			for key in keys {
				match state.cache.get_mut(*key) {
					Some(entry) if entry.valid_for(rev) => {
						entry.age = Age::Young;
						match entry.meta.as_of(rev) {
							Ok(attr) => {
								table.insert((*key).to_string(), attr);
							}
							Err(_) => stale = true,
						}
					}
					_ => missing.push((*key).to_string()),
				}
			}
		}

		if !missing.is_empty() {
			tracing::trace!(session = %self.id, rev, keys = missing.len(), "remote_catalog.fetch");
			let reply = self.settle(self.link.fetch(ctx, self.id, missing).await)?;
			let metas = self.state.lock().absorb(reply);
			for meta in metas {
				match meta.as_of(rev) {
					Ok(attr) => {
						table.insert(meta.attr.key, attr);
					}
					Err(_) => stale = true,
				}
			}
		}

		if stale { Err(Error::StaleFetch) } else { Ok(table) }
	}

	/// Updates the session at `rev` on the owner.
	///
	/// Attributes the cache proves unchanged are not sent. If none remain the
	/// revision is returned as is.
	pub async fn try_update(self: &Arc<Self>, ctx: &CallContext, rev: u64, attrs: Vec<Attr>) -> Result<Revision> {
		let remaining: Vec<Attr> = {
			let mut state = self.state.lock();
			state.ensure_open()?;
			if state.highest_seen > rev {
				return Err(Error::StaleUpdate);
			}
			attrs
				.into_iter()
				.filter(|attr| !state.cache.get(&attr.key).is_some_and(|entry| entry.elides(attr, rev)))
				.collect()
		};
		if remaining.is_empty() {
			return Ok(Revision::remote(Arc::clone(self), self.id.at(rev)));
		}

		let reply = self.settle(self.link.update(ctx, self.id.at(rev), remaining).await)?;
		let head = reply.head;
		self.state.lock().absorb(reply);
		Ok(Revision::remote(Arc::clone(self), self.id.at(head)))
	}

	/// Closes the session at `rev` on the owner.
	pub async fn try_close(&self, ctx: &CallContext, rev: u64) -> Result<()> {
		{
			let mut state = self.state.lock();
			state.ensure_open()?;
			if state.highest_seen > rev {
				return Err(Error::StaleUpdate);
			}
		}
		self.settle(self.link.close(ctx, self.id.at(rev)).await)?;
		self.mark_closed();
		Ok(())
	}

	/// Marks the catalog closed on [`Error::NotFound`].
	fn settle<T>(&self, result: Result<T>) -> Result<T> {
		if matches!(result, Err(Error::NotFound)) {
			self.mark_closed();
		}
		result
	}

	fn mark_closed(&self) {
		let mut state = self.state.lock();
		if !state.closed {
			tracing::debug!(session = %self.id, "remote_catalog.closed");
		}
		state.closed = true;
		state.cache.clear();
	}

	/// Ages the cache by one generation. Returns true if the whole catalog
	/// should be evicted.
	fn sweep(&self) -> bool {
		let mut state = self.state.lock();
		if state.closed || state.age == Age::Old {
			return true;
		}
		state.age = Age::Old;
		state.cache.retain(|_, entry| match entry.age {
			Age::Young => {
				entry.age = Age::Old;
				true
			}
			Age::Old => false,
		});
		false
	}
}

impl CacheEntry {
	/// Returns true if sending `attr` at `rev` cannot change the table.
	fn elides(&self, attr: &Attr, rev: u64) -> bool {
		let cached = &self.meta.attr;
		if cached.value != attr.value {
			return false;
		}
		cached.frozen || (self.fetched_at == rev && cached.frozen == attr.frozen)
	}
}

/// Remote catalogs of one peer, keyed by session.
#[derive(Debug)]
pub struct RemoteStore {
	link: CatalogLink,
	catalogs: Mutex<HashMap<SessionId, Arc<RemoteCatalog>>>,
}

impl RemoteStore {
	/// Creates an empty store.
	#[must_use]
	pub fn new(link: CatalogLink) -> Self {
		Self {
			link,
			catalogs: Mutex::new(HashMap::new()),
		}
	}

	/// Cache of `session`, created on first use.
	pub fn catalog(&self, session: SessionId) -> Arc<RemoteCatalog> {
		let mut catalogs = self.catalogs.lock();
		Arc::clone(
			catalogs
				.entry(session)
				.or_insert_with(|| RemoteCatalog::new(session, self.link.clone())),
		)
	}

	/// Revision `reference` of a remote session.
	pub fn revision_at(&self, reference: SessionRef) -> Revision {
		let catalog = self.catalog(reference.session);
		catalog.observe(reference.rev);
		Revision::remote(catalog, reference)
	}

	/// Number of cached sessions.
	#[must_use]
	pub fn len(&self) -> usize {
		self.catalogs.lock().len()
	}

	/// Returns true if no session is cached.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.catalogs.lock().is_empty()
	}

	/// Runs one sweep; returns the number of evicted catalogs.
	pub fn sweep(&self) -> usize {
		let mut catalogs = self.catalogs.lock();
		let before = catalogs.len();
		catalogs.retain(|_, catalog| !catalog.sweep());
		before - catalogs.len()
	}

	/// Sweeps every `interval` until `stop` fires.
	pub async fn run_sweeper(self: Arc<Self>, interval: Duration, stop: CancellationToken) -> Result<()> {
		let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				biased;
				() = stop.cancelled() => break,
				_ = ticker.tick() => {
					let evicted = self.sweep();
					tracing::debug!(evicted, remaining = self.len(), "remote_store.sweep");
				}
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use ravel_primitives::PeerId;
	use ravel_rpc::{ChannelPool, Invoker, MemoryBroker};
	use tokio::sync::mpsc;

	use super::*;

	/// A catalog whose link has no running invoker: every round trip fails
	/// with `ServiceStopped`, so a successful read proves a cache hit.
	fn offline_catalog() -> Arc<RemoteCatalog> {
		let (_tx, replies) = mpsc::unbounded_channel();
		let pool = ChannelPool::new(Arc::new(MemoryBroker::new()), 1);
		let token = CancellationToken::new();
		let (invoker, _loop) = Invoker::new(PeerId::from_raw(1), pool, replies, Duration::from_secs(1), token.clone(), token);
		RemoteCatalog::new(SessionId::new(PeerId::from_raw(2), 1), CatalogLink::new(invoker))
	}

	fn meta(attr: Attr, created_at: u64, updated_at: u64) -> AttrMeta {
		AttrMeta { attr, created_at, updated_at }
	}

	fn seed(catalog: &RemoteCatalog, head: u64, attrs: Vec<AttrMeta>) {
		catalog.state.lock().absorb(CatalogReply { head, attrs });
	}

	#[tokio::test]
	async fn cache_answers_up_to_the_fetch_revision() {
		let ctx = CallContext::background();
		let catalog = offline_catalog();
		seed(&catalog, 3, vec![meta(Attr::set("k", "v"), 1, 2), meta(Attr::freeze("f", "x"), 1, 1)]);

		let table = catalog.fetch(&ctx, 3, &["k", "f"]).await.unwrap();
		assert_eq!(table["k"], Attr::set("k", "v"));
		assert_eq!(catalog.fetch(&ctx, 5, &["k"]).await, Err(Error::ServiceStopped));
		assert_eq!(catalog.fetch(&ctx, 5, &["f"]).await.unwrap()["f"], Attr::freeze("f", "x"));
		assert_eq!(catalog.fetch(&ctx, 1, &["k"]).await, Err(Error::StaleFetch));
	}

	#[tokio::test]
	async fn updates_proven_unchanged_skip_the_round_trip() {
		let ctx = CallContext::background();
		let catalog = offline_catalog();
		seed(&catalog, 3, vec![meta(Attr::set("k", "v"), 1, 3), meta(Attr::freeze("f", "x"), 1, 1)]);

		let same = catalog.try_update(&ctx, 3, vec![Attr::set("k", "v"), Attr::set("f", "x")]).await.unwrap();
		assert_eq!(same.reference(), catalog.id().at(3));
		assert_eq!(catalog.try_update(&ctx, 3, vec![Attr::freeze("k", "v")]).await.unwrap_err(), Error::ServiceStopped);

		catalog.observe(4);
		assert_eq!(catalog.try_update(&ctx, 3, vec![Attr::set("k", "w")]).await.unwrap_err(), Error::StaleUpdate);
		assert_eq!(catalog.try_close(&ctx, 3).await, Err(Error::StaleUpdate));
	}

	#[tokio::test]
	async fn sweeps_evict_untouched_items_after_two_generations() {
		let ctx = CallContext::background();
		let catalog = offline_catalog();
		seed(&catalog, 1, vec![meta(Attr::set("hot", "1"), 1, 1), meta(Attr::set("cold", "1"), 1, 1)]);

		assert!(!catalog.sweep());
		catalog.fetch(&ctx, 1, &["hot"]).await.unwrap();
		assert!(!catalog.sweep());
		assert_eq!(catalog.cached(), 1);
		assert!(catalog.sweep());
	}

	#[test]
	fn closed_catalogs_answer_not_found() {
		let catalog = offline_catalog();
		catalog.mark_closed();
		assert!(catalog.sweep());
		assert_eq!(catalog.settle::<()>(Err(Error::NotFound)), Err(Error::NotFound));
		assert!(catalog.is_closed());
	}
}
