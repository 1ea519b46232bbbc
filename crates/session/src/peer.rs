//! One participant on the broker: loops, sessions and lifecycle.
//!
//! A peer runs four long-lived tasks: the invoker loop correlating replies,
//! one dispatch loop for commands, one for notifications, and the remote
//! catalog sweeper. The first task to fail records the error and forces the
//! others down; [`Peer::wait`] reports it once every task has exited and the
//! peer id was released.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use ravel_primitives::{Error, Namespace, PeerId, Result, SessionId, SessionRef};
use ravel_rpc::task::{self, TaskClass};
use ravel_rpc::{ChannelPool, DispatchKind, Dispatcher, Handler, Inbox, Invoker, Notifier, Request, Transport};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PeerConfig;
use crate::local::LocalCatalog;
use crate::proto::{self, CatalogLink, CatalogReply, CatalogRequest};
use crate::remote::RemoteStore;
use crate::revision::Revision;
use crate::session::{CommandHandler, EventHandler, Invocation, Notification, Session};

const RESERVE_ATTEMPTS: usize = 8;

/// State shared by a peer's handles, sessions and handlers.
pub(crate) struct PeerShared {
	pub(crate) id: PeerId,
	pub(crate) config: PeerConfig,
	pub(crate) invoker: Invoker,
	pub(crate) notifier: Notifier,
	commands: Dispatcher,
	events: Dispatcher,
	remote: Arc<RemoteStore>,
	sessions: Mutex<HashMap<SessionId, Arc<LocalCatalog>>>,
	next_session: AtomicU64,
	listeners: tokio::sync::Mutex<HashMap<Namespace, HashMap<SessionId, EventHandler>>>,
}

impl std::fmt::Debug for PeerShared {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PeerShared")
			.field("id", &self.id)
			.field("sessions", &self.sessions.lock().len())
			.field("remote", &self.remote.len())
			.finish_non_exhaustive()
	}
}

impl PeerShared {
	/// Session view named by an inbound message id.
	fn revision_of(&self, reference: SessionRef) -> Option<Revision> {
		if reference.session.is_internal() {
			return None;
		}
		if reference.session.peer == self.id {
			let catalog = self.sessions.lock().get(&reference.session).cloned()?;
			return catalog.at(reference).ok();
		}
		Some(self.remote.revision_at(reference))
	}

	fn local_catalog(&self, session: SessionId) -> Result<Arc<LocalCatalog>> {
		self.sessions.lock().get(&session).cloned().ok_or(Error::NotFound)
	}

	fn serve_catalog(&self, request: CatalogRequest) -> Result<CatalogReply> {
		match request {
			CatalogRequest::Fetch { session, keys } => {
				let (head, attrs) = self.local_catalog(session)?.metas(&keys)?;
				Ok(CatalogReply { head, attrs })
			}
			CatalogRequest::Update { target, attrs } => {
				let applied = self.local_catalog(target.session)?.apply(target, attrs)?;
				Ok(CatalogReply {
					head: applied.rev,
					attrs: applied.metas,
				})
			}
			CatalogRequest::Close { target } => {
				self.local_catalog(target.session)?.try_close(target)?;
				Ok(CatalogReply {
					head: target.rev,
					attrs: Vec::new(),
				})
			}
		}
	}

	pub(crate) async fn add_listener(self: &Arc<Self>, session: SessionId, namespace: Namespace, handler: EventHandler) -> Result<()> {
		let mut listeners = self.listeners.lock().await;
		if !listeners.contains_key(&namespace) {
			self.events.listen(namespace.clone(), fan_out_handler(Arc::downgrade(self))).await?;
		}
		listeners.entry(namespace).or_default().insert(session, handler);
		Ok(())
	}

	pub(crate) async fn remove_listener(&self, session: SessionId, namespace: &Namespace) -> Result<bool> {
		let mut listeners = self.listeners.lock().await;
		let Some(sessions) = listeners.get_mut(namespace) else {
			return Ok(false);
		};
		let removed = sessions.remove(&session).is_some();
		if sessions.is_empty() {
			listeners.remove(namespace);
			self.events.unlisten(namespace.clone()).await?;
		}
		Ok(removed)
	}

	/// Drops everything held on behalf of a closed session.
	async fn forget_session(&self, session: SessionId) {
		self.sessions.lock().remove(&session);
		self.invoker.set_async_handler(session, None);

		let mut listeners = self.listeners.lock().await;
		let mut emptied = Vec::new();
		listeners.retain(|namespace, sessions| {
			sessions.remove(&session);
			if sessions.is_empty() {
				emptied.push(namespace.clone());
				return false;
			}
			true
		});
		for namespace in emptied {
			if let Err(error) = self.events.unlisten(namespace.clone()).await {
				tracing::debug!(%session, %namespace, %error, "peer.unlisten_failed");
			}
		}
		tracing::debug!(%session, "peer.session_forgotten");
	}

	/// Closes every local session. The peer is gone, so no revision check
	/// applies.
	fn destroy_sessions(&self) {
		let catalogs: Vec<Arc<LocalCatalog>> = self.sessions.lock().drain().map(|(_, catalog)| catalog).collect();
		for catalog in &catalogs {
			catalog.destroy();
		}
		if !catalogs.is_empty() {
			tracing::debug!(peer = %self.id, count = catalogs.len(), "peer.sessions_destroyed");
		}
	}

	/// Hands a notification to every session listening on its namespace. A
	/// panicking listener does not keep the others from hearing it.
	async fn fan_out(&self, request: Request) {
		let targets: Vec<(SessionId, EventHandler)> = self
			.listeners
			.lock()
			.await
			.get(request.namespace())
			.map(|sessions| sessions.iter().map(|(session, handler)| (*session, Arc::clone(handler))).collect())
			.unwrap_or_default();
		if targets.is_empty() {
			tracing::trace!(id = %request.id(), namespace = %request.namespace(), "peer.notification_unheard");
			return;
		}
		let notification = Notification {
			id: request.id(),
			origin: request.origin(),
			namespace: request.namespace().clone(),
			topic: request.command().to_string(),
			payload: request.body().clone(),
			revision: self.revision_of(request.id().reference),
			context: request.context(),
		};
		let id = notification.id;
		let namespace = &notification.namespace;
		let deliveries = targets.into_iter().map(|(session, handler)| {
			let notification = notification.clone();
			async move {
				let heard = AssertUnwindSafe(async move { handler(notification).await }).catch_unwind().await;
				if heard.is_err() {
					tracing::error!(%session, %namespace, %id, "peer.listener_panicked");
				}
			}
		});
		futures::future::join_all(deliveries).await;
	}
}

fn catalog_handler(peer: Weak<PeerShared>) -> Handler {
	Arc::new(move |request: Request| {
		let peer = peer.clone();
		async move {
			let Some(peer) = peer.upgrade() else {
				return;
			};
			let reply = proto::decode::<CatalogRequest>(request.body())
				.and_then(|catalog_request| peer.serve_catalog(catalog_request))
				.and_then(|reply| proto::encode(&reply));
			let responder = request.responder();
			match reply {
				Ok(body) => {
					responder.done(body).await;
				}
				Err(error) => {
					tracing::debug!(id = %request.id(), %error, "catalog.request_failed");
					responder.error(error).await;
				}
			}
		}
		.boxed()
	})
}

fn command_adapter(peer: Weak<PeerShared>, handler: CommandHandler) -> Handler {
	Arc::new(move |request: Request| {
		let revision = peer.upgrade().and_then(|peer| peer.revision_of(request.id().reference));
		handler(Invocation::new(request, revision))
	})
}

fn fan_out_handler(peer: Weak<PeerShared>) -> Handler {
	Arc::new(move |request: Request| {
		let peer = peer.clone();
		async move {
			if let Some(peer) = peer.upgrade() {
				peer.fan_out(request).await;
			}
		}
		.boxed()
	})
}

#[derive(Debug)]
struct Lifecycle {
	stop_dispatch: CancellationToken,
	stop_invoker: CancellationToken,
	stop_sweeper: CancellationToken,
	force: CancellationToken,
	finished: CancellationToken,
	failure: Mutex<Option<Error>>,
}

impl Lifecycle {
	fn new() -> Self {
		let force = CancellationToken::new();
		Self {
			stop_dispatch: CancellationToken::new(),
			stop_invoker: CancellationToken::new(),
			stop_sweeper: force.child_token(),
			force,
			finished: CancellationToken::new(),
			failure: Mutex::new(None),
		}
	}

	fn fail(&self, error: Error) {
		{
			let mut failure = self.failure.lock();
			if failure.is_none() {
				*failure = Some(error);
			}
		}
		self.force.cancel();
	}

	fn is_stopping(&self) -> bool {
		self.stop_dispatch.is_cancelled() || self.force.is_cancelled()
	}
}

/// Handle to a running peer.
///
/// Cloning is cheap; every clone drives the same peer.
#[derive(Debug, Clone)]
pub struct Peer {
	shared: Arc<PeerShared>,
	life: Arc<Lifecycle>,
}

impl Peer {
	/// Reserves a unique peer id on `transport` and starts the peer.
	pub async fn connect(transport: Arc<dyn Transport>, config: PeerConfig) -> Result<Self> {
		let id = reserve(transport.as_ref()).await?;
		match Self::start(Arc::clone(&transport), id, config).await {
			Ok(peer) => Ok(peer),
			Err(error) => {
				if let Err(release) = transport.release(id).await {
					tracing::warn!(peer = %id, error = %release, "peer.release_failed");
				}
				Err(error)
			}
		}
	}

	async fn start(transport: Arc<dyn Transport>, id: PeerId, config: PeerConfig) -> Result<Self> {
		let replies = transport.consume(id, Inbox::Replies).await?;
		let command_deliveries = transport.consume(id, DispatchKind::Commands.inbox()).await?;
		let event_deliveries = transport.consume(id, DispatchKind::Events.inbox()).await?;

		let life = Arc::new(Lifecycle::new());
		let pool = ChannelPool::new(Arc::clone(&transport), config.channel_pool_size.max(1));
		let (invoker, invoker_loop) = Invoker::new(
			id,
			pool.clone(),
			replies,
			config.default_timeout(),
			life.stop_invoker.clone(),
			life.force.clone(),
		);
		let (commands, commands_loop) = Dispatcher::new(
			DispatchKind::Commands,
			id,
			pool.clone(),
			command_deliveries,
			config.prefetch,
			life.stop_dispatch.clone(),
			life.force.clone(),
		);
		let (events, events_loop) = Dispatcher::new(
			DispatchKind::Events,
			id,
			pool.clone(),
			event_deliveries,
			config.prefetch,
			life.stop_dispatch.clone(),
			life.force.clone(),
		);
		let remote = Arc::new(RemoteStore::new(CatalogLink::new(invoker.clone())));
		let sweep_interval = config.cache_sweep_interval().max(Duration::from_millis(1));

		let handles = vec![
			task::spawn(TaskClass::Invoker, watch(Arc::clone(&life), invoker_loop.run())),
			task::spawn(TaskClass::Dispatch, watch(Arc::clone(&life), commands_loop.run())),
			task::spawn(TaskClass::Dispatch, watch(Arc::clone(&life), events_loop.run())),
			task::spawn(
				TaskClass::Sweep,
				watch(Arc::clone(&life), Arc::clone(&remote).run_sweeper(sweep_interval, life.stop_sweeper.clone())),
			),
		];
		let shared = Arc::new(PeerShared {
			id,
			config,
			notifier: Notifier::new(id, pool),
			invoker,
			commands,
			events,
			remote,
			sessions: Mutex::new(HashMap::new()),
			next_session: AtomicU64::new(0),
			listeners: tokio::sync::Mutex::new(HashMap::new()),
		});
		task::spawn(
			TaskClass::Background,
			supervise(handles, transport, id, Arc::downgrade(&shared), Arc::clone(&life)),
		);
		let peer = Self { shared, life };
		if let Err(error) = peer
			.shared
			.commands
			.register_unicast(proto::namespace(), catalog_handler(Arc::downgrade(&peer.shared)))
			.await
		{
			peer.life.force.cancel();
			peer.life.finished.cancelled().await;
			return Err(error);
		}
		tracing::info!(peer = %id, "peer.connected");
		Ok(peer)
	}

	/// Unique id of this peer.
	#[must_use]
	pub fn id(&self) -> PeerId {
		self.shared.id
	}

	/// Configuration the peer runs with.
	#[must_use]
	pub fn config(&self) -> &PeerConfig {
		&self.shared.config
	}

	/// Opens a new session at revision 0.
	pub fn session(&self) -> Result<Session> {
		if self.life.is_stopping() {
			return Err(Error::ServiceStopped);
		}
		let seq = self.shared.next_session.fetch_add(1, Ordering::Relaxed) + 1;
		let catalog = LocalCatalog::new(SessionId::new(self.shared.id, seq));
		self.shared.sessions.lock().insert(catalog.id(), Arc::clone(&catalog));

		let weak = Arc::downgrade(&self.shared);
		let life = Arc::clone(&self.life);
		let watched = Arc::clone(&catalog);
		task::spawn(TaskClass::Background, async move {
			tokio::select! {
				() = watched.closed() => {}
				() = life.finished.cancelled() => return,
			}
			if let Some(shared) = weak.upgrade() {
				shared.forget_session(watched.id()).await;
			}
		});
		tracing::debug!(session = %catalog.id(), "peer.session_opened");
		Ok(Session::new(Arc::clone(&self.shared), catalog))
	}

	/// View of any session at `reference`: local sessions resolve against
	/// their catalog, remote ones against this peer's cache of them.
	pub fn revision_at(&self, reference: SessionRef) -> Result<Revision> {
		if reference.session.is_internal() {
			return Err(Error::NotFound);
		}
		if reference.session.peer == self.shared.id {
			return self.shared.local_catalog(reference.session)?.at(reference);
		}
		Ok(self.shared.remote.revision_at(reference))
	}

	/// Number of open local sessions.
	#[must_use]
	pub fn sessions(&self) -> usize {
		self.shared.sessions.lock().len()
	}

	/// Number of remote sessions this peer holds a cache for.
	#[must_use]
	pub fn cached_sessions(&self) -> usize {
		self.shared.remote.len()
	}

	/// Serves commands of `namespace` with `handler`. Listening again swaps
	/// the handler.
	pub async fn listen(&self, namespace: Namespace, handler: CommandHandler) -> Result<()> {
		self.shared
			.commands
			.listen(namespace, command_adapter(Arc::downgrade(&self.shared), handler))
			.await
	}

	/// Stops serving commands of `namespace`.
	pub async fn unlisten(&self, namespace: &Namespace) -> Result<bool> {
		self.shared.commands.unlisten(namespace.clone()).await
	}

	/// Closes gracefully: stops taking deliveries, lets in-flight handlers
	/// finish, then lets pending calls settle. Each phase is bounded by the
	/// configured drain timeout, after which the peer is forced down.
	pub async fn close(&self) -> Result<()> {
		let drain = self.shared.config.drain_timeout();
		tracing::info!(peer = %self.shared.id, "peer.closing");

		self.life.stop_dispatch.cancel();
		let dispatch = async {
			self.shared.commands.closed().await;
			self.shared.events.closed().await;
		};
		if tokio::time::timeout(drain, dispatch).await.is_err() {
			tracing::warn!(peer = %self.shared.id, "peer.dispatch_drain_timeout");
			self.life.force.cancel();
		}

		self.life.stop_sweeper.cancel();
		self.life.stop_invoker.cancel();
		if tokio::time::timeout(drain, self.shared.invoker.closed()).await.is_err() {
			tracing::warn!(peer = %self.shared.id, "peer.invoker_drain_timeout");
			self.life.force.cancel();
		}
		self.wait().await
	}

	/// Stops immediately, abandoning in-flight work.
	pub async fn shutdown_now(&self) -> Result<()> {
		self.life.force.cancel();
		self.wait().await
	}

	/// Resolves once every task has exited. Returns the error that brought
	/// the peer down, if any.
	pub async fn wait(&self) -> Result<()> {
		self.life.finished.cancelled().await;
		self.life.failure.lock().clone().map_or(Ok(()), Err)
	}

	/// Returns true once every task has exited.
	#[must_use]
	pub fn is_finished(&self) -> bool {
		self.life.finished.is_cancelled()
	}
}

async fn reserve(transport: &dyn Transport) -> Result<PeerId> {
	for attempt in 1..=RESERVE_ATTEMPTS {
		let id = PeerId::generate();
		if transport.reserve(id).await? {
			return Ok(id);
		}
		tracing::debug!(peer = %id, attempt, "peer.reserve_collision");
	}
	Err(Error::Transport("could not reserve a unique peer id".into()))
}

async fn watch(life: Arc<Lifecycle>, task: impl Future<Output = Result<()>>) -> Result<()> {
	let result = task.await;
	if let Err(error) = &result {
		tracing::error!(%error, "peer.task_failed");
		life.fail(error.clone());
	}
	result
}

async fn supervise(
	handles: Vec<JoinHandle<Result<()>>>,
	transport: Arc<dyn Transport>,
	id: PeerId,
	shared: Weak<PeerShared>,
	life: Arc<Lifecycle>,
) {
	let mut running: FuturesUnordered<_> = handles.into_iter().collect();
	while let Some(joined) = running.next().await {
		if let Err(error) = joined {
			tracing::error!(peer = %id, %error, "peer.task_panicked");
			life.fail(Error::Transport(format!("peer task panicked: {error}")));
		}
	}
	if let Some(shared) = shared.upgrade() {
		shared.destroy_sessions();
	}
	if let Err(error) = transport.release(id).await {
		tracing::warn!(peer = %id, %error, "peer.release_failed");
	}
	tracing::info!(peer = %id, "peer.finished");
	life.finished.cancel();
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use ravel_primitives::Attr;
	use ravel_rpc::{CallContext, MemoryBroker};

	use super::*;

	async fn peer(broker: &MemoryBroker) -> Peer {
		Peer::connect(Arc::new(broker.clone()), PeerConfig::default()).await.unwrap()
	}

	#[tokio::test]
	async fn connect_reserves_and_close_releases_the_id() {
		let broker = MemoryBroker::new();
		let peer = peer(&broker).await;
		assert!(broker.is_reserved(peer.id()));

		peer.close().await.unwrap();
		assert!(peer.is_finished());
		assert!(!broker.is_reserved(peer.id()));
		assert_eq!(peer.session().unwrap_err(), Error::ServiceStopped);
	}

	#[tokio::test]
	async fn closing_the_peer_ends_its_sessions() {
		let broker = MemoryBroker::new();
		let peer = peer(&broker).await;
		let ctx = CallContext::background();
		let session = peer.session().unwrap();
		let r1 = session.head().unwrap().update(&ctx, vec![Attr::set("k", "v")]).await.unwrap();

		peer.close().await.unwrap();
		assert!(session.is_closed());
		session.done().await;
		assert_eq!(session.head().unwrap_err(), Error::NotFound);
		assert_eq!(peer.sessions(), 0);
		assert!(peer.shared.revision_of(r1.reference()).is_none());
	}

	#[tokio::test]
	async fn closed_sessions_are_forgotten() {
		let broker = MemoryBroker::new();
		let peer = peer(&broker).await;
		let ctx = CallContext::background();
		let session = peer.session().unwrap();
		let r1 = session.head().unwrap().update(&ctx, vec![Attr::set("k", "v")]).await.unwrap();
		assert_eq!(peer.sessions(), 1);

		r1.close(&ctx).await.unwrap();
		session.done().await;
		tokio::time::timeout(Duration::from_secs(1), async {
			while peer.sessions() > 0 {
				tokio::task::yield_now().await;
			}
		})
		.await
		.unwrap();
		assert_eq!(peer.revision_at(r1.reference()).unwrap_err(), Error::NotFound);
		peer.shutdown_now().await.unwrap();
	}

	#[tokio::test]
	async fn internal_session_has_no_revision() {
		let broker = MemoryBroker::new();
		let peer = peer(&broker).await;
		let internal = SessionId::internal(peer.id()).at(0);
		assert_eq!(peer.revision_at(internal).unwrap_err(), Error::NotFound);
		assert!(peer.shared.revision_of(internal).is_none());
		peer.shutdown_now().await.unwrap();
	}
}
