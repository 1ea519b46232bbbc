//! Server loop: routes inbound deliveries to namespace handlers.
//!
//! A [`DispatchLoop`] owns the `namespace -> handler` registry and the set of
//! in-flight handler tasks. It stops pulling deliveries while `prefetch`
//! handlers are running. [`Dispatcher`] handles mutate the registry through a
//! command channel; the transport binding changes together with the registry.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use ravel_primitives::{Error, MessageId, Namespace, PeerId, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::context::CallContext;
use crate::pool::ChannelPool;
use crate::responder::Responder;
use crate::task::HandlerTasks;
use crate::transport::{Binding, Delivery, DeliveryClass, DeliveryStream, Envelope, Inbox, Settlement};

/// Namespace handler. Runs once per delivery on its own task.
pub type Handler = Arc<dyn Fn(Request) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure into a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
	F: Fn(Request) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = ()> + Send + 'static,
{
	Arc::new(move |request| f(request).boxed())
}

/// One inbound request or notification.
#[derive(Debug)]
pub struct Request {
	envelope: Envelope,
	class: DeliveryClass,
	responder: Responder,
}

impl Request {
	/// Message id assigned by the sender.
	#[must_use]
	pub fn id(&self) -> MessageId {
		self.envelope.id
	}

	/// Sending peer.
	#[must_use]
	pub fn origin(&self) -> PeerId {
		self.envelope.origin
	}

	/// Namespace the message was routed by.
	#[must_use]
	pub fn namespace(&self) -> &Namespace {
		&self.envelope.namespace
	}

	/// Command name or notification topic.
	#[must_use]
	pub fn command(&self) -> &str {
		&self.envelope.command
	}

	/// Payload.
	#[must_use]
	pub fn body(&self) -> &Bytes {
		&self.envelope.body
	}

	/// Full envelope.
	#[must_use]
	pub fn envelope(&self) -> &Envelope {
		&self.envelope
	}

	/// Route the message arrived by.
	#[must_use]
	pub fn class(&self) -> DeliveryClass {
		self.class
	}

	/// Response handle.
	#[must_use]
	pub fn responder(&self) -> &Responder {
		&self.responder
	}

	/// Context for downstream calls made while handling this request: the
	/// caller's deadline and causal root carry over.
	#[must_use]
	pub fn context(&self) -> CallContext {
		let mut ctx = CallContext::background();
		if let Some(deadline) = self.envelope.expires_at {
			ctx = ctx.with_deadline(deadline);
		}
		if let Some(correlation) = self.envelope.correlation {
			ctx = ctx.with_correlation(correlation);
		}
		ctx
	}
}

/// Which inbox a dispatcher serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
	/// Command requests; namespaces bind multicast and balanced routes.
	Commands,
	/// Notifications; namespaces bind the event route.
	Events,
}

impl DispatchKind {
	/// Inbox consumed by this kind.
	#[must_use]
	pub fn inbox(self) -> Inbox {
		match self {
			Self::Commands => Inbox::Commands,
			Self::Events => Inbox::Events,
		}
	}

	fn bindings(self, namespace: &Namespace) -> Vec<Binding> {
		match self {
			Self::Commands => vec![Binding::Multicast(namespace.clone()), Binding::Balanced(namespace.clone())],
			Self::Events => vec![Binding::Events(namespace.clone())],
		}
	}

	const fn as_str(self) -> &'static str {
		match self {
			Self::Commands => "commands",
			Self::Events => "events",
		}
	}
}

/// Settlement of a finished delivery.
///
/// Notifications are always acknowledged. An unhandled balanced request goes
/// back to the broker for another subscriber unless nobody waits for it any
/// more; other unhandled requests are dropped.
fn settlement_for(class: DeliveryClass, handled: bool, expired: bool) -> Settlement {
	match class {
		_ if handled => Settlement::Ack,
		DeliveryClass::Event => Settlement::Ack,
		DeliveryClass::Balanced if !expired => Settlement::Requeue,
		_ => Settlement::Abandon,
	}
}

enum DispatchCmd {
	Listen {
		namespace: Namespace,
		handler: Handler,
		bind: bool,
		ack: oneshot::Sender<Result<()>>,
	},
	Unlisten {
		namespace: Namespace,
		ack: oneshot::Sender<Result<bool>>,
	},
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
	Running,
	Draining,
	Closed,
}

/// Cloneable registry handle.
#[derive(Clone)]
pub struct Dispatcher {
	kind: DispatchKind,
	tx: mpsc::UnboundedSender<DispatchCmd>,
	closed: CancellationToken,
}

impl std::fmt::Debug for Dispatcher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Dispatcher")
			.field("kind", &self.kind)
			.field("closed", &self.closed.is_cancelled())
			.finish_non_exhaustive()
	}
}

impl Dispatcher {
	/// Creates the handle and the loop that must be driven with
	/// [`DispatchLoop::run`].
	pub fn new(
		kind: DispatchKind,
		peer: PeerId,
		pool: ChannelPool,
		deliveries: DeliveryStream,
		prefetch: usize,
		stop: CancellationToken,
		force: CancellationToken,
	) -> (Self, DispatchLoop) {
		let (tx, rx) = mpsc::unbounded_channel();
		let closed = CancellationToken::new();
		let dispatcher = Self {
			kind,
			tx,
			closed: closed.clone(),
		};
		let main_loop = DispatchLoop {
			kind,
			peer,
			pool,
			rx: Some(rx),
			deliveries,
			registry: HashMap::new(),
			tasks: HandlerTasks::new(prefetch),
			state: LoopState::Running,
			stop,
			force,
			closed,
		};
		(dispatcher, main_loop)
	}

	/// Serves `namespace` with `handler`, binding it on the transport.
	///
	/// Listening again on a served namespace only swaps the handler.
	pub async fn listen(&self, namespace: Namespace, handler: Handler) -> Result<()> {
		if namespace.is_reserved() {
			return Err(Error::InvalidNamespace {
				name: namespace.to_string(),
				reason: "reserved for internal use",
			});
		}
		self.register(namespace, handler, true).await
	}

	/// Serves `namespace` for unicast requests only, without a transport
	/// binding. Reserved namespaces are allowed.
	pub async fn register_unicast(&self, namespace: Namespace, handler: Handler) -> Result<()> {
		self.register(namespace, handler, false).await
	}

	/// Stops serving `namespace`. Returns false if it was not served.
	pub async fn unlisten(&self, namespace: Namespace) -> Result<bool> {
		let (ack, rx) = oneshot::channel();
		self.tx.send(DispatchCmd::Unlisten { namespace, ack }).map_err(|_| Error::ServiceStopped)?;
		rx.await.map_err(|_| Error::ServiceStopped)?
	}

	/// Resolves once the loop has exited.
	pub async fn closed(&self) {
		self.closed.cancelled().await;
	}

	async fn register(&self, namespace: Namespace, handler: Handler, bind: bool) -> Result<()> {
		let (ack, rx) = oneshot::channel();
		self.tx
			.send(DispatchCmd::Listen {
				namespace,
				handler,
				bind,
				ack,
			})
			.map_err(|_| Error::ServiceStopped)?;
		rx.await.map_err(|_| Error::ServiceStopped)?
	}
}

struct Registration {
	handler: Handler,
	bound: bool,
}

/// Intake loop of one inbox.
pub struct DispatchLoop {
	kind: DispatchKind,
	peer: PeerId,
	pool: ChannelPool,
	rx: Option<mpsc::UnboundedReceiver<DispatchCmd>>,
	deliveries: DeliveryStream,
	registry: HashMap<Namespace, Registration>,
	tasks: HandlerTasks,
	state: LoopState,
	stop: CancellationToken,
	force: CancellationToken,
	closed: CancellationToken,
}

impl DispatchLoop {
	/// Drives the loop until it is stopped or the delivery stream fails.
	///
	/// A graceful stop takes no further deliveries, waits for in-flight
	/// handlers and then removes the transport bindings. A forced stop aborts
	/// in-flight handlers.
	///
	/// # Errors
	///
	/// Returns [`Error::Transport`] when the delivery stream ends while running.
	pub async fn run(mut self) -> Result<()> {
		let kind = self.kind.as_str();
		tracing::debug!(peer = %self.peer, kind, prefetch = self.tasks.limit(), "dispatch.start");
		let result = loop {
			if self.state == LoopState::Draining && self.tasks.is_empty() {
				self.unbind_all().await;
				break Ok(());
			}
			let accepting = self.state == LoopState::Running && self.tasks.has_room();
			tokio::select! {
				biased;

				() = self.force.cancelled() => {
					self.tasks.abort_all();
					break Ok(());
				}

				() = self.stop.cancelled(), if self.state == LoopState::Running => self.begin_drain(),

				Some((id, joined)) = self.tasks.join_next(), if !self.tasks.is_empty() => {
					if let Err(error) = joined
						&& !error.is_cancelled()
					{
						tracing::error!(peer = %self.peer, kind, ?id, %error, "dispatch.task_failed");
					}
				}

				cmd = recv_cmd(&mut self.rx) => match cmd {
					Some(cmd) => self.on_cmd(cmd).await,
					None => {
						self.rx = None;
						self.begin_drain();
					}
				},

				delivery = self.deliveries.recv(), if accepting => match delivery {
					Some(delivery) => self.on_delivery(delivery),
					None => break Err(Error::Transport(format!("{kind} stream closed"))),
				},
			}
		};

		self.state = LoopState::Closed;
		match &result {
			Ok(()) => tracing::debug!(peer = %self.peer, kind, "dispatch.closed"),
			Err(error) => {
				tracing::error!(peer = %self.peer, kind, %error, "dispatch.failed");
				self.force.cancel();
			}
		}
		self.closed.cancel();
		result
	}

	fn begin_drain(&mut self) {
		if self.state == LoopState::Running {
			tracing::debug!(peer = %self.peer, kind = self.kind.as_str(), in_flight = self.tasks.len(), "dispatch.draining");
			self.state = LoopState::Draining;
		}
	}

	async fn on_cmd(&mut self, cmd: DispatchCmd) {
		match cmd {
			DispatchCmd::Listen {
				namespace,
				handler,
				bind,
				ack,
			} => {
				let result = self.listen(namespace, handler, bind).await;
				let _ = ack.send(result);
			}
			DispatchCmd::Unlisten { namespace, ack } => {
				let result = self.unlisten(&namespace).await;
				let _ = ack.send(result);
			}
		}
	}

	async fn listen(&mut self, namespace: Namespace, handler: Handler, bind: bool) -> Result<()> {
		if self.state != LoopState::Running {
			return Err(Error::ServiceStopped);
		}
		if let Some(registration) = self.registry.get_mut(&namespace) {
			registration.handler = handler;
			return Ok(());
		}
		if bind {
			let transport = self.pool.transport();
			let inbox = self.kind.inbox();
			let mut bound = Vec::new();
			for binding in self.kind.bindings(&namespace) {
				if let Err(error) = transport.bind(self.peer, inbox, binding.clone()).await {
					for binding in bound {
						let _ = transport.unbind(self.peer, inbox, binding).await;
					}
					return Err(error);
				}
				bound.push(binding);
			}
		}
		tracing::debug!(peer = %self.peer, kind = self.kind.as_str(), %namespace, bind, "dispatch.listen");
		self.registry.insert(namespace, Registration { handler, bound: bind });
		Ok(())
	}

	async fn unlisten(&mut self, namespace: &Namespace) -> Result<bool> {
		let Some(registration) = self.registry.remove(namespace) else {
			return Ok(false);
		};
		tracing::debug!(peer = %self.peer, kind = self.kind.as_str(), %namespace, "dispatch.unlisten");
		if registration.bound {
			let transport = self.pool.transport();
			for binding in self.kind.bindings(namespace) {
				if let Err(error) = transport.unbind(self.peer, self.kind.inbox(), binding).await {
					tracing::warn!(peer = %self.peer, %namespace, %error, "dispatch.unbind_failed");
				}
			}
		}
		Ok(true)
	}

	async fn unbind_all(&mut self) {
		let transport = Arc::clone(self.pool.transport());
		for (namespace, registration) in self.registry.drain() {
			if !registration.bound {
				continue;
			}
			for binding in self.kind.bindings(&namespace) {
				if let Err(error) = transport.unbind(self.peer, self.kind.inbox(), binding).await {
					tracing::warn!(peer = %self.peer, %namespace, %error, "dispatch.unbind_failed");
				}
			}
		}
	}

	fn on_delivery(&mut self, delivery: Delivery) {
		let Delivery { envelope, class, settler } = delivery;
		let Some(registration) = self.registry.get(&envelope.namespace) else {
			let settlement = settlement_for(class, false, envelope.is_expired());
			tracing::warn!(
				peer = %self.peer,
				id = %envelope.id,
				namespace = %envelope.namespace,
				?settlement,
				"dispatch.unhandled_namespace"
			);
			settler.settle(settlement);
			return;
		};

		let handler = Arc::clone(&registration.handler);
		let responder = Responder::new(&envelope, self.peer, self.pool.clone());
		let id = envelope.id;
		let expires_at = envelope.expires_at;
		let one_way = !envelope.reply_expected;
		let request = Request {
			envelope,
			class,
			responder: responder.clone(),
		};
		let peer = self.peer;

		self.tasks.spawn(id, async move {
			let outcome = AssertUnwindSafe(async move { handler(request).await }).catch_unwind().await;
			if outcome.is_err() {
				tracing::error!(%peer, %id, "dispatch.handler_panicked");
			}
			let handled = responder.is_closed() || (one_way && outcome.is_ok());
			let expired = expires_at.is_some_and(|at| at <= Instant::now());
			let settlement = settlement_for(class, handled, expired);
			match settlement {
				Settlement::Ack => tracing::trace!(%peer, %id, "dispatch.ack"),
				Settlement::Requeue => tracing::warn!(%peer, %id, "dispatch.requeue_unanswered"),
				Settlement::Abandon => tracing::warn!(%peer, %id, expired, "dispatch.abandon_unanswered"),
			}
			settler.settle(settlement);
		});
	}
}

async fn recv_cmd(rx: &mut Option<mpsc::UnboundedReceiver<DispatchCmd>>) -> Option<DispatchCmd> {
	match rx {
		Some(rx) => rx.recv().await,
		None => std::future::pending().await,
	}
}
