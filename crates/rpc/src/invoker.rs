//! RPC client: publishes requests and correlates replies to pending calls.
//!
//! One [`InvokerLoop`] per peer owns the pending-call table and the reply
//! stream. [`Invoker`] handles talk to it through a command channel, so the
//! table is never shared between tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ravel_primitives::{CorrelationId, Error, Failure, MessageId, Namespace, PeerId, Result, SessionId};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::context::CallContext;
use crate::pool::ChannelPool;
use crate::task::{self, TaskClass};
use crate::transport::{Delivery, DeliveryStream, Envelope, ReplyStatus, Route, Settlement};

/// Request content; routing and deadline come from the call.
#[derive(Debug, Clone)]
pub struct Outbound {
	/// Id allocated by the sending session.
	pub id: MessageId,
	/// Target namespace.
	pub namespace: Namespace,
	/// Command name.
	pub command: String,
	/// Request payload.
	pub body: Bytes,
}

/// Reply to a [`Invoker::call_async`] request.
#[derive(Debug)]
pub struct AsyncReply {
	/// Id of the request.
	pub id: MessageId,
	/// Reply payload or the failure that ended the call.
	pub result: Result<Bytes>,
}

/// Receives the async replies of one session.
pub type AsyncHandler = Arc<dyn Fn(AsyncReply) + Send + Sync>;

enum Pending {
	Waiter(oneshot::Sender<Result<Bytes>>),
	Async { session: SessionId },
}

enum InvokerCmd {
	Track {
		id: MessageId,
		pending: Pending,
		ack: oneshot::Sender<Result<()>>,
	},
	Cancel {
		id: MessageId,
	},
	Expire {
		id: MessageId,
	},
	SetAsyncHandler {
		session: SessionId,
		handler: Option<AsyncHandler>,
	},
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
	Running,
	Draining,
	Closed,
}

/// Cloneable client handle.
#[derive(Clone)]
pub struct Invoker {
	peer: PeerId,
	tx: mpsc::UnboundedSender<InvokerCmd>,
	pool: ChannelPool,
	default_timeout: Duration,
	closed: CancellationToken,
}

impl std::fmt::Debug for Invoker {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Invoker")
			.field("peer", &self.peer)
			.field("default_timeout", &self.default_timeout)
			.field("closed", &self.closed.is_cancelled())
			.finish_non_exhaustive()
	}
}

impl Invoker {
	/// Creates the handle and the loop that must be driven with
	/// [`InvokerLoop::run`].
	///
	/// `stop` drains the loop gracefully; `force` ends it immediately and is
	/// tripped by the loop itself when the reply stream fails.
	pub fn new(
		peer: PeerId,
		pool: ChannelPool,
		replies: DeliveryStream,
		default_timeout: Duration,
		stop: CancellationToken,
		force: CancellationToken,
	) -> (Self, InvokerLoop) {
		let (tx, rx) = mpsc::unbounded_channel();
		let closed = CancellationToken::new();
		let invoker = Self {
			peer,
			tx,
			pool,
			default_timeout,
			closed: closed.clone(),
		};
		let main_loop = InvokerLoop {
			peer,
			rx,
			replies,
			pending: HashMap::new(),
			async_handlers: HashMap::new(),
			state: LoopState::Running,
			stop,
			force,
			closed,
		};
		(invoker, main_loop)
	}

	/// Peer the invoker sends from.
	#[must_use]
	pub fn peer(&self) -> PeerId {
		self.peer
	}

	/// Sends a request to one peer and waits for its reply.
	pub async fn call_unicast(&self, ctx: &CallContext, peer: PeerId, request: Outbound) -> Result<Bytes> {
		self.call(ctx, Route::Unicast(peer), request).await
	}

	/// Sends a request to one subscriber of the namespace and waits for its
	/// reply.
	pub async fn call_balanced(&self, ctx: &CallContext, request: Outbound) -> Result<Bytes> {
		let route = Route::Balanced(request.namespace.clone());
		self.call(ctx, route, request).await
	}

	/// Sends a one-way request to one subscriber of the namespace.
	pub async fn execute_balanced(&self, ctx: &CallContext, request: Outbound) -> Result<()> {
		let route = Route::Balanced(request.namespace.clone());
		self.execute(ctx, route, request).await
	}

	/// Sends a one-way request to every subscriber of the namespace.
	pub async fn execute_multicast(&self, ctx: &CallContext, request: Outbound) -> Result<()> {
		let route = Route::Multicast(request.namespace.clone());
		self.execute(ctx, route, request).await
	}

	/// Sends a balanced request whose reply goes to the async handler of the
	/// sending session instead of the caller.
	///
	/// The handler receives [`Error::DeadlineExceeded`] if no reply arrives in
	/// time.
	pub async fn call_async(&self, ctx: &CallContext, request: Outbound) -> Result<MessageId> {
		if ctx.is_cancelled() {
			return Err(Error::Cancelled);
		}
		let route = Route::Balanced(request.namespace.clone());
		let session = request.id.reference.session;
		let envelope = self.envelope(ctx, request, true);
		let id = envelope.id;
		let deadline = envelope.expires_at.unwrap_or_else(Instant::now);

		self.track(id, Pending::Async { session }).await?;
		if let Err(error) = self.pool.publish(route, envelope).await {
			self.send(InvokerCmd::Cancel { id });
			return Err(error);
		}

		let tx = self.tx.clone();
		task::spawn(TaskClass::AsyncReply, async move {
			tokio::time::sleep_until(deadline).await;
			let _ = tx.send(InvokerCmd::Expire { id });
		});
		Ok(id)
	}

	/// Installs or removes the async reply handler of `session`.
	pub fn set_async_handler(&self, session: SessionId, handler: Option<AsyncHandler>) {
		self.send(InvokerCmd::SetAsyncHandler { session, handler });
	}

	/// Resolves once the loop has exited.
	pub async fn closed(&self) {
		self.closed.cancelled().await;
	}

	async fn call(&self, ctx: &CallContext, route: Route, request: Outbound) -> Result<Bytes> {
		if ctx.is_cancelled() {
			return Err(Error::Cancelled);
		}
		let envelope = self.envelope(ctx, request, true);
		let id = envelope.id;
		let deadline = envelope.expires_at.unwrap_or_else(Instant::now);
		tracing::trace!(%id, route = route.class().as_str(), "invoker.call");

		let (tx, rx) = oneshot::channel();
		self.track(id, Pending::Waiter(tx)).await?;
		// Removes the pending entry however this call ends, including when
		// the caller drops the future.
		let _untrack = Untrack { invoker: self, id };
		self.pool.publish(route, envelope).await?;

		tokio::select! {
			biased;
			reply = rx => reply.unwrap_or(Err(Error::ServiceStopped)),
			() = ctx.cancelled() => Err(Error::Cancelled),
			() = tokio::time::sleep_until(deadline) => Err(Error::DeadlineExceeded),
		}
	}

	async fn execute(&self, ctx: &CallContext, route: Route, request: Outbound) -> Result<()> {
		if ctx.is_cancelled() {
			return Err(Error::Cancelled);
		}
		if self.closed.is_cancelled() {
			return Err(Error::ServiceStopped);
		}
		let envelope = self.envelope(ctx, request, false);
		tracing::trace!(id = %envelope.id, route = route.class().as_str(), "invoker.execute");
		self.pool.publish(route, envelope).await
	}

	fn envelope(&self, ctx: &CallContext, request: Outbound, reply_expected: bool) -> Envelope {
		let expires_at = ctx.deadline().unwrap_or_else(|| Instant::now() + self.default_timeout);
		Envelope {
			id: request.id,
			correlation: Some(ctx.correlation().unwrap_or(CorrelationId(request.id))),
			expires_at: Some(expires_at),
			reply_expected,
			origin: self.peer,
			namespace: request.namespace,
			command: request.command,
			status: None,
			body: request.body,
		}
	}

	async fn track(&self, id: MessageId, pending: Pending) -> Result<()> {
		let (ack, rx) = oneshot::channel();
		self.tx.send(InvokerCmd::Track { id, pending, ack }).map_err(|_| Error::ServiceStopped)?;
		rx.await.map_err(|_| Error::ServiceStopped)?
	}

	fn send(&self, cmd: InvokerCmd) {
		if self.tx.send(cmd).is_err() {
			tracing::trace!(peer = %self.peer, "invoker.loop_gone");
		}
	}
}

struct Untrack<'a> {
	invoker: &'a Invoker,
	id: MessageId,
}

impl Drop for Untrack<'_> {
	fn drop(&mut self) {
		self.invoker.send(InvokerCmd::Cancel { id: self.id });
	}
}

/// Reply-matching loop of one peer.
pub struct InvokerLoop {
	peer: PeerId,
	rx: mpsc::UnboundedReceiver<InvokerCmd>,
	replies: DeliveryStream,
	pending: HashMap<MessageId, Pending>,
	async_handlers: HashMap<SessionId, AsyncHandler>,
	state: LoopState,
	stop: CancellationToken,
	force: CancellationToken,
	closed: CancellationToken,
}

impl InvokerLoop {
	/// Drives the loop until it is stopped or the reply stream fails.
	///
	/// # Errors
	///
	/// Returns [`Error::Transport`] when the reply stream ends while running.
	pub async fn run(mut self) -> Result<()> {
		tracing::debug!(peer = %self.peer, "invoker.start");
		let result = loop {
			if self.state == LoopState::Draining && self.pending.is_empty() {
				break Ok(());
			}
			tokio::select! {
				biased;

				() = self.force.cancelled() => break Ok(()),

				() = self.stop.cancelled(), if self.state == LoopState::Running => {
					tracing::debug!(peer = %self.peer, pending = self.pending.len(), "invoker.draining");
					self.state = LoopState::Draining;
				}

				delivery = self.replies.recv() => match delivery {
					Some(delivery) => self.on_reply(delivery),
					None => break Err(Error::Transport("reply stream closed".into())),
				},

				cmd = self.rx.recv() => match cmd {
					Some(cmd) => self.on_cmd(cmd),
					None => break Ok(()),
				},
			}
		};

		self.state = LoopState::Closed;
		for (_, pending) in self.pending.drain() {
			if let Pending::Waiter(tx) = pending {
				let _ = tx.send(Err(Error::ServiceStopped));
			}
		}
		match &result {
			Ok(()) => tracing::debug!(peer = %self.peer, "invoker.closed"),
			Err(error) => {
				tracing::error!(peer = %self.peer, %error, "invoker.failed");
				self.force.cancel();
			}
		}
		self.closed.cancel();
		result
	}

	fn on_cmd(&mut self, cmd: InvokerCmd) {
		match cmd {
			InvokerCmd::Track { id, pending, ack } => {
				let accepted = if self.state == LoopState::Running {
					self.pending.insert(id, pending);
					Ok(())
				} else {
					Err(Error::ServiceStopped)
				};
				let _ = ack.send(accepted);
			}
			InvokerCmd::Cancel { id } => {
				self.pending.remove(&id);
			}
			InvokerCmd::Expire { id } => {
				if let Some(pending) = self.pending.remove(&id) {
					self.resolve(id, pending, Err(Error::DeadlineExceeded));
				}
			}
			InvokerCmd::SetAsyncHandler { session, handler } => match handler {
				Some(handler) => {
					self.async_handlers.insert(session, handler);
				}
				None => {
					self.async_handlers.remove(&session);
				}
			},
		}
	}

	fn on_reply(&mut self, delivery: Delivery) {
		let Delivery { envelope, settler, .. } = delivery;
		settler.settle(Settlement::Ack);
		let Some(pending) = self.pending.remove(&envelope.id) else {
			tracing::trace!(peer = %self.peer, id = %envelope.id, "invoker.late_reply");
			return;
		};
		let id = envelope.id;
		self.resolve(id, pending, reply_result(envelope));
	}

	fn resolve(&self, id: MessageId, pending: Pending, result: Result<Bytes>) {
		match pending {
			Pending::Waiter(tx) => {
				let _ = tx.send(result);
			}
			Pending::Async { session } => {
				let Some(handler) = self.async_handlers.get(&session).cloned() else {
					tracing::debug!(peer = %self.peer, %id, %session, "invoker.no_async_handler");
					return;
				};
				task::spawn(TaskClass::AsyncReply, async move { handler(AsyncReply { id, result }) });
			}
		}
	}
}

fn reply_result(envelope: Envelope) -> Result<Bytes> {
	match envelope.status {
		Some(ReplyStatus::Done) => Ok(envelope.body),
		Some(ReplyStatus::Failed { kind, message }) => Err(Error::from_failure(Failure {
			kind,
			message,
			payload: envelope.body,
		})),
		Some(ReplyStatus::Unexpected { message }) => Err(Error::Unexpected(message)),
		None => Err(Error::Unexpected("reply without status".into())),
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;
	use crate::responder::Responder;
	use crate::transport::{Binding, Inbox, Transport};
	use crate::MemoryBroker;

	struct Fixture {
		broker: MemoryBroker,
		invoker: Invoker,
		stop: CancellationToken,
		force: CancellationToken,
		running: tokio::task::JoinHandle<Result<()>>,
		server: PeerId,
		server_pool: ChannelPool,
		requests: DeliveryStream,
	}

	async fn fixture() -> Fixture {
		let broker = MemoryBroker::new();
		let client = PeerId::from_raw(1);
		let server = PeerId::from_raw(2);
		broker.reserve(client).await.unwrap();
		broker.reserve(server).await.unwrap();
		let replies = broker.consume(client, Inbox::Replies).await.unwrap();
		let requests = broker.consume(server, Inbox::Commands).await.unwrap();
		broker.bind(server, Inbox::Commands, Binding::Balanced(ns())).await.unwrap();

		let transport: Arc<dyn Transport> = Arc::new(broker.clone());
		let stop = CancellationToken::new();
		let force = CancellationToken::new();
		let (invoker, main_loop) = Invoker::new(
			client,
			ChannelPool::new(Arc::clone(&transport), 2),
			replies,
			Duration::from_secs(30),
			stop.clone(),
			force.clone(),
		);
		Fixture {
			broker,
			invoker,
			stop,
			force,
			running: tokio::spawn(main_loop.run()),
			server,
			server_pool: ChannelPool::new(transport, 2),
			requests,
		}
	}

	fn ns() -> Namespace {
		Namespace::new("greeter").unwrap()
	}

	fn outbound(seq: u64) -> Outbound {
		Outbound {
			id: MessageId::new(SessionId::new(PeerId::from_raw(1), 1).at(0), seq),
			namespace: ns(),
			command: "hello".into(),
			body: Bytes::from_static(b"world"),
		}
	}

	impl Fixture {
		async fn next_responder(&mut self) -> (Envelope, Responder) {
			let delivery = self.requests.recv().await.expect("request delivered");
			let responder = Responder::new(&delivery.envelope, self.server, self.server_pool.clone());
			delivery.settler.settle(Settlement::Ack);
			(delivery.envelope, responder)
		}
	}

	#[tokio::test]
	async fn unicast_call_receives_its_reply() {
		let mut fx = fixture().await;
		let invoker = fx.invoker.clone();
		let server = fx.server;
		let call = tokio::spawn(async move { invoker.call_unicast(&CallContext::background(), server, outbound(1)).await });

		let (request, responder) = fx.next_responder().await;
		assert_eq!(request.body, Bytes::from_static(b"world"));
		assert_eq!(request.correlation, Some(CorrelationId(request.id)));
		assert!(request.expires_at.is_some());
		assert!(responder.done(Bytes::from_static(b"hi")).await);

		assert_eq!(call.await.unwrap().unwrap(), Bytes::from_static(b"hi"));
	}

	#[tokio::test]
	async fn correlation_follows_the_context() {
		let mut fx = fixture().await;
		let root = CorrelationId(MessageId::new(SessionId::new(PeerId::from_raw(9), 3).at(1), 1));
		let invoker = fx.invoker.clone();
		tokio::spawn(async move {
			let ctx = CallContext::background().with_correlation(root);
			invoker.execute_balanced(&ctx, outbound(1)).await
		});

		let (request, _) = fx.next_responder().await;
		assert_eq!(request.correlation, Some(root));
		assert!(!request.reply_expected);
	}

	#[tokio::test]
	async fn failures_are_mapped_back() {
		let mut fx = fixture().await;
		let invoker = fx.invoker.clone();
		let call = tokio::spawn(async move { invoker.call_balanced(&CallContext::background(), outbound(1)).await });

		let (_, responder) = fx.next_responder().await;
		responder.fail(Failure::new("greeter.busy", "try later")).await;
		assert_eq!(call.await.unwrap(), Err(Error::Failure(Failure::new("greeter.busy", "try later"))));

		let invoker = fx.invoker.clone();
		let call = tokio::spawn(async move { invoker.call_balanced(&CallContext::background(), outbound(2)).await });
		let (_, responder) = fx.next_responder().await;
		responder.error(Error::FrozenAttributes { keys: vec!["x".into()] }).await;
		assert_eq!(call.await.unwrap(), Err(Error::FrozenAttributes { keys: vec!["x".into()] }));
	}

	#[tokio::test(start_paused = true)]
	async fn deadline_unblocks_and_late_reply_is_dropped() {
		let mut fx = fixture().await;
		let invoker = fx.invoker.clone();
		let call = tokio::spawn(async move {
			let ctx = CallContext::background().with_timeout(Duration::from_millis(50));
			invoker.call_balanced(&ctx, outbound(1)).await
		});

		let (request, responder) = fx.next_responder().await;
		assert_eq!(call.await.unwrap(), Err(Error::DeadlineExceeded));
		assert!(!responder.is_required());

		let late = Envelope {
			origin: fx.server,
			reply_expected: false,
			status: Some(ReplyStatus::Done),
			..request
		};
		fx.server_pool.publish(Route::Response(fx.invoker.peer()), late).await.unwrap();
		fx.stop.cancel();
		assert_eq!(fx.running.await.unwrap(), Ok(()));
	}

	#[tokio::test]
	async fn cancellation_resolves_the_call() {
		let mut fx = fixture().await;
		let ctx = CallContext::background();
		let invoker = fx.invoker.clone();
		let call_ctx = ctx.clone();
		let call = tokio::spawn(async move { invoker.call_balanced(&call_ctx, outbound(1)).await });

		let _ = fx.next_responder().await;
		ctx.cancel();
		assert_eq!(call.await.unwrap(), Err(Error::Cancelled));
	}

	#[tokio::test]
	async fn draining_refuses_new_calls_and_finishes_pending_ones() {
		let mut fx = fixture().await;
		let invoker = fx.invoker.clone();
		let call = tokio::spawn(async move { invoker.call_balanced(&CallContext::background(), outbound(1)).await });
		let (_, responder) = fx.next_responder().await;

		fx.stop.cancel();
		tokio::task::yield_now().await;
		let refused = fx.invoker.call_balanced(&CallContext::background(), outbound(2)).await;
		assert_eq!(refused, Err(Error::ServiceStopped));
		assert!(!fx.running.is_finished());

		responder.done(Bytes::from_static(b"late but wanted")).await;
		assert_eq!(call.await.unwrap().unwrap(), Bytes::from_static(b"late but wanted"));
		assert_eq!(fx.running.await.unwrap(), Ok(()));
		fx.invoker.closed().await;
	}

	#[tokio::test]
	async fn lost_reply_stream_forces_shutdown() {
		let fx = fixture().await;
		fx.broker.disconnect(fx.invoker.peer());
		assert!(matches!(fx.running.await.unwrap(), Err(Error::Transport(_))));
		assert!(fx.force.is_cancelled());
	}

	#[tokio::test(start_paused = true)]
	async fn async_replies_reach_the_session_handler() {
		let mut fx = fixture().await;
		let (tx, mut rx) = mpsc::unbounded_channel();
		let session = SessionId::new(PeerId::from_raw(1), 1);
		fx.invoker.set_async_handler(
			session,
			Some(Arc::new(move |reply: AsyncReply| {
				let _ = tx.send(reply);
			})),
		);

		let ctx = CallContext::background().with_timeout(Duration::from_secs(1));
		let answered = fx.invoker.call_async(&ctx, outbound(1)).await.unwrap();
		let (_, responder) = fx.next_responder().await;
		responder.done(Bytes::from_static(b"async")).await;
		let reply = rx.recv().await.unwrap();
		assert_eq!(reply.id, answered);
		assert_eq!(reply.result, Ok(Bytes::from_static(b"async")));

		let ignored = fx.invoker.call_async(&ctx, outbound(2)).await.unwrap();
		let _ = fx.next_responder().await;
		let reply = rx.recv().await.unwrap();
		assert_eq!(reply.id, ignored);
		assert_eq!(reply.result, Err(Error::DeadlineExceeded));
	}
}
