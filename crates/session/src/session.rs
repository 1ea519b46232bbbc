//! Sessions: versioned attribute tables travelling with every message.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use ravel_primitives::{Error, MessageId, Namespace, PeerId, Result, SessionId};
use ravel_rpc::{AsyncHandler, CallContext, DeliveryClass, Notice, Outbound, Request, Responder};

use crate::local::LocalCatalog;
use crate::peer::PeerShared;
use crate::revision::Revision;

/// Peer-level command handler.
pub type CommandHandler = Arc<dyn Fn(Invocation) -> BoxFuture<'static, ()> + Send + Sync>;

/// Session-level notification listener.
pub type EventHandler = Arc<dyn Fn(Notification) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure into a [`CommandHandler`].
pub fn command_handler<F, Fut>(f: F) -> CommandHandler
where
	F: Fn(Invocation) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = ()> + Send + 'static,
{
	Arc::new(move |invocation| f(invocation).boxed())
}

/// Wraps an async closure into an [`EventHandler`].
pub fn event_handler<F, Fut>(f: F) -> EventHandler
where
	F: Fn(Notification) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = ()> + Send + 'static,
{
	Arc::new(move |notification| f(notification).boxed())
}

/// An inbound command together with the caller's session.
#[derive(Debug)]
pub struct Invocation {
	request: Request,
	revision: Option<Revision>,
}

impl Invocation {
	pub(crate) fn new(request: Request, revision: Option<Revision>) -> Self {
		Self { request, revision }
	}

	/// The calling session as of the revision it sent the request from.
	///
	/// `None` for requests from a peer's internal session or from a local
	/// session that has since closed.
	#[must_use]
	pub fn revision(&self) -> Option<&Revision> {
		self.revision.as_ref()
	}

	/// Message id assigned by the caller.
	#[must_use]
	pub fn id(&self) -> MessageId {
		self.request.id()
	}

	/// Calling peer.
	#[must_use]
	pub fn origin(&self) -> PeerId {
		self.request.origin()
	}

	/// Command name.
	#[must_use]
	pub fn command(&self) -> &str {
		self.request.command()
	}

	/// Request payload.
	#[must_use]
	pub fn body(&self) -> &Bytes {
		self.request.body()
	}

	/// Route the request arrived by.
	#[must_use]
	pub fn class(&self) -> DeliveryClass {
		self.request.class()
	}

	/// Response handle.
	#[must_use]
	pub fn responder(&self) -> &Responder {
		self.request.responder()
	}

	/// Context for downstream calls: the caller's deadline and causal root.
	#[must_use]
	pub fn context(&self) -> CallContext {
		self.request.context()
	}
}

/// An inbound notification.
#[derive(Debug, Clone)]
pub struct Notification {
	pub(crate) id: MessageId,
	pub(crate) origin: PeerId,
	pub(crate) namespace: Namespace,
	pub(crate) topic: String,
	pub(crate) payload: Bytes,
	pub(crate) revision: Option<Revision>,
	pub(crate) context: CallContext,
}

impl Notification {
	/// Message id assigned by the sender.
	#[must_use]
	pub fn id(&self) -> MessageId {
		self.id
	}

	/// Sending peer.
	#[must_use]
	pub fn origin(&self) -> PeerId {
		self.origin
	}

	/// Namespace the notification was published in.
	#[must_use]
	pub fn namespace(&self) -> &Namespace {
		&self.namespace
	}

	/// Topic within the namespace.
	#[must_use]
	pub fn topic(&self) -> &str {
		&self.topic
	}

	/// Payload.
	#[must_use]
	pub fn payload(&self) -> &Bytes {
		&self.payload
	}

	/// The sending session as of the revision it notified from.
	#[must_use]
	pub fn revision(&self) -> Option<&Revision> {
		self.revision.as_ref()
	}

	/// Context carrying the sender's causal root.
	#[must_use]
	pub fn context(&self) -> &CallContext {
		&self.context
	}
}

/// A session owned by this peer.
///
/// Every request and notification sent through a session carries a message
/// id naming the session's current revision, so receivers can read the
/// session state the sender acted on.
#[derive(Debug, Clone)]
pub struct Session {
	peer: Arc<PeerShared>,
	catalog: Arc<LocalCatalog>,
}

impl Session {
	pub(crate) fn new(peer: Arc<PeerShared>, catalog: Arc<LocalCatalog>) -> Self {
		Self { peer, catalog }
	}

	/// Session id.
	#[must_use]
	pub fn id(&self) -> SessionId {
		self.catalog.id()
	}

	/// Current revision.
	pub fn head(&self) -> Result<Revision> {
		self.catalog.head()
	}

	/// Sends a request to one listener of `namespace` and waits for the reply.
	pub async fn call(&self, ctx: &CallContext, namespace: &Namespace, command: &str, body: Bytes) -> Result<Bytes> {
		let request = self.outbound(namespace, command, body)?;
		self.peer.invoker.call_balanced(ctx, request).await
	}

	/// Sends a request to `namespace` on one specific peer and waits for the
	/// reply.
	pub async fn call_peer(&self, ctx: &CallContext, peer: PeerId, namespace: &Namespace, command: &str, body: Bytes) -> Result<Bytes> {
		let request = self.outbound(namespace, command, body)?;
		self.peer.invoker.call_unicast(ctx, peer, request).await
	}

	/// Sends a request to one listener of `namespace`; the reply goes to the
	/// handler installed with [`Session::set_async_handler`].
	pub async fn call_async(&self, ctx: &CallContext, namespace: &Namespace, command: &str, body: Bytes) -> Result<MessageId> {
		let request = self.outbound(namespace, command, body)?;
		self.peer.invoker.call_async(ctx, request).await
	}

	/// Installs or removes the receiver of this session's async replies.
	pub fn set_async_handler(&self, handler: Option<AsyncHandler>) {
		self.peer.invoker.set_async_handler(self.id(), handler);
	}

	/// Sends a one-way request to one listener of `namespace`.
	pub async fn execute(&self, ctx: &CallContext, namespace: &Namespace, command: &str, body: Bytes) -> Result<()> {
		let request = self.outbound(namespace, command, body)?;
		self.peer.invoker.execute_balanced(ctx, request).await
	}

	/// Sends a one-way request to every listener of `namespace`.
	pub async fn execute_many(&self, ctx: &CallContext, namespace: &Namespace, command: &str, body: Bytes) -> Result<()> {
		let request = self.outbound(namespace, command, body)?;
		self.peer.invoker.execute_multicast(ctx, request).await
	}

	/// Publishes a notification.
	pub async fn notify(&self, ctx: &CallContext, namespace: &Namespace, topic: &str, payload: Bytes) -> Result<()> {
		let notice = Notice {
			id: self.catalog.next_message_id()?,
			topic: topic.to_string(),
			body: payload,
		};
		self.peer.notifier.notify(ctx, namespace, notice).await
	}

	/// Publishes several notifications in order.
	pub async fn notify_many(&self, ctx: &CallContext, namespace: &Namespace, notices: Vec<(String, Bytes)>) -> Result<()> {
		let notices = notices
			.into_iter()
			.map(|(topic, body)| {
				Ok(Notice {
					id: self.catalog.next_message_id()?,
					topic,
					body,
				})
			})
			.collect::<Result<Vec<_>>>()?;
		self.peer.notifier.notify_many(ctx, namespace, notices).await
	}

	/// Receives notifications published in `namespace`. Listening again
	/// replaces this session's listener.
	pub async fn listen(&self, namespace: Namespace, handler: EventHandler) -> Result<()> {
		if self.catalog.is_closed() {
			return Err(Error::NotFound);
		}
		self.peer.add_listener(self.id(), namespace, handler).await
	}

	/// Stops receiving notifications of `namespace`.
	pub async fn unlisten(&self, namespace: &Namespace) -> Result<bool> {
		self.peer.remove_listener(self.id(), namespace).await
	}

	/// Closes the session at its current revision.
	pub async fn close(&self, ctx: &CallContext) -> Result<()> {
		self.head()?.close(ctx).await
	}

	/// Resolves once the session is closed, locally or by a remote peer.
	pub async fn done(&self) {
		self.catalog.closed().await;
	}

	/// Returns true once closed.
	#[must_use]
	pub fn is_closed(&self) -> bool {
		self.catalog.is_closed()
	}

	fn outbound(&self, namespace: &Namespace, command: &str, body: Bytes) -> Result<Outbound> {
		Ok(Outbound {
			id: self.catalog.next_message_id()?,
			namespace: namespace.clone(),
			command: command.to_string(),
			body,
		})
	}
}
