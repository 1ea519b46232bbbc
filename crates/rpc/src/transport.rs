//! Boundary between the RPC loops and the message broker.
//!
//! A transport provides per-peer inbox queues, namespace bindings feeding
//! those queues, and channels for publishing. The topology mirrors a classic
//! exchange/queue broker but nothing here assumes a particular technology.

use async_trait::async_trait;
use bytes::Bytes;
use ravel_primitives::{CorrelationId, MessageId, Namespace, PeerId, Result};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Per-peer inbound queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Inbox {
	/// Responses to this peer's calls.
	Replies,
	/// Unicast, multicast and balanced command requests.
	Commands,
	/// Notifications.
	Events,
}

/// Subscription of a peer inbox to namespace traffic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Binding {
	/// Receive every multicast command of the namespace.
	Multicast(Namespace),
	/// Compete with other subscribers for balanced commands of the namespace.
	Balanced(Namespace),
	/// Receive every notification of the namespace.
	Events(Namespace),
}

/// Publish destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
	/// The command inbox of one peer.
	Unicast(PeerId),
	/// Every command subscriber of a namespace.
	Multicast(Namespace),
	/// Exactly one command subscriber of a namespace.
	Balanced(Namespace),
	/// Every notification subscriber of a namespace.
	Event(Namespace),
	/// The reply inbox of the originating peer.
	Response(PeerId),
}

impl Route {
	/// Delivery class of messages published on this route.
	#[must_use]
	pub fn class(&self) -> DeliveryClass {
		match self {
			Self::Unicast(_) => DeliveryClass::Unicast,
			Self::Multicast(_) => DeliveryClass::Multicast,
			Self::Balanced(_) => DeliveryClass::Balanced,
			Self::Event(_) => DeliveryClass::Event,
			Self::Response(_) => DeliveryClass::Response,
		}
	}
}

/// How a delivery reached its inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryClass {
	/// Addressed to this peer.
	Unicast,
	/// Fanned out to every namespace subscriber.
	Multicast,
	/// Handed to one of the competing namespace subscribers.
	Balanced,
	/// Notification fan-out.
	Event,
	/// Reply to one of this peer's calls.
	Response,
}

impl DeliveryClass {
	pub(crate) const fn as_str(self) -> &'static str {
		match self {
			Self::Unicast => "unicast",
			Self::Multicast => "multicast",
			Self::Balanced => "balanced",
			Self::Event => "event",
			Self::Response => "response",
		}
	}
}

/// Outcome of a response, carried on reply envelopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyStatus {
	/// Handler completed; the body is the result payload.
	Done,
	/// Expected application failure; the body is the failure payload.
	Failed {
		/// Failure type identifier.
		kind: String,
		/// Failure description.
		message: String,
	},
	/// Unexpected handler error.
	Unexpected {
		/// Error description.
		message: String,
	},
}

/// Message envelope: everything the loops read besides the opaque body.
#[derive(Debug, Clone)]
pub struct Envelope {
	/// Caller-assigned id; replies reuse the id of their request.
	pub id: MessageId,
	/// Causal root of the exchange.
	pub correlation: Option<CorrelationId>,
	/// Instant after which nobody waits for this message any more.
	pub expires_at: Option<Instant>,
	/// Whether the sender waits for a reply.
	pub reply_expected: bool,
	/// Sending peer; replies are routed back to it.
	pub origin: PeerId,
	/// Routing namespace.
	pub namespace: Namespace,
	/// Command name or notification topic.
	pub command: String,
	/// Set on replies only.
	pub status: Option<ReplyStatus>,
	/// Opaque payload.
	pub body: Bytes,
}

impl Envelope {
	/// Returns true once `expires_at` lies in the past.
	#[must_use]
	pub fn is_expired(&self) -> bool {
		self.expires_at.is_some_and(|at| at <= Instant::now())
	}
}

/// Settlement of a consumed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Settlement {
	/// Processed; remove from the queue.
	Ack,
	/// Not processed; hand it to another subscriber.
	Requeue,
	/// Not processed; drop it.
	Abandon,
}

/// Transport-side settlement hook of one delivery.
pub trait Settle: Send {
	/// Applies the settlement.
	fn settle(self: Box<Self>, settlement: Settlement);
}

/// Owned settlement handle. Abandons the delivery when dropped unsettled.
pub struct Settler(Option<Box<dyn Settle>>);

impl Settler {
	/// Wraps a transport settlement hook.
	pub fn new(hook: Box<dyn Settle>) -> Self {
		Self(Some(hook))
	}

	/// A settler for transports without acknowledgements.
	#[must_use]
	pub fn none() -> Self {
		Self(None)
	}

	/// Settles the delivery.
	pub fn settle(mut self, settlement: Settlement) {
		if let Some(hook) = self.0.take() {
			hook.settle(settlement);
		}
	}
}

impl Drop for Settler {
	fn drop(&mut self) {
		if let Some(hook) = self.0.take() {
			hook.settle(Settlement::Abandon);
		}
	}
}

impl std::fmt::Debug for Settler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_tuple("Settler").field(&self.0.is_some()).finish()
	}
}

/// One consumed message.
#[derive(Debug)]
pub struct Delivery {
	/// The message.
	pub envelope: Envelope,
	/// Route the message arrived by.
	pub class: DeliveryClass,
	/// Settlement handle.
	pub settler: Settler,
}

/// Stream of deliveries for one peer inbox.
pub type DeliveryStream = mpsc::UnboundedReceiver<Delivery>;

/// Publishing channel.
#[async_trait]
pub trait Channel: Send {
	/// Publishes `envelope` on `route`.
	async fn publish(&mut self, route: Route, envelope: Envelope) -> Result<()>;
}

/// Message broker collaborator.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
	/// Reserves `peer` exclusively. Returns false if another process holds it.
	async fn reserve(&self, peer: PeerId) -> Result<bool>;

	/// Opens a publishing channel.
	async fn open_channel(&self) -> Result<Box<dyn Channel>>;

	/// Starts consuming one inbox of a reserved peer.
	async fn consume(&self, peer: PeerId, inbox: Inbox) -> Result<DeliveryStream>;

	/// Routes namespace traffic into the peer's inbox.
	async fn bind(&self, peer: PeerId, inbox: Inbox, binding: Binding) -> Result<()>;

	/// Removes a binding created by [`Transport::bind`].
	async fn unbind(&self, peer: PeerId, inbox: Inbox, binding: Binding) -> Result<()>;

	/// Drops the peer's inboxes, bindings and reservation.
	async fn release(&self, peer: PeerId) -> Result<()>;
}
