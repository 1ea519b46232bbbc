//! In-process broker implementing [`Transport`].
//!
//! Every peer owns one queue per [`Inbox`]. Namespace bindings decide which
//! queues receive multicast, balanced and event traffic; balanced routes pick
//! one subscriber round-robin and hand requeued deliveries to the next one.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use ravel_primitives::{Error, Namespace, PeerId, Result};
use tokio::sync::mpsc;

use crate::transport::{Binding, Channel, Delivery, DeliveryClass, DeliveryStream, Envelope, Inbox, Route, Settle, Settlement, Settler, Transport};

/// Cloneable handle to one in-process broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
	inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
	state: Mutex<BrokerState>,
	stats: Mutex<BrokerStats>,
}

#[derive(Default)]
struct BrokerState {
	reserved: HashSet<PeerId>,
	inboxes: HashMap<(PeerId, Inbox), mpsc::UnboundedSender<Delivery>>,
	multicast: HashMap<Namespace, BTreeSet<PeerId>>,
	balanced: HashMap<Namespace, BalancedGroup>,
	events: HashMap<Namespace, BTreeSet<PeerId>>,
}

#[derive(Default)]
struct BrokerStats {
	published: HashMap<DeliveryClass, u64>,
	settled: HashMap<Settlement, u64>,
}

/// Competing subscribers of one namespace with a round-robin cursor.
#[derive(Default)]
struct BalancedGroup {
	members: Vec<PeerId>,
	cursor: usize,
}

impl BalancedGroup {
	/// Picks the next member other than `avoid`.
	fn next(&mut self, avoid: Option<PeerId>) -> Option<PeerId> {
		let len = self.members.len();
		if len == 0 {
			return None;
		}
		for _ in 0..len {
			let peer = self.members[self.cursor % len];
			self.cursor = (self.cursor + 1) % len;
			if Some(peer) != avoid {
				return Some(peer);
			}
		}
		None
	}
}

impl BrokerState {
	/// Queues a delivery. A delivery whose inbox is gone is handed back so the
	/// caller can drop it after releasing the state lock.
	fn deliver(&mut self, peer: PeerId, inbox: Inbox, delivery: Delivery) -> Option<Delivery> {
		let Some(tx) = self.inboxes.get(&(peer, inbox)) else {
			tracing::trace!(%peer, ?inbox, id = %delivery.envelope.id, "memory_broker.unroutable");
			return Some(delivery);
		};
		match tx.send(delivery) {
			Ok(()) => None,
			Err(mpsc::error::SendError(delivery)) => {
				self.inboxes.remove(&(peer, inbox));
				Some(delivery)
			}
		}
	}

	fn drop_peer(&mut self, peer: PeerId) -> Vec<mpsc::UnboundedSender<Delivery>> {
		self.reserved.remove(&peer);
		for members in self.multicast.values_mut().chain(self.events.values_mut()) {
			members.remove(&peer);
		}
		for group in self.balanced.values_mut() {
			group.members.retain(|p| *p != peer);
		}
		let keys: Vec<_> = self.inboxes.keys().filter(|(p, _)| *p == peer).copied().collect();
		keys.into_iter().filter_map(|key| self.inboxes.remove(&key)).collect()
	}
}

/// Counts settlements of non-balanced deliveries.
struct CountingSettle {
	broker: MemoryBroker,
}

impl Settle for CountingSettle {
	fn settle(self: Box<Self>, settlement: Settlement) {
		self.broker.count_settlement(settlement);
	}
}

/// Settlement of a balanced delivery; requeues go to the next subscriber.
struct BalancedSettle {
	broker: MemoryBroker,
	namespace: Namespace,
	envelope: Envelope,
	delivered_to: PeerId,
}

impl Settle for BalancedSettle {
	fn settle(self: Box<Self>, settlement: Settlement) {
		self.broker.count_settlement(settlement);
		if settlement == Settlement::Requeue {
			self.broker.route_balanced(self.namespace, self.envelope, Some(self.delivered_to));
		}
	}
}

impl MemoryBroker {
	/// Creates an empty broker.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Simulates connection loss: drops the peer's queues, bindings and
	/// reservation. Its consumers observe the end of their streams.
	pub fn disconnect(&self, peer: PeerId) {
		let senders = self.inner.state.lock().drop_peer(peer);
		tracing::debug!(%peer, queues = senders.len(), "memory_broker.disconnect");
		drop(senders);
	}

	/// Returns true if `peer` is currently reserved.
	#[must_use]
	pub fn is_reserved(&self, peer: PeerId) -> bool {
		self.inner.state.lock().reserved.contains(&peer)
	}

	/// Number of peers subscribed through `binding`.
	#[must_use]
	pub fn subscribers(&self, binding: &Binding) -> usize {
		let state = self.inner.state.lock();
		match binding {
			Binding::Multicast(ns) => state.multicast.get(ns).map_or(0, BTreeSet::len),
			Binding::Balanced(ns) => state.balanced.get(ns).map_or(0, |g| g.members.len()),
			Binding::Events(ns) => state.events.get(ns).map_or(0, BTreeSet::len),
		}
	}

	/// Number of messages published with the given delivery class.
	#[must_use]
	pub fn published(&self, class: DeliveryClass) -> u64 {
		self.inner.stats.lock().published.get(&class).copied().unwrap_or(0)
	}

	/// Number of deliveries settled with `settlement`.
	#[must_use]
	pub fn settled(&self, settlement: Settlement) -> u64 {
		self.inner.stats.lock().settled.get(&settlement).copied().unwrap_or(0)
	}

	fn count_settlement(&self, settlement: Settlement) {
		*self.inner.stats.lock().settled.entry(settlement).or_default() += 1;
	}

	fn counting(&self) -> Settler {
		Settler::new(Box::new(CountingSettle { broker: self.clone() }))
	}

	fn route(&self, route: Route, envelope: Envelope) -> Result<()> {
		let class = route.class();
		let mut orphans = Vec::new();
		{
			let mut state = self.inner.state.lock();
			if !state.reserved.contains(&envelope.origin) {
				return Err(Error::Transport(format!("peer {} is not connected", envelope.origin)));
			}
			match route {
				Route::Unicast(peer) => {
					let delivery = self.delivery(envelope, class);
					orphans.extend(state.deliver(peer, Inbox::Commands, delivery));
				}
				Route::Response(peer) => {
					let delivery = self.delivery(envelope, class);
					orphans.extend(state.deliver(peer, Inbox::Replies, delivery));
				}
				Route::Multicast(ns) => {
					let members: Vec<_> = state.multicast.get(&ns).into_iter().flatten().copied().collect();
					for peer in members {
						let delivery = self.delivery(envelope.clone(), class);
						orphans.extend(state.deliver(peer, Inbox::Commands, delivery));
					}
				}
				Route::Event(ns) => {
					let members: Vec<_> = state.events.get(&ns).into_iter().flatten().copied().collect();
					for peer in members {
						let delivery = self.delivery(envelope.clone(), class);
						orphans.extend(state.deliver(peer, Inbox::Events, delivery));
					}
				}
				Route::Balanced(ns) => {
					drop(state);
					self.count_published(class);
					self.route_balanced(ns, envelope, None);
					return Ok(());
				}
			}
		}
		self.count_published(class);
		drop(orphans);
		Ok(())
	}

	fn route_balanced(&self, namespace: Namespace, envelope: Envelope, avoid: Option<PeerId>) {
		let orphan = {
			let mut state = self.inner.state.lock();
			let Some(peer) = state.balanced.get_mut(&namespace).and_then(|group| group.next(avoid)) else {
				tracing::trace!(namespace = %namespace, id = %envelope.id, "memory_broker.no_balanced_subscriber");
				return;
			};
			let settler = Settler::new(Box::new(BalancedSettle {
				broker: self.clone(),
				namespace,
				envelope: envelope.clone(),
				delivered_to: peer,
			}));
			let delivery = Delivery {
				envelope,
				class: DeliveryClass::Balanced,
				settler,
			};
			state.deliver(peer, Inbox::Commands, delivery)
		};
		drop(orphan);
	}

	fn delivery(&self, envelope: Envelope, class: DeliveryClass) -> Delivery {
		Delivery {
			envelope,
			class,
			settler: self.counting(),
		}
	}

	fn count_published(&self, class: DeliveryClass) {
		*self.inner.stats.lock().published.entry(class).or_default() += 1;
	}

	fn require_reserved(state: &BrokerState, peer: PeerId) -> Result<()> {
		if state.reserved.contains(&peer) {
			Ok(())
		} else {
			Err(Error::Transport(format!("peer {peer} is not reserved")))
		}
	}
}

struct MemoryChannel {
	broker: MemoryBroker,
}

#[async_trait]
impl Channel for MemoryChannel {
	async fn publish(&mut self, route: Route, envelope: Envelope) -> Result<()> {
		self.broker.route(route, envelope)
	}
}

#[async_trait]
impl Transport for MemoryBroker {
	async fn reserve(&self, peer: PeerId) -> Result<bool> {
		Ok(self.inner.state.lock().reserved.insert(peer))
	}

	async fn open_channel(&self) -> Result<Box<dyn Channel>> {
		Ok(Box::new(MemoryChannel { broker: self.clone() }))
	}

	async fn consume(&self, peer: PeerId, inbox: Inbox) -> Result<DeliveryStream> {
		let (tx, rx) = mpsc::unbounded_channel();
		let previous = {
			let mut state = self.inner.state.lock();
			Self::require_reserved(&state, peer)?;
			state.inboxes.insert((peer, inbox), tx)
		};
		drop(previous);
		Ok(rx)
	}

	async fn bind(&self, peer: PeerId, _inbox: Inbox, binding: Binding) -> Result<()> {
		let mut state = self.inner.state.lock();
		Self::require_reserved(&state, peer)?;
		match binding {
			Binding::Multicast(ns) => {
				state.multicast.entry(ns).or_default().insert(peer);
			}
			Binding::Events(ns) => {
				state.events.entry(ns).or_default().insert(peer);
			}
			Binding::Balanced(ns) => {
				let group = state.balanced.entry(ns).or_default();
				if !group.members.contains(&peer) {
					group.members.push(peer);
				}
			}
		}
		Ok(())
	}

	async fn unbind(&self, peer: PeerId, _inbox: Inbox, binding: Binding) -> Result<()> {
		let mut state = self.inner.state.lock();
		match binding {
			Binding::Multicast(ns) => {
				if let Some(members) = state.multicast.get_mut(&ns) {
					members.remove(&peer);
				}
			}
			Binding::Events(ns) => {
				if let Some(members) = state.events.get_mut(&ns) {
					members.remove(&peer);
				}
			}
			Binding::Balanced(ns) => {
				if let Some(group) = state.balanced.get_mut(&ns) {
					group.members.retain(|p| *p != peer);
				}
			}
		}
		Ok(())
	}

	async fn release(&self, peer: PeerId) -> Result<()> {
		self.disconnect(peer);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use bytes::Bytes;
	use ravel_primitives::SessionId;

	use super::*;

	fn envelope(origin: PeerId, ns: &Namespace) -> Envelope {
		Envelope {
			id: ravel_primitives::MessageId::new(SessionId::new(origin, 1).at(0), 1),
			correlation: None,
			expires_at: None,
			reply_expected: false,
			origin,
			namespace: ns.clone(),
			command: "ping".into(),
			status: None,
			body: Bytes::new(),
		}
	}

	async fn peer(broker: &MemoryBroker, raw: u64) -> (PeerId, DeliveryStream) {
		let peer = PeerId::from_raw(raw);
		assert!(broker.reserve(peer).await.unwrap());
		let rx = broker.consume(peer, Inbox::Commands).await.unwrap();
		(peer, rx)
	}

	#[tokio::test]
	async fn reservation_is_exclusive() {
		let broker = MemoryBroker::new();
		let peer = PeerId::from_raw(9);
		assert!(broker.reserve(peer).await.unwrap());
		assert!(!broker.reserve(peer).await.unwrap());
		broker.release(peer).await.unwrap();
		assert!(broker.reserve(peer).await.unwrap());
	}

	#[tokio::test]
	async fn balanced_requeue_moves_to_next_subscriber() {
		let broker = MemoryBroker::new();
		let ns = Namespace::new("work").unwrap();
		let (a, mut rx_a) = peer(&broker, 1).await;
		let (b, mut rx_b) = peer(&broker, 2).await;
		broker.bind(a, Inbox::Commands, Binding::Balanced(ns.clone())).await.unwrap();
		broker.bind(b, Inbox::Commands, Binding::Balanced(ns.clone())).await.unwrap();

		let mut channel = broker.open_channel().await.unwrap();
		channel.publish(Route::Balanced(ns.clone()), envelope(a, &ns)).await.unwrap();

		let first = rx_a.try_recv().expect("first subscriber gets the delivery");
		assert!(rx_b.try_recv().is_err());
		first.settler.settle(Settlement::Requeue);

		let second = rx_b.try_recv().expect("requeue reaches the other subscriber");
		assert_eq!(second.class, DeliveryClass::Balanced);
		second.settler.settle(Settlement::Ack);
		assert_eq!(broker.settled(Settlement::Requeue), 1);
		assert_eq!(broker.settled(Settlement::Ack), 1);
	}

	#[tokio::test]
	async fn requeue_without_other_subscribers_is_dropped() {
		let broker = MemoryBroker::new();
		let ns = Namespace::new("solo").unwrap();
		let (a, mut rx_a) = peer(&broker, 1).await;
		broker.bind(a, Inbox::Commands, Binding::Balanced(ns.clone())).await.unwrap();

		let mut channel = broker.open_channel().await.unwrap();
		channel.publish(Route::Balanced(ns.clone()), envelope(a, &ns)).await.unwrap();
		rx_a.try_recv().unwrap().settler.settle(Settlement::Requeue);
		assert!(rx_a.try_recv().is_err());
	}

	#[tokio::test]
	async fn multicast_reaches_every_subscriber() {
		let broker = MemoryBroker::new();
		let ns = Namespace::new("fanout").unwrap();
		let (a, mut rx_a) = peer(&broker, 1).await;
		let (b, mut rx_b) = peer(&broker, 2).await;
		broker.bind(a, Inbox::Commands, Binding::Multicast(ns.clone())).await.unwrap();
		broker.bind(b, Inbox::Commands, Binding::Multicast(ns.clone())).await.unwrap();

		let mut channel = broker.open_channel().await.unwrap();
		channel.publish(Route::Multicast(ns.clone()), envelope(a, &ns)).await.unwrap();

		assert!(rx_a.try_recv().is_ok());
		assert!(rx_b.try_recv().is_ok());
		assert_eq!(broker.published(DeliveryClass::Multicast), 1);
	}

	#[tokio::test]
	async fn disconnect_ends_streams_and_rejects_publishes() {
		let broker = MemoryBroker::new();
		let ns = Namespace::new("x").unwrap();
		let (a, mut rx_a) = peer(&broker, 1).await;
		broker.disconnect(a);
		assert!(rx_a.recv().await.is_none());

		let mut channel = broker.open_channel().await.unwrap();
		let err = channel.publish(Route::Unicast(a), envelope(a, &ns)).await.unwrap_err();
		assert!(matches!(err, Error::Transport(_)));
	}
}
