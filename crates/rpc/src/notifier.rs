//! Fire-and-forget notification publishing.

use bytes::Bytes;
use ravel_primitives::{CorrelationId, MessageId, Namespace, PeerId, Result};

use crate::context::CallContext;
use crate::pool::ChannelPool;
use crate::transport::{Envelope, Route};

/// One notification of a batch.
#[derive(Debug, Clone)]
pub struct Notice {
	/// Id allocated by the sending session.
	pub id: MessageId,
	/// Topic within the namespace.
	pub topic: String,
	/// Notification payload.
	pub body: Bytes,
}

/// Publishes notifications on the event route of a namespace.
#[derive(Debug, Clone)]
pub struct Notifier {
	peer: PeerId,
	pool: ChannelPool,
}

impl Notifier {
	/// Creates a notifier publishing as `peer`.
	#[must_use]
	pub fn new(peer: PeerId, pool: ChannelPool) -> Self {
		Self { peer, pool }
	}

	/// Publishes one notification.
	pub async fn notify(&self, ctx: &CallContext, namespace: &Namespace, notice: Notice) -> Result<()> {
		let envelope = self.envelope(ctx, namespace, notice);
		self.pool.publish(Route::Event(namespace.clone()), envelope).await
	}

	/// Publishes a batch of notifications through a single channel checkout.
	pub async fn notify_many(&self, ctx: &CallContext, namespace: &Namespace, notices: Vec<Notice>) -> Result<()> {
		if notices.is_empty() {
			return Ok(());
		}
		let mut channel = self.pool.checkout().await?;
		for notice in notices {
			let envelope = self.envelope(ctx, namespace, notice);
			channel.publish(Route::Event(namespace.clone()), envelope).await?;
		}
		Ok(())
	}

	fn envelope(&self, ctx: &CallContext, namespace: &Namespace, notice: Notice) -> Envelope {
		Envelope {
			id: notice.id,
			correlation: Some(ctx.correlation().unwrap_or(CorrelationId(notice.id))),
			expires_at: ctx.deadline(),
			reply_expected: false,
			origin: self.peer,
			namespace: namespace.clone(),
			command: notice.topic,
			status: None,
			body: notice.body,
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use ravel_primitives::SessionId;

	use super::*;
	use crate::transport::{Binding, DeliveryClass, Inbox, Transport};
	use crate::MemoryBroker;

	#[tokio::test]
	async fn batches_reach_every_listener_in_order() {
		let broker = MemoryBroker::new();
		let ns = Namespace::new("chat").unwrap();
		let sender = PeerId::from_raw(1);
		let listener = PeerId::from_raw(2);
		broker.reserve(sender).await.unwrap();
		broker.reserve(listener).await.unwrap();
		let mut events = broker.consume(listener, Inbox::Events).await.unwrap();
		broker.bind(listener, Inbox::Events, Binding::Events(ns.clone())).await.unwrap();

		let notifier = Notifier::new(sender, ChannelPool::new(Arc::new(broker.clone()), 1));
		let session = SessionId::new(sender, 1);
		let notices = (1..=3)
			.map(|seq| Notice {
				id: MessageId::new(session.at(0), seq),
				topic: format!("line-{seq}"),
				body: Bytes::new(),
			})
			.collect();
		notifier.notify_many(&CallContext::background(), &ns, notices).await.unwrap();

		for seq in 1..=3 {
			let delivery = events.try_recv().unwrap();
			assert_eq!(delivery.class, DeliveryClass::Event);
			assert_eq!(delivery.envelope.command, format!("line-{seq}"));
			assert!(!delivery.envelope.reply_expected);
		}
		assert_eq!(broker.published(DeliveryClass::Event), 3);
	}
}
