//! Bounded pool of outbound transport channels.
//!
//! Channels are checked out for the duration of one publish (or a batch) and
//! returned when the [`PooledChannel`] guard drops. A channel whose publish
//! failed is discarded instead of returned.

use std::sync::Arc;

use parking_lot::Mutex;
use ravel_primitives::{Error, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::transport::{Channel, Envelope, Route, Transport};

/// Shared, cloneable channel pool.
#[derive(Clone)]
pub struct ChannelPool {
	inner: Arc<PoolInner>,
}

struct PoolInner {
	transport: Arc<dyn Transport>,
	capacity: usize,
	idle: Mutex<Vec<Box<dyn Channel>>>,
	permits: Arc<Semaphore>,
}

impl std::fmt::Debug for ChannelPool {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ChannelPool")
			.field("idle", &self.inner.idle.lock().len())
			.field("available", &self.inner.permits.available_permits())
			.finish_non_exhaustive()
	}
}

impl ChannelPool {
	/// Creates a pool holding at most `capacity` channels.
	///
	/// # Panics
	///
	/// Panics if `capacity` is zero.
	#[must_use]
	pub fn new(transport: Arc<dyn Transport>, capacity: usize) -> Self {
		assert!(capacity > 0, "channel pool capacity must be > 0");
		Self {
			inner: Arc::new(PoolInner {
				transport,
				capacity,
				idle: Mutex::new(Vec::with_capacity(capacity)),
				permits: Arc::new(Semaphore::new(capacity)),
			}),
		}
	}

	/// Checks out a channel, waiting while all of them are in use.
	pub async fn checkout(&self) -> Result<PooledChannel> {
		let permit = Arc::clone(&self.inner.permits).acquire_owned().await.map_err(|_| Error::ServiceStopped)?;
		let idle = self.inner.idle.lock().pop();
		let channel = match idle {
			Some(channel) => channel,
			None => self.inner.transport.open_channel().await?,
		};
		Ok(PooledChannel {
			channel: Some(channel),
			pool: Arc::clone(&self.inner),
			poisoned: false,
			_permit: permit,
		})
	}

	/// Transport the pool opens channels on.
	#[must_use]
	pub fn transport(&self) -> &Arc<dyn Transport> {
		&self.inner.transport
	}

	/// Publishes one message through a short-lived checkout.
	pub async fn publish(&self, route: Route, envelope: Envelope) -> Result<()> {
		self.checkout().await?.publish(route, envelope).await
	}

	/// Number of channels currently checked out.
	#[must_use]
	pub fn in_use(&self) -> usize {
		self.inner.capacity - self.inner.permits.available_permits()
	}

	/// Number of opened channels waiting for a checkout.
	#[must_use]
	pub fn idle(&self) -> usize {
		self.inner.idle.lock().len()
	}
}

/// Scoped checkout; returns the channel to the pool on drop.
pub struct PooledChannel {
	channel: Option<Box<dyn Channel>>,
	pool: Arc<PoolInner>,
	poisoned: bool,
	_permit: OwnedSemaphorePermit,
}

impl PooledChannel {
	/// Publishes on the checked-out channel.
	pub async fn publish(&mut self, route: Route, envelope: Envelope) -> Result<()> {
		let Some(channel) = self.channel.as_mut() else {
			return Err(Error::ServiceStopped);
		};
		let result = channel.publish(route, envelope).await;
		if result.is_err() {
			self.poisoned = true;
		}
		result
	}
}

impl Drop for PooledChannel {
	fn drop(&mut self) {
		if let Some(channel) = self.channel.take()
			&& !self.poisoned
		{
			self.pool.idle.lock().push(channel);
		}
	}
}

#[cfg(test)]
mod tests {
	use bytes::Bytes;
	use ravel_primitives::{MessageId, Namespace, PeerId, SessionId};

	use super::*;
	use crate::MemoryBroker;

	fn envelope(origin: PeerId) -> Envelope {
		Envelope {
			id: MessageId::new(SessionId::internal(origin).at(0), 1),
			correlation: None,
			expires_at: None,
			reply_expected: false,
			origin,
			namespace: Namespace::reserved("test"),
			command: "noop".into(),
			status: None,
			body: Bytes::new(),
		}
	}

	#[tokio::test]
	async fn checkin_reuses_channels() {
		let broker = MemoryBroker::new();
		let peer = PeerId::from_raw(1);
		broker.reserve(peer).await.unwrap();
		let pool = ChannelPool::new(Arc::new(broker), 2);

		{
			let mut channel = pool.checkout().await.unwrap();
			assert_eq!(pool.in_use(), 1);
			channel.publish(Route::Unicast(peer), envelope(peer)).await.unwrap();
		}
		assert_eq!(pool.in_use(), 0);
		assert_eq!(pool.idle(), 1);

		pool.publish(Route::Unicast(peer), envelope(peer)).await.unwrap();
		assert_eq!(pool.idle(), 1);
	}

	#[tokio::test]
	async fn failed_channels_are_discarded() {
		let broker = MemoryBroker::new();
		let pool = ChannelPool::new(Arc::new(broker), 1);
		let stranger = PeerId::from_raw(7);

		let err = pool.publish(Route::Unicast(stranger), envelope(stranger)).await.unwrap_err();
		assert!(matches!(err, Error::Transport(_)));
		assert_eq!(pool.idle(), 0);
		assert_eq!(pool.in_use(), 0);
	}
}
