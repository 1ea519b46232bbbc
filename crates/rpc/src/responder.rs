//! Single-use response handle for one inbound request.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use ravel_primitives::{Error, Failure, PeerId};

use crate::pool::ChannelPool;
use crate::transport::{Envelope, ReplyStatus, Route};

/// Sends at most one response for the request it was created for.
///
/// Every closing method returns `true` only for the call that performed the
/// close; later calls return `false` and publish nothing. Clones share the
/// same closed flag.
#[derive(Clone)]
pub struct Responder(Arc<Inner>);

struct Inner {
	closed: AtomicBool,
	request: Envelope,
	peer: PeerId,
	pool: ChannelPool,
}

impl std::fmt::Debug for Responder {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Responder")
			.field("id", &self.0.request.id)
			.field("closed", &self.is_closed())
			.finish_non_exhaustive()
	}
}

impl Responder {
	/// Creates a responder for `request` received by `peer`.
	#[must_use]
	pub fn new(request: &Envelope, peer: PeerId, pool: ChannelPool) -> Self {
		let mut request = request.clone();
		request.body = Bytes::new();
		Self(Arc::new(Inner {
			closed: AtomicBool::new(false),
			request,
			peer,
			pool,
		}))
	}

	/// Returns true while the caller still waits for a response.
	#[must_use]
	pub fn is_required(&self) -> bool {
		self.0.request.reply_expected && !self.0.request.is_expired()
	}

	/// Returns true once any closing method ran.
	#[must_use]
	pub fn is_closed(&self) -> bool {
		self.0.closed.load(Ordering::Acquire)
	}

	/// Completes the request with a result payload.
	pub async fn done(&self, body: Bytes) -> bool {
		self.respond(ReplyStatus::Done, body).await
	}

	/// Completes the request with an expected application failure.
	pub async fn fail(&self, failure: Failure) -> bool {
		let status = ReplyStatus::Failed {
			kind: failure.kind,
			message: failure.message,
		};
		self.respond(status, failure.payload).await
	}

	/// Completes the request with `error`.
	///
	/// Catalog errors and [`Error::Failure`] keep their identity on the wire;
	/// anything else reaches the caller as an opaque unexpected error.
	pub async fn error(&self, error: Error) -> bool {
		match error.to_reserved_failure() {
			Some(failure) => self.fail(failure).await,
			None => {
				let status = ReplyStatus::Unexpected { message: error.to_string() };
				self.respond(status, Bytes::new()).await
			}
		}
	}

	/// Closes without a result; the caller receives an empty payload.
	pub async fn close(&self) -> bool {
		self.respond(ReplyStatus::Done, Bytes::new()).await
	}

	async fn respond(&self, status: ReplyStatus, body: Bytes) -> bool {
		if self.0.closed.swap(true, Ordering::AcqRel) {
			tracing::debug!(id = %self.0.request.id, "responder.already_closed");
			return false;
		}
		if !self.is_required() {
			tracing::debug!(id = %self.0.request.id, expired = self.0.request.is_expired(), "responder.discarded");
			return true;
		}

		let request = &self.0.request;
		let envelope = Envelope {
			id: request.id,
			correlation: request.correlation,
			expires_at: request.expires_at,
			reply_expected: false,
			origin: self.0.peer,
			namespace: request.namespace.clone(),
			command: request.command.clone(),
			status: Some(status),
			body,
		};
		if let Err(error) = self.0.pool.publish(Route::Response(request.origin), envelope).await {
			tracing::warn!(id = %request.id, %error, "responder.publish_failed");
		}
		true
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use ravel_primitives::{MessageId, Namespace, SessionId};
	use tokio::time::Instant;

	use super::*;
	use crate::transport::{DeliveryClass, DeliveryStream, Inbox, Transport};
	use crate::MemoryBroker;

	struct Fixture {
		broker: MemoryBroker,
		pool: ChannelPool,
		caller: PeerId,
		server: PeerId,
		replies: DeliveryStream,
	}

	async fn fixture() -> Fixture {
		let broker = MemoryBroker::new();
		let caller = PeerId::from_raw(1);
		let server = PeerId::from_raw(2);
		broker.reserve(caller).await.unwrap();
		broker.reserve(server).await.unwrap();
		let replies = broker.consume(caller, Inbox::Replies).await.unwrap();
		let pool = ChannelPool::new(Arc::new(broker.clone()), 1);
		Fixture {
			broker,
			pool,
			caller,
			server,
			replies,
		}
	}

	fn request(origin: PeerId, reply_expected: bool, expires_at: Option<Instant>) -> Envelope {
		Envelope {
			id: MessageId::new(SessionId::new(origin, 1).at(0), 4),
			correlation: None,
			expires_at,
			reply_expected,
			origin,
			namespace: Namespace::new("greeter").unwrap(),
			command: "hello".into(),
			status: None,
			body: Bytes::from_static(b"request"),
		}
	}

	#[tokio::test]
	async fn first_close_wins() {
		let mut fx = fixture().await;
		let responder = Responder::new(&request(fx.caller, true, None), fx.server, fx.pool.clone());

		assert!(responder.is_required());
		assert!(responder.done(Bytes::from_static(b"hi")).await);
		assert!(!responder.close().await);
		assert!(!responder.clone().fail(Failure::new("x", "y")).await);

		let reply = fx.replies.try_recv().unwrap();
		assert_eq!(reply.envelope.status, Some(ReplyStatus::Done));
		assert_eq!(reply.envelope.body, Bytes::from_static(b"hi"));
		assert_eq!(reply.envelope.origin, fx.server);
		assert!(fx.replies.try_recv().is_err());
		assert_eq!(fx.broker.published(DeliveryClass::Response), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn expired_requests_are_not_answered() {
		let mut fx = fixture().await;
		let expires_at = Instant::now() + Duration::from_millis(5);
		let responder = Responder::new(&request(fx.caller, true, Some(expires_at)), fx.server, fx.pool.clone());
		tokio::time::advance(Duration::from_millis(10)).await;

		assert!(!responder.is_required());
		assert!(responder.done(Bytes::new()).await);
		assert!(responder.is_closed());
		assert!(fx.replies.try_recv().is_err());
		assert_eq!(fx.broker.published(DeliveryClass::Response), 0);
	}

	#[tokio::test]
	async fn catalog_errors_keep_their_kind() {
		let mut fx = fixture().await;
		let responder = Responder::new(&request(fx.caller, true, None), fx.server, fx.pool.clone());
		assert!(responder.error(Error::StaleUpdate).await);

		let reply = fx.replies.try_recv().unwrap();
		let Some(ReplyStatus::Failed { kind, .. }) = reply.envelope.status else {
			panic!("expected a failure reply");
		};
		assert_eq!(kind, ravel_primitives::error::kinds::STALE_UPDATE);
	}

	#[tokio::test]
	async fn one_way_requests_are_discarded() {
		let mut fx = fixture().await;
		let responder = Responder::new(&request(fx.caller, false, None), fx.server, fx.pool.clone());
		assert!(!responder.is_required());
		assert!(responder.close().await);
		assert!(fx.replies.try_recv().is_err());
	}
}
