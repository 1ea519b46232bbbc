//! Task spawning for the peer loops and the in-flight handler set.
//!
//! Every long-lived loop of a peer is spawned through [`spawn`] so traces
//! carry its class. Handler invocations of a dispatch loop live in
//! [`HandlerTasks`], which caps how many run at once.

use std::collections::HashMap;
use std::future::Future;

use ravel_primitives::MessageId;
use tokio::task::{Id, JoinError, JoinHandle, JoinSet};

/// Execution classes, used for tracing only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskClass {
	/// Reply-matching loop.
	Invoker,
	/// Request or notification intake loop.
	Dispatch,
	/// A handler invocation.
	Handler,
	/// Periodic remote cache sweep.
	Sweep,
	/// Asynchronous reply delivery.
	AsyncReply,
	/// Anything else that outlives its caller.
	Background,
}

impl TaskClass {
	pub(crate) const fn as_str(self) -> &'static str {
		match self {
			Self::Invoker => "invoker",
			Self::Dispatch => "dispatch",
			Self::Handler => "handler",
			Self::Sweep => "sweep",
			Self::AsyncReply => "async_reply",
			Self::Background => "background",
		}
	}
}

/// Spawns a task on the current runtime.
pub fn spawn<F>(class: TaskClass, fut: F) -> JoinHandle<F::Output>
where
	F: Future + Send + 'static,
	F::Output: Send + 'static,
{
	tracing::trace!(task_class = class.as_str(), "rpc.spawn");
	tokio::spawn(fut)
}

/// Handler invocations in flight on one dispatch loop.
///
/// The loop stops reading deliveries while [`HandlerTasks::has_room`] is
/// false. Each task remembers the message it serves so a failed join can be
/// reported against it.
#[derive(Debug)]
pub struct HandlerTasks {
	limit: usize,
	running: JoinSet<()>,
	messages: HashMap<Id, MessageId>,
}

impl HandlerTasks {
	/// Creates an empty set admitting `limit` concurrent handlers (at least one).
	pub fn new(limit: usize) -> Self {
		Self {
			limit: limit.max(1),
			running: JoinSet::new(),
			messages: HashMap::new(),
		}
	}

	/// Concurrency cap.
	pub fn limit(&self) -> usize {
		self.limit
	}

	/// Handlers still running or not yet joined.
	pub fn len(&self) -> usize {
		self.running.len()
	}

	/// Returns `true` if no handler is in flight.
	pub fn is_empty(&self) -> bool {
		self.running.is_empty()
	}

	/// Returns `true` while another handler may start.
	pub fn has_room(&self) -> bool {
		self.running.len() < self.limit
	}

	/// Starts the handler serving `message`.
	pub fn spawn<F>(&mut self, message: MessageId, fut: F)
	where
		F: Future<Output = ()> + Send + 'static,
	{
		let handle = self.running.spawn(fut);
		self.messages.insert(handle.id(), message);
		tracing::trace!(
			task_class = TaskClass::Handler.as_str(),
			%message,
			in_flight = self.running.len(),
			"rpc.handler_spawn"
		);
	}

	/// Waits for the next handler to finish and returns the message it served
	/// with its join result. Returns `None` when the set is empty.
	pub async fn join_next(&mut self) -> Option<(Option<MessageId>, Result<(), JoinError>)> {
		let (task, result) = match self.running.join_next_with_id().await? {
			Ok((task, ())) => (task, Ok(())),
			Err(error) => (error.id(), Err(error)),
		};
		Some((self.messages.remove(&task), result))
	}

	/// Aborts every handler in flight.
	pub fn abort_all(&mut self) {
		self.running.abort_all();
		self.messages.clear();
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use ravel_primitives::{PeerId, SessionId};
	use tokio::sync::oneshot;

	use super::*;

	fn message(seq: u64) -> MessageId {
		MessageId::new(SessionId::new(PeerId::from_raw(1), 1).at(0), seq)
	}

	#[tokio::test]
	async fn room_frees_up_as_handlers_finish() {
		let mut tasks = HandlerTasks::new(2);
		let (release, wait) = oneshot::channel::<()>();
		tasks.spawn(message(1), async {});
		tasks.spawn(message(2), async move {
			let _ = wait.await;
		});
		assert!(!tasks.has_room());

		let (finished, result) = tasks.join_next().await.unwrap();
		assert_eq!(finished, Some(message(1)));
		assert!(result.is_ok());
		assert!(tasks.has_room());

		release.send(()).unwrap();
		let (finished, _) = tasks.join_next().await.unwrap();
		assert_eq!(finished, Some(message(2)));
		assert!(tasks.is_empty());
		assert!(tasks.join_next().await.is_none());
	}

	#[tokio::test]
	async fn panics_are_reported_against_their_message() {
		let mut tasks = HandlerTasks::new(0);
		assert_eq!(tasks.limit(), 1);
		tasks.spawn(message(7), async { panic!("handler blew up") });

		let (finished, result) = tasks.join_next().await.unwrap();
		assert_eq!(finished, Some(message(7)));
		assert!(result.unwrap_err().is_panic());
	}
}
