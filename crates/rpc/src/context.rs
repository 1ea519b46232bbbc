//! Deadline, cancellation and correlation carried by every blocking call.

use std::time::Duration;

use ravel_primitives::CorrelationId;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Call context: an optional deadline, a cancellation token and the causal
/// root of the exchange this call belongs to.
///
/// Contexts are cheap to clone. Derived contexts ([`CallContext::with_timeout`]
/// and friends) share cancellation with their parent through a child token.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
	deadline: Option<Instant>,
	correlation: Option<CorrelationId>,
	cancel: CancellationToken,
}

impl CallContext {
	/// A context without deadline or correlation.
	#[must_use]
	pub fn background() -> Self {
		Self::default()
	}

	/// Derives a context whose deadline is at most `timeout` from now.
	#[must_use]
	pub fn with_timeout(&self, timeout: Duration) -> Self {
		self.with_deadline(Instant::now() + timeout)
	}

	/// Derives a context whose deadline is at most `deadline`.
	#[must_use]
	pub fn with_deadline(&self, deadline: Instant) -> Self {
		let deadline = match self.deadline {
			Some(current) if current < deadline => current,
			_ => deadline,
		};
		Self {
			deadline: Some(deadline),
			correlation: self.correlation,
			cancel: self.cancel.child_token(),
		}
	}

	/// Derives a context belonging to the exchange rooted at `correlation`.
	#[must_use]
	pub fn with_correlation(&self, correlation: CorrelationId) -> Self {
		Self {
			deadline: self.deadline,
			correlation: Some(correlation),
			cancel: self.cancel.child_token(),
		}
	}

	/// Returns the deadline, if any.
	#[must_use]
	pub fn deadline(&self) -> Option<Instant> {
		self.deadline
	}

	/// Returns the causal root, if any.
	#[must_use]
	pub fn correlation(&self) -> Option<CorrelationId> {
		self.correlation
	}

	/// Time left until the deadline; `None` without deadline.
	#[must_use]
	pub fn remaining(&self) -> Option<Duration> {
		self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
	}

	/// Cancels this context and every context derived from it.
	pub fn cancel(&self) {
		self.cancel.cancel();
	}

	/// Returns true once cancelled.
	#[must_use]
	pub fn is_cancelled(&self) -> bool {
		self.cancel.is_cancelled()
	}

	/// Resolves when the context is cancelled.
	pub async fn cancelled(&self) {
		self.cancel.cancelled().await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test(start_paused = true)]
	async fn derived_deadlines_never_extend_the_parent() {
		let parent = CallContext::background().with_timeout(Duration::from_secs(1));
		let child = parent.with_timeout(Duration::from_secs(10));
		assert_eq!(child.deadline(), parent.deadline());

		let tighter = parent.with_timeout(Duration::from_millis(10));
		assert!(tighter.deadline() < parent.deadline());
	}

	#[tokio::test]
	async fn cancellation_flows_to_children() {
		let parent = CallContext::background();
		let child = parent.with_timeout(Duration::from_secs(1));
		parent.cancel();
		assert!(child.is_cancelled());
		child.cancelled().await;
	}
}
