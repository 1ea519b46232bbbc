//! Identifiers for peers, sessions, revisions and messages.
//!
//! Every identifier renders to a compact string and parses back from it, so a
//! transport can carry message ids in whatever header field it has available:
//!
//! ```text
//! <peer:016x>.<session-seq>@<rev>#<message-seq>
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Network-unique identity of one peer process.
///
/// The upper half holds a coarse wall-clock component (minutes since the unix
/// epoch), the lower half a random component. Uniqueness is only guaranteed
/// once the id has been reserved with the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(u64);

impl PeerId {
	/// Generates a fresh, not yet reserved, peer id.
	#[must_use]
	pub fn generate() -> Self {
		let minutes = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() / 60).unwrap_or_default();
		let random = uuid::Uuid::new_v4().as_u128() as u32;
		Self(((minutes & 0xffff_ffff) << 32) | u64::from(random))
	}

	/// Wraps a raw id value.
	#[must_use]
	pub const fn from_raw(raw: u64) -> Self {
		Self(raw)
	}

	/// Returns the raw id value.
	#[must_use]
	pub const fn get(self) -> u64 {
		self.0
	}
}

impl fmt::Display for PeerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:016x}", self.0)
	}
}

/// Identity of one session, allocated by its owning peer.
///
/// Sequence numbers start at 1; sequence 0 is the peer's internal session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId {
	/// Peer owning the session's catalog.
	pub peer: PeerId,
	/// Per-peer allocation sequence.
	pub seq: u64,
}

impl SessionId {
	/// Sequence reserved for a peer's internal session.
	pub const INTERNAL_SEQ: u64 = 0;

	/// Creates a session id.
	#[must_use]
	pub const fn new(peer: PeerId, seq: u64) -> Self {
		Self { peer, seq }
	}

	/// Returns the internal session of `peer`.
	#[must_use]
	pub const fn internal(peer: PeerId) -> Self {
		Self::new(peer, Self::INTERNAL_SEQ)
	}

	/// Returns true for a peer's internal session.
	#[must_use]
	pub const fn is_internal(self) -> bool {
		self.seq == Self::INTERNAL_SEQ
	}

	/// Reference to revision `rev` of this session.
	#[must_use]
	pub const fn at(self, rev: u64) -> SessionRef {
		SessionRef { session: self, rev }
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{}", self.peer, self.seq)
	}
}

/// An exact point in a session's attribute-table timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionRef {
	/// Referenced session.
	pub session: SessionId,
	/// Revision number; 0 is the freshly created, empty table.
	pub rev: u64,
}

impl fmt::Display for SessionRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}@{}", self.session, self.rev)
	}
}

/// Identity of one outbound request or notification.
///
/// `seq` restarts on every committed update of the sending session, tying the
/// message to the snapshot of session state that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId {
	/// Sending session and its revision at send time.
	pub reference: SessionRef,
	/// Per-revision message sequence.
	pub seq: u64,
}

impl MessageId {
	/// Creates a message id.
	#[must_use]
	pub const fn new(reference: SessionRef, seq: u64) -> Self {
		Self { reference, seq }
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}#{}", self.reference, self.seq)
	}
}

/// Causal root shared by every message triggered by one originating request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub MessageId);

impl From<MessageId> for CorrelationId {
	fn from(id: MessageId) -> Self {
		Self(id)
	}
}

impl fmt::Display for CorrelationId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

/// Failure to parse an identifier from its string form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed identifier {input:?}: {reason}")]
pub struct ParseIdError {
	input: String,
	reason: &'static str,
}

impl ParseIdError {
	fn new(input: &str, reason: &'static str) -> Self {
		Self {
			input: input.to_string(),
			reason,
		}
	}
}

impl FromStr for PeerId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if s.len() != 16 {
			return Err(ParseIdError::new(s, "peer id must be 16 hex digits"));
		}
		u64::from_str_radix(s, 16)
			.map(Self)
			.map_err(|_| ParseIdError::new(s, "peer id must be 16 hex digits"))
	}
}

impl FromStr for SessionId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let (peer, seq) = s.split_once('.').ok_or_else(|| ParseIdError::new(s, "missing '.' separator"))?;
		let seq = seq.parse().map_err(|_| ParseIdError::new(s, "invalid session sequence"))?;
		Ok(Self::new(peer.parse()?, seq))
	}
}

impl FromStr for SessionRef {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let (session, rev) = s.split_once('@').ok_or_else(|| ParseIdError::new(s, "missing '@' separator"))?;
		let rev = rev.parse().map_err(|_| ParseIdError::new(s, "invalid revision"))?;
		Ok(session.parse::<SessionId>()?.at(rev))
	}
}

impl FromStr for MessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let (reference, seq) = s.split_once('#').ok_or_else(|| ParseIdError::new(s, "missing '#' separator"))?;
		let seq = seq.parse().map_err(|_| ParseIdError::new(s, "invalid message sequence"))?;
		Ok(Self::new(reference.parse()?, seq))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn message_id_parses_back_from_display() {
		let id = MessageId::new(SessionId::new(PeerId::from_raw(0xdead_beef_0000_0001), 7).at(3), 12);
		let text = id.to_string();
		assert_eq!(text, "deadbeef00000001.7@3#12");
		assert_eq!(text.parse::<MessageId>(), Ok(id));
	}

	#[test]
	fn malformed_message_ids_are_rejected() {
		assert!("deadbeef00000001.7@3".parse::<MessageId>().is_err());
		assert!("beef.7@3#1".parse::<MessageId>().is_err());
		assert!("deadbeef00000001.x@3#1".parse::<MessageId>().is_err());
	}

	#[test]
	fn generated_peer_ids_carry_a_clock_component() {
		let a = PeerId::generate();
		let b = PeerId::generate();
		assert_ne!(a.get() >> 32, 0);
		assert_ne!(a, b);
	}

	#[test]
	fn internal_session_uses_reserved_sequence() {
		let peer = PeerId::from_raw(1);
		assert!(SessionId::internal(peer).is_internal());
		assert!(!SessionId::new(peer, 1).is_internal());
	}
}
