//! Catalog RPCs between a remote catalog cache and the owning peer.
//!
//! Requests travel as unicast calls in the reserved `.catalog` namespace,
//! sent from the peer's internal session. Payloads are postcard-encoded.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use ravel_primitives::{Attr, AttrMeta, Error, MessageId, Namespace, Result, SessionId, SessionRef};
use ravel_rpc::{CallContext, Invoker, Outbound};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Reserved namespace serving catalog requests.
#[must_use]
pub fn namespace() -> Namespace {
	Namespace::reserved("catalog")
}

/// Operation on the catalog of a session owned by the receiving peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatalogRequest {
	/// Current revision plus the raw metadata of `keys`.
	Fetch {
		/// Target session.
		session: SessionId,
		/// Keys to read; empty to learn the head only.
		keys: Vec<String>,
	},
	/// Compare-and-swap update on `target`.
	Update {
		/// Revision the update is based on.
		target: SessionRef,
		/// Attributes to apply.
		attrs: Vec<Attr>,
	},
	/// Close at `target`.
	Close {
		/// Revision the close is based on.
		target: SessionRef,
	},
}

impl CatalogRequest {
	/// Session the request targets.
	#[must_use]
	pub fn session(&self) -> SessionId {
		match self {
			Self::Fetch { session, .. } => *session,
			Self::Update { target, .. } | Self::Close { target } => target.session,
		}
	}

	fn command(&self) -> &'static str {
		match self {
			Self::Fetch { .. } => "fetch",
			Self::Update { .. } => "update",
			Self::Close { .. } => "close",
		}
	}
}

/// Reply to every catalog request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogReply {
	/// Current revision after the operation.
	pub head: u64,
	/// Metadata of the fetched or updated keys.
	pub attrs: Vec<AttrMeta>,
}

/// Encodes a catalog message.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
	postcard::to_allocvec(value)
		.map(Bytes::from)
		.map_err(|e| Error::Codec(e.to_string()))
}

/// Decodes a catalog message.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
	postcard::from_bytes(bytes).map_err(|e| Error::Codec(e.to_string()))
}

/// Client side of the catalog RPCs.
#[derive(Debug, Clone)]
pub struct CatalogLink {
	invoker: Invoker,
	seq: Arc<AtomicU64>,
}

impl CatalogLink {
	/// Sends catalog requests through `invoker`.
	#[must_use]
	pub fn new(invoker: Invoker) -> Self {
		Self {
			invoker,
			seq: Arc::new(AtomicU64::new(0)),
		}
	}

	/// Reads `keys` of `session` from its owner.
	pub async fn fetch(&self, ctx: &CallContext, session: SessionId, keys: Vec<String>) -> Result<CatalogReply> {
		self.call(ctx, CatalogRequest::Fetch { session, keys }).await
	}

	/// Updates the session at `target` on its owner.
	pub async fn update(&self, ctx: &CallContext, target: SessionRef, attrs: Vec<Attr>) -> Result<CatalogReply> {
		self.call(ctx, CatalogRequest::Update { target, attrs }).await
	}

	/// Closes the session at `target` on its owner.
	pub async fn close(&self, ctx: &CallContext, target: SessionRef) -> Result<CatalogReply> {
		self.call(ctx, CatalogRequest::Close { target }).await
	}

	async fn call(&self, ctx: &CallContext, request: CatalogRequest) -> Result<CatalogReply> {
		let owner = request.session().peer;
		let internal = SessionId::internal(self.invoker.peer());
		let id = MessageId::new(internal.at(0), self.seq.fetch_add(1, Ordering::Relaxed) + 1);
		let outbound = Outbound {
			id,
			namespace: namespace(),
			command: request.command().to_string(),
			body: encode(&request)?,
		};
		tracing::trace!(%id, %owner, command = outbound.command.as_str(), "catalog.call");
		let body = self.invoker.call_unicast(ctx, owner, outbound).await?;
		decode(&body)
	}
}
