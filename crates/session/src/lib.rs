//! Versioned sessions for ravel peers.
//!
//! A [`Peer`] owns sessions. Each session is an attribute table that only
//! changes by compare-and-swap from one [`Revision`] to the next, and every
//! message sent through a session names the revision it was sent from.
//! Receivers on other peers read that state through a cache that fetches
//! from the owner on demand and never serves a value newer than the
//! revision it was asked about.

#![warn(missing_docs)]

pub mod config;
pub mod local;
pub mod peer;
pub mod proto;
pub mod remote;
pub mod revision;
pub mod session;

pub use config::{ConfigError, PeerConfig};
pub use local::LocalCatalog;
pub use peer::Peer;
pub use ravel_primitives::{Attr, AttrTable, Diff, Error, Failure, MessageId, Namespace, PeerId, Result, SessionId, SessionRef};
pub use ravel_rpc::{AsyncHandler, AsyncReply, CallContext, MemoryBroker, Responder, Transport};
pub use remote::{RemoteCatalog, RemoteStore};
pub use revision::Revision;
pub use session::{CommandHandler, EventHandler, Invocation, Notification, Session, command_handler, event_handler};
