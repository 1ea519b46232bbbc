//! Core data model for ravel peers.
//!
//! * [`ids`]: peer, session, revision and message identifiers
//! * [`attr`]: attributes, metadata and the as-of-revision read rule
//! * [`diff`]: structured change sets produced by catalog updates
//! * [`namespace`]: validated routing domains
//! * [`error`]: the shared error taxonomy

#![warn(missing_docs)]

pub mod attr;
pub mod diff;
pub mod error;
pub mod ids;
pub mod namespace;

pub use attr::{Attr, AttrMeta, AttrMetaTable, AttrTable};
pub use diff::{Diff, DiffEntry, DiffKind};
pub use error::{Error, Failure, Result};
pub use ids::{CorrelationId, MessageId, PeerId, SessionId, SessionRef};
pub use namespace::Namespace;
