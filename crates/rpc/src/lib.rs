//! Broker-agnostic RPC exchange for ravel peers.
//!
//! This crate provides the moving parts of one peer's messaging:
//! * [`Transport`]/[`Channel`]: the broker collaborator boundary
//! * [`MemoryBroker`]: an in-process broker implementing that boundary
//! * [`ChannelPool`]: bounded, scoped checkout of outbound channels
//! * [`Invoker`]: the client loop correlating replies to pending calls
//! * [`Responder`]: a single-use response handle for one inbound request
//! * [`Dispatcher`]: the server loop routing deliveries to namespace handlers
//! * [`Notifier`]: fire-and-forget notification publishing

#![warn(missing_docs)]

pub mod context;
pub mod dispatch;
pub mod invoker;
pub mod memory;
pub mod notifier;
pub mod pool;
pub mod responder;
pub mod task;
pub mod transport;

pub use context::CallContext;
pub use dispatch::{DispatchKind, DispatchLoop, Dispatcher, Handler, Request, handler};
pub use invoker::{AsyncHandler, AsyncReply, Invoker, InvokerLoop, Outbound};
pub use memory::MemoryBroker;
pub use notifier::{Notice, Notifier};
pub use pool::{ChannelPool, PooledChannel};
pub use ravel_primitives::{Error, Result};
pub use responder::Responder;
pub use transport::{Binding, Channel, Delivery, DeliveryClass, DeliveryStream, Envelope, Inbox, ReplyStatus, Route, Settle, Settlement, Settler, Transport};
