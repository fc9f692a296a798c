//! Single-owner concurrency primitives.
//!
//! Every piece of shared state in udev-manager is owned by exactly one task.
//! Other tasks talk to it through the two primitives defined here:
//!
//! - [`Rendezvous`]: a request bundled with a single-use reply channel, used
//!   to turn a message send into a synchronous call into the owning task.
//! - [`Mux`]: a publish/subscribe hub whose subscriber set is owned by a
//!   dedicated task, so registration and delivery are totally ordered.
//!
//! Sinks ([`Sink`]) are the delivery targets of a [`Mux`]; they compose with
//! [`SinkExt::map`] and [`SinkExt::filter`].

mod hub;
mod predicate;
mod rendezvous;
mod sink;

pub use hub::Mux;
pub use hub::MuxConfig;
pub use hub::MuxError;
pub use hub::Subscription;
pub use hub::Subscriptions;
pub use predicate::Predicate;
pub use rendezvous::call;
pub use rendezvous::AwaitDone;
pub use rendezvous::Awaiting;
pub use rendezvous::Rendezvous;
pub use rendezvous::RendezvousError;
pub use rendezvous::Reply;
pub use sink::BoxSink;
pub use sink::FilterSink;
pub use sink::MapSink;
pub use sink::Sink;
pub use sink::SinkError;
pub use sink::SinkExt;
