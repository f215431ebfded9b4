//! PriorityCoordinator for ordered task completion
//!
//! The coordinator owns the render cursor and mediates every gated task
//! through three primitives:
//! - **Queue:** register, enqueue and dequeue tasks per priority level
//! - **Advance:** move the cursor forward, skipping levels nobody registered
//! - **Notify:** publish cursor changes to every subscriber, in subscription order
//!
//! Deferred task reports go through one FIFO owned by the coordinator and are
//! flushed by a single task on the turn after they were scheduled.

mod config;
mod core;
mod messages;

pub use config::CoordinatorConfig;
pub use core::{Listener, OnceCallback, PriorityCoordinator};
pub use messages::{CoordinatorEvent, CoordinatorSnapshot, Subscription, SubscriptionId};
