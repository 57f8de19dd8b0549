//! Sluice Flow -- the transport-free core of a filtered-resource subscription.
//!
//! The state machine decides, the driver (in sluice-client) acts.
//! Slot tracker and delivery queue are the only state shared with
//! downloaders and consumers.

pub mod backoff;
pub mod item;
pub mod machine;
pub mod queue;
pub mod slots;
pub mod stats;

pub use backoff::{ReconnectPolicy, ResumePolicy};
pub use item::{Delivery, Resource, ResourceItem, Terminal};
pub use machine::{FlowAction, FlowActions, Phase, SubscriptionMachine};
pub use queue::{delivery_queue, DeliveryReceiver, DeliverySender, QueueError, DEFAULT_QUEUE_CAPACITY};
pub use slots::{Permit, SlotTracker};
pub use stats::{FlowStats, StatsSnapshot};
