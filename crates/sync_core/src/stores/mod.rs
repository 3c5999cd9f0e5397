//! Entity stores. Only the reconciliation engine holds them mutably.

pub mod channels;
pub mod messages;
pub mod notifications;
pub mod reactions;

pub use channels::{ChannelStore, RoleSnapshot};
pub use messages::{Delivery, Message, MessageStore};
pub use notifications::NotificationStore;
pub use reactions::{ReactionKey, ReactionStore, ReactionSummary};
