pub mod actor;
pub mod client;
pub mod group;

pub use actor::GroupCoordinator;
pub use client::Consumer;
pub use group::{ConsumerGroup, GroupMember};
