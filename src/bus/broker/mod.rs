pub mod broker;
pub mod types;

pub use broker::{Bus, RecoveryReport};
