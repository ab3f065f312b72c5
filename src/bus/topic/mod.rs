pub mod partition;
pub mod registry;
pub mod router;

pub use partition::PartitionLog;
pub use registry::{Topic, TopicMetadata, TopicRegistry};
