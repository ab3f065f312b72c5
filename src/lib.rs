//! In-process, topic-partitioned publish/subscribe bus with consumer groups.

pub mod bus;
pub mod config;
pub mod error;
pub mod storage;

pub use bus::broker::types::{
    BusEvent, GroupInfo, Headers, MessageRecord, OffsetCommit, PartitionInfo, RecordMetadata,
    TopicInfo, TopicPartition,
};
pub use bus::broker::{Bus, RecoveryReport};
pub use bus::consumer::Consumer;
pub use bus::producer::{BatchResult, Producer, ProducerRecord, ProducerStats, SendOptions};
pub use bus::retention::SweepReport;
pub use config::{BusConfig, ConsumerConfig, ProducerConfig, TopicConfig, TopicSpec};
pub use error::{BusError, BusResult};
pub use storage::{FileLogStore, LogStore, OffsetSnapshot};
