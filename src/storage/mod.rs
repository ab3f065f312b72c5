//! Persistence adapter: mirrors appends and offset commits to durable storage.
//!
//! Nothing is loaded automatically; `Bus::recover` replays a store explicitly.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::bus::broker::types::{MessageRecord, TopicPartition};
use crate::bus::topic::TopicMetadata;
use crate::error::BusResult;

mod file;

pub use file::FileLogStore;

/// Committed offsets of one group, "next offset to read" per partition.
pub type OffsetSnapshot = BTreeMap<TopicPartition, i64>;

#[async_trait]
pub trait LogStore: Send + Sync {
    /// Fails with `AlreadyExists` when the store already holds the topic.
    async fn create_topic(&self, metadata: &TopicMetadata) -> BusResult<()>;

    /// Must complete before the record becomes visible to consumers.
    async fn append(&self, record: &MessageRecord) -> BusResult<()>;

    /// Replaces the whole snapshot of `group_id`.
    async fn write_offsets(&self, group_id: &str, offsets: &OffsetSnapshot) -> BusResult<()>;

    /// Records that retention advanced the start of `tp` to `log_start_offset`.
    /// Records below it must not come back from `load_partition`.
    async fn truncate_before(&self, tp: &TopicPartition, log_start_offset: i64) -> BusResult<()>;

    async fn load_topics(&self) -> BusResult<Vec<TopicMetadata>>;

    async fn load_partition(&self, topic: &str, partition: i32) -> BusResult<Vec<MessageRecord>>;

    /// First live offset of a partition; 0 when nothing was ever evicted.
    async fn load_log_start(&self, topic: &str, partition: i32) -> BusResult<i64>;

    async fn load_offsets(&self) -> BusResult<BTreeMap<String, OffsetSnapshot>>;

    async fn flush(&self) -> BusResult<()>;
}
