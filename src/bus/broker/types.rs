use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub type Headers = IndexMap<String, String>;

/// Representation of a topic partition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

/// Formats as `topic:partition`, the key used in offset snapshots.
impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

impl FromStr for TopicPartition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (topic, partition) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("missing ':' in {:?}", s))?;
        let partition = partition
            .parse::<i32>()
            .map_err(|e| format!("bad partition in {:?}: {}", s, e))?;
        if topic.is_empty() {
            return Err(format!("empty topic in {:?}", s));
        }
        Ok(Self::new(topic, partition))
    }
}

/// A record as stored in a partition log. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub offset: i64,
    pub topic: String,
    pub partition: i32,
    pub key: Option<String>,
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub headers: Headers,
    pub timestamp: DateTime<Utc>,
    pub producer_id: String,
}

impl MessageRecord {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

/// Where an appended record landed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// The last processed offset of a partition; committing stores `offset + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetCommit {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl OffsetCommit {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }
}

impl From<&MessageRecord> for OffsetCommit {
    fn from(record: &MessageRecord) -> Self {
        Self::new(record.topic.clone(), record.partition, record.offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub id: i32,
    pub message_count: usize,
    pub high_water_mark: i64,
    pub log_start_offset: i64,
}

#[derive(Debug, Clone)]
pub struct TopicInfo {
    pub name: String,
    pub partition_count: i32,
    pub retention: Duration,
    pub created_at: DateTime<Utc>,
    pub partitions: Vec<PartitionInfo>,
}

impl TopicInfo {
    pub fn message_count(&self) -> usize {
        self.partitions.iter().map(|p| p.message_count).sum()
    }
}

#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub group_id: String,
    pub generation: i32,
    pub member_count: usize,
    pub members: Vec<String>,
    pub assignment: BTreeMap<String, Vec<TopicPartition>>,
    /// Next offset to read, per partition.
    pub offsets: BTreeMap<TopicPartition, i64>,
}

/// Notifications published on the bus event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    TopicCreated {
        topic: String,
        partitions: i32,
    },
    RecordAppended {
        topic: String,
        partition: i32,
        offset: i64,
    },
    GroupRebalanced {
        group_id: String,
        generation: i32,
        members: usize,
    },
    RecordsExpired {
        topic: String,
        partition: i32,
        count: usize,
        log_start_offset: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_partition_key_roundtrip() {
        let tp = TopicPartition::new("orders.eu", 2);
        assert_eq!(tp.to_string(), "orders.eu:2");
        assert_eq!("orders.eu:2".parse::<TopicPartition>().unwrap(), tp);
    }

    #[test]
    fn test_topic_partition_rejects_garbage() {
        assert!("orders".parse::<TopicPartition>().is_err());
        assert!(":1".parse::<TopicPartition>().is_err());
        assert!("orders:x".parse::<TopicPartition>().is_err());
    }

    #[test]
    fn test_record_json_line() {
        let record = MessageRecord {
            offset: 4,
            topic: "orders".to_string(),
            partition: 1,
            key: Some("customer-1".to_string()),
            value: b"hello".to_vec(),
            headers: Headers::new(),
            timestamp: Utc::now(),
            producer_id: "p1".to_string(),
        };
        let line = serde_json::to_string(&record).unwrap();
        assert!(!line.contains('\n'));
        assert!(!line.contains("headers"));
        let parsed: MessageRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(parsed.value_str(), Some("hello"));
    }
}
