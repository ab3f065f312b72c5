use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::partition::PartitionLog;
use crate::bus::broker::types::TopicInfo;
use crate::config::{TopicConfig, validate_name};
use crate::error::{BusError, BusResult};

/// Topic definition as written to `topic.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMetadata {
    pub name: String,
    pub partitions: i32,
    pub config: TopicConfig,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Topic {
    name: String,
    config: TopicConfig,
    retention: Duration,
    created_at: DateTime<Utc>,
    partitions: Vec<Mutex<PartitionLog>>,
    round_robin: AtomicUsize,
}

impl Topic {
    fn new(metadata: &TopicMetadata, default_retention: Duration) -> Self {
        let partitions = (0..metadata.partitions)
            .map(|id| {
                Mutex::new(PartitionLog::new(
                    metadata.name.clone(),
                    id,
                    metadata.config.max_partition_records,
                ))
            })
            .collect();
        let retention = metadata
            .config
            .retention_ms
            .map(Duration::from_millis)
            .unwrap_or(default_retention);
        Self {
            name: metadata.name.clone(),
            config: metadata.config.clone(),
            retention,
            created_at: metadata.created_at,
            partitions,
            round_robin: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition_count(&self) -> i32 {
        self.partitions.len() as i32
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn partition(&self, id: i32) -> BusResult<&Mutex<PartitionLog>> {
        usize::try_from(id)
            .ok()
            .and_then(|idx| self.partitions.get(idx))
            .ok_or_else(|| BusError::InvalidPartition {
                topic: self.name.clone(),
                partition: id,
                partitions: self.partition_count(),
            })
    }

    pub fn partitions(&self) -> impl Iterator<Item = &Mutex<PartitionLog>> {
        self.partitions.iter()
    }

    /// Advances this topic's round-robin counter and returns the previous value.
    pub(crate) fn next_round_robin(&self) -> usize {
        self.round_robin.fetch_add(1, Ordering::Relaxed)
    }

    pub fn metadata(&self) -> TopicMetadata {
        TopicMetadata {
            name: self.name.clone(),
            partitions: self.partition_count(),
            config: self.config.clone(),
            created_at: self.created_at,
        }
    }

    pub async fn info(&self) -> TopicInfo {
        let mut partitions = Vec::with_capacity(self.partitions.len());
        for log in &self.partitions {
            partitions.push(log.lock().await.info());
        }
        TopicInfo {
            name: self.name.clone(),
            partition_count: self.partition_count(),
            retention: self.retention,
            created_at: self.created_at,
            partitions,
        }
    }
}

/// All topics of one bus, keyed by name.
pub struct TopicRegistry {
    topics: DashMap<String, Arc<Topic>>,
    default_retention: Duration,
}

impl TopicRegistry {
    pub fn new(default_retention: Duration) -> Self {
        Self {
            topics: DashMap::new(),
            default_retention,
        }
    }

    pub fn create(
        &self,
        name: &str,
        partitions: i32,
        config: TopicConfig,
        created_at: DateTime<Utc>,
    ) -> BusResult<Arc<Topic>> {
        self.register(TopicMetadata {
            name: name.to_string(),
            partitions,
            config,
            created_at,
        })
    }

    pub fn register(&self, metadata: TopicMetadata) -> BusResult<Arc<Topic>> {
        validate_name("topic", &metadata.name)?;
        if metadata.partitions <= 0 {
            return Err(BusError::InvalidConfig(format!(
                "topic {} needs at least one partition, got {}",
                metadata.name, metadata.partitions
            )));
        }
        if metadata.config.max_partition_records == Some(0) {
            return Err(BusError::InvalidConfig(format!(
                "topic {} has a partition capacity of zero",
                metadata.name
            )));
        }

        match self.topics.entry(metadata.name.clone()) {
            Entry::Occupied(_) => Err(BusError::AlreadyExists(metadata.name)),
            Entry::Vacant(slot) => {
                let topic = Arc::new(Topic::new(&metadata, self.default_retention));
                slot.insert(topic.clone());
                info!(
                    "Created topic {} with {} partitions, retention {:?}",
                    metadata.name,
                    metadata.partitions,
                    topic.retention()
                );
                Ok(topic)
            }
        }
    }

    /// Undoes a registration whose metadata could not be persisted.
    pub(crate) fn remove(&self, name: &str) {
        self.topics.remove(name);
    }

    pub fn get(&self, name: &str) -> BusResult<Arc<Topic>> {
        self.topics
            .get(name)
            .map(|topic| topic.value().clone())
            .ok_or_else(|| BusError::TopicNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.topics.contains_key(name)
    }

    pub fn partition_count(&self, name: &str) -> Option<i32> {
        self.topics.get(name).map(|topic| topic.partition_count())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.iter().map(|t| t.key().clone()).collect();
        names.sort();
        names
    }

    pub fn all(&self) -> Vec<Arc<Topic>> {
        let mut topics: Vec<Arc<Topic>> = self.topics.iter().map(|t| t.value().clone()).collect();
        topics.sort_by(|a, b| a.name().cmp(b.name()));
        topics
    }
}
