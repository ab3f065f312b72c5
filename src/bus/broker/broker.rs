use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use tokio::sync::broadcast;

use super::types::{BusEvent, GroupInfo, RecordMetadata, TopicInfo};
use crate::bus::consumer::{Consumer, GroupCoordinator};
use crate::bus::producer::{Producer, SendOptions};
use crate::bus::retention::{self, RetentionSweeper, SweepReport};
use crate::bus::topic::router::select_partition;
use crate::bus::topic::{Topic, TopicRegistry};
use crate::config::{BusConfig, ConsumerConfig, ProducerConfig, TopicConfig, validate_name};
use crate::error::{BusError, BusResult};
use crate::storage::{FileLogStore, LogStore};

/// What `Bus::recover` put back into memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub topics: usize,
    pub records: usize,
    pub groups: usize,
}

/// The in-process broker: topics, partitions, group coordination and retention.
pub struct Bus {
    config: BusConfig,
    registry: Arc<TopicRegistry>,
    coordinator: GroupCoordinator,
    store: Option<Arc<dyn LogStore>>,
    events: broadcast::Sender<BusEvent>,
    member_seq: AtomicU64,
    sweeper: StdMutex<Option<RetentionSweeper>>,
}

impl Bus {
    /// Starts a bus. A `data_dir` in the config enables the file store.
    pub async fn new(config: BusConfig) -> BusResult<Arc<Self>> {
        let store: Option<Arc<dyn LogStore>> = match &config.data_dir {
            Some(dir) => Some(Arc::new(FileLogStore::open(dir.clone()).await?)),
            None => None,
        };
        Self::with_store(config, store).await
    }

    pub async fn with_store(
        config: BusConfig,
        store: Option<Arc<dyn LogStore>>,
    ) -> BusResult<Arc<Self>> {
        let registry = Arc::new(TopicRegistry::new(config.default_retention()));
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let coordinator = GroupCoordinator::start(
            registry.clone(),
            store.clone(),
            events.clone(),
            config.coordinator_timeout(),
        )
        .await?;

        let bus = Arc::new(Self {
            config,
            registry,
            coordinator,
            store,
            events,
            member_seq: AtomicU64::new(0),
            sweeper: StdMutex::new(None),
        });

        let sweeper =
            RetentionSweeper::start(Arc::downgrade(&bus), bus.config.retention_check_interval());
        *bus.sweeper.lock().unwrap_or_else(PoisonError::into_inner) = Some(sweeper);

        info!(
            "Started bus ({})",
            if bus.store.is_some() { "persistent" } else { "in-memory" }
        );
        Ok(bus)
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub(crate) fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    pub(crate) fn coordinator(&self) -> &GroupCoordinator {
        &self.coordinator
    }

    /// Subscribes to bus notifications. Slow receivers lose the oldest events.
    pub fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    pub async fn create_topic(
        &self,
        name: &str,
        partitions: i32,
        config: TopicConfig,
    ) -> BusResult<Arc<Topic>> {
        let topic = self.registry.create(name, partitions, config, Utc::now())?;

        if let Some(store) = &self.store {
            if let Err(e) = store.create_topic(&topic.metadata()).await {
                match &e {
                    BusError::AlreadyExists(_) => {
                        warn!("Topic {} already exists in the store, recover it instead", name)
                    }
                    _ => error!("Failed to persist topic {}: {}", name, e),
                }
                self.registry.remove(name);
                return Err(e);
            }
        }

        let _ = self.events.send(BusEvent::TopicCreated {
            topic: name.to_string(),
            partitions,
        });
        Ok(topic)
    }

    pub fn list_topics(&self) -> Vec<String> {
        self.registry.names()
    }

    pub async fn topic_info(&self, name: &str) -> BusResult<TopicInfo> {
        Ok(self.registry.get(name)?.info().await)
    }

    pub fn consumer_group_info(&self, group_id: &str) -> BusResult<GroupInfo> {
        self.coordinator.group_info(group_id)
    }

    pub fn consumer_groups(&self) -> Vec<String> {
        self.coordinator.group_ids()
    }

    pub fn create_producer(self: &Arc<Self>, id: &str, config: ProducerConfig) -> Producer {
        Producer::new(self.clone(), id.to_string(), config)
    }

    /// Creates a consumer with a fresh member id. It joins the group on its
    /// first `subscribe`. Call `Consumer::close` to commit what was polled;
    /// a consumer that is only dropped leaves the group without committing.
    pub fn create_consumer(
        self: &Arc<Self>,
        group_id: &str,
        config: ConsumerConfig,
    ) -> BusResult<Consumer> {
        validate_name("group", group_id)?;
        let seq = self.member_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let prefix = config.client_id.as_deref().unwrap_or(group_id);
        let member_id = format!("{}-{:06}", prefix, seq);
        Ok(Consumer::new(
            self.clone(),
            group_id.to_string(),
            member_id,
            config,
        ))
    }

    /// Routes, persists and appends one record.
    ///
    /// The partition lock is held across the store write, so offsets reach the
    /// store in order and a failed write leaves the log untouched.
    pub(crate) async fn append(
        &self,
        topic_name: &str,
        producer_id: &str,
        value: &[u8],
        options: &SendOptions,
    ) -> BusResult<RecordMetadata> {
        let topic = self.registry.get(topic_name)?;
        let partition = select_partition(&topic, options.partition, options.key.as_deref())?;

        let mut log = topic.partition(partition)?.lock().await;
        let record = log.stage(
            options.key.clone(),
            value.to_vec(),
            options.headers.clone(),
            producer_id,
            Utc::now(),
        )?;
        if let Some(store) = &self.store {
            if let Err(e) = store.append(&record).await {
                error!(
                    "Failed to persist record for {}-{}: {}",
                    topic_name, partition, e
                );
                return Err(e);
            }
        }
        let offset = log.push(record);
        drop(log);

        let _ = self.events.send(BusEvent::RecordAppended {
            topic: topic_name.to_string(),
            partition,
            offset,
        });
        Ok(RecordMetadata {
            topic: topic_name.to_string(),
            partition,
            offset,
        })
    }

    /// Runs one retention pass as if the clock read `now`.
    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> SweepReport {
        retention::sweep_topics(&self.registry.all(), now, self.store.as_deref(), &self.events)
            .await
    }

    /// Replays topics, records, log start offsets and committed offsets from
    /// the store.
    ///
    /// Topics already defined in memory are left alone. Without a store this
    /// is a no-op.
    pub async fn recover(&self) -> BusResult<RecoveryReport> {
        let Some(store) = &self.store else {
            return Ok(RecoveryReport::default());
        };
        let mut report = RecoveryReport::default();

        for metadata in store.load_topics().await? {
            let name = metadata.name.clone();
            let topic = match self.registry.register(metadata) {
                Ok(topic) => topic,
                Err(BusError::AlreadyExists(_)) => {
                    warn!("Topic {} already defined, not recovering it", name);
                    continue;
                }
                Err(e) => return Err(e),
            };
            for log in topic.partitions() {
                let mut log = log.lock().await;
                let start = store.load_log_start(&name, log.id()).await?;
                log.reset_start(start)?;
                for record in store.load_partition(&name, log.id()).await? {
                    // Left behind when a compaction was interrupted.
                    if record.offset < start {
                        continue;
                    }
                    log.restore(record)?;
                    report.records += 1;
                }
            }
            report.topics += 1;
        }

        report.groups = self.coordinator.restore(store.load_offsets().await?).await?;
        info!(
            "Recovered {} topics, {} records, {} groups",
            report.topics, report.records, report.groups
        );
        Ok(report)
    }

    /// Stops background work and flushes the store. Producers and consumers
    /// still holding the bus get `CoordinatorUnavailable` from group calls.
    pub async fn shutdown(&self) -> BusResult<()> {
        if let Some(sweeper) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            sweeper.stop();
        }
        self.coordinator.stop();
        if let Some(store) = &self.store {
            store.flush().await?;
        }
        info!("Bus shut down");
        Ok(())
    }
}
