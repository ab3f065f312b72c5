use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time as tokio_time;

use crate::bus::broker::Bus;
use crate::bus::broker::types::{MessageRecord, OffsetCommit, TopicPartition};
use crate::config::ConsumerConfig;
use crate::error::{BusError, BusResult};

struct ConsumerInner {
    bus: Arc<Bus>,
    group_id: String,
    member_id: String,
    client_id: String,
    config: ConsumerConfig,
    subscriptions: Mutex<BTreeSet<String>>,
    /// Highest offset handed out by `poll` per partition since the last commit.
    observed: Mutex<BTreeMap<TopicPartition, i64>>,
    closed: AtomicBool,
}

/// A member of a consumer group.
///
/// `poll` always reads from the group's committed offsets; nothing moves until
/// a commit, so an uncommitted batch is delivered again. Dropping the handle
/// without `close` leaves the group in the background but commits nothing.
pub struct Consumer {
    inner: Arc<ConsumerInner>,
    auto_commit: Option<JoinHandle<()>>,
}

impl Consumer {
    pub(crate) fn new(
        bus: Arc<Bus>,
        group_id: String,
        member_id: String,
        config: ConsumerConfig,
    ) -> Self {
        let client_id = config.client_id.clone().unwrap_or_else(|| group_id.clone());
        let inner = Arc::new(ConsumerInner {
            bus,
            group_id,
            member_id,
            client_id,
            config,
            subscriptions: Mutex::new(BTreeSet::new()),
            observed: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        });
        let auto_commit = inner
            .config
            .auto_commit
            .then(|| spawn_auto_commit(Arc::downgrade(&inner)));
        Self { inner, auto_commit }
    }

    pub fn group_id(&self) -> &str {
        &self.inner.group_id
    }

    pub fn member_id(&self) -> &str {
        &self.inner.member_id
    }

    pub async fn subscription(&self) -> Vec<String> {
        self.inner.subscriptions.lock().await.iter().cloned().collect()
    }

    /// Partitions the coordinator currently assigns to this member.
    pub fn assignment(&self) -> Vec<TopicPartition> {
        self.inner
            .bus
            .coordinator()
            .assignment(&self.inner.group_id, &self.inner.member_id)
    }

    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.inner
            .bus
            .coordinator()
            .committed(&self.inner.group_id, &TopicPartition::new(topic, partition))
    }

    /// Adds topics to the subscription, joining the group on first call.
    pub async fn subscribe<S: AsRef<str>>(&self, topics: &[S]) -> BusResult<()> {
        self.inner.ensure_open()?;
        let registry = self.inner.bus.registry();
        for topic in topics {
            let topic = topic.as_ref();
            if !registry.contains(topic) {
                return Err(BusError::TopicNotFound(topic.to_string()));
            }
        }

        let mut subscriptions = self.inner.subscriptions.lock().await;
        let mut wanted = subscriptions.clone();
        wanted.extend(topics.iter().map(|t| t.as_ref().to_string()));
        let topics: Vec<String> = wanted.iter().cloned().collect();
        let assignment = self
            .inner
            .bus
            .coordinator()
            .join(
                &self.inner.group_id,
                &self.inner.member_id,
                &self.inner.client_id,
                topics,
            )
            .await?;
        *subscriptions = wanted;
        info!(
            "Consumer {} subscribed to {:?}, assigned {} partitions",
            self.inner.member_id,
            *subscriptions,
            assignment.len()
        );
        Ok(())
    }

    /// Reads up to `max_poll_records` records from the assigned partitions.
    pub async fn poll(&self) -> BusResult<Vec<MessageRecord>> {
        self.poll_records(self.inner.config.max_poll_records).await
    }

    /// Reads up to `max_records` in total, starting at the committed offset of
    /// each assigned partition (0 when nothing was committed). Never blocks
    /// waiting for data.
    pub async fn poll_records(&self, max_records: usize) -> BusResult<Vec<MessageRecord>> {
        self.inner.ensure_open()?;
        let bus = &self.inner.bus;
        let mut records = Vec::new();

        for tp in self.assignment() {
            if records.len() >= max_records {
                break;
            }
            let Ok(topic) = bus.registry().get(&tp.topic) else {
                continue;
            };
            let Ok(log) = topic.partition(tp.partition) else {
                continue;
            };
            let from = bus
                .coordinator()
                .committed(&self.inner.group_id, &tp)
                .unwrap_or(0);
            let batch = log.lock().await.read(from, max_records - records.len());

            if let Some(last) = batch.last() {
                let mut observed = self.inner.observed.lock().await;
                let entry = observed.entry(tp.clone()).or_insert(last.offset);
                *entry = (*entry).max(last.offset);
            }
            records.extend(batch);
        }

        debug!(
            "Consumer {} polled {} records",
            self.inner.member_id,
            records.len()
        );
        Ok(records)
    }

    /// Commits `offset + 1` for every given triple, or for the highest offset
    /// polled per partition since the previous commit when `offsets` is `None`.
    pub async fn commit_offsets(&self, offsets: Option<Vec<OffsetCommit>>) -> BusResult<()> {
        self.inner.ensure_open()?;
        match offsets {
            Some(offsets) => self.inner.commit_explicit(offsets).await,
            None => self.inner.commit_observed().await,
        }
    }

    /// Commits whatever was polled, then leaves the group.
    pub async fn close(mut self) -> BusResult<()> {
        self.shutdown().await
    }

    async fn shutdown(&mut self) -> BusResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.auto_commit.take() {
            handle.abort();
        }

        let joined = !self.inner.subscriptions.lock().await.is_empty();
        let commit = if joined {
            self.inner.commit_observed().await
        } else {
            Ok(())
        };
        self.inner.closed.store(true, Ordering::SeqCst);

        let leave = if joined {
            self.inner
                .bus
                .coordinator()
                .leave(&self.inner.group_id, &self.inner.member_id)
                .await
        } else {
            Ok(())
        };
        info!("Consumer {} closed", self.inner.member_id);
        commit.and(leave)
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Some(handle) = self.auto_commit.take() {
            handle.abort();
        }
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Without a runtime there is nobody left to rebalance for.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = self.inner.clone();
        runtime.spawn(async move {
            if inner.subscriptions.lock().await.is_empty() {
                return;
            }
            match inner
                .bus
                .coordinator()
                .leave(&inner.group_id, &inner.member_id)
                .await
            {
                Ok(()) => info!("Dropped consumer {} left its group", inner.member_id),
                Err(e) => debug!("Dropped consumer {} could not leave: {}", inner.member_id, e),
            }
        });
    }
}

impl ConsumerInner {
    fn ensure_open(&self) -> BusResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BusError::ConsumerClosed)
        } else {
            Ok(())
        }
    }

    async fn commit_explicit(&self, offsets: Vec<OffsetCommit>) -> BusResult<()> {
        // Holding `observed` keeps a concurrent auto-commit from landing in between.
        let mut observed = self.observed.lock().await;
        let commits: Vec<(TopicPartition, i64)> = offsets
            .into_iter()
            .map(|c| (TopicPartition::new(c.topic, c.partition), c.offset + 1))
            .collect();
        self.bus
            .coordinator()
            .commit(&self.group_id, &self.member_id, commits.clone())
            .await?;
        // Manual commits supersede anything auto-commit was about to write.
        for (tp, _) in &commits {
            observed.remove(tp);
        }
        Ok(())
    }

    async fn commit_observed(&self) -> BusResult<()> {
        let mut observed = self.observed.lock().await;
        // Progress on partitions lost in a rebalance belongs to the new owner.
        let owned = self
            .bus
            .coordinator()
            .assignment(&self.group_id, &self.member_id);
        observed.retain(|tp, _| {
            let keep = owned.contains(tp);
            if !keep {
                debug!("Consumer {} no longer owns {}, not committing it", self.member_id, tp);
            }
            keep
        });
        if observed.is_empty() {
            return Ok(());
        }
        let commits: Vec<(TopicPartition, i64)> = observed
            .iter()
            .map(|(tp, offset)| (tp.clone(), offset + 1))
            .collect();
        self.bus
            .coordinator()
            .commit(&self.group_id, &self.member_id, commits)
            .await?;
        observed.clear();
        Ok(())
    }
}

fn spawn_auto_commit(inner: Weak<ConsumerInner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = match inner.upgrade() {
            Some(inner) => inner.config.auto_commit_interval(),
            None => return,
        };
        let mut interval = tokio_time::interval(period);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if inner.closed.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = inner.commit_observed().await {
                warn!("Auto-commit for {} failed: {}", inner.member_id, e);
            }
        }
    })
}
