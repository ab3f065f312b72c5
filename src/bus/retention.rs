//! Time-based eviction of old records.
//!
//! Eviction ignores consumer progress: a group lagging behind the retention
//! window silently resumes at the new log start on its next poll.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self as tokio_time, MissedTickBehavior};

use crate::bus::broker::Bus;
use crate::bus::broker::types::{BusEvent, TopicPartition};
use crate::bus::topic::Topic;
use crate::storage::LogStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub partitions_swept: usize,
    pub records_expired: usize,
}

fn cutoff(now: DateTime<Utc>, retention: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|retention| now.checked_sub_signed(retention))
}

/// Removes every record older than `now - retention` from each partition,
/// then moves the store's log start along.
pub(crate) async fn sweep_topics(
    topics: &[Arc<Topic>],
    now: DateTime<Utc>,
    store: Option<&dyn LogStore>,
    events: &broadcast::Sender<BusEvent>,
) -> SweepReport {
    let mut report = SweepReport::default();
    for topic in topics {
        let Some(cutoff) = cutoff(now, topic.retention()) else {
            continue;
        };
        for log in topic.partitions() {
            let mut log = log.lock().await;
            report.partitions_swept += 1;
            let expired = log.expire_before(cutoff);
            if expired == 0 {
                continue;
            }
            report.records_expired += expired;
            info!(
                "Expired {} records from {}-{}, log start now {}",
                expired,
                topic.name(),
                log.id(),
                log.log_start_offset()
            );
            if let Some(store) = store {
                let tp = TopicPartition::new(topic.name(), log.id());
                if let Err(e) = store.truncate_before(&tp, log.log_start_offset()).await {
                    error!("Failed to persist log start of {}: {}", tp, e);
                }
            }
            let _ = events.send(BusEvent::RecordsExpired {
                topic: topic.name().to_string(),
                partition: log.id(),
                count: expired,
                log_start_offset: log.log_start_offset(),
            });
        }
    }
    report
}

/// Periodic sweep task. Aborted when dropped.
pub struct RetentionSweeper {
    handle: JoinHandle<()>,
}

impl RetentionSweeper {
    pub fn start(bus: Weak<Bus>, period: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut interval = tokio_time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(bus) = bus.upgrade() else {
                    break;
                };
                let report = bus.sweep_expired_at(Utc::now()).await;
                debug!(
                    "Retention sweep: {} partitions, {} records expired",
                    report.partitions_swept, report.records_expired
                );
            }
        });
        info!("Started retention sweeper every {:?}", period);
        Self { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for RetentionSweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
