//! Append-only, offset-indexed record log for one topic partition.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::bus::broker::types::{Headers, MessageRecord, PartitionInfo};
use crate::error::{BusError, BusResult};

#[derive(Debug)]
pub struct PartitionLog {
    topic: String,
    id: i32,
    records: VecDeque<MessageRecord>,
    /// Lowest retained offset.
    log_start_offset: i64,
    /// Next offset to assign.
    high_water_mark: i64,
    capacity: Option<usize>,
}

impl PartitionLog {
    pub fn new(topic: impl Into<String>, id: i32, capacity: Option<usize>) -> Self {
        Self {
            topic: topic.into(),
            id,
            records: VecDeque::new(),
            log_start_offset: 0,
            high_water_mark: 0,
            capacity,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn high_water_mark(&self) -> i64 {
        self.high_water_mark
    }

    pub fn log_start_offset(&self) -> i64 {
        self.log_start_offset
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn info(&self) -> PartitionInfo {
        PartitionInfo {
            id: self.id,
            message_count: self.records.len(),
            high_water_mark: self.high_water_mark,
            log_start_offset: self.log_start_offset,
        }
    }

    /// Builds the record the next `push` will accept, without changing the log.
    ///
    /// Split from `push` so the caller can persist the record first and only
    /// make it visible once the write succeeded.
    pub fn stage(
        &self,
        key: Option<String>,
        value: Vec<u8>,
        headers: Headers,
        producer_id: &str,
        timestamp: DateTime<Utc>,
    ) -> BusResult<MessageRecord> {
        if let Some(capacity) = self.capacity {
            if self.records.len() >= capacity {
                return Err(BusError::QueueFull {
                    topic: self.topic.clone(),
                    partition: self.id,
                    capacity,
                });
            }
        }
        Ok(MessageRecord {
            offset: self.high_water_mark,
            topic: self.topic.clone(),
            partition: self.id,
            key,
            value,
            headers,
            timestamp,
            producer_id: producer_id.to_string(),
        })
    }

    /// Appends a staged record and returns its offset.
    pub fn push(&mut self, record: MessageRecord) -> i64 {
        debug_assert_eq!(record.offset, self.high_water_mark);
        let offset = self.high_water_mark;
        self.records.push_back(MessageRecord { offset, ..record });
        self.high_water_mark += 1;
        offset
    }

    /// Moves an empty log forward to `offset`, as if everything below had
    /// been appended and then evicted. Used by recovery.
    pub fn reset_start(&mut self, offset: i64) -> BusResult<()> {
        if !self.records.is_empty() || offset < self.high_water_mark {
            return Err(BusError::Recovery(format!(
                "cannot move {}-{} to offset {} (high water mark {}, {} records)",
                self.topic,
                self.id,
                offset,
                self.high_water_mark,
                self.records.len()
            )));
        }
        self.log_start_offset = offset;
        self.high_water_mark = offset;
        Ok(())
    }

    /// Re-inserts a persisted record during recovery. Offsets must keep increasing.
    pub fn restore(&mut self, record: MessageRecord) -> BusResult<()> {
        if record.offset < self.high_water_mark {
            return Err(BusError::Recovery(format!(
                "offset {} of {}-{} is below high water mark {}",
                record.offset, self.topic, self.id, self.high_water_mark
            )));
        }
        if self.records.is_empty() {
            self.log_start_offset = record.offset;
        }
        self.high_water_mark = record.offset + 1;
        self.records.push_back(record);
        Ok(())
    }

    /// Returns up to `max` records starting at `from`.
    ///
    /// A position below the log start resumes at the log start; records
    /// evicted by retention are skipped without an error.
    pub fn read(&self, from: i64, max: usize) -> Vec<MessageRecord> {
        let from = from.max(self.log_start_offset);
        if max == 0 || from >= self.high_water_mark {
            return Vec::new();
        }
        let first = self
            .records
            .partition_point(|record| record.offset < from);
        self.records
            .iter()
            .skip(first)
            .take(max)
            .cloned()
            .collect()
    }

    /// Drops every record appended before `cutoff` and returns how many were removed.
    pub fn expire_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let Some(last_expired) = self
            .records
            .iter()
            .rposition(|record| record.timestamp < cutoff)
        else {
            return 0;
        };
        let removed = last_expired + 1;
        self.records.drain(..removed);
        self.log_start_offset = self
            .records
            .front()
            .map_or(self.high_water_mark, |record| record.offset);
        removed
    }
}
