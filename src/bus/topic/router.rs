//! Partition selection for outgoing records.
//!
//! Priority: explicit partition, then key hash, then per-topic round-robin.
//! The key hash is murmur2 with the Kafka seed, so every record sharing a key
//! lands in the same partition and keeps its relative order.

use murmur2::{KAFKA_SEED, murmur2};

use super::registry::Topic;
use crate::error::{BusError, BusResult};

pub fn select_partition(topic: &Topic, explicit: Option<i32>, key: Option<&str>) -> BusResult<i32> {
    let partitions = topic.partition_count();

    if let Some(partition) = explicit {
        if partition < 0 || partition >= partitions {
            return Err(BusError::InvalidPartition {
                topic: topic.name().to_string(),
                partition,
                partitions,
            });
        }
        return Ok(partition);
    }

    if let Some(key) = key {
        return Ok(key_partition(key.as_bytes(), partitions));
    }

    Ok((topic.next_round_robin() % partitions as usize) as i32)
}

pub fn key_partition(key: &[u8], partitions: i32) -> i32 {
    let hash = murmur2(key, KAFKA_SEED) & 0x7fff_ffff;
    (hash % partitions as u32) as i32
}
