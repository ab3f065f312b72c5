use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, error, warn};

use crate::bus::broker::Bus;
use crate::bus::broker::types::{Headers, RecordMetadata};
use crate::config::ProducerConfig;
use crate::error::{BusError, BusResult};

/// Routing and metadata for one outgoing record.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub key: Option<String>,
    pub headers: Headers,
    /// Explicit partition; overrides the key hash.
    pub partition: Option<i32>,
}

impl SendOptions {
    pub fn keyed(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn to_partition(partition: i32) -> Self {
        Self {
            partition: Some(partition),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ProducerRecord {
    pub value: Vec<u8>,
    pub options: SendOptions,
}

impl ProducerRecord {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: value.into(),
            options: SendOptions::default(),
        }
    }

    pub fn keyed(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: value.into(),
            options: SendOptions::keyed(key),
        }
    }

    pub fn with_options(mut self, options: SendOptions) -> Self {
        self.options = options;
        self
    }
}

/// Outcome of `send_batch`. Failed records carry their index in the input.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub results: Vec<RecordMetadata>,
    pub errors: Vec<(usize, BusError)>,
}

impl BatchResult {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub sent: u64,
    pub failed: u64,
    pub attempts: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    failed: AtomicU64,
    attempts: AtomicU64,
}

/// Publishes records into a bus. Holds no partition state of its own.
#[derive(Clone)]
pub struct Producer {
    id: String,
    config: ProducerConfig,
    bus: Arc<Bus>,
    counters: Arc<Counters>,
}

impl Producer {
    pub(crate) fn new(bus: Arc<Bus>, id: String, config: ProducerConfig) -> Self {
        Self {
            id,
            config,
            bus,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    pub fn stats(&self) -> ProducerStats {
        ProducerStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            attempts: self.counters.attempts.load(Ordering::Relaxed),
        }
    }

    /// Appends one record and returns where it landed.
    ///
    /// Every failure is retried with a fixed delay until `max_retries` attempts
    /// are used up; the last error is returned.
    pub async fn send(
        &self,
        topic: &str,
        value: impl Into<Vec<u8>>,
        options: SendOptions,
    ) -> BusResult<RecordMetadata> {
        let value = value.into();
        let attempts = self.config.attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);

            match self.bus.append(topic, &self.id, &value, &options).await {
                Ok(metadata) => {
                    self.counters.sent.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Producer {} sent to {}-{} at offset {}",
                        self.id, metadata.topic, metadata.partition, metadata.offset
                    );
                    return Ok(metadata);
                }
                Err(e) if attempt < attempts => {
                    if e.is_retriable() {
                        warn!(
                            "Producer {} send to {} failed (attempt {}/{}): {}",
                            self.id, topic, attempt, attempts, e
                        );
                    } else {
                        warn!(
                            "Producer {} send to {} rejected (attempt {}/{}), retry unlikely to help: {}",
                            self.id, topic, attempt, attempts, e
                        );
                    }
                    if !self.config.retry_delay().is_zero() {
                        tokio::time::sleep(self.config.retry_delay()).await;
                    }
                }
                Err(e) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "Producer {} giving up on {} after {} attempts: {}",
                        self.id, topic, attempt, e
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Sends each record in order. A failure does not undo earlier appends.
    pub async fn send_batch(&self, topic: &str, records: Vec<ProducerRecord>) -> BatchResult {
        let mut outcome = BatchResult::default();
        for (idx, record) in records.into_iter().enumerate() {
            match self.send(topic, record.value, record.options).await {
                Ok(metadata) => outcome.results.push(metadata),
                Err(e) => outcome.errors.push((idx, e)),
            }
        }
        outcome
    }
}
