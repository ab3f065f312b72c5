use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::try_join_all;
use log::{debug, info, warn};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{LogStore, OffsetSnapshot};
use crate::bus::broker::types::{MessageRecord, TopicPartition};
use crate::bus::topic::TopicMetadata;
use crate::error::{BusError, BusResult};

const TOPICS_DIR: &str = "topics";
const GROUPS_DIR: &str = "groups";
const TOPIC_METADATA_FILE: &str = "topic.json";

/// Directory-backed store.
///
/// ```text
/// <root>/topics/<topic>/topic.json
/// <root>/topics/<topic>/<partition>.log   one JSON record per line
/// <root>/topics/<topic>/<partition>.start first live offset after retention
/// <root>/groups/<group>.json              {"topic:partition": next_offset}
/// ```
pub struct FileLogStore {
    root: PathBuf,
    logs: DashMap<TopicPartition, Arc<Mutex<File>>>,
}

fn recovery_err(path: &Path, e: impl std::fmt::Display) -> BusError {
    BusError::Recovery(format!("{}: {}", path.display(), e))
}

fn encode_err(e: serde_json::Error) -> BusError {
    BusError::PersistenceWriteFailed(e.to_string())
}

/// Write-then-rename so a crash never leaves a half-written file.
async fn replace_file(path: &Path, content: &[u8]) -> BusResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let mut file = File::create(&tmp).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await?;
    Ok(())
}

impl FileLogStore {
    pub async fn open(root: impl Into<PathBuf>) -> BusResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(TOPICS_DIR)).await?;
        fs::create_dir_all(root.join(GROUPS_DIR)).await?;
        info!("Opened log store at {}", root.display());
        Ok(Self {
            root,
            logs: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn topic_dir(&self, topic: &str) -> PathBuf {
        self.root.join(TOPICS_DIR).join(topic)
    }

    pub fn partition_path(&self, topic: &str, partition: i32) -> PathBuf {
        self.topic_dir(topic).join(format!("{}.log", partition))
    }

    pub fn log_start_path(&self, topic: &str, partition: i32) -> PathBuf {
        self.topic_dir(topic).join(format!("{}.start", partition))
    }

    pub fn offsets_path(&self, group_id: &str) -> PathBuf {
        self.root.join(GROUPS_DIR).join(format!("{}.json", group_id))
    }

    async fn log_file(&self, tp: &TopicPartition) -> BusResult<Arc<Mutex<File>>> {
        if let Some(file) = self.logs.get(tp) {
            return Ok(file.value().clone());
        }
        let path = self.partition_path(&tp.topic, tp.partition);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        debug!("Opened partition log {}", path.display());
        // Keep whichever handle got registered first.
        let file = self
            .logs
            .entry(tp.clone())
            .or_insert_with(|| Arc::new(Mutex::new(file)))
            .value()
            .clone();
        Ok(file)
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    async fn create_topic(&self, metadata: &TopicMetadata) -> BusResult<()> {
        let dir = self.topic_dir(&metadata.name);
        fs::create_dir_all(&dir).await?;
        let content = serde_json::to_vec_pretty(metadata).map_err(encode_err)?;

        // An existing definition still owns its partition logs; a second one
        // would hand out offsets those logs already contain.
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(TOPIC_METADATA_FILE))
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(BusError::AlreadyExists(metadata.name.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(&content).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn append(&self, record: &MessageRecord) -> BusResult<()> {
        let mut line = serde_json::to_vec(record).map_err(encode_err)?;
        line.push(b'\n');

        let file = self.log_file(&record.topic_partition()).await?;
        let mut file = file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn write_offsets(&self, group_id: &str, offsets: &OffsetSnapshot) -> BusResult<()> {
        let snapshot: BTreeMap<String, i64> = offsets
            .iter()
            .map(|(tp, offset)| (tp.to_string(), *offset))
            .collect();
        let content = serde_json::to_vec_pretty(&snapshot).map_err(encode_err)?;
        replace_file(&self.offsets_path(group_id), &content).await
    }

    /// Writes the new start first, then compacts the log. A crash in between
    /// leaves stale lines that `Bus::recover` skips using the start file.
    /// Callers hold the partition lock, so no append races the rewrite.
    async fn truncate_before(&self, tp: &TopicPartition, log_start_offset: i64) -> BusResult<()> {
        let start = serde_json::to_vec(&log_start_offset).map_err(encode_err)?;
        replace_file(&self.log_start_path(&tp.topic, tp.partition), &start).await?;

        let path = self.partition_path(&tp.topic, tp.partition);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut kept = String::with_capacity(content.len());
        let mut dropped = 0;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<MessageRecord>(line) {
                Ok(record) if record.offset < log_start_offset => dropped += 1,
                // Unreadable lines stay for recovery to judge.
                _ => {
                    kept.push_str(line);
                    kept.push('\n');
                }
            }
        }
        if dropped == 0 {
            return Ok(());
        }

        // The cached append handle would keep writing to the replaced file.
        self.logs.remove(tp);
        replace_file(&path, kept.as_bytes()).await?;
        debug!(
            "Compacted {}: dropped {} records below offset {}",
            path.display(),
            dropped,
            log_start_offset
        );
        Ok(())
    }

    async fn load_topics(&self) -> BusResult<Vec<TopicMetadata>> {
        let dir = self.root.join(TOPICS_DIR);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(recovery_err(&dir, e)),
        };

        let mut topics = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| recovery_err(&dir, e))? {
            let path = entry.path().join(TOPIC_METADATA_FILE);
            match fs::read(&path).await {
                Ok(content) => {
                    let metadata: TopicMetadata =
                        serde_json::from_slice(&content).map_err(|e| recovery_err(&path, e))?;
                    topics.push(metadata);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    warn!("Skipping {} without topic metadata", entry.path().display());
                }
                Err(e) => return Err(recovery_err(&path, e)),
            }
        }
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(topics)
    }

    async fn load_partition(&self, topic: &str, partition: i32) -> BusResult<Vec<MessageRecord>> {
        let path = self.partition_path(topic, partition);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(recovery_err(&path, e)),
        };

        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut records = Vec::with_capacity(lines.len());
        let mut torn_tail = false;
        for (idx, line) in lines.iter().enumerate() {
            match serde_json::from_str::<MessageRecord>(line) {
                Ok(record) => records.push(record),
                // A crash mid-append leaves at most one partial line at the end.
                Err(e) if idx + 1 == lines.len() => {
                    warn!("Dropping partial record at end of {}: {}", path.display(), e);
                    torn_tail = true;
                }
                Err(e) => return Err(recovery_err(&path, format!("line {}: {}", idx + 1, e))),
            }
        }

        if torn_tail || (!content.is_empty() && !content.ends_with('\n')) {
            let mut repaired = String::with_capacity(content.len());
            for line in lines.iter().take(records.len()) {
                repaired.push_str(line);
                repaired.push('\n');
            }
            fs::write(&path, repaired).await.map_err(|e| recovery_err(&path, e))?;
        }

        debug!("Loaded {} records from {}", records.len(), path.display());
        Ok(records)
    }

    async fn load_log_start(&self, topic: &str, partition: i32) -> BusResult<i64> {
        let path = self.log_start_path(topic, partition);
        match fs::read(&path).await {
            Ok(content) => serde_json::from_slice(&content).map_err(|e| recovery_err(&path, e)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(recovery_err(&path, e)),
        }
    }

    async fn load_offsets(&self) -> BusResult<BTreeMap<String, OffsetSnapshot>> {
        let dir = self.root.join(GROUPS_DIR);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(recovery_err(&dir, e)),
        };

        let mut groups = BTreeMap::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| recovery_err(&dir, e))? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(group_id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let content = fs::read(&path).await.map_err(|e| recovery_err(&path, e))?;
            let raw: BTreeMap<String, i64> =
                serde_json::from_slice(&content).map_err(|e| recovery_err(&path, e))?;
            let mut snapshot = OffsetSnapshot::new();
            for (key, offset) in raw {
                let tp = key
                    .parse::<TopicPartition>()
                    .map_err(|e| recovery_err(&path, e))?;
                snapshot.insert(tp, offset);
            }
            groups.insert(group_id.to_string(), snapshot);
        }
        Ok(groups)
    }

    async fn flush(&self) -> BusResult<()> {
        let files: Vec<Arc<Mutex<File>>> =
            self.logs.iter().map(|entry| entry.value().clone()).collect();
        try_join_all(files.iter().map(|file| async move {
            let mut file = file.lock().await;
            file.flush().await?;
            file.sync_all().await
        }))
        .await?;
        debug!("Flushed {} partition logs", files.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::bus::broker::types::Headers;
    use crate::config::TopicConfig;

    fn record(topic: &str, partition: i32, offset: i64, value: &str) -> MessageRecord {
        MessageRecord {
            offset,
            topic: topic.to_string(),
            partition,
            key: None,
            value: value.as_bytes().to_vec(),
            headers: Headers::new(),
            timestamp: Utc::now(),
            producer_id: "p".to_string(),
        }
    }

    #[tokio::test]
    async fn test_append_and_load_partition() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLogStore::open(dir.path()).await.unwrap();
        for offset in 0..3 {
            store
                .append(&record("orders", 1, offset, &format!("v{offset}")))
                .await
                .unwrap();
        }
        store.flush().await.unwrap();

        let loaded = store.load_partition("orders", 1).await.unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[2].value_str(), Some("v2"));
        assert!(store.load_partition("orders", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_topic_metadata_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLogStore::open(dir.path()).await.unwrap();
        let metadata = TopicMetadata {
            name: "orders".to_string(),
            partitions: 3,
            config: TopicConfig::default().with_max_partition_records(10),
            created_at: Utc::now(),
        };
        store.create_topic(&metadata).await.unwrap();
        assert_eq!(store.load_topics().await.unwrap(), vec![metadata]);
    }

    #[tokio::test]
    async fn test_topic_defined_twice() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLogStore::open(dir.path()).await.unwrap();
        let metadata = TopicMetadata {
            name: "orders".to_string(),
            partitions: 1,
            config: TopicConfig::default(),
            created_at: Utc::now(),
        };
        store.create_topic(&metadata).await.unwrap();

        let redefined = TopicMetadata {
            partitions: 4,
            ..metadata.clone()
        };
        assert_eq!(
            store.create_topic(&redefined).await,
            Err(BusError::AlreadyExists("orders".to_string()))
        );
        assert_eq!(store.load_topics().await.unwrap(), vec![metadata]);
    }

    #[tokio::test]
    async fn test_truncate_before_compacts_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLogStore::open(dir.path()).await.unwrap();
        let tp = TopicPartition::new("orders", 0);
        for offset in 0..5 {
            store
                .append(&record("orders", 0, offset, &format!("v{offset}")))
                .await
                .unwrap();
        }
        assert_eq!(store.load_log_start("orders", 0).await.unwrap(), 0);

        store.truncate_before(&tp, 3).await.unwrap();
        assert_eq!(store.load_log_start("orders", 0).await.unwrap(), 3);
        let offsets: Vec<i64> = store
            .load_partition("orders", 0)
            .await
            .unwrap()
            .iter()
            .map(|r| r.offset)
            .collect();
        assert_eq!(offsets, vec![3, 4]);

        // Appends after compaction land in the rewritten file.
        store.append(&record("orders", 0, 5, "v5")).await.unwrap();
        let loaded = store.load_partition("orders", 0).await.unwrap();
        assert_eq!(loaded.last().map(|r| r.offset), Some(5));
        assert_eq!(loaded.len(), 3);
    }

    #[tokio::test]
    async fn test_truncate_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLogStore::open(dir.path()).await.unwrap();
        for offset in 0..2 {
            store.append(&record("t", 0, offset, "v")).await.unwrap();
        }
        store.truncate_before(&TopicPartition::new("t", 0), 2).await.unwrap();
        assert!(store.load_partition("t", 0).await.unwrap().is_empty());
        assert_eq!(store.load_log_start("t", 0).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_partial_tail_is_dropped_and_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLogStore::open(dir.path()).await.unwrap();
        store.append(&record("t", 0, 0, "ok")).await.unwrap();
        drop(store);

        let store = FileLogStore::open(dir.path()).await.unwrap();
        let path = store.partition_path("t", 0);
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"offset\":1,\"top");
        std::fs::write(&path, content).unwrap();

        let loaded = store.load_partition("t", 0).await.unwrap();
        assert_eq!(loaded.len(), 1);

        store.append(&record("t", 0, 1, "next")).await.unwrap();
        let loaded = store.load_partition("t", 0).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].offset, 1);
    }

    #[tokio::test]
    async fn test_corrupt_middle_line_fails_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLogStore::open(dir.path()).await.unwrap();
        let path = store.partition_path("t", 0);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let good = serde_json::to_string(&record("t", 0, 1, "b")).unwrap();
        std::fs::write(&path, format!("garbage\n{good}\n")).unwrap();

        assert!(matches!(
            store.load_partition("t", 0).await,
            Err(BusError::Recovery(_))
        ));
    }

    #[tokio::test]
    async fn test_offset_snapshot_format() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLogStore::open(dir.path()).await.unwrap();
        let mut offsets = OffsetSnapshot::new();
        offsets.insert(TopicPartition::new("orders", 0), 5);
        offsets.insert(TopicPartition::new("orders", 2), 9);
        store.write_offsets("g1", &offsets).await.unwrap();

        let raw: BTreeMap<String, i64> =
            serde_json::from_slice(&std::fs::read(store.offsets_path("g1")).unwrap()).unwrap();
        assert_eq!(raw.get("orders:0"), Some(&5));
        assert_eq!(raw.get("orders:2"), Some(&9));

        offsets.insert(TopicPartition::new("orders", 0), 6);
        store.write_offsets("g1", &offsets).await.unwrap();

        let loaded = store.load_offsets().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["g1"][&TopicPartition::new("orders", 0)], 6);
    }
}
