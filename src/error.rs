use thiserror::Error;

pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("topic not found: {0}")]
    TopicNotFound(String),

    #[error("topic already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid partition {partition} for topic {topic} ({partitions} partitions)")]
    InvalidPartition {
        topic: String,
        partition: i32,
        partitions: i32,
    },

    #[error("partition {topic}-{partition} is full ({capacity} records)")]
    QueueFull {
        topic: String,
        partition: i32,
        capacity: usize,
    },

    #[error("consumer group not found: {0}")]
    GroupNotFound(String),

    #[error("member {member_id} is not part of group {group_id}")]
    UnknownMember { group_id: String, member_id: String },

    #[error("partition {topic}-{partition} is not assigned to {member_id} in group {group_id}")]
    NotAssigned {
        group_id: String,
        member_id: String,
        topic: String,
        partition: i32,
    },

    #[error("persistence write failed: {0}")]
    PersistenceWriteFailed(String),

    #[error("invalid {kind} name {name:?}")]
    InvalidName { kind: &'static str, name: String },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("group coordinator unavailable")]
    CoordinatorUnavailable,

    #[error("consumer is closed")]
    ConsumerClosed,

    #[error("recovery failed: {0}")]
    Recovery(String),
}

impl BusError {
    /// Failures that may succeed on a later attempt without caller changes.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BusError::TopicNotFound(_)
                | BusError::QueueFull { .. }
                | BusError::PersistenceWriteFailed(_)
                | BusError::CoordinatorUnavailable
        )
    }
}

impl From<std::io::Error> for BusError {
    fn from(e: std::io::Error) -> Self {
        BusError::PersistenceWriteFailed(e.to_string())
    }
}
