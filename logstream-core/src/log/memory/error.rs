//! Error types of the in-memory log.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LogError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error("Unknown stream: {0}")]
    UnknownStream(String),

    #[error("Unknown partition: {0}")]
    UnknownPartition(String),

    #[error("Partition {partition} is already assigned in group {group}")]
    AlreadyAssigned { group: String, partition: String },

    #[error("Failed to append record: {0}")]
    Append(String),

    #[error("Failed to read records: {0}")]
    Read(String),

    #[error("Failed to commit offsets: {0}")]
    Commit(String),

    #[error("Tailer is closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            LogError::UnknownStream("s1".to_string()).to_string(),
            "Unknown stream: s1"
        );
        assert_eq!(
            LogError::AlreadyAssigned {
                group: "g".to_string(),
                partition: "s1-00".to_string()
            }
            .to_string(),
            "Partition s1-00 is already assigned in group g"
        );
        assert_eq!(LogError::Closed.to_string(), "Tailer is closed");
    }
}
