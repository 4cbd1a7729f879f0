//! Job status state machine.
//!
//! ```text
//! Pending -> Extracting -> Chunking -> Embedding -> Indexing -> Indexed
//!    any non-terminal state -> Failed(stage) -> DeadLettered
//!    Failed(stage) | in-flight stage -> Extracting   (next attempt)
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Processing stage a job is in, or failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Fetching the blob and extracting page text.
    Extracting,
    /// Splitting pages into chunks.
    Chunking,
    /// Producing embedding vectors.
    Embedding,
    /// Upserting chunks into the vector index.
    Indexing,
}

impl Stage {
    /// Stable lowercase name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Extracting => "extracting",
            Self::Chunking => "chunking",
            Self::Embedding => "embedding",
            Self::Indexing => "indexing",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "extracting" => Some(Self::Extracting),
            "chunking" => Some(Self::Chunking),
            "embedding" => Some(Self::Embedding),
            "indexing" => Some(Self::Indexing),
            _ => None,
        }
    }

    fn next(self) -> JobStatus {
        match self {
            Self::Extracting => JobStatus::Chunking,
            Self::Chunking => JobStatus::Embedding,
            Self::Embedding => JobStatus::Indexing,
            Self::Indexing => JobStatus::Indexed,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an ingestion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Published, not picked up yet.
    Pending,
    /// Stage 1.
    Extracting,
    /// Stage 2.
    Chunking,
    /// Stage 3.
    Embedding,
    /// Stage 4.
    Indexing,
    /// Terminal success.
    Indexed,
    /// The last attempt failed in the given stage.
    Failed(Stage),
    /// Terminal failure; the job was moved to the dead-letter destination.
    DeadLettered,
}

impl JobStatus {
    /// `Indexed` or `DeadLettered`.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Indexed | Self::DeadLettered)
    }

    /// Stage currently running, if any.
    pub const fn in_flight_stage(self) -> Option<Stage> {
        match self {
            Self::Extracting => Some(Stage::Extracting),
            Self::Chunking => Some(Stage::Chunking),
            Self::Embedding => Some(Stage::Embedding),
            Self::Indexing => Some(Stage::Indexing),
            _ => None,
        }
    }

    /// Status recorded while `stage` runs.
    pub const fn running(stage: Stage) -> Self {
        match stage {
            Stage::Extracting => Self::Extracting,
            Stage::Chunking => Self::Chunking,
            Stage::Embedding => Self::Embedding,
            Stage::Indexing => Self::Indexing,
        }
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Self::Failed(_)) => !matches!(self, Self::Failed(_)),
            (Self::Failed(_), Self::DeadLettered) => true,
            (Self::Pending | Self::Failed(_), Self::Extracting) => true,
            (current, Self::Extracting) => current.in_flight_stage().is_some(),
            (current, next) => current
                .in_flight_stage()
                .is_some_and(|stage| stage.next() == next),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Indexed => f.write_str("indexed"),
            Self::DeadLettered => f.write_str("dead_lettered"),
            Self::Failed(stage) => write!(f, "failed:{stage}"),
            running => match running.in_flight_stage() {
                Some(stage) => f.write_str(stage.as_str()),
                None => Ok(()),
            },
        }
    }
}

/// Unrecognized status string.
#[derive(Debug, thiserror::Error)]
#[error("unknown job status '{0}'")]
pub struct ParseStatusError(pub String);

impl FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = match s {
            "pending" => Some(Self::Pending),
            "indexed" => Some(Self::Indexed),
            "dead_lettered" => Some(Self::DeadLettered),
            other => match other.strip_prefix("failed:") {
                Some(stage) => Stage::parse(stage).map(Self::Failed),
                None => Stage::parse(other).map(Self::running),
            },
        };
        parsed.ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

impl Serialize for JobStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for JobStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
