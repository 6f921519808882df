use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of one `(job, stage)` lifecycle entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Known but never started
    #[default]
    Pending,
    /// An attempt is running
    Processing,
    /// Stage finished successfully
    Completed,
    /// Last attempt failed, another attempt is scheduled
    Error,
    /// Attempt budget spent or fatal failure
    Failed,
}

impl StageStatus {
    /// Check if this is a terminal state (no further attempts expected)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Check if an attempt is in progress
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid stage status: {s}")),
        }
    }
}

/// Denormalized status of a whole job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Processing,
    Completed,
    /// A stage failed and will be retried
    Error,
    /// A stage failed permanently
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_status_terminal_check() {
        assert!(StageStatus::Completed.is_terminal());
        assert!(StageStatus::Failed.is_terminal());
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::Processing.is_terminal());
        assert!(!StageStatus::Error.is_terminal());
        assert!(StageStatus::Processing.is_active());
    }

    #[test]
    fn test_status_string_conversion() {
        assert_eq!(StageStatus::Processing.to_string(), "processing");
        assert_eq!("failed".parse::<StageStatus>().unwrap(), StageStatus::Failed);
        assert!("in_progress".parse::<StageStatus>().is_err());

        assert_eq!(JobStatus::Queued.to_string(), "queued");
        assert_eq!("error".parse::<JobStatus>().unwrap(), JobStatus::Error);
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&StageStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");

        let parsed: JobStatus = serde_json::from_str("\"processing\"").unwrap();
        assert_eq!(parsed, JobStatus::Processing);
    }
}
