use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Cancelling,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Partial | Self::Failed | Self::Cancelled
        )
    }

    /// Actions a client may take in this state. `retry` additionally
    /// requires at least one failed item; the runtime checks that.
    pub fn allowed_actions(self) -> &'static [&'static str] {
        match self {
            Self::Pending => &["cancel", "delete"],
            Self::Running => &["cancel"],
            Self::Cancelling => &[],
            Self::Completed | Self::Partial | Self::Failed | Self::Cancelled => {
                &["retry", "delete"]
            }
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "cancelling" => Ok(Self::Cancelling),
            "completed" => Ok(Self::Completed),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(anyhow::anyhow!("invalid job status")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Scheduled,
    Api,
}

impl TriggerType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
            Self::Api => "api",
        }
    }
}

impl std::str::FromStr for TriggerType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "scheduled" => Ok(Self::Scheduled),
            "api" => Ok(Self::Api),
            _ => Err(anyhow::anyhow!("invalid trigger type")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Processing,
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemResult {
    pub source_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_count: u32,
    /// Task-specific metrics (e.g. per-mount index rebuild counters).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

/// Progress counters for a job. Fields only ever grow; the runtime guards
/// monotonicity when merging updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStats {
    pub total_items: u64,
    pub processed_items: u64,
    pub success_count: u64,
    pub failed_count: u64,
    pub skipped_count: u64,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    #[serde(default)]
    pub item_results: Vec<ItemResult>,
}

impl JobStats {
    /// Merge `update` in, never letting counters move backwards.
    pub fn absorb(&mut self, update: JobStats) {
        self.total_items = self.total_items.max(update.total_items);
        self.processed_items = self.processed_items.max(update.processed_items);
        self.success_count = self.success_count.max(update.success_count);
        self.failed_count = self.failed_count.max(update.failed_count);
        self.skipped_count = self.skipped_count.max(update.skipped_count);
        self.bytes_transferred = self.bytes_transferred.max(update.bytes_transferred);
        self.total_bytes = self.total_bytes.max(update.total_bytes);
        if update.item_results.len() > self.item_results.len() {
            self.item_results = update.item_results;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{JobStats, JobStatus};

    #[test]
    fn terminal_states_are_final() {
        for status in ["completed", "partial", "failed", "cancelled"] {
            let status: JobStatus = status.parse().unwrap();
            assert!(status.is_terminal());
        }
        for status in ["pending", "running", "cancelling"] {
            let status: JobStatus = status.parse().unwrap();
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn allowed_actions_per_state() {
        assert_eq!(JobStatus::Pending.allowed_actions(), ["cancel", "delete"]);
        assert_eq!(JobStatus::Running.allowed_actions(), ["cancel"]);
        assert!(JobStatus::Cancelling.allowed_actions().is_empty());
        assert_eq!(JobStatus::Failed.allowed_actions(), ["retry", "delete"]);
    }

    #[test]
    fn absorb_is_monotonic() {
        let mut stats = JobStats {
            processed_items: 5,
            ..Default::default()
        };
        stats.absorb(JobStats {
            processed_items: 3,
            success_count: 2,
            ..Default::default()
        });
        assert_eq!(stats.processed_items, 5);
        assert_eq!(stats.success_count, 2);
    }
}
