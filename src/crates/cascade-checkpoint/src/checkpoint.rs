//! Checkpoint records for one cascade run
//!
//! A cascade run is identified by the `(module, version)` pair it targets. Its
//! progress is captured by two record types:
//!
//! - [`Summary`] - aggregate state of the run (`summary.json`)
//! - [`ItemState`] - last known outcome for one dependent repository
//!   (`items/<sha256(repo)>.json`)
//!
//! All timestamps are held as `DateTime<Utc>`. Builder methods accept any
//! `chrono` time zone and convert on the way in, and decoding converts any
//! RFC 3339 offset to UTC, so a record never carries a local offset.
//!
//! Unset timestamps (`end_time` of a run still in progress, `last_updated` of
//! an item the manager has not stamped yet) are written as the zero timestamp
//! `0001-01-01T00:00:00Z` and read back as `None`.

use crate::error::ValidationError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Outcome of one dependent repository within a cascade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemStatus {
    /// Update landed (commit pushed, PR opened or merged)
    Completed,
    /// Needs a human before the cascade can continue for this repo
    ManualReview,
    /// Update failed
    Failed,
    /// Deliberately not touched
    Skipped,
}

impl ItemStatus {
    /// Every accepted status, in display order
    pub const ALL: [ItemStatus; 4] = [
        ItemStatus::Completed,
        ItemStatus::ManualReview,
        ItemStatus::Failed,
        ItemStatus::Skipped,
    ];

    /// Wire name of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::ManualReview => "manual-review",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Statuses callers must surface for human attention
    pub fn needs_attention(&self) -> bool {
        matches!(self, Self::ManualReview | Self::Failed)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ValidationError::InvalidStatus(s.to_string()))
    }
}

/// One command run against a repository, kept for the audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLog {
    pub command: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
}

impl CommandLog {
    pub fn new(command: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            output: output.into(),
            error: String::new(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = error.into();
        self
    }
}

/// Last known state of one dependent repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemState {
    pub repo: String,
    pub branch: String,
    pub status: ItemStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, with = "zero_time")]
    pub last_updated: Option<DateTime<Utc>>,
    /// Maintained by the store; whatever the caller sets is ignored on save.
    #[serde(default)]
    pub attempts: u32,
    /// Appended across saves, never replaced.
    #[serde(default)]
    pub command_logs: Vec<CommandLog>,
}

impl ItemState {
    pub fn new(repo: impl Into<String>, branch: impl Into<String>, status: ItemStatus) -> Self {
        Self {
            repo: repo.into(),
            branch: branch.into(),
            status,
            reason: String::new(),
            commit_hash: None,
            pr_url: None,
            last_updated: None,
            attempts: 0,
            command_logs: Vec::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_commit_hash(mut self, hash: impl Into<String>) -> Self {
        self.commit_hash = Some(hash.into());
        self
    }

    pub fn with_pr_url(mut self, url: impl Into<String>) -> Self {
        self.pr_url = Some(url.into());
        self
    }

    /// Set the update time, converting from any time zone to UTC
    pub fn with_last_updated<Tz: TimeZone>(mut self, at: DateTime<Tz>) -> Self {
        self.last_updated = Some(at.with_timezone(&Utc));
        self
    }

    pub fn with_command_log(mut self, log: CommandLog) -> Self {
        self.command_logs.push(log);
        self
    }

    pub fn with_command_logs(mut self, logs: impl IntoIterator<Item = CommandLog>) -> Self {
        self.command_logs.extend(logs);
        self
    }
}

/// Per-status tally of a summary's items
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub completed: usize,
    pub manual_review: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.completed + self.manual_review + self.failed + self.skipped
    }

    /// Items a human has to look at
    pub fn needing_attention(&self) -> usize {
        self.manual_review + self.failed
    }
}

/// Aggregate state of one cascade run against one `(module, version)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub module: String,
    pub version: String,
    pub start_time: DateTime<Utc>,
    /// `None` while the run is in progress
    #[serde(default, with = "zero_time")]
    pub end_time: Option<DateTime<Utc>>,
    /// Cascade-level retries; owned by the caller.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub items: Vec<ItemState>,
    /// Repositories the planner found already on the target version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_up_to_date: Option<Vec<String>>,
}

impl Summary {
    /// Start a summary for a run beginning at `started`
    pub fn new<Tz: TimeZone>(
        module: impl Into<String>,
        version: impl Into<String>,
        started: DateTime<Tz>,
    ) -> Self {
        Self {
            module: module.into(),
            version: version.into(),
            start_time: started.with_timezone(&Utc),
            end_time: None,
            retry_count: 0,
            items: Vec::new(),
            skipped_up_to_date: None,
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_skipped_up_to_date(mut self, repos: Vec<String>) -> Self {
        self.skipped_up_to_date = Some(repos);
        self
    }

    pub fn with_items(mut self, items: Vec<ItemState>) -> Self {
        self.items = items;
        self
    }

    /// Mark the run finished at `ended`
    pub fn finish<Tz: TimeZone>(&mut self, ended: DateTime<Tz>) {
        self.end_time = Some(ended.with_timezone(&Utc));
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn item(&self, repo: &str) -> Option<&ItemState> {
        self.items.iter().find(|item| item.repo == repo)
    }

    /// Replace the snapshot for `item.repo`, or append it if absent
    pub fn upsert_item(&mut self, item: ItemState) {
        match self.items.iter_mut().find(|existing| existing.repo == item.repo) {
            Some(existing) => *existing = item,
            None => self.items.push(item),
        }
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for item in &self.items {
            match item.status {
                ItemStatus::Completed => counts.completed += 1,
                ItemStatus::ManualReview => counts.manual_review += 1,
                ItemStatus::Failed => counts.failed += 1,
                ItemStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }
}

/// Serde adapter mapping `None` to the zero timestamp on disk
pub(crate) mod zero_time {
    use chrono::{DateTime, Utc};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub(crate) const ZERO_TIME: &str = "0001-01-01T00:00:00Z";

    // Unix timestamp of 0001-01-01T00:00:00Z
    const ZERO_UNIX_SECS: i64 = -62_135_596_800;

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(at) => at.serialize(serializer),
            None => serializer.serialize_str(ZERO_TIME),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Some(raw) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        let at = DateTime::parse_from_rfc3339(&raw)
            .map_err(D::Error::custom)?
            .with_timezone(&Utc);
        if at.timestamp() == ZERO_UNIX_SECS {
            Ok(None)
        } else {
            Ok(Some(at))
        }
    }
}
