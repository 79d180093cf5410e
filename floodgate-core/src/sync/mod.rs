//! Synchronization queue: durable units of work mirroring customer and
//! touchpoint data into external systems, processed with retry and
//! exponential backoff.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, ErrorDetails};

pub mod handlers;
pub mod processor;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncSource {
    Shopify,
    Kajabi,
    Social,
}

impl SyncSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncSource::Shopify => "shopify",
            SyncSource::Kajabi => "kajabi",
            SyncSource::Social => "social",
        }
    }
}

impl std::fmt::Display for SyncSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shopify" => Ok(SyncSource::Shopify),
            "kajabi" => Ok(SyncSource::Kajabi),
            "social" => Ok(SyncSource::Social),
            _ => Err(Error::new(ErrorDetails::InvalidRequest {
                message: format!("unknown sync source `{s}`"),
            })),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
    Upsert,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Create => "create",
            SyncAction::Update => "update",
            SyncAction::Delete => "delete",
            SyncAction::Upsert => "upsert",
        }
    }
}

impl std::fmt::Display for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(SyncAction::Create),
            "update" => Ok(SyncAction::Update),
            "delete" => Ok(SyncAction::Delete),
            "upsert" => Ok(SyncAction::Upsert),
            _ => Err(Error::new(ErrorDetails::InvalidRequest {
                message: format!("unknown sync action `{s}`"),
            })),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Processing => "processing",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "processing" => Ok(SyncStatus::Processing),
            "completed" => Ok(SyncStatus::Completed),
            "failed" => Ok(SyncStatus::Failed),
            _ => Err(Error::new(ErrorDetails::InvalidRequest {
                message: format!("unknown sync status `{s}`"),
            })),
        }
    }
}

/// One unit of synchronization work.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SyncQueueItem {
    pub id: Uuid,
    pub source: SyncSource,
    pub action: SyncAction,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Value,
    /// Ascending priority: lower values are claimed first.
    pub priority: i32,
    pub status: SyncStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub scheduled_for: DateTime<Utc>,
    pub error_message: Option<String>,
    /// Set while `processing`; used to detect orphaned claims.
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_priority() -> i32 {
    100
}

fn default_max_retries() -> i32 {
    3
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct NewSyncQueueItem {
    pub source: SyncSource,
    pub action: SyncAction,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Value,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    /// Defaults to "now" (immediately due) when unset.
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// Backoff before the attempt after `retry_count` failures:
/// 5, 10, 20, 40, ... minutes. The shift is capped so pathological
/// `max_retries` values cannot overflow.
pub fn retry_delay(retry_count: i32) -> chrono::Duration {
    let exponent = retry_count.clamp(0, 16) as u32;
    chrono::Duration::minutes(5 * (1i64 << exponent))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles() {
        assert_eq!(retry_delay(0), chrono::Duration::minutes(5));
        assert_eq!(retry_delay(1), chrono::Duration::minutes(10));
        assert_eq!(retry_delay(2), chrono::Duration::minutes(20));
        assert_eq!(retry_delay(3), chrono::Duration::minutes(40));
    }

    #[test]
    fn test_retry_delay_strictly_increases() {
        for count in 0..16 {
            assert!(retry_delay(count + 1) > retry_delay(count));
        }
    }

    #[test]
    fn test_retry_delay_large_count_does_not_overflow() {
        assert_eq!(retry_delay(1000), retry_delay(16));
        assert!(retry_delay(1000) > chrono::Duration::zero());
    }

    #[test]
    fn test_source_round_trip() {
        for source in [SyncSource::Shopify, SyncSource::Kajabi, SyncSource::Social] {
            assert_eq!(source.as_str().parse::<SyncSource>().unwrap(), source);
        }
        assert!("woocommerce".parse::<SyncSource>().is_err());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            SyncStatus::Pending,
            SyncStatus::Processing,
            SyncStatus::Completed,
            SyncStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<SyncStatus>().unwrap(), status);
        }
    }
}
