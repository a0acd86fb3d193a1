//! Core data models for VibeVault.
//!
//! These types are shared across all VibeVault crates and represent the
//! domain entities the enrichment pipeline reads and writes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{Error, Result};

// =============================================================================
// LINK TYPES
// =============================================================================

/// Enrichment state of a link as surfaced to the UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentStatus {
    #[default]
    Pending,
    Ready,
    Failed,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::Pending => "pending",
            EnrichmentStatus::Ready => "ready",
            EnrichmentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for EnrichmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrichmentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(EnrichmentStatus::Pending),
            "ready" => Ok(EnrichmentStatus::Ready),
            "failed" => Ok(EnrichmentStatus::Failed),
            other => Err(Error::Serialization(format!(
                "unknown enrichment status: {other}"
            ))),
        }
    }
}

/// A saved link owned by a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub id: Uuid,
    pub user_id: Uuid,
    pub url: String,
    pub normalized_url: String,
    pub domain: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub note: Option<String>,
    pub image: Option<String>,
    pub favicon: Option<String>,
    pub site_name: Option<String>,
    pub published_time: Option<DateTime<Utc>>,
    pub enrichment_status: EnrichmentStatus,
    pub enrichment_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to save a new link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateLinkRequest {
    pub user_id: Uuid,
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub note: Option<String>,
}

impl CreateLinkRequest {
    pub fn new(user_id: Uuid, url: impl Into<String>) -> Self {
        Self {
            user_id,
            url: url.into(),
            title: None,
            description: None,
            note: None,
        }
    }
}

/// Display metadata extracted from a page.
///
/// Every text field is either a trimmed, non-empty string or `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub title: Option<String>,
    pub description: Option<String>,
    pub site_name: Option<String>,
    pub image: Option<String>,
    pub favicon: Option<String>,
    pub published_time: Option<DateTime<Utc>>,
}

impl MetadataRecord {
    /// True when nothing at all was extracted.
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.site_name.is_none()
            && self.image.is_none()
            && self.favicon.is_none()
            && self.published_time.is_none()
    }
}

/// Write-back of enrichment results onto a link.
///
/// When `metadata` is present its fields replace the stored ones; absent
/// fields keep whatever the link already had (e.g. a user-supplied title).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMetadataUpdate {
    pub metadata: Option<MetadataRecord>,
    pub enrichment_status: EnrichmentStatus,
    pub enrichment_error: Option<String>,
}

impl LinkMetadataUpdate {
    pub fn ready(metadata: MetadataRecord) -> Self {
        Self {
            metadata: Some(metadata),
            enrichment_status: EnrichmentStatus::Ready,
            enrichment_error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            metadata: None,
            enrichment_status: EnrichmentStatus::Failed,
            enrichment_error: Some(error.into()),
        }
    }
}

// =============================================================================
// JOB TYPES
// =============================================================================

/// Lifecycle state of a job.
///
/// `queued → running → {completed | failed}`. A running job returns to
/// `queued` only through the retry policy or lease reconciliation; finished
/// jobs return to `queued` only through an explicit re-queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Whether the runner has finished with this job.
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::Serialization(format!("unknown job status: {other}"))),
        }
    }
}

/// Tag identifying which handler processes a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Fetch a link's page and extract display metadata.
    FetchMetadata,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::FetchMetadata => "fetch_metadata",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fetch_metadata" => Ok(JobType::FetchMetadata),
            other => Err(Error::Serialization(format!("unknown job type: {other}"))),
        }
    }
}

/// Payload of a metadata fetch job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchMetadataPayload {
    pub link_id: Uuid,
    pub url: String,
}

/// A job's kind together with its strongly-typed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum JobKind {
    FetchMetadata(FetchMetadataPayload),
}

impl JobKind {
    pub fn fetch_metadata(link_id: Uuid, url: impl Into<String>) -> Self {
        JobKind::FetchMetadata(FetchMetadataPayload {
            link_id,
            url: url.into(),
        })
    }

    pub fn job_type(&self) -> JobType {
        match self {
            JobKind::FetchMetadata(_) => JobType::FetchMetadata,
        }
    }

    /// Link this job enriches.
    pub fn link_id(&self) -> Uuid {
        match self {
            JobKind::FetchMetadata(p) => p.link_id,
        }
    }

    /// The payload alone, as stored next to the `job_type` column.
    pub fn payload_json(&self) -> Result<JsonValue> {
        match self {
            JobKind::FetchMetadata(p) => Ok(serde_json::to_value(p)?),
        }
    }

    /// Rebuild a kind from its stored `job_type` tag and payload.
    pub fn from_parts(job_type: &str, payload: JsonValue) -> Result<Self> {
        match job_type.parse::<JobType>()? {
            JobType::FetchMetadata => Ok(JobKind::FetchMetadata(serde_json::from_value(payload)?)),
        }
    }
}

/// A persisted enrichment job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub user_id: Uuid,
    pub link_id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Number of claims so far. Incremented exactly once per claim.
    pub attempts: i32,
    pub last_error: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Earliest time a queued job may be claimed.
    pub available_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn job_type(&self) -> JobType {
        self.kind.job_type()
    }
}

/// Job store counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
}
