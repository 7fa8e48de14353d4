//! Execution audit trail: append-only records of every attempted operation.
//!
//! A run covers one top-level attempt; steps cover its granular
//! sub-operations (one message out of a bulk send, for instance). Rows are
//! never updated after creation; corrections are new rows. Field names here
//! round-trip to storage and the API unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::identity::TenantId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuditRunId(pub String);

impl std::fmt::Display for AuditRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    Partial,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Partial => "partial",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "partial" => Some(Self::Partial),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSource {
    Ai,
    Automation,
    Scheduler,
    Manual,
    Webhook,
}

impl RunSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::Automation => "automation",
            Self::Scheduler => "scheduler",
            Self::Manual => "manual",
            Self::Webhook => "webhook",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ai" => Some(Self::Ai),
            "automation" => Some(Self::Automation),
            "scheduler" => Some(Self::Scheduler),
            "manual" => Some(Self::Manual),
            "webhook" => Some(Self::Webhook),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    System,
    External,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
            Self::External => "external",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Self::User),
            "system" => Some(Self::System),
            "external" => Some(Self::External),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRun {
    pub id: AuditRunId,
    pub tenant_id: TenantId,
    pub occurred_at: DateTime<Utc>,
    pub operation_type: String,
    pub status: RunStatus,
    pub source: RunSource,
    pub actor_type: ActorType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Free-form reference to the subject of the run, e.g. a card id or an
    /// idempotency request id.
    pub reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counts: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStep {
    pub id: String,
    pub run_id: AuditRunId,
    pub occurred_at: DateTime<Utc>,
    pub status: StepStatus,
    pub target_type: String,
    pub target_id: String,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl AuditRun {
    pub fn new(
        tenant_id: TenantId,
        operation_type: impl Into<String>,
        status: RunStatus,
        source: RunSource,
        actor_type: ActorType,
        summary: impl Into<String>,
        reference: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AuditRunId(Uuid::new_v4().to_string()),
            tenant_id,
            occurred_at,
            operation_type: operation_type.into(),
            status,
            source,
            actor_type,
            actor_id: None,
            summary: summary.into(),
            details: None,
            reference: reference.into(),
            counts: None,
            error_code: None,
            duration_ms: None,
        }
    }

    pub fn with_actor_id(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_counts(mut self, counts: Value) -> Self {
        self.counts = Some(counts);
        self
    }

    pub fn with_error_code(mut self, error_code: impl Into<String>) -> Self {
        self.error_code = Some(error_code.into());
        self
    }
}

impl AuditStep {
    pub fn new(
        run_id: AuditRunId,
        status: StepStatus,
        target_type: impl Into<String>,
        target_id: impl Into<String>,
        summary: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            run_id,
            occurred_at,
            status,
            target_type: target_type.into(),
            target_id: target_id.into(),
            summary: summary.into(),
            details: None,
            error_code: None,
        }
    }

    pub fn with_error_code(mut self, error_code: impl Into<String>) -> Self {
        self.error_code = Some(error_code.into());
        self
    }
}

/// Filters accepted by the run-list query. All fields combine with AND;
/// `q` matches the summary or error code as a substring.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub status: Option<RunStatus>,
    pub operation_type: Option<String>,
    pub source: Option<RunSource>,
    pub q: Option<String>,
}

impl RunFilter {
    pub fn matches(&self, run: &AuditRun) -> bool {
        if let Some(from) = self.from {
            if run.occurred_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if run.occurred_at > to {
                return false;
            }
        }
        if let Some(status) = self.status {
            if run.status != status {
                return false;
            }
        }
        if let Some(operation_type) = &self.operation_type {
            if &run.operation_type != operation_type {
                return false;
            }
        }
        if let Some(source) = self.source {
            if run.source != source {
                return false;
            }
        }
        if let Some(q) = &self.q {
            let in_summary = run.summary.contains(q.as_str());
            let in_error = run.error_code.as_deref().is_some_and(|code| code.contains(q.as_str()));
            if !in_summary && !in_error {
                return false;
            }
        }
        true
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("malformed pagination cursor")]
pub struct CursorError;

/// Keyset-pagination cursor over `(occurred_at desc, id desc)`.
///
/// `occurred_at` alone is not unique under concurrent writes at the same
/// timestamp; the id tiebreak keeps pages stable. The token is the RFC 3339
/// timestamp and the id joined by a colon; ids are UUIDs and contain no
/// colon, so the last colon separates unambiguously.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cursor {
    pub occurred_at: DateTime<Utc>,
    pub id: String,
}

impl Cursor {
    pub fn after(run: &AuditRun) -> Self {
        Self { occurred_at: run.occurred_at, id: run.id.0.clone() }
    }

    pub fn after_step(step: &AuditStep) -> Self {
        Self { occurred_at: step.occurred_at, id: step.id.clone() }
    }

    pub fn encode(&self) -> String {
        format!("{}:{}", self.occurred_at.to_rfc3339(), self.id)
    }

    /// Decodes a caller-supplied token. Malformed tokens are rejected rather
    /// than treated as "no cursor" so a typo cannot silently restart paging.
    pub fn decode(token: &str) -> Result<Self, CursorError> {
        let (timestamp, id) = token.rsplit_once(':').ok_or(CursorError)?;
        if id.is_empty() {
            return Err(CursorError);
        }
        let occurred_at = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|_| CursorError)?
            .with_timezone(&Utc);
        Ok(Self { occurred_at, id: id.to_string() })
    }

    /// The next-page predicate for `(occurred_at desc, id desc)` ordering.
    pub fn admits(&self, occurred_at: DateTime<Utc>, id: &str) -> bool {
        occurred_at < self.occurred_at || (occurred_at == self.occurred_at && id < self.id.as_str())
    }
}

/// One page of results plus the token for the next page.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self { items: Vec::new(), next_cursor: None, has_more: false }
    }
}
