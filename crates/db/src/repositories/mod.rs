use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use taskdeck_core::audit::{AuditRun, AuditRunId, AuditStep, Cursor, Page, RunFilter};
use taskdeck_core::cards::{TaskCard, TaskCardId};
use taskdeck_core::identity::TenantId;

pub mod audit;
pub mod card;
pub mod memory;

pub use audit::SqlAuditRepository;
pub use card::SqlCardRepository;
pub use memory::{InMemoryAuditRepository, InMemoryCardRepository};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Timestamps are stored as RFC 3339 text; anything else in the column is a
/// decode error, never a silently substituted value.
pub(crate) fn parse_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("bad {column}: {e}")))
}

#[async_trait]
pub trait CardRepository: Send + Sync {
    async fn find_by_id(
        &self,
        tenant_id: &TenantId,
        id: &TaskCardId,
    ) -> Result<Option<TaskCard>, RepositoryError>;

    /// Cards still worth showing: not executed, and either unexpired or
    /// created today.
    async fn list_active(
        &self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskCard>, RepositoryError>;

    /// Insert unless an equally-keyed live card already exists. Returns
    /// `true` when the card was stored, `false` when deduplicated.
    async fn upsert_with_dedup(&self, card: TaskCard) -> Result<bool, RepositoryError>;

    async fn save(&self, card: TaskCard) -> Result<(), RepositoryError>;

    /// Persist a card state change and its audit run atomically. Either
    /// both land or neither does.
    async fn save_with_run(&self, card: TaskCard, run: AuditRun) -> Result<(), RepositoryError>;

    async fn delete(&self, tenant_id: &TenantId, id: &TaskCardId)
        -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn record_run(&self, run: AuditRun) -> Result<(), RepositoryError>;

    async fn record_steps(&self, steps: Vec<AuditStep>) -> Result<(), RepositoryError>;

    async fn find_run(
        &self,
        tenant_id: &TenantId,
        id: &AuditRunId,
    ) -> Result<Option<AuditRun>, RepositoryError>;

    /// Look up a prior run by its request reference. Backs replay
    /// detection for approval and execution actions.
    async fn find_run_by_reference(
        &self,
        tenant_id: &TenantId,
        reference: &str,
    ) -> Result<Option<AuditRun>, RepositoryError>;

    async fn list_runs(
        &self,
        tenant_id: &TenantId,
        filter: &RunFilter,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Page<AuditRun>, RepositoryError>;

    async fn list_steps(
        &self,
        run_id: &AuditRunId,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Page<AuditStep>, RepositoryError>;
}
