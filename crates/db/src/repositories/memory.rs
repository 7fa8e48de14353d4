use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use taskdeck_core::audit::{AuditRun, AuditRunId, AuditStep, Cursor, Page, RunFilter};
use taskdeck_core::cards::{active_order, CardStatus, TaskCard, TaskCardId};
use taskdeck_core::identity::TenantId;

use super::{AuditRepository, CardRepository, RepositoryError};

/// Card store for tests. Keeps its own run log so `save_with_run` has
/// somewhere to put the audit half of the write; link an audit store when
/// the test also reads runs back through the audit surface.
#[derive(Default)]
pub struct InMemoryCardRepository {
    cards: RwLock<HashMap<String, TaskCard>>,
    runs: RwLock<Vec<AuditRun>>,
    audit_log: Option<Arc<InMemoryAuditRepository>>,
}

impl InMemoryCardRepository {
    /// Mirrors `save_with_run` writes into the given audit store, the way
    /// the SQL pair shares one database.
    pub fn linked(audit: Arc<InMemoryAuditRepository>) -> Self {
        Self { audit_log: Some(audit), ..Self::default() }
    }

    pub async fn recorded_runs(&self) -> Vec<AuditRun> {
        self.runs.read().await.clone()
    }
}

#[derive(Default)]
pub struct InMemoryAuditRepository {
    runs: RwLock<Vec<AuditRun>>,
    steps: RwLock<Vec<AuditStep>>,
}

#[async_trait::async_trait]
impl CardRepository for InMemoryCardRepository {
    async fn find_by_id(
        &self,
        tenant_id: &TenantId,
        id: &TaskCardId,
    ) -> Result<Option<TaskCard>, RepositoryError> {
        let cards = self.cards.read().await;
        Ok(cards.get(&id.0).filter(|c| &c.tenant_id == tenant_id).cloned())
    }

    async fn list_active(
        &self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskCard>, RepositoryError> {
        let cards = self.cards.read().await;
        let mut active: Vec<TaskCard> = cards
            .values()
            .filter(|c| &c.tenant_id == tenant_id && c.is_listed_active(now))
            .cloned()
            .collect();
        active.sort_by(active_order);
        Ok(active)
    }

    async fn upsert_with_dedup(&self, card: TaskCard) -> Result<bool, RepositoryError> {
        let mut cards = self.cards.write().await;
        if let Some(ref key) = card.dedup_key {
            let live_duplicate = cards.values().any(|c| {
                c.dedup_key.as_ref() == Some(key)
                    && matches!(c.status, CardStatus::Pending | CardStatus::Approved)
            });
            if live_duplicate {
                return Ok(false);
            }
        }
        cards.insert(card.id.0.clone(), card);
        Ok(true)
    }

    async fn save(&self, card: TaskCard) -> Result<(), RepositoryError> {
        let mut cards = self.cards.write().await;
        cards.insert(card.id.0.clone(), card);
        Ok(())
    }

    async fn save_with_run(&self, card: TaskCard, run: AuditRun) -> Result<(), RepositoryError> {
        {
            let mut cards = self.cards.write().await;
            let mut runs = self.runs.write().await;
            cards.insert(card.id.0.clone(), card);
            runs.push(run.clone());
        }
        if let Some(audit) = &self.audit_log {
            audit.record_run(run).await?;
        }
        Ok(())
    }

    async fn delete(
        &self,
        tenant_id: &TenantId,
        id: &TaskCardId,
    ) -> Result<(), RepositoryError> {
        let mut cards = self.cards.write().await;
        if cards.get(&id.0).is_some_and(|c| &c.tenant_id == tenant_id) {
            cards.remove(&id.0);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl AuditRepository for InMemoryAuditRepository {
    async fn record_run(&self, run: AuditRun) -> Result<(), RepositoryError> {
        let mut runs = self.runs.write().await;
        runs.push(run);
        Ok(())
    }

    async fn record_steps(&self, new_steps: Vec<AuditStep>) -> Result<(), RepositoryError> {
        let mut steps = self.steps.write().await;
        steps.extend(new_steps);
        Ok(())
    }

    async fn find_run(
        &self,
        tenant_id: &TenantId,
        id: &AuditRunId,
    ) -> Result<Option<AuditRun>, RepositoryError> {
        let runs = self.runs.read().await;
        Ok(runs.iter().find(|r| &r.id == id && &r.tenant_id == tenant_id).cloned())
    }

    async fn find_run_by_reference(
        &self,
        tenant_id: &TenantId,
        reference: &str,
    ) -> Result<Option<AuditRun>, RepositoryError> {
        let runs = self.runs.read().await;
        let mut matching: Vec<&AuditRun> = runs
            .iter()
            .filter(|r| &r.tenant_id == tenant_id && r.reference == reference)
            .collect();
        matching.sort_by(|a, b| {
            b.occurred_at.cmp(&a.occurred_at).then_with(|| b.id.0.cmp(&a.id.0))
        });
        Ok(matching.first().map(|r| (*r).clone()))
    }

    async fn list_runs(
        &self,
        tenant_id: &TenantId,
        filter: &RunFilter,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Page<AuditRun>, RepositoryError> {
        let runs = self.runs.read().await;
        let mut matching: Vec<AuditRun> = runs
            .iter()
            .filter(|r| &r.tenant_id == tenant_id && filter.matches(r))
            .filter(|r| cursor.map_or(true, |c| c.admits(r.occurred_at, &r.id.0)))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.occurred_at.cmp(&a.occurred_at).then_with(|| b.id.0.cmp(&a.id.0))
        });

        let has_more = matching.len() > limit;
        matching.truncate(limit);
        let next_cursor =
            if has_more { matching.last().map(|r| Cursor::after(r).encode()) } else { None };

        Ok(Page { items: matching, next_cursor, has_more })
    }

    async fn list_steps(
        &self,
        run_id: &AuditRunId,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Page<AuditStep>, RepositoryError> {
        let steps = self.steps.read().await;
        let mut matching: Vec<AuditStep> = steps
            .iter()
            .filter(|s| &s.run_id == run_id)
            .filter(|s| cursor.map_or(true, |c| c.admits(s.occurred_at, &s.id)))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.occurred_at.cmp(&a.occurred_at).then_with(|| b.id.cmp(&a.id))
        });

        let has_more = matching.len() > limit;
        matching.truncate(limit);
        let next_cursor =
            if has_more { matching.last().map(|s| Cursor::after_step(s).encode()) } else { None };

        Ok(Page { items: matching, next_cursor, has_more })
    }
}
