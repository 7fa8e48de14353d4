use chrono::{DateTime, Utc};
use sqlx::Row;

use taskdeck_core::audit::AuditRun;
use taskdeck_core::cards::{CardStatus, SuggestedAction, TaskCard, TaskCardId, TaskType};
use taskdeck_core::identity::TenantId;

use super::{parse_timestamp, CardRepository, RepositoryError};
use crate::repositories::audit::insert_run;
use crate::DbPool;

pub struct SqlCardRepository {
    pool: DbPool,
}

impl SqlCardRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const CARD_COLUMNS: &str = "id, tenant_id, entity_type, entity_id, task_type, status, priority,
                    title, description, dedup_key, suggested_action, source,
                    expires_at, created_at, updated_at";

fn row_to_card(row: &sqlx::sqlite::SqliteRow) -> Result<TaskCard, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let tenant_id: String =
        row.try_get("tenant_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let entity_type: String =
        row.try_get("entity_type").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let entity_id: String =
        row.try_get("entity_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let task_type_str: String =
        row.try_get("task_type").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let status_str: String =
        row.try_get("status").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let priority: i64 =
        row.try_get("priority").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let title: String =
        row.try_get("title").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let description: Option<String> =
        row.try_get("description").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let dedup_key: Option<String> =
        row.try_get("dedup_key").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let suggested_action_str: Option<String> =
        row.try_get("suggested_action").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let source: String =
        row.try_get("source").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let expires_at_str: Option<String> =
        row.try_get("expires_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at_str: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let updated_at_str: String =
        row.try_get("updated_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let task_type = TaskType::parse(&task_type_str)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown task_type: {task_type_str}")))?;
    let status = CardStatus::parse(&status_str)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown status: {status_str}")))?;
    let suggested_action: Option<SuggestedAction> = suggested_action_str
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let created_at = parse_timestamp("created_at", &created_at_str)?;
    let updated_at = parse_timestamp("updated_at", &updated_at_str)?;
    let expires_at = expires_at_str
        .as_deref()
        .map(|s| parse_timestamp("expires_at", s))
        .transpose()?;

    Ok(TaskCard {
        id: TaskCardId(id),
        tenant_id: TenantId(tenant_id),
        entity_type,
        entity_id,
        task_type,
        status,
        priority: priority.clamp(0, 100) as u8,
        title,
        description,
        dedup_key,
        suggested_action,
        source,
        expires_at,
        created_at,
        updated_at,
    })
}

fn encode_action(action: &Option<SuggestedAction>) -> Result<Option<String>, RepositoryError> {
    action
        .as_ref()
        .map(|a| serde_json::to_string(a))
        .transpose()
        .map_err(|e| RepositoryError::Decode(e.to_string()))
}

async fn upsert_card<'e, E>(executor: E, card: &TaskCard) -> Result<(), RepositoryError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let action_str = encode_action(&card.suggested_action)?;
    let expires_at_str = card.expires_at.map(|dt| dt.to_rfc3339());

    sqlx::query(
        "INSERT INTO task_cards (id, tenant_id, entity_type, entity_id, task_type, status,
                                 priority, title, description, dedup_key, suggested_action,
                                 source, expires_at, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
             status = excluded.status,
             priority = excluded.priority,
             title = excluded.title,
             description = excluded.description,
             dedup_key = excluded.dedup_key,
             suggested_action = excluded.suggested_action,
             expires_at = excluded.expires_at,
             updated_at = excluded.updated_at",
    )
    .bind(&card.id.0)
    .bind(&card.tenant_id.0)
    .bind(&card.entity_type)
    .bind(&card.entity_id)
    .bind(card.task_type.as_str())
    .bind(card.status.as_str())
    .bind(i64::from(card.priority))
    .bind(&card.title)
    .bind(&card.description)
    .bind(&card.dedup_key)
    .bind(&action_str)
    .bind(&card.source)
    .bind(&expires_at_str)
    .bind(card.created_at.to_rfc3339())
    .bind(card.updated_at.to_rfc3339())
    .execute(executor)
    .await?;

    Ok(())
}

#[async_trait::async_trait]
impl CardRepository for SqlCardRepository {
    async fn find_by_id(
        &self,
        tenant_id: &TenantId,
        id: &TaskCardId,
    ) -> Result<Option<TaskCard>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {CARD_COLUMNS} FROM task_cards WHERE tenant_id = ? AND id = ?",
        ))
        .bind(&tenant_id.0)
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_card(r)?)),
            None => Ok(None),
        }
    }

    async fn list_active(
        &self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskCard>, RepositoryError> {
        // Cards created today stay listed even past their nominal expiry.
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(&format!(
            "SELECT {CARD_COLUMNS}
             FROM task_cards
             WHERE tenant_id = ?
               AND status != 'executed'
               AND (expires_at IS NULL OR expires_at > ? OR date(created_at) = date(?))
             ORDER BY priority DESC, created_at DESC, id DESC",
        ))
        .bind(&tenant_id.0)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_card).collect::<Result<Vec<_>, _>>()
    }

    async fn upsert_with_dedup(&self, card: TaskCard) -> Result<bool, RepositoryError> {
        let action_str = encode_action(&card.suggested_action)?;
        let expires_at_str = card.expires_at.map(|dt| dt.to_rfc3339());

        // The partial unique index on dedup_key only covers live cards, so
        // DO NOTHING drops the insert exactly when a pending or approved
        // duplicate exists.
        let result = sqlx::query(
            "INSERT INTO task_cards (id, tenant_id, entity_type, entity_id, task_type, status,
                                     priority, title, description, dedup_key, suggested_action,
                                     source, expires_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(dedup_key)
                 WHERE dedup_key IS NOT NULL AND status IN ('pending', 'approved')
                 DO NOTHING",
        )
        .bind(&card.id.0)
        .bind(&card.tenant_id.0)
        .bind(&card.entity_type)
        .bind(&card.entity_id)
        .bind(card.task_type.as_str())
        .bind(card.status.as_str())
        .bind(i64::from(card.priority))
        .bind(&card.title)
        .bind(&card.description)
        .bind(&card.dedup_key)
        .bind(&action_str)
        .bind(&card.source)
        .bind(&expires_at_str)
        .bind(card.created_at.to_rfc3339())
        .bind(card.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn save(&self, card: TaskCard) -> Result<(), RepositoryError> {
        upsert_card(&self.pool, &card).await
    }

    async fn save_with_run(&self, card: TaskCard, run: AuditRun) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        upsert_card(&mut *tx, &card).await?;
        insert_run(&mut *tx, &run).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete(
        &self,
        tenant_id: &TenantId,
        id: &TaskCardId,
    ) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM task_cards WHERE tenant_id = ? AND id = ?")
            .bind(&tenant_id.0)
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;

    use taskdeck_core::audit::{ActorType, AuditRun, RunSource, RunStatus};
    use taskdeck_core::cards::{
        build_dedup_key, CardStatus, Recipient, SuggestedAction, TaskCard, TaskCardId, TaskType,
    };
    use taskdeck_core::identity::TenantId;

    use super::SqlCardRepository;
    use crate::repositories::{AuditRepository, CardRepository, SqlAuditRepository};
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn sample_card(id: &str, priority: u8) -> TaskCard {
        let now = Utc::now();
        TaskCard {
            id: TaskCardId(id.to_string()),
            tenant_id: TenantId("t1".to_string()),
            entity_type: "member".to_string(),
            entity_id: "m-1".to_string(),
            task_type: TaskType::Absence,
            status: CardStatus::Pending,
            priority,
            title: "Absence follow-up".to_string(),
            description: Some("3 consecutive absences".to_string()),
            dedup_key: None,
            suggested_action: Some(SuggestedAction::SendMessage {
                recipients: vec![Recipient {
                    target_type: "guardian".to_string(),
                    target_id: "g-1".to_string(),
                    address: "010-1234-5678".to_string(),
                }],
                message: "Your child was absent today.".to_string(),
                template_code: Some("absence_notice".to_string()),
            }),
            source: "ai".to_string(),
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn save_and_find_round_trips_suggested_action() {
        let pool = setup().await;
        let repo = SqlCardRepository::new(pool);

        let card = sample_card("card-1", 70);
        repo.save(card.clone()).await.expect("save");

        let found = repo
            .find_by_id(&card.tenant_id, &card.id)
            .await
            .expect("find")
            .expect("card exists");
        assert_eq!(found.id, card.id);
        assert_eq!(found.status, CardStatus::Pending);
        assert_eq!(found.suggested_action, card.suggested_action);
    }

    #[tokio::test]
    async fn find_by_id_is_tenant_scoped() {
        let pool = setup().await;
        let repo = SqlCardRepository::new(pool);

        let card = sample_card("card-1", 50);
        repo.save(card.clone()).await.expect("save");

        let other_tenant = TenantId("t2".to_string());
        let found = repo.find_by_id(&other_tenant, &card.id).await.expect("find");
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn upsert_with_dedup_drops_duplicate_live_cards() {
        let pool = setup().await;
        let repo = SqlCardRepository::new(pool);

        let tenant = TenantId("t1".to_string());
        let key = build_dedup_key(&tenant, "notify_guardians_absent", "member", "m-1", "2026-08-29");

        let mut first = sample_card("card-1", 50);
        first.dedup_key = Some(key.clone());
        let mut second = sample_card("card-2", 90);
        second.dedup_key = Some(key.clone());

        assert!(repo.upsert_with_dedup(first.clone()).await.expect("first insert"));
        assert!(!repo.upsert_with_dedup(second.clone()).await.expect("duplicate insert"));

        // Executing the first card frees the slot for the window.
        first.status = CardStatus::Executed;
        repo.save(first).await.expect("execute first");
        assert!(repo.upsert_with_dedup(second).await.expect("insert after execution"));
    }

    #[tokio::test]
    async fn list_active_orders_by_priority_then_recency() {
        let pool = setup().await;
        let repo = SqlCardRepository::new(pool);
        let tenant = TenantId("t1".to_string());
        let now = Utc::now();

        let low = sample_card("card-low", 40);
        let high = sample_card("card-high", 90);
        let mut executed = sample_card("card-done", 99);
        executed.status = CardStatus::Executed;

        repo.save(low).await.expect("save low");
        repo.save(high).await.expect("save high");
        repo.save(executed).await.expect("save executed");

        let active = repo.list_active(&tenant, now).await.expect("list");
        let ids: Vec<&str> = active.iter().map(|c| c.id.0.as_str()).collect();
        assert_eq!(ids, vec!["card-high", "card-low"]);
    }

    #[tokio::test]
    async fn list_active_keeps_todays_cards_past_expiry() {
        let pool = setup().await;
        let repo = SqlCardRepository::new(pool);
        let tenant = TenantId("t1".to_string());
        let now = Utc::now();

        let mut today_expired = sample_card("card-today", 50);
        today_expired.created_at = now - Duration::hours(3);
        today_expired.expires_at = Some(now - Duration::hours(1));

        let mut stale = sample_card("card-stale", 80);
        stale.created_at = now - Duration::days(3);
        stale.updated_at = stale.created_at;
        stale.expires_at = Some(now - Duration::days(2));

        repo.save(today_expired).await.expect("save today");
        repo.save(stale).await.expect("save stale");

        let active = repo.list_active(&tenant, now).await.expect("list");
        let ids: Vec<&str> = active.iter().map(|c| c.id.0.as_str()).collect();
        assert_eq!(ids, vec!["card-today"]);
    }

    #[tokio::test]
    async fn save_with_run_persists_both_atomically() {
        let pool = setup().await;
        let cards = SqlCardRepository::new(pool.clone());
        let audits = SqlAuditRepository::new(pool);
        let tenant = TenantId("t1".to_string());

        let mut card = sample_card("card-1", 60);
        cards.save(card.clone()).await.expect("save pending");

        card.status = CardStatus::Executed;
        let run = AuditRun::new(
            tenant.clone(),
            "task_card.approve_and_execute",
            RunStatus::Success,
            RunSource::Ai,
            ActorType::User,
            "Sent 1 absence notice",
            "card-1:approve-and-execute",
            Utc::now(),
        )
        .with_counts(json!({"success": 1, "failed": 0}));
        let run_id = run.id.clone();

        cards.save_with_run(card.clone(), run).await.expect("save with run");

        let stored = cards
            .find_by_id(&tenant, &card.id)
            .await
            .expect("find")
            .expect("card exists");
        assert_eq!(stored.status, CardStatus::Executed);

        let stored_run = audits.find_run(&tenant, &run_id).await.expect("find run");
        assert!(stored_run.is_some());
    }

    #[tokio::test]
    async fn corrupt_timestamp_surfaces_as_decode_error() {
        let pool = setup().await;
        let repo = SqlCardRepository::new(pool.clone());
        let tenant = TenantId("t1".to_string());

        sqlx::query(
            "INSERT INTO task_cards (id, tenant_id, entity_type, entity_id, task_type, status,
                                     priority, title, source, created_at, updated_at)
             VALUES ('card-bad', 't1', 'member', 'm-1', 'absence', 'pending',
                     50, 'Absence follow-up', 'ai', 'not-a-timestamp', 'not-a-timestamp')",
        )
        .execute(&pool)
        .await
        .expect("raw insert");

        let error = repo
            .find_by_id(&tenant, &TaskCardId("card-bad".to_string()))
            .await
            .expect_err("must not invent a timestamp");
        match error {
            crate::repositories::RepositoryError::Decode(message) => {
                assert!(message.contains("created_at"));
            }
            other => panic!("expected a decode error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_removes_the_card() {
        let pool = setup().await;
        let repo = SqlCardRepository::new(pool);
        let tenant = TenantId("t1".to_string());

        let card = sample_card("card-1", 50);
        repo.save(card.clone()).await.expect("save");
        repo.delete(&tenant, &card.id).await.expect("delete");

        let found = repo.find_by_id(&tenant, &card.id).await.expect("find");
        assert!(found.is_none());
    }
}
