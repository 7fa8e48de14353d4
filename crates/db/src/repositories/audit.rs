use sqlx::{QueryBuilder, Row, Sqlite};

use taskdeck_core::audit::{
    ActorType, AuditRun, AuditRunId, AuditStep, Cursor, Page, RunFilter, RunSource, RunStatus,
    StepStatus,
};
use taskdeck_core::identity::TenantId;

use super::{parse_timestamp, AuditRepository, RepositoryError};
use crate::DbPool;

pub struct SqlAuditRepository {
    pool: DbPool,
}

impl SqlAuditRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const RUN_COLUMNS: &str = "id, tenant_id, occurred_at, operation_type, status, source,
                    actor_type, actor_id, summary, details, reference, counts,
                    error_code, duration_ms";

const STEP_COLUMNS: &str =
    "id, run_id, occurred_at, status, target_type, target_id, summary, details, error_code";

fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> Result<AuditRun, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let tenant_id: String =
        row.try_get("tenant_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let occurred_at_str: String =
        row.try_get("occurred_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let operation_type: String =
        row.try_get("operation_type").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let status_str: String =
        row.try_get("status").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let source_str: String =
        row.try_get("source").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let actor_type_str: String =
        row.try_get("actor_type").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let actor_id: Option<String> =
        row.try_get("actor_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let summary: String =
        row.try_get("summary").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let details_str: Option<String> =
        row.try_get("details").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let reference: String =
        row.try_get("reference").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let counts_str: Option<String> =
        row.try_get("counts").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let error_code: Option<String> =
        row.try_get("error_code").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let duration_ms: Option<i64> =
        row.try_get("duration_ms").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let status = RunStatus::parse(&status_str)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown run status: {status_str}")))?;
    let source = RunSource::parse(&source_str)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown run source: {source_str}")))?;
    let actor_type = ActorType::parse(&actor_type_str)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown actor type: {actor_type_str}")))?;

    let occurred_at = parse_timestamp("occurred_at", &occurred_at_str)?;
    let details = details_str
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let counts = counts_str
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;

    Ok(AuditRun {
        id: AuditRunId(id),
        tenant_id: TenantId(tenant_id),
        occurred_at,
        operation_type,
        status,
        source,
        actor_type,
        actor_id,
        summary,
        details,
        reference,
        counts,
        error_code,
        duration_ms,
    })
}

fn row_to_step(row: &sqlx::sqlite::SqliteRow) -> Result<AuditStep, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let run_id: String =
        row.try_get("run_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let occurred_at_str: String =
        row.try_get("occurred_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let status_str: String =
        row.try_get("status").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let target_type: String =
        row.try_get("target_type").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let target_id: String =
        row.try_get("target_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let summary: String =
        row.try_get("summary").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let details_str: Option<String> =
        row.try_get("details").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let error_code: Option<String> =
        row.try_get("error_code").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let status = StepStatus::parse(&status_str)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown step status: {status_str}")))?;
    let occurred_at = parse_timestamp("occurred_at", &occurred_at_str)?;
    let details = details_str
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;

    Ok(AuditStep {
        id,
        run_id: AuditRunId(run_id),
        occurred_at,
        status,
        target_type,
        target_id,
        summary,
        details,
        error_code,
    })
}

pub(crate) async fn insert_run<'e, E>(executor: E, run: &AuditRun) -> Result<(), RepositoryError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let details_str = run.details.as_ref().map(|v| v.to_string());
    let counts_str = run.counts.as_ref().map(|v| v.to_string());

    // Append-only: no ON CONFLICT clause, duplicate ids are a bug upstream.
    sqlx::query(
        "INSERT INTO execution_audit_runs (id, tenant_id, occurred_at, operation_type, status,
                                           source, actor_type, actor_id, summary, details,
                                           reference, counts, error_code, duration_ms)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&run.id.0)
    .bind(&run.tenant_id.0)
    .bind(run.occurred_at.to_rfc3339())
    .bind(&run.operation_type)
    .bind(run.status.as_str())
    .bind(run.source.as_str())
    .bind(run.actor_type.as_str())
    .bind(&run.actor_id)
    .bind(&run.summary)
    .bind(&details_str)
    .bind(&run.reference)
    .bind(&counts_str)
    .bind(&run.error_code)
    .bind(run.duration_ms)
    .execute(executor)
    .await?;

    Ok(())
}

async fn insert_step<'e, E>(executor: E, step: &AuditStep) -> Result<(), RepositoryError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let details_str = step.details.as_ref().map(|v| v.to_string());

    sqlx::query(
        "INSERT INTO execution_audit_steps (id, run_id, occurred_at, status, target_type,
                                            target_id, summary, details, error_code)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&step.id)
    .bind(&step.run_id.0)
    .bind(step.occurred_at.to_rfc3339())
    .bind(step.status.as_str())
    .bind(&step.target_type)
    .bind(&step.target_id)
    .bind(&step.summary)
    .bind(&details_str)
    .bind(&step.error_code)
    .execute(executor)
    .await?;

    Ok(())
}

#[async_trait::async_trait]
impl AuditRepository for SqlAuditRepository {
    async fn record_run(&self, run: AuditRun) -> Result<(), RepositoryError> {
        insert_run(&self.pool, &run).await
    }

    async fn record_steps(&self, steps: Vec<AuditStep>) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        for step in &steps {
            insert_step(&mut *tx, step).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find_run(
        &self,
        tenant_id: &TenantId,
        id: &AuditRunId,
    ) -> Result<Option<AuditRun>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM execution_audit_runs WHERE tenant_id = ? AND id = ?",
        ))
        .bind(&tenant_id.0)
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_run(r)?)),
            None => Ok(None),
        }
    }

    async fn find_run_by_reference(
        &self,
        tenant_id: &TenantId,
        reference: &str,
    ) -> Result<Option<AuditRun>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM execution_audit_runs
             WHERE tenant_id = ? AND reference = ?
             ORDER BY occurred_at DESC, id DESC
             LIMIT 1",
        ))
        .bind(&tenant_id.0)
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_run(r)?)),
            None => Ok(None),
        }
    }

    async fn list_runs(
        &self,
        tenant_id: &TenantId,
        filter: &RunFilter,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Page<AuditRun>, RepositoryError> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {RUN_COLUMNS} FROM execution_audit_runs WHERE tenant_id = ",
        ));
        builder.push_bind(&tenant_id.0);

        if let Some(from) = filter.from {
            builder.push(" AND occurred_at >= ").push_bind(from.to_rfc3339());
        }
        if let Some(to) = filter.to {
            builder.push(" AND occurred_at <= ").push_bind(to.to_rfc3339());
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(ref operation_type) = filter.operation_type {
            builder.push(" AND operation_type = ").push_bind(operation_type);
        }
        if let Some(source) = filter.source {
            builder.push(" AND source = ").push_bind(source.as_str());
        }
        if let Some(ref q) = filter.q {
            builder
                .push(" AND (instr(summary, ")
                .push_bind(q)
                .push(") > 0 OR instr(IFNULL(error_code, ''), ")
                .push_bind(q)
                .push(") > 0)");
        }
        if let Some(cursor) = cursor {
            let occurred_at = cursor.occurred_at.to_rfc3339();
            builder
                .push(" AND (occurred_at < ")
                .push_bind(occurred_at.clone())
                .push(" OR (occurred_at = ")
                .push_bind(occurred_at)
                .push(" AND id < ")
                .push_bind(&cursor.id)
                .push("))");
        }

        // Fetch one extra row to learn whether a further page exists.
        builder
            .push(" ORDER BY occurred_at DESC, id DESC LIMIT ")
            .push_bind((limit + 1) as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut items =
            rows.iter().map(row_to_run).collect::<Result<Vec<_>, RepositoryError>>()?;

        let has_more = items.len() > limit;
        items.truncate(limit);
        let next_cursor = if has_more {
            items.last().map(|run| Cursor::after(run).encode())
        } else {
            None
        };

        Ok(Page { items, next_cursor, has_more })
    }

    async fn list_steps(
        &self,
        run_id: &AuditRunId,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Page<AuditStep>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = if let Some(cursor) = cursor {
            sqlx::query(&format!(
                "SELECT {STEP_COLUMNS} FROM execution_audit_steps
                 WHERE run_id = ?
                   AND (occurred_at < ? OR (occurred_at = ? AND id < ?))
                 ORDER BY occurred_at DESC, id DESC
                 LIMIT ?",
            ))
            .bind(&run_id.0)
            .bind(cursor.occurred_at.to_rfc3339())
            .bind(cursor.occurred_at.to_rfc3339())
            .bind(&cursor.id)
            .bind((limit + 1) as i64)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {STEP_COLUMNS} FROM execution_audit_steps
                 WHERE run_id = ?
                 ORDER BY occurred_at DESC, id DESC
                 LIMIT ?",
            ))
            .bind(&run_id.0)
            .bind((limit + 1) as i64)
            .fetch_all(&self.pool)
            .await?
        };

        let mut items =
            rows.iter().map(row_to_step).collect::<Result<Vec<_>, RepositoryError>>()?;

        let has_more = items.len() > limit;
        items.truncate(limit);
        let next_cursor = if has_more {
            items.last().map(|step| Cursor::after_step(step).encode())
        } else {
            None
        };

        Ok(Page { items, next_cursor, has_more })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use taskdeck_core::audit::{
        ActorType, AuditRun, AuditRunId, AuditStep, Cursor, RunFilter, RunSource, RunStatus,
        StepStatus,
    };
    use taskdeck_core::identity::TenantId;

    use super::SqlAuditRepository;
    use crate::repositories::AuditRepository;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn tenant() -> TenantId {
        TenantId("t1".to_string())
    }

    fn sample_run(minute: u32, status: RunStatus) -> AuditRun {
        let occurred_at = Utc.with_ymd_and_hms(2026, 8, 29, 9, minute, 0).unwrap();
        AuditRun::new(
            tenant(),
            "task_card.approve_and_execute",
            status,
            RunSource::Ai,
            ActorType::User,
            format!("Run at minute {minute}"),
            format!("card-{minute}:approve-and-execute"),
            occurred_at,
        )
    }

    #[tokio::test]
    async fn record_and_find_run_round_trips() {
        let pool = setup().await;
        let repo = SqlAuditRepository::new(pool);

        let run = sample_run(5, RunStatus::Success)
            .with_actor_id("u-1")
            .with_counts(serde_json::json!({"success": 2, "failed": 0}));
        let id = run.id.clone();
        repo.record_run(run.clone()).await.expect("record");

        let found = repo.find_run(&tenant(), &id).await.expect("find").expect("run exists");
        assert_eq!(found, run);
    }

    #[tokio::test]
    async fn find_run_by_reference_returns_latest_match() {
        let pool = setup().await;
        let repo = SqlAuditRepository::new(pool);

        let mut early = sample_run(1, RunStatus::Failed);
        early.reference = "card-9:request-approval".to_string();
        let mut late = sample_run(30, RunStatus::Success);
        late.reference = "card-9:request-approval".to_string();
        let late_id = late.id.clone();

        repo.record_run(early).await.expect("record early");
        repo.record_run(late).await.expect("record late");

        let found = repo
            .find_run_by_reference(&tenant(), "card-9:request-approval")
            .await
            .expect("find")
            .expect("run exists");
        assert_eq!(found.id, late_id);

        let missing =
            repo.find_run_by_reference(&tenant(), "card-9:other").await.expect("find");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn list_runs_pages_newest_first_with_cursor() {
        let pool = setup().await;
        let repo = SqlAuditRepository::new(pool);

        for minute in 0..5 {
            repo.record_run(sample_run(minute, RunStatus::Success)).await.expect("record");
        }

        let first = repo
            .list_runs(&tenant(), &RunFilter::default(), None, 2)
            .await
            .expect("first page");
        assert_eq!(first.items.len(), 2);
        assert!(first.has_more);
        assert_eq!(first.items[0].summary, "Run at minute 4");
        assert_eq!(first.items[1].summary, "Run at minute 3");

        let token = first.next_cursor.expect("cursor");
        let cursor = Cursor::decode(&token).expect("decode");
        let second = repo
            .list_runs(&tenant(), &RunFilter::default(), Some(&cursor), 2)
            .await
            .expect("second page");
        assert_eq!(second.items[0].summary, "Run at minute 2");
        assert_eq!(second.items[1].summary, "Run at minute 1");
        assert!(second.has_more);

        let token = second.next_cursor.expect("cursor");
        let cursor = Cursor::decode(&token).expect("decode");
        let last = repo
            .list_runs(&tenant(), &RunFilter::default(), Some(&cursor), 2)
            .await
            .expect("last page");
        assert_eq!(last.items.len(), 1);
        assert!(!last.has_more);
        assert!(last.next_cursor.is_none());
    }

    #[tokio::test]
    async fn list_runs_applies_filters() {
        let pool = setup().await;
        let repo = SqlAuditRepository::new(pool);

        let failed = sample_run(10, RunStatus::Failed)
            .with_error_code("EXTERNAL_PROVIDER_FAILURE");
        repo.record_run(failed).await.expect("record failed");
        repo.record_run(sample_run(20, RunStatus::Success)).await.expect("record success");

        let filter = RunFilter { status: Some(RunStatus::Failed), ..Default::default() };
        let page = repo.list_runs(&tenant(), &filter, None, 10).await.expect("list");
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].status, RunStatus::Failed);

        let filter = RunFilter {
            q: Some("EXTERNAL_PROVIDER".to_string()),
            ..Default::default()
        };
        let page = repo.list_runs(&tenant(), &filter, None, 10).await.expect("list by q");
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].error_code.as_deref(), Some("EXTERNAL_PROVIDER_FAILURE"));

        let filter = RunFilter {
            from: Some(Utc.with_ymd_and_hms(2026, 8, 29, 9, 15, 0).unwrap()),
            ..Default::default()
        };
        let page = repo.list_runs(&tenant(), &filter, None, 10).await.expect("list from");
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].status, RunStatus::Success);
    }

    #[tokio::test]
    async fn list_runs_is_tenant_scoped() {
        let pool = setup().await;
        let repo = SqlAuditRepository::new(pool);

        repo.record_run(sample_run(1, RunStatus::Success)).await.expect("record");

        let other = TenantId("t2".to_string());
        let page = repo
            .list_runs(&other, &RunFilter::default(), None, 10)
            .await
            .expect("list other tenant");
        assert!(page.items.is_empty());
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn list_steps_pages_under_their_run() {
        let pool = setup().await;
        let repo = SqlAuditRepository::new(pool);

        let run = sample_run(0, RunStatus::Partial);
        let run_id = run.id.clone();
        repo.record_run(run).await.expect("record run");

        let base = Utc.with_ymd_and_hms(2026, 8, 29, 9, 0, 0).unwrap();
        let steps: Vec<AuditStep> = (0..3)
            .map(|i| {
                AuditStep::new(
                    run_id.clone(),
                    if i == 2 { StepStatus::Failed } else { StepStatus::Success },
                    "guardian",
                    format!("g-{i}"),
                    format!("Notified guardian g-{i}"),
                    base + Duration::seconds(i),
                )
            })
            .collect();
        repo.record_steps(steps).await.expect("record steps");

        let first = repo.list_steps(&run_id, None, 2).await.expect("first page");
        assert_eq!(first.items.len(), 2);
        assert!(first.has_more);
        assert_eq!(first.items[0].target_id, "g-2");

        let token = first.next_cursor.expect("cursor");
        let cursor = Cursor::decode(&token).expect("decode");
        let second = repo.list_steps(&run_id, Some(&cursor), 2).await.expect("second page");
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0].target_id, "g-0");
        assert!(!second.has_more);
    }

    #[tokio::test]
    async fn corrupt_occurred_at_surfaces_as_decode_error() {
        let pool = setup().await;
        let repo = SqlAuditRepository::new(pool.clone());

        sqlx::query(
            "INSERT INTO execution_audit_runs (id, tenant_id, occurred_at, operation_type,
                                               status, source, actor_type, summary, reference)
             VALUES ('run-bad', 't1', 'yesterday-ish', 'task_card.request_approval',
                     'success', 'ai', 'user', 'Approval requested', 'card-1:request-approval')",
        )
        .execute(&pool)
        .await
        .expect("raw insert");

        let error = repo
            .find_run(&tenant(), &AuditRunId("run-bad".to_string()))
            .await
            .expect_err("must not invent a timestamp");
        match error {
            crate::repositories::RepositoryError::Decode(message) => {
                assert!(message.contains("occurred_at"));
            }
            other => panic!("expected a decode error, got {other:?}"),
        }
    }
}
