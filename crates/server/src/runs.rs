//! Execution audit trail routes.
//!
//! The trail is read-only over HTTP. Cursors are opaque base64url tokens;
//! a token that fails to decode is rejected rather than treated as "start
//! from the beginning".

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::error;

use taskdeck_core::audit::{AuditRun, AuditRunId, AuditStep, RunFilter, RunSource, RunStatus};
use taskdeck_db::repositories::AuditRepository;

use crate::api::{auth_reject, bad_request, decode_cursor, encode_cursor, internal, not_found, Reject};
use crate::auth::authenticate;

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

#[derive(Clone)]
pub struct RunsState {
    pub audit: Arc<dyn AuditRepository>,
    pub secret: SecretString,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunListQuery {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub status: Option<String>,
    pub source: Option<String>,
    pub operation_type: Option<String>,
    pub q: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StepListQuery {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RunPageResponse {
    pub items: Vec<AuditRun>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

#[derive(Debug, Serialize)]
pub struct StepPageResponse {
    pub items: Vec<AuditStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

pub fn router(state: RunsState) -> Router {
    Router::new()
        .route("/execution-audit-runs", get(list_runs))
        .route("/execution-audit-runs/{id}", get(get_run))
        .route("/execution-audit-runs/{id}/steps", get(list_run_steps))
        .with_state(state)
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>, Reject> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| bad_request(format!("invalid {field} timestamp, expected RFC 3339")))
}

fn build_filter(query: &RunListQuery) -> Result<RunFilter, Reject> {
    let from = query.from.as_deref().map(|v| parse_datetime(v, "from")).transpose()?;
    let to = query.to.as_deref().map(|v| parse_datetime(v, "to")).transpose()?;

    let status = query
        .status
        .as_deref()
        .map(|v| RunStatus::parse(v).ok_or_else(|| bad_request("unknown run status")))
        .transpose()?;
    let source = query
        .source
        .as_deref()
        .map(|v| RunSource::parse(v).ok_or_else(|| bad_request("unknown run source")))
        .transpose()?;

    Ok(RunFilter {
        from,
        to,
        status,
        operation_type: query.operation_type.clone(),
        source,
        q: query.q.clone(),
    })
}

pub async fn list_runs(
    State(state): State<RunsState>,
    Query(query): Query<RunListQuery>,
    headers: HeaderMap,
) -> Result<Json<RunPageResponse>, Reject> {
    let context = authenticate(&headers, &state.secret).map_err(auth_reject)?;

    let filter = build_filter(&query)?;
    let cursor = query.cursor.as_deref().map(decode_cursor).transpose()?;
    let limit = clamp_limit(query.limit);

    let page = state
        .audit
        .list_runs(&context.tenant_id, &filter, cursor.as_ref(), limit)
        .await
        .map_err(|e| {
            error!(event_name = "audit.list_failed", error = %e, "run listing failed");
            internal("run listing failed")
        })?;

    Ok(Json(RunPageResponse {
        items: page.items,
        next_cursor: page.next_cursor.as_deref().map(encode_cursor),
        has_more: page.has_more,
    }))
}

pub async fn get_run(
    Path(id): Path<String>,
    State(state): State<RunsState>,
    headers: HeaderMap,
) -> Result<Json<AuditRun>, Reject> {
    let context = authenticate(&headers, &state.secret).map_err(auth_reject)?;

    let run = state
        .audit
        .find_run(&context.tenant_id, &AuditRunId(id))
        .await
        .map_err(|e| {
            error!(event_name = "audit.lookup_failed", error = %e, "run lookup failed");
            internal("run lookup failed")
        })?
        .ok_or_else(|| not_found("execution run not found"))?;

    Ok(Json(run))
}

pub async fn list_run_steps(
    Path(id): Path<String>,
    State(state): State<RunsState>,
    Query(query): Query<StepListQuery>,
    headers: HeaderMap,
) -> Result<Json<StepPageResponse>, Reject> {
    let context = authenticate(&headers, &state.secret).map_err(auth_reject)?;

    // Tenancy check happens on the run, steps carry no tenant column.
    let run_id = AuditRunId(id);
    state
        .audit
        .find_run(&context.tenant_id, &run_id)
        .await
        .map_err(|e| {
            error!(event_name = "audit.lookup_failed", error = %e, "run lookup failed");
            internal("run lookup failed")
        })?
        .ok_or_else(|| not_found("execution run not found"))?;

    let cursor = query.cursor.as_deref().map(decode_cursor).transpose()?;
    let limit = clamp_limit(query.limit);

    let page = state.audit.list_steps(&run_id, cursor.as_ref(), limit).await.map_err(|e| {
        error!(event_name = "audit.list_failed", error = %e, "step listing failed");
        internal("step listing failed")
    })?;

    Ok(Json(StepPageResponse {
        items: page.items,
        next_cursor: page.next_cursor.as_deref().map(encode_cursor),
        has_more: page.has_more,
    }))
}
