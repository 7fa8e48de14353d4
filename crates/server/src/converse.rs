//! Conversational agent route.
//!
//! The client owns the rolling history and replays it on every turn; the
//! server keeps no conversation state.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::info;

use taskdeck_agent::dispatch::{CardPlanner, PendingExecution};
use taskdeck_agent::llm::{AgentMessage, Usage};
use taskdeck_agent::orchestrator::{Orchestrator, ToolResultView};
use taskdeck_core::intents::IntentRegistry;

use crate::api::{auth_reject, tool_reject, Reject};
use crate::auth::authenticate;

#[derive(Clone)]
pub struct ConverseState {
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<IntentRegistry>,
    pub planner: Arc<dyn CardPlanner>,
    pub secret: SecretString,
}

#[derive(Debug, Deserialize)]
pub struct ConverseRequest {
    pub message: String,
    #[serde(default)]
    pub history: Vec<AgentMessage>,
}

#[derive(Debug, Serialize)]
pub struct ConverseResponse {
    pub response: String,
    pub tool_results: Vec<ToolResultView>,
    pub usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_execution: Option<PendingExecution>,
}

pub fn router(state: ConverseState) -> Router {
    Router::new().route("/agent/converse", post(converse)).with_state(state)
}

pub async fn converse(
    State(state): State<ConverseState>,
    headers: HeaderMap,
    Json(request): Json<ConverseRequest>,
) -> Result<Json<ConverseResponse>, Reject> {
    let context = authenticate(&headers, &state.secret).map_err(auth_reject)?;

    let reply = state
        .orchestrator
        .run_agent(&request.message, &request.history, &context)
        .await
        .map_err(|e| tool_reject(&e))?;

    // A confirmed L2 request becomes a pending card; the approval surface
    // is the confirmation step, so nothing executes from the conversation.
    if let Some(pending) = &reply.pending_execution {
        let contract = state
            .registry
            .ensure_executable(&pending.intent_key)
            .map_err(|e| tool_reject(&e))?;
        let plan = state
            .planner
            .plan(contract, &pending.params, &context)
            .await
            .map_err(|e| tool_reject(&e))?;
        info!(
            event_name = "agent.execution_card_planned",
            tenant_id = %context.tenant_id,
            intent_key = %pending.intent_key,
            plan_message = %plan.message,
            "pending execution persisted as an approvable task card"
        );
    }

    info!(
        event_name = "agent.turn_completed",
        tenant_id = %context.tenant_id,
        user_id = %context.user_id,
        tool_calls = reply.tool_results.len(),
        total_tokens = reply.usage.total_tokens,
        pending_execution = reply.pending_execution.is_some(),
        "agent turn completed"
    );

    Ok(Json(ConverseResponse {
        response: reply.response,
        tool_results: reply.tool_results,
        usage: reply.usage,
        pending_execution: reply.pending_execution,
    }))
}
