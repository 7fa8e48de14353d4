//! TaskCard routes.
//!
//! - `GET  /task-cards`                             — active list for the tenant
//! - `POST /task-cards/{id}/request-approval`       — teacher action
//! - `POST /task-cards/{id}/approve-and-execute`    — admin/owner action
//!
//! Both POST actions are idempotent per request reference: a replayed request
//! returns the recorded outcome instead of acting twice.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use secrecy::SecretString;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info};

use taskdeck_agent::dispatch::IntentHandler;
use taskdeck_core::audit::{ActorType, AuditRun, AuditStep, RunSource, RunStatus, StepStatus};
use taskdeck_core::cards::{CardEngine, CardError, SuggestedAction, TaskCard, TaskCardId};
use taskdeck_core::identity::RequestContext;
use taskdeck_core::intents::IntentRegistry;
use taskdeck_core::messaging::MessageSender;
use taskdeck_db::repositories::{AuditRepository, CardRepository};

use crate::api::{auth_reject, conflict, internal, not_found, Reject};
use crate::auth::authenticate;

#[derive(Clone)]
pub struct CardsState {
    pub cards: Arc<dyn CardRepository>,
    pub audit: Arc<dyn AuditRepository>,
    pub sender: Arc<dyn MessageSender>,
    pub registry: Arc<IntentRegistry>,
    /// Executors for approved intent plans, keyed by intent key. A plan
    /// whose key has no executor fails closed instead of pretending to run.
    pub executors: Arc<HashMap<String, Arc<dyn IntentHandler>>>,
    pub secret: SecretString,
}

#[derive(Debug, Serialize)]
pub struct CardListResponse {
    pub items: Vec<TaskCard>,
}

#[derive(Debug, Serialize)]
pub struct CardActionResponse {
    pub card: TaskCard,
    pub run: AuditRun,
    /// True when this request matched a previously recorded outcome.
    pub replayed: bool,
}

pub fn router(state: CardsState) -> Router {
    Router::new()
        .route("/task-cards", get(list_cards))
        .route("/task-cards/{id}/request-approval", post(request_approval))
        .route("/task-cards/{id}/approve-and-execute", post(approve_and_execute))
        .with_state(state)
}

fn card_reject(error: CardError) -> Reject {
    match error {
        CardError::RoleForbidden { .. } => {
            crate::api::forbidden(error.user_message(), error.code())
        }
        CardError::InvalidTransition { .. } => {
            conflict(error.user_message(), error.code())
        }
    }
}

fn run_source(card: &TaskCard) -> RunSource {
    if card.source == "ai" {
        RunSource::Ai
    } else {
        RunSource::Manual
    }
}

async fn load_card(
    state: &CardsState,
    context: &RequestContext,
    id: &str,
) -> Result<TaskCard, Reject> {
    state
        .cards
        .find_by_id(&context.tenant_id, &TaskCardId(id.to_string()))
        .await
        .map_err(|e| {
            error!(event_name = "cards.load_failed", error = %e, "card lookup failed");
            internal("card lookup failed")
        })?
        .ok_or_else(|| not_found("task card not found"))
}

async fn replayed_outcome(
    state: &CardsState,
    context: &RequestContext,
    card: &TaskCard,
    reference: &str,
) -> Result<Option<CardActionResponse>, Reject> {
    let prior = state
        .audit
        .find_run_by_reference(&context.tenant_id, reference)
        .await
        .map_err(|e| {
            error!(event_name = "cards.replay_check_failed", error = %e, "replay lookup failed");
            internal("replay lookup failed")
        })?;

    Ok(prior.map(|run| {
        info!(
            event_name = "cards.request_replayed",
            tenant_id = %context.tenant_id,
            card_id = %card.id,
            reference,
            "duplicate card action replayed from audit trail"
        );
        CardActionResponse { card: card.clone(), run, replayed: true }
    }))
}

pub async fn list_cards(
    State(state): State<CardsState>,
    headers: HeaderMap,
) -> Result<Json<CardListResponse>, Reject> {
    let context = authenticate(&headers, &state.secret).map_err(auth_reject)?;

    let items = state.cards.list_active(&context.tenant_id, Utc::now()).await.map_err(|e| {
        error!(event_name = "cards.list_failed", error = %e, "active card listing failed");
        internal("card listing failed")
    })?;

    Ok(Json(CardListResponse { items }))
}

pub async fn request_approval(
    Path(id): Path<String>,
    State(state): State<CardsState>,
    headers: HeaderMap,
) -> Result<Json<CardActionResponse>, Reject> {
    let context = authenticate(&headers, &state.secret).map_err(auth_reject)?;
    let card = load_card(&state, &context, &id).await?;
    let now = Utc::now();

    let reference = format!("{}:request-approval", card.id.0);
    if let Some(outcome) = replayed_outcome(&state, &context, &card, &reference).await? {
        return Ok(Json(outcome));
    }

    let engine = CardEngine::new();
    let (updated, transition) =
        engine.request_approval(card, &context.actor(), now).map_err(card_reject)?;

    let run = AuditRun::new(
        context.tenant_id.clone(),
        "task_card.request_approval",
        RunStatus::Success,
        run_source(&updated),
        ActorType::User,
        format!("Approval requested for task card: {}", updated.title),
        reference,
        now,
    )
    .with_actor_id(context.user_id.0.clone())
    .with_details(json!({
        "from": transition.from,
        "to": transition.to,
    }));

    state.cards.save_with_run(updated.clone(), run.clone()).await.map_err(|e| {
        error!(event_name = "cards.save_failed", error = %e, "approval save failed");
        internal("card save failed")
    })?;

    info!(
        event_name = "cards.approval_requested",
        tenant_id = %context.tenant_id,
        card_id = %updated.id,
        actor_id = %context.user_id,
        "task card approval requested"
    );

    Ok(Json(CardActionResponse { card: updated, run, replayed: false }))
}

pub async fn approve_and_execute(
    Path(id): Path<String>,
    State(state): State<CardsState>,
    headers: HeaderMap,
) -> Result<Json<CardActionResponse>, Reject> {
    let context = authenticate(&headers, &state.secret).map_err(auth_reject)?;
    let card = load_card(&state, &context, &id).await?;
    let now = Utc::now();

    // Five-minute replay bucket: the same approval clicked twice in quick
    // succession executes once; a deliberate later re-approval is allowed
    // to fail on the state machine instead.
    let bucket = now.timestamp() / 300;
    let reference = format!("{}:approve-and-execute:{bucket}", card.id.0);
    if let Some(outcome) = replayed_outcome(&state, &context, &card, &reference).await? {
        return Ok(Json(outcome));
    }

    let engine = CardEngine::new();
    let (updated, transition) =
        engine.approve_and_execute(card, &context.actor(), now).map_err(card_reject)?;

    let execution = execute_action(&state, &context, &updated).await?;

    let mut run = AuditRun::new(
        context.tenant_id.clone(),
        "task_card.approve_and_execute",
        execution.status,
        run_source(&updated),
        ActorType::User,
        execution.summary.clone(),
        reference,
        now,
    )
    .with_actor_id(context.user_id.0.clone())
    .with_details(json!({
        "from": transition.from,
        "to": transition.to,
    }))
    .with_counts(json!({
        "success": execution.success_count,
        "failed": execution.failure_count,
    }));
    if let Some(code) = execution.error_code {
        run = run.with_error_code(code);
    }

    // Card status and the run land in one transaction; steps are recorded
    // best-effort afterwards.
    state.cards.save_with_run(updated.clone(), run.clone()).await.map_err(|e| {
        error!(event_name = "cards.save_failed", error = %e, "execution save failed");
        internal("card save failed")
    })?;

    let steps: Vec<AuditStep> = execution
        .steps
        .into_iter()
        .map(|step| step.into_audit_step(run.id.clone()))
        .collect();
    if !steps.is_empty() {
        if let Err(e) = state.audit.record_steps(steps).await {
            error!(
                event_name = "audit.write_failed",
                tenant_id = %context.tenant_id,
                run_id = %run.id,
                error = %e,
                "audit step write failed after successful execution"
            );
        }
    }

    info!(
        event_name = "cards.executed",
        tenant_id = %context.tenant_id,
        card_id = %updated.id,
        actor_id = %context.user_id,
        run_status = run.status.as_str(),
        "task card approved and executed"
    );

    Ok(Json(CardActionResponse { card: updated, run, replayed: false }))
}

/// Step outcome collected before the run id exists.
struct StepDraft {
    status: StepStatus,
    target_type: String,
    target_id: String,
    summary: String,
    error_code: Option<&'static str>,
}

impl StepDraft {
    fn into_audit_step(self, run_id: taskdeck_core::audit::AuditRunId) -> AuditStep {
        let step = AuditStep::new(
            run_id,
            self.status,
            self.target_type,
            self.target_id,
            self.summary,
            Utc::now(),
        );
        match self.error_code {
            Some(code) => step.with_error_code(code),
            None => step,
        }
    }
}

struct ExecutionOutcome {
    status: RunStatus,
    summary: String,
    success_count: usize,
    failure_count: usize,
    error_code: Option<&'static str>,
    steps: Vec<StepDraft>,
}

async fn execute_action(
    state: &CardsState,
    context: &RequestContext,
    card: &TaskCard,
) -> Result<ExecutionOutcome, Reject> {
    match &card.suggested_action {
        None => Ok(ExecutionOutcome {
            status: RunStatus::Success,
            summary: format!("Task card completed with no attached action: {}", card.title),
            success_count: 0,
            failure_count: 0,
            error_code: None,
            steps: Vec::new(),
        }),
        Some(SuggestedAction::SendMessage { recipients, message, template_code }) => {
            let mut steps = Vec::with_capacity(recipients.len());
            let mut success_count = 0usize;
            let mut failure_count = 0usize;

            for recipient in recipients {
                let result =
                    state.sender.send(recipient, message, template_code.as_deref()).await;
                match result {
                    Ok(outcome) if outcome.success => {
                        success_count += 1;
                        steps.push(StepDraft {
                            status: StepStatus::Success,
                            target_type: recipient.target_type.clone(),
                            target_id: recipient.target_id.clone(),
                            summary: format!("Delivered via {}", outcome.channel_used),
                            error_code: None,
                        });
                    }
                    Ok(outcome) => {
                        failure_count += 1;
                        steps.push(StepDraft {
                            status: StepStatus::Failed,
                            target_type: recipient.target_type.clone(),
                            target_id: recipient.target_id.clone(),
                            summary: format!("Provider refused on {}", outcome.channel_used),
                            error_code: Some("EXTERNAL_PROVIDER_FAILURE"),
                        });
                    }
                    Err(e) => {
                        failure_count += 1;
                        steps.push(StepDraft {
                            status: StepStatus::Failed,
                            target_type: recipient.target_type.clone(),
                            target_id: recipient.target_id.clone(),
                            summary: "Delivery failed".to_string(),
                            error_code: Some(e.code()),
                        });
                    }
                }
            }

            let status = if failure_count == 0 {
                RunStatus::Success
            } else if success_count > 0 {
                RunStatus::Partial
            } else {
                RunStatus::Failed
            };
            Ok(ExecutionOutcome {
                status,
                summary: format!(
                    "Sent {success_count} of {} messages for: {}",
                    recipients.len(),
                    card.title
                ),
                success_count,
                failure_count,
                error_code: (failure_count > 0).then_some("EXTERNAL_PROVIDER_FAILURE"),
                steps,
            })
        }
        Some(SuggestedAction::RunAnalysis { analysis_type, params }) => Ok(ExecutionOutcome {
            status: RunStatus::Success,
            summary: format!("Analysis scheduled: {analysis_type}"),
            success_count: 1,
            failure_count: 0,
            error_code: None,
            steps: vec![StepDraft {
                status: StepStatus::Success,
                target_type: "analysis".to_string(),
                target_id: analysis_type.clone(),
                summary: format!("Deferred analysis request recorded: {params}"),
                error_code: None,
            }],
        }),
        Some(SuggestedAction::IntentPlan(plan)) => {
            // Contracts are re-checked at execution time. An L1 plan or an
            // unregistered event type refuses here even if the card was
            // planned before a contract change.
            if let Err(e) = state.registry.ensure_executable(&plan.intent_key) {
                return Err(conflict(e.user_message(), e.code()));
            }

            // The executor performs the side effect. A key with no
            // registered executor records a failed run; nothing is sent.
            let Some(executor) = state.executors.get(plan.intent_key.as_str()) else {
                error!(
                    event_name = "cards.executor_missing",
                    intent_key = %plan.intent_key,
                    "no executor registered for approved intent plan"
                );
                return Ok(ExecutionOutcome {
                    status: RunStatus::Failed,
                    summary: format!("No executor registered for intent {}", plan.intent_key),
                    success_count: 0,
                    failure_count: 1,
                    error_code: Some("HANDLER_NOT_FOUND"),
                    steps: vec![StepDraft {
                        status: StepStatus::Failed,
                        target_type: "intent".to_string(),
                        target_id: plan.intent_key.clone(),
                        summary: "Execution skipped: no registered executor".to_string(),
                        error_code: Some("HANDLER_NOT_FOUND"),
                    }],
                });
            };

            match executor.handle(&plan.intent_key, &plan.params, context).await {
                Ok(result) => Ok(ExecutionOutcome {
                    status: RunStatus::Success,
                    summary: format!("Executed intent {}", plan.intent_key),
                    success_count: 1,
                    failure_count: 0,
                    error_code: None,
                    steps: vec![StepDraft {
                        status: StepStatus::Success,
                        target_type: "intent".to_string(),
                        target_id: plan.intent_key.clone(),
                        summary: result["delivered"]
                            .as_u64()
                            .map(|n| format!("Delivered {n} messages"))
                            .unwrap_or_else(|| plan.message.clone()),
                        error_code: None,
                    }],
                }),
                Err(e) => Ok(ExecutionOutcome {
                    status: RunStatus::Failed,
                    summary: format!("Intent {} failed: {}", plan.intent_key, e.user_message()),
                    success_count: 0,
                    failure_count: 1,
                    error_code: Some(e.code()),
                    steps: vec![StepDraft {
                        status: StepStatus::Failed,
                        target_type: "intent".to_string(),
                        target_id: plan.intent_key.clone(),
                        summary: "Execution failed".to_string(),
                        error_code: Some(e.code()),
                    }],
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::extract::{Path, State};
    use chrono::Duration;
    use secrecy::SecretString;
    use serde_json::json;
    use uuid::Uuid;

    use taskdeck_core::cards::{CardStatus, Recipient, TaskType};
    use taskdeck_core::identity::TenantId;
    use taskdeck_core::messaging::RecordingMessageSender;
    use taskdeck_db::repositories::{InMemoryAuditRepository, InMemoryCardRepository};

    use crate::auth::test_tokens::{bearer, sign_token};
    use crate::handlers::SendIntentExecutor;

    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn secret() -> SecretString {
        SecretString::from(SECRET)
    }

    fn state_with_sender(sender: Arc<dyn MessageSender>) -> (CardsState, Arc<InMemoryCardRepository>, Arc<InMemoryAuditRepository>) {
        let audit = Arc::new(InMemoryAuditRepository::default());
        let cards = Arc::new(InMemoryCardRepository::linked(Arc::clone(&audit)));
        // Same wiring shape as production: send intents execute through the
        // message sender, everything else has no executor.
        let mut executors: HashMap<String, Arc<dyn IntentHandler>> = HashMap::new();
        executors.insert(
            "message.exec.send_absence_notice".to_string(),
            Arc::new(SendIntentExecutor::new(Arc::clone(&sender))),
        );
        let state = CardsState {
            cards: Arc::clone(&cards) as Arc<dyn CardRepository>,
            audit: Arc::clone(&audit) as Arc<dyn AuditRepository>,
            sender,
            registry: Arc::new(IntentRegistry::builtin()),
            executors: Arc::new(executors),
            secret: secret(),
        };
        (state, cards, audit)
    }

    fn setup() -> (CardsState, Arc<InMemoryCardRepository>, Arc<InMemoryAuditRepository>, RecordingMessageSender) {
        let sender = RecordingMessageSender::new();
        let (state, cards, audit) =
            state_with_sender(Arc::new(sender.clone()) as Arc<dyn MessageSender>);
        (state, cards, audit, sender)
    }

    fn headers_for(role: &str) -> HeaderMap {
        bearer(&sign_token(&secret(), "u-1", "t1", role, None))
    }

    fn notification_card(id: &str, priority: u8) -> TaskCard {
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
            description: None,
            dedup_key: None,
            suggested_action: Some(SuggestedAction::SendMessage {
                recipients: vec![
                    Recipient {
                        target_type: "guardian".to_string(),
                        target_id: "g-1".to_string(),
                        address: "010-1111-1111".to_string(),
                    },
                    Recipient {
                        target_type: "guardian".to_string(),
                        target_id: "g-2".to_string(),
                        address: "010-2222-2222".to_string(),
                    },
                ],
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
    async fn teacher_can_request_approval() {
        let (state, cards, _, _) = setup();
        let card = notification_card(&Uuid::new_v4().to_string(), 50);
        let id = card.id.0.clone();
        cards.save(card).await.expect("seed card");

        let response = request_approval(
            Path(id.clone()),
            State(state.clone()),
            headers_for("teacher"),
        )
        .await
        .expect("request approval");

        assert_eq!(response.0.card.status, CardStatus::Approved);
        assert!(!response.0.replayed);

        let stored = cards
            .find_by_id(&TenantId("t1".to_string()), &TaskCardId(id))
            .await
            .expect("find")
            .expect("card exists");
        assert_eq!(stored.status, CardStatus::Approved);
    }

    #[tokio::test]
    async fn teacher_cannot_approve_and_execute() {
        let (state, cards, _, sender) = setup();
        let card = notification_card(&Uuid::new_v4().to_string(), 50);
        let id = card.id.0.clone();
        cards.save(card).await.expect("seed card");

        let result = approve_and_execute(
            Path(id),
            State(state),
            headers_for("teacher"),
        )
        .await;

        let (status, Json(body)) = result.expect_err("should refuse");
        assert_eq!(status, axum::http::StatusCode::FORBIDDEN);
        assert_eq!(body.code.as_deref(), Some("ROLE_FORBIDDEN"));
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn admin_execution_sends_and_records_run_with_steps() {
        let (state, cards, audit, sender) = setup();
        let card = notification_card(&Uuid::new_v4().to_string(), 50);
        let id = card.id.0.clone();
        cards.save(card).await.expect("seed card");

        let response = approve_and_execute(
            Path(id.clone()),
            State(state),
            headers_for("admin"),
        )
        .await
        .expect("execute");

        assert_eq!(response.0.card.status, CardStatus::Executed);
        assert_eq!(response.0.run.status, RunStatus::Success);
        assert_eq!(sender.sent().len(), 2);

        let runs = cards.recorded_runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].operation_type, "task_card.approve_and_execute");

        let steps = audit
            .list_steps(&response.0.run.id, None, 10)
            .await
            .expect("list steps");
        assert_eq!(steps.items.len(), 2);
        assert!(steps.items.iter().all(|s| s.status == StepStatus::Success));
    }

    #[tokio::test]
    async fn partial_delivery_yields_partial_run() {
        let (state, cards, _, sender) = setup();
        sender.fail_for("010-2222-2222");

        let card = notification_card(&Uuid::new_v4().to_string(), 50);
        let id = card.id.0.clone();
        cards.save(card).await.expect("seed card");

        let response = approve_and_execute(
            Path(id),
            State(state),
            headers_for("admin"),
        )
        .await
        .expect("execute");

        assert_eq!(response.0.run.status, RunStatus::Partial);
        assert_eq!(
            response.0.run.error_code.as_deref(),
            Some("EXTERNAL_PROVIDER_FAILURE")
        );
        assert_eq!(response.0.card.status, CardStatus::Executed);
        assert_eq!(sender.sent().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_execution_replays_the_recorded_outcome() {
        let (state, cards, _, sender) = setup();
        let card = notification_card(&Uuid::new_v4().to_string(), 50);
        let id = card.id.0.clone();
        cards.save(card).await.expect("seed card");

        let first = approve_and_execute(
            Path(id.clone()),
            State(state.clone()),
            headers_for("admin"),
        )
        .await
        .expect("first execution");
        assert!(!first.0.replayed);

        let second = approve_and_execute(
            Path(id),
            State(state),
            headers_for("admin"),
        )
        .await
        .expect("second execution");

        assert!(second.0.replayed);
        assert_eq!(second.0.run.id, first.0.run.id);
        // The replay never touched the sender again.
        assert_eq!(sender.sent().len(), 2);
    }

    fn intent_plan_card(id: &str, intent_key: &str, params: serde_json::Value) -> TaskCard {
        let mut card = notification_card(id, 50);
        card.suggested_action =
            Some(SuggestedAction::IntentPlan(taskdeck_core::cards::CardPlan {
                intent_key: intent_key.to_string(),
                params,
                message: format!("Approved plan for {intent_key}"),
            }));
        card
    }

    #[tokio::test]
    async fn intent_plan_executes_through_its_registered_executor() {
        let (state, cards, _, sender) = setup();
        let card = intent_plan_card(
            &Uuid::new_v4().to_string(),
            "message.exec.send_absence_notice",
            json!({"member_id": "m-1", "message": "Absent today"}),
        );
        let id = card.id.0.clone();
        cards.save(card).await.expect("seed card");

        let response = approve_and_execute(
            Path(id),
            State(state),
            headers_for("admin"),
        )
        .await
        .expect("execute");

        assert_eq!(response.0.card.status, CardStatus::Executed);
        assert_eq!(response.0.run.status, RunStatus::Success);

        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient.target_id, "m-1");
        assert_eq!(sent[0].message, "Absent today");
    }

    #[tokio::test]
    async fn intent_plan_without_an_executor_records_a_failed_run() {
        let (state, cards, audit, sender) = setup();
        // Registered L2-A contract, but nothing wired to carry it out.
        let card = intent_plan_card(
            &Uuid::new_v4().to_string(),
            "report.exec.monthly_report",
            json!({"month": "2026-08"}),
        );
        let id = card.id.0.clone();
        cards.save(card).await.expect("seed card");

        let response = approve_and_execute(
            Path(id),
            State(state),
            headers_for("admin"),
        )
        .await
        .expect("execute");

        assert_eq!(response.0.card.status, CardStatus::Executed);
        assert_eq!(response.0.run.status, RunStatus::Failed);
        assert_eq!(response.0.run.error_code.as_deref(), Some("HANDLER_NOT_FOUND"));
        assert!(sender.sent().is_empty());

        let steps = audit
            .list_steps(&response.0.run.id, None, 10)
            .await
            .expect("list steps");
        assert_eq!(steps.items.len(), 1);
        assert_eq!(steps.items[0].status, StepStatus::Failed);
        assert_eq!(steps.items[0].error_code.as_deref(), Some("HANDLER_NOT_FOUND"));
    }

    #[tokio::test]
    async fn intent_plan_execution_failure_lands_in_the_run() {
        let (state, cards, _, sender) = setup();
        sender.fail_for("m-1");
        let card = intent_plan_card(
            &Uuid::new_v4().to_string(),
            "message.exec.send_absence_notice",
            json!({"member_id": "m-1"}),
        );
        let id = card.id.0.clone();
        cards.save(card).await.expect("seed card");

        let response = approve_and_execute(
            Path(id),
            State(state),
            headers_for("admin"),
        )
        .await
        .expect("execute");

        assert_eq!(response.0.run.status, RunStatus::Failed);
        assert_eq!(
            response.0.run.error_code.as_deref(),
            Some("EXTERNAL_PROVIDER_FAILURE")
        );
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn l1_intent_plan_refuses_execution() {
        let (state, cards, _, _) = setup();
        let mut card = notification_card(&Uuid::new_v4().to_string(), 50);
        card.suggested_action =
            Some(SuggestedAction::IntentPlan(taskdeck_core::cards::CardPlan {
                intent_key: "message.draft.absence_notice".to_string(),
                params: json!({"member_id": "m-1"}),
                message: "Draft an absence notice".to_string(),
            }));
        let id = card.id.0.clone();
        cards.save(card).await.expect("seed card");

        let result = approve_and_execute(
            Path(id.clone()),
            State(state),
            headers_for("admin"),
        )
        .await;

        let (status, Json(body)) = result.expect_err("should refuse");
        assert_eq!(status, axum::http::StatusCode::CONFLICT);
        assert_eq!(body.code.as_deref(), Some("CONTRACT_INPUT_TYPE"));

        // The card must not be left executed.
        let stored = cards
            .find_by_id(&TenantId("t1".to_string()), &TaskCardId(id))
            .await
            .expect("find")
            .expect("card exists");
        assert_eq!(stored.status, CardStatus::Pending);
    }

    #[tokio::test]
    async fn active_listing_shrinks_after_execution() {
        let (state, cards, _, _) = setup();
        let now = Utc::now();

        let urgent = notification_card(&Uuid::new_v4().to_string(), 90);
        let mut routine = notification_card(&Uuid::new_v4().to_string(), 40);
        // Created earlier today and nominally expired; the today's-cards
        // override keeps it listed.
        routine.created_at = now - Duration::hours(6);
        routine.expires_at = Some(now - Duration::hours(1));

        let urgent_id = urgent.id.0.clone();
        cards.save(urgent).await.expect("seed urgent");
        cards.save(routine).await.expect("seed routine");

        let before = list_cards(State(state.clone()), headers_for("admin"))
            .await
            .expect("list before");
        assert_eq!(before.0.items.len(), 2);
        assert_eq!(before.0.items[0].priority, 90);
        assert_eq!(before.0.items[1].priority, 40);

        approve_and_execute(
            Path(urgent_id),
            State(state.clone()),
            headers_for("admin"),
        )
        .await
        .expect("execute urgent");

        let after = list_cards(State(state), headers_for("admin"))
            .await
            .expect("list after");
        assert_eq!(after.0.items.len(), 1);
        assert_eq!(after.0.items[0].priority, 40);
    }
}
