//! Server-side implementations of the agent's capability seams: the card
//! planner that persists L1 plans, the default read-query handler, and the
//! log-only message sender wired when no provider is configured.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use taskdeck_agent::{CardPlanner, IntentHandler};
use taskdeck_core::cards::{
    build_dedup_key, CardPlan, CardStatus, Recipient, SuggestedAction, TaskCard, TaskCardId,
    TaskType,
};
use taskdeck_core::errors::ToolError;
use taskdeck_core::identity::RequestContext;
use taskdeck_core::intents::{DedupWindow, IntentContract};
use taskdeck_core::messaging::{MessageSender, SendOutcome};
use taskdeck_db::repositories::CardRepository;

/// Plans and persists TaskCards for card-producing intents.
pub struct ServerCardPlanner {
    cards: Arc<dyn CardRepository>,
}

impl ServerCardPlanner {
    pub fn new(cards: Arc<dyn CardRepository>) -> Self {
        Self { cards }
    }
}

fn default_priority(task_type: TaskType) -> u8 {
    match task_type {
        TaskType::Risk => 80,
        TaskType::Absence => 70,
        TaskType::Counseling => 60,
        TaskType::NewSignup => 50,
        TaskType::AiSuggested => 40,
    }
}

fn entity_segment(args: &Value) -> String {
    if let Some(member_id) = args.get("member_id").and_then(Value::as_str) {
        return member_id.to_string();
    }
    match args.get("member_ids").and_then(Value::as_array) {
        Some(ids) if ids.len() == 1 => {
            ids[0].as_str().unwrap_or("general").to_string()
        }
        Some(ids) if ids.len() > 1 => "batch".to_string(),
        _ => "general".to_string(),
    }
}

fn window_expiry(window: DedupWindow, now: chrono::DateTime<Utc>) -> Option<chrono::DateTime<Utc>> {
    match window {
        DedupWindow::Daily | DedupWindow::Hourly => Some(now + Duration::days(1)),
        DedupWindow::Monthly => Some(now + Duration::days(31)),
        DedupWindow::Batch => None,
    }
}

#[async_trait]
impl CardPlanner for ServerCardPlanner {
    async fn plan(
        &self,
        contract: &IntentContract,
        args: &Value,
        context: &RequestContext,
    ) -> Result<CardPlan, ToolError> {
        let spec = contract
            .card_spec
            .as_ref()
            .ok_or_else(|| ToolError::InputType("intent does not produce a task card".into()))?;

        let now = Utc::now();
        let entity_id = entity_segment(args);
        let dedup_key = build_dedup_key(
            &context.tenant_id,
            spec.trigger,
            spec.entity_type,
            &entity_id,
            &spec.window.segment(now),
        );

        let priority = args
            .get("priority")
            .and_then(Value::as_u64)
            .map(|p| p.min(100) as u8)
            .unwrap_or_else(|| default_priority(spec.task_type));

        let plan = CardPlan {
            intent_key: contract.intent_key.to_string(),
            params: args.clone(),
            message: format!("Task card ready for approval: {}", contract.description),
        };

        let card = TaskCard {
            id: TaskCardId(Uuid::new_v4().to_string()),
            tenant_id: context.tenant_id.clone(),
            entity_type: spec.entity_type.to_string(),
            entity_id,
            task_type: spec.task_type,
            status: CardStatus::Pending,
            priority,
            title: contract.description.to_string(),
            description: args.get("message").and_then(Value::as_str).map(str::to_string),
            dedup_key: Some(dedup_key),
            suggested_action: Some(SuggestedAction::IntentPlan(plan.clone())),
            source: "ai".to_string(),
            expires_at: window_expiry(spec.window, now),
            created_at: now,
            updated_at: now,
        };
        let card_id = card.id.clone();

        let created = self
            .cards
            .upsert_with_dedup(card)
            .await
            .map_err(|e| ToolError::Provider(e.to_string()))?;

        if created {
            info!(
                event_name = "cards.planned",
                tenant_id = %context.tenant_id,
                card_id = %card_id,
                intent_key = contract.intent_key,
                "task card created from intent plan"
            );
            Ok(plan)
        } else {
            Ok(CardPlan {
                message: format!(
                    "An equivalent task card already exists for this window: {}",
                    contract.description
                ),
                ..plan
            })
        }
    }
}

/// Default L0 handler. Deployments back read queries with their operational
/// datastore; out of the box every query answers with an empty result set so
/// the conversation loop stays functional end to end.
pub struct EmptyDirectoryHandler;

#[async_trait]
impl IntentHandler for EmptyDirectoryHandler {
    async fn handle(
        &self,
        intent_key: &str,
        args: &Value,
        context: &RequestContext,
    ) -> Result<Value, ToolError> {
        info!(
            event_name = "dispatch.query_served",
            tenant_id = %context.tenant_id,
            intent_key,
            "read query served with empty result set"
        );
        Ok(json!({
            "intent_key": intent_key,
            "params": args,
            "items": [],
        }))
    }
}

/// Executes approved send intents by routing them through the configured
/// message channel. Registered for the autonomous `message.exec.*` contracts;
/// intents without a registered executor fail closed at execution time.
pub struct SendIntentExecutor {
    sender: Arc<dyn MessageSender>,
}

impl SendIntentExecutor {
    pub fn new(sender: Arc<dyn MessageSender>) -> Self {
        Self { sender }
    }
}

/// Directory-backed address resolution is a deployment concern; the member id
/// stands in as the address when the params carry none. An intent without any
/// member reference addresses the whole tenant.
fn send_targets(args: &Value) -> Vec<Recipient> {
    let address_override = args.get("address").and_then(Value::as_str);
    let recipient = |member_id: &str| Recipient {
        target_type: "member".to_string(),
        target_id: member_id.to_string(),
        address: address_override.unwrap_or(member_id).to_string(),
    };

    if let Some(member_id) = args.get("member_id").and_then(Value::as_str) {
        return vec![recipient(member_id)];
    }
    if let Some(ids) = args.get("member_ids").and_then(Value::as_array) {
        return ids.iter().filter_map(Value::as_str).map(recipient).collect();
    }
    vec![Recipient {
        target_type: "tenant".to_string(),
        target_id: "broadcast".to_string(),
        address: "broadcast".to_string(),
    }]
}

#[async_trait]
impl IntentHandler for SendIntentExecutor {
    async fn handle(
        &self,
        intent_key: &str,
        args: &Value,
        context: &RequestContext,
    ) -> Result<Value, ToolError> {
        let targets = send_targets(args);
        let message = args.get("message").and_then(Value::as_str).unwrap_or("");
        let template_code = args
            .get("template_code")
            .and_then(Value::as_str)
            .or_else(|| intent_key.rsplit('.').next());

        let mut delivered = 0usize;
        let mut channel = String::new();
        for target in &targets {
            let outcome = self.sender.send(target, message, template_code).await?;
            if !outcome.success {
                return Err(ToolError::Provider(format!(
                    "delivery refused on {} after {delivered} of {} sends",
                    outcome.channel_used,
                    targets.len()
                )));
            }
            delivered += 1;
            channel = outcome.channel_used;
        }

        info!(
            event_name = "dispatch.intent_executed",
            tenant_id = %context.tenant_id,
            intent_key,
            delivered,
            "send intent executed"
        );
        Ok(json!({
            "intent_key": intent_key,
            "delivered": delivered,
            "channel": channel,
        }))
    }
}

/// Message sender of last resort: records the send in the log stream and
/// reports success without contacting any provider. Templated messages go
/// out on the primary channel; free-form text drops to the fallback, the
/// same shape a real alimtalk-to-SMS provider pair reports.
pub struct LogOnlySender {
    channel: String,
    fallback_channel: String,
}

impl LogOnlySender {
    pub fn new(channel: impl Into<String>, fallback_channel: impl Into<String>) -> Self {
        Self { channel: channel.into(), fallback_channel: fallback_channel.into() }
    }
}

#[async_trait]
impl MessageSender for LogOnlySender {
    async fn send(
        &self,
        recipient: &Recipient,
        message: &str,
        template_code: Option<&str>,
    ) -> Result<SendOutcome, ToolError> {
        let fallback_used = template_code.is_none();
        let channel_used =
            if fallback_used { self.fallback_channel.clone() } else { self.channel.clone() };
        info!(
            event_name = "messaging.log_only_send",
            target_type = %recipient.target_type,
            target_id = %recipient.target_id,
            template_code = template_code.unwrap_or("none"),
            channel = %channel_used,
            length = message.len(),
            "message delivery logged without a provider"
        );
        Ok(SendOutcome { success: true, channel_used, fallback_used })
    }
}
