//! Intent dispatcher: resolves tool calls to intent keys and runs them at
//! the tier the registry declares.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use taskdeck_core::{
    AutomationTier, CardPlan, IntentContract, IntentRegistry, RequestContext, ToolError,
};

use crate::tools::{ToolCatalog, EXECUTE_L2_INTENT};

/// Read-only executor for one or more L0 intent keys.
#[async_trait]
pub trait IntentHandler: Send + Sync {
    async fn handle(
        &self,
        intent_key: &str,
        args: &Value,
        context: &RequestContext,
    ) -> Result<Value, ToolError>;
}

/// Synthesizes and persists the TaskCard for an L1 intent. The dispatcher
/// consults this seam instead of writing to the store itself.
#[async_trait]
pub trait CardPlanner: Send + Sync {
    async fn plan(
        &self,
        contract: &IntentContract,
        args: &Value,
        context: &RequestContext,
    ) -> Result<CardPlan, ToolError>;
}

/// An L2 execution request extracted from the conversation, awaiting the
/// caller's confirmation step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PendingExecution {
    pub intent_key: String,
    pub params: Value,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchResult {
    /// Immediate result of an L0 read or the plan summary of an L1 card.
    Value(Value),
    /// Validated L2 request for the caller to route into confirmation.
    Pending(PendingExecution),
}

impl DispatchResult {
    /// JSON fed back to the model as the tool result.
    pub fn to_tool_value(&self) -> Value {
        match self {
            Self::Value(value) => value.clone(),
            Self::Pending(pending) => json!({
                "status": "pending_confirmation",
                "intent_key": pending.intent_key,
                "params": pending.params,
            }),
        }
    }
}

pub struct IntentDispatcher {
    registry: Arc<IntentRegistry>,
    catalog: Arc<ToolCatalog>,
    handlers: HashMap<String, Arc<dyn IntentHandler>>,
    card_planner: Arc<dyn CardPlanner>,
}

impl IntentDispatcher {
    pub fn new(
        registry: Arc<IntentRegistry>,
        catalog: Arc<ToolCatalog>,
        card_planner: Arc<dyn CardPlanner>,
    ) -> Self {
        Self { registry, catalog, handlers: HashMap::new(), card_planner }
    }

    pub fn register_handler(
        &mut self,
        intent_key: impl Into<String>,
        handler: Arc<dyn IntentHandler>,
    ) {
        self.handlers.insert(intent_key.into(), handler);
    }

    pub fn register_handler_for_all(
        &mut self,
        intent_keys: impl IntoIterator<Item = impl Into<String>>,
        handler: Arc<dyn IntentHandler>,
    ) {
        for intent_key in intent_keys {
            self.handlers.insert(intent_key.into(), Arc::clone(&handler));
        }
    }

    pub fn registry(&self) -> &IntentRegistry {
        &self.registry
    }

    /// Resolves, validates, and runs one tool call. Every failure is folded
    /// into a categorized [`ToolError`]; nothing here panics the loop.
    pub async fn dispatch(
        &self,
        tool_name: &str,
        args: &Value,
        context: &RequestContext,
    ) -> Result<DispatchResult, ToolError> {
        let intent_key = self.catalog.map_to_intent(tool_name, args)?;

        if tool_name == EXECUTE_L2_INTENT {
            return self.validate_l2_request(&intent_key, args);
        }

        let contract = self.registry.validate(&intent_key, args)?;

        match contract.effective_tier() {
            AutomationTier::L0 => {
                let handler = self.handlers.get(intent_key.as_str()).ok_or_else(|| {
                    warn!(
                        event_name = "dispatch.handler_missing",
                        intent_key = %intent_key,
                        "no handler registered for resolved intent"
                    );
                    ToolError::HandlerNotFound(intent_key.clone())
                })?;
                let result = handler.handle(&intent_key, args, context).await?;
                Ok(DispatchResult::Value(result))
            }
            AutomationTier::L1 | AutomationTier::L2 => {
                let plan = self.card_planner.plan(contract, args, context).await?;
                info!(
                    event_name = "dispatch.card_planned",
                    intent_key = %intent_key,
                    tenant_id = %context.tenant_id,
                    "task card planned for deferred execution"
                );
                Ok(DispatchResult::Value(json!({
                    "message": plan.message,
                    "intent_key": plan.intent_key,
                    "params": plan.params,
                })))
            }
        }
    }

    fn validate_l2_request(
        &self,
        intent_key: &str,
        args: &Value,
    ) -> Result<DispatchResult, ToolError> {
        let contract = self.registry.ensure_executable(intent_key)?;
        let params = args.get("params").cloned().unwrap_or_else(|| json!({}));
        contract.param_schema.validate(&params)?;
        Ok(DispatchResult::Pending(PendingExecution {
            intent_key: intent_key.to_string(),
            params,
        }))
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::test_support::{context, EchoPlanner, StaticHandler};
    use super::{DispatchResult, IntentDispatcher};
    use crate::tools::{ToolCatalog, EXECUTE_L2_INTENT};
    use taskdeck_core::{IntentRegistry, ToolError};

    fn dispatcher() -> IntentDispatcher {
        IntentDispatcher::new(
            Arc::new(IntentRegistry::builtin()),
            Arc::new(ToolCatalog::builtin()),
            Arc::new(EchoPlanner),
        )
    }

    #[tokio::test]
    async fn l0_dispatch_runs_the_registered_handler() {
        let mut dispatcher = dispatcher();
        dispatcher.register_handler(
            "attendance.query.late",
            Arc::new(StaticHandler { payload: json!({ "rows": [{ "member": "kim" }] }) }),
        );

        let result = dispatcher
            .dispatch("query_attendance", &json!({ "type": "late" }), &context())
            .await
            .unwrap();
        let DispatchResult::Value(value) = result else {
            panic!("L0 dispatch must return a value");
        };
        assert_eq!(value["rows"][0]["member"], json!("kim"));
    }

    #[tokio::test]
    async fn unhandled_resolved_intent_is_a_configuration_defect() {
        let dispatcher = dispatcher();
        let error = dispatcher
            .dispatch("query_attendance", &json!({ "type": "late" }), &context())
            .await
            .unwrap_err();
        assert_eq!(error, ToolError::HandlerNotFound("attendance.query.late".to_string()));
    }

    #[tokio::test]
    async fn l1_dispatch_consults_the_card_planner() {
        let dispatcher = dispatcher();
        let result = dispatcher
            .dispatch(
                "create_notification_task",
                &json!({ "type": "absent", "member_ids": ["m-1"] }),
                &context(),
            )
            .await
            .unwrap();

        let DispatchResult::Value(value) = result else {
            panic!("L1 dispatch must return a plan summary");
        };
        assert_eq!(value["intent_key"], json!("attendance.create.notify_guardians_absent"));
        assert!(value["message"].as_str().unwrap_or_default().contains("approvable task"));
    }

    #[tokio::test]
    async fn l2_request_is_validated_but_never_executed() {
        let dispatcher = dispatcher();
        let result = dispatcher
            .dispatch(
                EXECUTE_L2_INTENT,
                &json!({
                    "intent_key": "message.exec.send_announcement",
                    "params": { "message": "Closed tomorrow for maintenance" }
                }),
                &context(),
            )
            .await
            .unwrap();

        let DispatchResult::Pending(pending) = result else {
            panic!("execute_l2_intent must stay pending");
        };
        assert_eq!(pending.intent_key, "message.exec.send_announcement");
        assert_eq!(pending.params["message"], json!("Closed tomorrow for maintenance"));
    }

    #[tokio::test]
    async fn l2_request_for_a_class_b_intent_is_refused() {
        let dispatcher = dispatcher();
        let error = dispatcher
            .dispatch(
                EXECUTE_L2_INTENT,
                &json!({ "intent_key": "member.exec.discharge", "params": { "member_id": "m-1" } }),
                &context(),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, ToolError::InputType(_)));
    }

    #[tokio::test]
    async fn l2_request_params_are_schema_checked() {
        let dispatcher = dispatcher();
        let error = dispatcher
            .dispatch(
                EXECUTE_L2_INTENT,
                &json!({ "intent_key": "message.exec.send_announcement", "params": {} }),
                &context(),
            )
            .await
            .unwrap_err();
        assert_eq!(error, ToolError::MissingParam("message".to_string()));
    }

    #[tokio::test]
    async fn bad_arguments_fail_before_the_handler_runs() {
        let mut dispatcher = dispatcher();
        dispatcher.register_handler(
            "member.query.profile",
            Arc::new(StaticHandler { payload: json!({}) }),
        );
        let error = dispatcher
            .dispatch("get_member_profile", &json!({}), &context())
            .await
            .unwrap_err();
        assert_eq!(error, ToolError::MissingParam("member_id".to_string()));
    }
}
