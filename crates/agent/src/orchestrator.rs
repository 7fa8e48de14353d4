//! Bounded conversational loop driving the language model and tool dispatch.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use taskdeck_core::{RequestContext, ToolError};

use crate::dispatch::{DispatchResult, IntentDispatcher, PendingExecution};
use crate::llm::{AgentMessage, ChatCompletionProvider, ToolChoice, Usage};
use crate::tools::{ToolCatalog, EXECUTE_L2_INTENT};

/// Returned when the loop exhausts its iteration budget. A circuit breaker
/// against runaway tool-calling, not an error condition.
pub const FALLBACK_MESSAGE: &str =
    "I could not finish working through that request. Please try again with a narrower question.";

const SYSTEM_PROMPT: &str = "You are the operations assistant for a business-management \
workspace. Answer questions about members, attendance, billing, classes, schedules, and \
messages using the available tools. Read-only lookups run immediately. Anything that would \
contact a member or change records becomes an approvable task for a human; never claim to \
have sent a message or changed data yourself. Keep answers short and concrete.";

#[derive(Clone, Debug, Serialize)]
pub struct ToolResultView {
    pub tool_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolErrorView>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ToolErrorView {
    pub code: &'static str,
    pub message: String,
}

#[derive(Clone, Debug)]
pub struct AgentReply {
    pub response: String,
    pub tool_results: Vec<ToolResultView>,
    pub usage: Usage,
    /// Populated when the conversation produced a validated L2 request; the
    /// caller routes it into a separate confirmation step.
    pub pending_execution: Option<PendingExecution>,
}

#[derive(Clone, Copy, Debug)]
pub struct OrchestratorConfig {
    pub max_iterations: u32,
    pub history_turns: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { max_iterations: 5, history_turns: 10 }
    }
}

pub struct Orchestrator {
    provider: Arc<dyn ChatCompletionProvider>,
    dispatcher: Arc<IntentDispatcher>,
    catalog: Arc<ToolCatalog>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn ChatCompletionProvider>,
        dispatcher: Arc<IntentDispatcher>,
        catalog: Arc<ToolCatalog>,
        config: OrchestratorConfig,
    ) -> Self {
        Self { provider, dispatcher, catalog, config }
    }

    /// Runs one conversational turn. The caller owns and supplies the rolling
    /// history; nothing is persisted here between calls.
    pub async fn run_agent(
        &self,
        user_message: &str,
        history: &[AgentMessage],
        context: &RequestContext,
    ) -> Result<AgentReply, ToolError> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(AgentMessage::system(SYSTEM_PROMPT));
        let retained = history.len().saturating_sub(self.config.history_turns);
        messages.extend_from_slice(&history[retained..]);
        messages.push(AgentMessage::user(user_message));

        let mut usage = Usage::default();
        let mut tool_results = Vec::new();
        let mut pending_execution = None;

        for iteration in 0..self.config.max_iterations {
            let completion = self
                .provider
                .complete(&messages, self.catalog.definitions(), ToolChoice::Auto)
                .await?;
            usage.accumulate(completion.usage);

            if completion.tool_calls.is_empty() {
                let response = completion.content.unwrap_or_else(String::new);
                info!(
                    event_name = "agent.turn_completed",
                    tenant_id = %context.tenant_id,
                    iterations = iteration + 1,
                    tool_calls = tool_results.len(),
                    "agent turn completed"
                );
                return Ok(AgentReply { response, tool_results, usage, pending_execution });
            }

            messages.push(AgentMessage::assistant_tool_calls(completion.tool_calls.clone()));

            // Tool calls from one model turn run strictly in order. Later
            // results may depend on earlier writes within the same tenant.
            for tool_call in completion.tool_calls {
                let outcome = self
                    .dispatcher
                    .dispatch(&tool_call.tool_name, &tool_call.arguments, context)
                    .await;

                let (view, tool_content) = match outcome {
                    Ok(result) => {
                        if let DispatchResult::Pending(pending) = &result {
                            pending_execution = Some(pending.clone());
                        }
                        let value = result.to_tool_value();
                        let view = ToolResultView {
                            tool_name: tool_call.tool_name.clone(),
                            success: true,
                            result: Some(value.clone()),
                            error: None,
                        };
                        (view, value.to_string())
                    }
                    Err(error) => {
                        warn!(
                            event_name = "agent.tool_failed",
                            tenant_id = %context.tenant_id,
                            tool_name = %tool_call.tool_name,
                            error_code = error.code(),
                            error = %error,
                            "tool dispatch failed"
                        );
                        let error_value = json!({
                            "error": {
                                "code": error.code(),
                                "message": error.user_message(),
                            }
                        });
                        let view = ToolResultView {
                            tool_name: tool_call.tool_name.clone(),
                            success: false,
                            result: None,
                            error: Some(ToolErrorView {
                                code: error.code(),
                                message: error.to_string(),
                            }),
                        };
                        (view, error_value.to_string())
                    }
                };

                tool_results.push(view);
                messages.push(AgentMessage::tool(tool_call.id, tool_content));
            }
        }

        warn!(
            event_name = "agent.iteration_budget_exhausted",
            tenant_id = %context.tenant_id,
            max_iterations = self.config.max_iterations,
            "agent loop hit its iteration bound"
        );
        Ok(AgentReply {
            response: FALLBACK_MESSAGE.to_string(),
            tool_results,
            usage,
            pending_execution,
        })
    }
}

/// Post-loop helper: the most recent validated `execute_l2_intent` outcome,
/// if the turn produced one.
pub fn l2_intent_execution(reply: &AgentReply) -> Option<&PendingExecution> {
    reply.pending_execution.as_ref().filter(|_| {
        reply.tool_results.iter().any(|view| view.tool_name == EXECUTE_L2_INTENT && view.success)
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use super::{l2_intent_execution, Orchestrator, OrchestratorConfig, FALLBACK_MESSAGE};
    use crate::dispatch::test_support::{context, EchoPlanner, StaticHandler};
    use crate::dispatch::IntentDispatcher;
    use crate::llm::{
        AgentMessage, ChatCompletion, ChatCompletionProvider, ToolCall, ToolChoice, Usage,
    };
    use crate::tools::{ToolCatalog, EXECUTE_L2_INTENT};
    use taskdeck_core::{IntentRegistry, ToolError};

    /// Provider stub driven by a script of completions; repeats the last
    /// entry when the script runs out.
    struct ScriptedProvider {
        script: Vec<ChatCompletion>,
        calls: AtomicU32,
    }

    impl ScriptedProvider {
        fn new(script: Vec<ChatCompletion>) -> Self {
            Self { script, calls: AtomicU32::new(0) }
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatCompletionProvider for ScriptedProvider {
        async fn complete(
            &self,
            _messages: &[AgentMessage],
            _tools: &[crate::tools::ToolDefinition],
            _tool_choice: ToolChoice,
        ) -> Result<ChatCompletion, ToolError> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let step = self.script.get(index).or_else(|| self.script.last());
            step.cloned().ok_or_else(|| ToolError::Provider("empty script".to_string()))
        }
    }

    fn text_completion(content: &str) -> ChatCompletion {
        ChatCompletion {
            content: Some(content.to_string()),
            tool_calls: Vec::new(),
            finish_reason: "stop".to_string(),
            usage: Usage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 },
        }
    }

    fn tool_completion(calls: Vec<ToolCall>) -> ChatCompletion {
        ChatCompletion {
            content: None,
            tool_calls: calls,
            finish_reason: "tool_calls".to_string(),
            usage: Usage { prompt_tokens: 20, completion_tokens: 8, total_tokens: 28 },
        }
    }

    fn orchestrator_with(
        provider: Arc<ScriptedProvider>,
        register_late_handler: bool,
    ) -> Orchestrator {
        let registry = Arc::new(IntentRegistry::builtin());
        let catalog = Arc::new(ToolCatalog::builtin());
        let mut dispatcher =
            IntentDispatcher::new(Arc::clone(&registry), Arc::clone(&catalog), Arc::new(EchoPlanner));
        if register_late_handler {
            dispatcher.register_handler(
                "attendance.query.late",
                Arc::new(StaticHandler { payload: json!({ "rows": [] }) }),
            );
        }
        Orchestrator::new(provider, Arc::new(dispatcher), catalog, OrchestratorConfig::default())
    }

    #[tokio::test]
    async fn plain_answer_ends_the_loop_after_one_call() {
        let provider = Arc::new(ScriptedProvider::new(vec![text_completion("All quiet today.")]));
        let orchestrator = orchestrator_with(Arc::clone(&provider), false);

        let reply = orchestrator.run_agent("anything new?", &[], &context()).await.unwrap();
        assert_eq!(reply.response, "All quiet today.");
        assert_eq!(provider.call_count(), 1);
        assert!(reply.tool_results.is_empty());
        assert_eq!(reply.usage.total_tokens, 15);
    }

    #[tokio::test]
    async fn tool_results_are_fed_back_before_the_final_answer() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_completion(vec![ToolCall {
                id: "call-1".to_string(),
                tool_name: "query_attendance".to_string(),
                arguments: json!({ "type": "late" }),
            }]),
            text_completion("Nobody was late."),
        ]));
        let orchestrator = orchestrator_with(Arc::clone(&provider), true);

        let reply = orchestrator.run_agent("who was late?", &[], &context()).await.unwrap();
        assert_eq!(reply.response, "Nobody was late.");
        assert_eq!(provider.call_count(), 2);
        assert_eq!(reply.tool_results.len(), 1);
        assert!(reply.tool_results[0].success);
        // Usage accumulates across both model calls.
        assert_eq!(reply.usage.total_tokens, 28 + 15);
    }

    #[tokio::test]
    async fn tool_failures_become_structured_error_messages() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_completion(vec![ToolCall {
                id: "call-1".to_string(),
                tool_name: "query_attendance".to_string(),
                arguments: json!({}),
            }]),
            text_completion("I need to know which attendance view you want."),
        ]));
        let orchestrator = orchestrator_with(Arc::clone(&provider), true);

        let reply = orchestrator.run_agent("check attendance", &[], &context()).await.unwrap();
        assert_eq!(reply.tool_results.len(), 1);
        let result = &reply.tool_results[0];
        assert!(!result.success);
        assert_eq!(result.error.as_ref().map(|error| error.code), Some("MISSING_PARAM"));
        // The conversation survives the failure.
        assert_eq!(reply.response, "I need to know which attendance view you want.");
    }

    #[tokio::test]
    async fn loop_bound_returns_the_fallback_after_exactly_max_iterations() {
        let provider = Arc::new(ScriptedProvider::new(vec![tool_completion(vec![ToolCall {
            id: "call-1".to_string(),
            tool_name: "query_attendance".to_string(),
            arguments: json!({ "type": "late" }),
        }])]));
        let orchestrator = orchestrator_with(Arc::clone(&provider), true);

        let reply = orchestrator.run_agent("loop forever", &[], &context()).await.unwrap();
        assert_eq!(reply.response, FALLBACK_MESSAGE);
        assert_eq!(provider.call_count(), OrchestratorConfig::default().max_iterations);
    }

    #[tokio::test]
    async fn l2_requests_surface_as_pending_execution() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_completion(vec![ToolCall {
                id: "call-1".to_string(),
                tool_name: EXECUTE_L2_INTENT.to_string(),
                arguments: json!({
                    "intent_key": "message.exec.send_announcement",
                    "params": { "message": "Closed tomorrow" }
                }),
            }]),
            text_completion("I prepared the announcement; please confirm to send."),
        ]));
        let orchestrator = orchestrator_with(Arc::clone(&provider), false);

        let reply = orchestrator.run_agent("announce the closure", &[], &context()).await.unwrap();
        let pending = l2_intent_execution(&reply).expect("pending execution must surface");
        assert_eq!(pending.intent_key, "message.exec.send_announcement");
        assert_eq!(pending.params["message"], json!("Closed tomorrow"));
        // The loop itself never finalized the send.
        assert!(reply.response.contains("confirm"));
    }

    #[tokio::test]
    async fn history_is_trimmed_to_the_configured_window() {
        let provider = Arc::new(ScriptedProvider::new(vec![text_completion("ok")]));
        let orchestrator = orchestrator_with(Arc::clone(&provider), false);

        let history: Vec<AgentMessage> =
            (0..30).map(|index| AgentMessage::user(format!("message {index}"))).collect();
        let reply = orchestrator.run_agent("latest", &history, &context()).await.unwrap();
        assert_eq!(reply.response, "ok");
    }
}
