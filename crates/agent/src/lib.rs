//! Agent runtime - the tool-calling loop between the language model and the
//! intent layer.
//!
//! This crate turns free-form user requests into classified operations:
//! - **Tool catalog** (`tools`) - the compact function surface shown to the
//!   model, mapped onto intent keys by template substitution
//! - **Intent dispatcher** (`dispatch`) - resolves and validates a tool call,
//!   runs L0 reads, defers L1 work to an approvable task card
//! - **Orchestrator** (`orchestrator`) - the bounded conversational loop
//! - **Provider seam** (`llm`) - `ChatCompletionProvider` with an
//!   OpenAI-compatible HTTP client
//!
//! # Safety Principle
//!
//! The model never executes a side effect. Read-only lookups run inline;
//! everything else is deferred into a TaskCard or routed through a separate
//! confirmation step, and the tier of every operation comes from the intent
//! registry, not from the model or a handler.

pub mod dispatch;
pub mod llm;
pub mod orchestrator;
pub mod tools;

pub use dispatch::{CardPlanner, DispatchResult, IntentDispatcher, IntentHandler, PendingExecution};
pub use llm::{
    AgentMessage, ChatCompletion, ChatCompletionProvider, OpenAiCompatibleProvider, Role,
    ToolCall, ToolChoice, Usage,
};
pub use orchestrator::{
    l2_intent_execution, AgentReply, Orchestrator, OrchestratorConfig, ToolErrorView,
    ToolResultView, FALLBACK_MESSAGE,
};
pub use tools::{ToolCatalog, ToolDefinition, EXECUTE_L2_INTENT};
