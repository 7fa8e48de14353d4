pub mod audit;
pub mod cards;
pub mod config;
pub mod errors;
pub mod identity;
pub mod intents;
pub mod messaging;

pub use audit::{
    ActorType, AuditRun, AuditRunId, AuditStep, Cursor, CursorError, Page, RunFilter, RunSource,
    RunStatus, StepStatus,
};
pub use cards::{
    active_order, build_dedup_key, CardEngine, CardError, CardPlan, CardStatus, CardTransition,
    Completion, Recipient, SuggestedAction, TaskCard, TaskCardId, TaskType,
};
pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
pub use errors::ToolError;
pub use identity::{Actor, ActorRole, RequestContext, TenantId, UserId};
pub use intents::{
    AutomationTier, CardSpec, DedupWindow, EventCatalog, ExecutionClass, IntentContract,
    IntentRegistry, ParamSchema, ParamType,
};
pub use messaging::{MessageSender, RecordingMessageSender, SendOutcome, SentMessage};
