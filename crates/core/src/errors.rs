use thiserror::Error;

/// Categorized failure of a single tool dispatch.
///
/// Every tool execution failure is folded into one of these categories at the
/// dispatch boundary so the agent can explain it in natural language instead
/// of surfacing an internal trace. The `code` values are part of the external
/// contract and must stay stable.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("invalid tool arguments: {0}")]
    InputType(String),
    #[error("required parameter missing: {0}")]
    MissingParam(String),
    #[error("no handler registered for intent `{0}`")]
    HandlerNotFound(String),
    #[error("actor is not permitted to perform this action: {0}")]
    RoleForbidden(String),
    #[error("downstream provider failure: {0}")]
    Provider(String),
    #[error("event type `{0}` is not registered in the automation event catalog")]
    EventTypeUnregistered(String),
}

impl ToolError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InputType(_) => "CONTRACT_INPUT_TYPE",
            Self::MissingParam(_) => "MISSING_PARAM",
            Self::HandlerNotFound(_) => "HANDLER_NOT_FOUND",
            Self::RoleForbidden(_) => "ROLE_FORBIDDEN",
            Self::Provider(_) => "EXTERNAL_PROVIDER_FAILURE",
            Self::EventTypeUnregistered(_) => "EVENT_TYPE_UNREGISTERED",
        }
    }

    /// Message safe to show to an end user, without internal detail.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::InputType(_) | Self::MissingParam(_) => {
                "The request is missing required details. Please rephrase with more specifics."
            }
            Self::HandlerNotFound(_) => "That operation is not available yet.",
            Self::RoleForbidden(_) => "You are not permitted to perform this action.",
            Self::Provider(_) => "A downstream service is temporarily unavailable. Please retry.",
            Self::EventTypeUnregistered(_) => "This automation is not enabled for your workspace.",
        }
    }

    /// Whether a retry of the same call could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider(_))
    }
}
