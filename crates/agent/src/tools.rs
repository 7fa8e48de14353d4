//! Tool catalog: the model-facing function surface and its mapping onto
//! intent keys.
//!
//! The catalog stays small on purpose. A `type` argument fans one tool out
//! over several intents via `{type}` substitution in the template, keeping
//! the function-calling surface compact despite the larger intent space.

use std::collections::HashMap;

use serde_json::{json, Value};

use taskdeck_core::ToolError;

#[derive(Clone, Debug)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    /// JSON-schema shape handed to the model verbatim.
    pub parameters: Value,
    /// Intent-key template; `{type}` resolves from the call's `type` argument.
    /// Empty for `execute_l2_intent`, whose target key is an argument.
    intent_template: &'static str,
}

pub struct ToolCatalog {
    tools: Vec<ToolDefinition>,
    by_name: HashMap<&'static str, usize>,
}

/// The distinguished tool whose result is routed to a confirmation step
/// instead of being finalized inside the conversational loop.
pub const EXECUTE_L2_INTENT: &str = "execute_l2_intent";

impl ToolCatalog {
    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.tools
    }

    pub fn find(&self, tool_name: &str) -> Option<&ToolDefinition> {
        self.by_name.get(tool_name).map(|index| &self.tools[*index])
    }

    /// Resolves a tool call to a concrete intent key.
    ///
    /// Fails with `MISSING_PARAM` before any handler runs when a `{type}`
    /// placeholder cannot be filled from the arguments.
    pub fn map_to_intent(&self, tool_name: &str, args: &Value) -> Result<String, ToolError> {
        let tool = self
            .find(tool_name)
            .ok_or_else(|| ToolError::HandlerNotFound(tool_name.to_string()))?;

        if tool.name == EXECUTE_L2_INTENT {
            return match args.get("intent_key").and_then(Value::as_str) {
                Some(intent_key) if !intent_key.is_empty() => Ok(intent_key.to_string()),
                _ => Err(ToolError::MissingParam("intent_key".to_string())),
            };
        }

        let template = tool.intent_template;
        if !template.contains("{type}") {
            return Ok(template.to_string());
        }

        match args.get("type").and_then(Value::as_str) {
            Some(subtype) if !subtype.is_empty() => {
                Ok(template.replace("{type}", subtype))
            }
            _ => Err(ToolError::MissingParam("type".to_string())),
        }
    }

    pub fn builtin() -> Self {
        let tools = vec![
            ToolDefinition {
                name: "search_member",
                description: "Find members by name or phone fragment.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "description": "Name or phone fragment" },
                        "limit": { "type": "integer" }
                    },
                    "required": ["query"]
                }),
                intent_template: "member.query.search",
            },
            ToolDefinition {
                name: "get_member_profile",
                description: "Full profile of a single member.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "member_id": { "type": "string" }
                    },
                    "required": ["member_id"]
                }),
                intent_template: "member.query.profile",
            },
            ToolDefinition {
                name: "query_attendance",
                description: "Attendance lookups. `type` selects the view.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "type": {
                            "type": "string",
                            "enum": ["late", "absent", "early_leave", "unchecked", "by_member", "by_class"]
                        },
                        "date": { "type": "string" },
                        "member_id": { "type": "string" },
                        "class_id": { "type": "string" }
                    },
                    "required": ["type"]
                }),
                intent_template: "attendance.query.{type}",
            },
            ToolDefinition {
                name: "query_billing",
                description: "Billing lookups. `type` selects the view.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "type": {
                            "type": "string",
                            "enum": ["overdue", "by_member", "invoice_status", "failed_payments", "kpi_summary"]
                        },
                        "member_id": { "type": "string" },
                        "month": { "type": "string" }
                    },
                    "required": ["type"]
                }),
                intent_template: "billing.query.{type}",
            },
            ToolDefinition {
                name: "query_class",
                description: "Class lookups. `type` is `list` or `roster`.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "type": { "type": "string", "enum": ["list", "roster"] },
                        "class_id": { "type": "string" }
                    },
                    "required": ["type"]
                }),
                intent_template: "class.query.{type}",
            },
            ToolDefinition {
                name: "query_schedule",
                description: "Schedule lookups. `type` selects the view.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "type": { "type": "string", "enum": ["today", "by_staff", "by_class"] },
                        "staff_id": { "type": "string" },
                        "class_id": { "type": "string" }
                    },
                    "required": ["type"]
                }),
                intent_template: "schedule.query.{type}",
            },
            ToolDefinition {
                name: "query_message_log",
                description: "Outbound message logs. `type` is `sent` or `failed`.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "type": { "type": "string", "enum": ["sent", "failed"] },
                        "from": { "type": "string" }
                    },
                    "required": ["type"]
                }),
                intent_template: "message.query.{type}_log",
            },
            ToolDefinition {
                name: "get_dashboard_kpi",
                description: "KPI summaries. `type` selects the report.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "type": { "type": "string", "enum": ["attendance", "billing", "overall"] },
                        "month": { "type": "string" }
                    },
                    "required": ["type"]
                }),
                intent_template: "report.query.{type}_summary",
            },
            ToolDefinition {
                name: "ai_summarize",
                description: "Summarize history. `type` selects the subject.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "type": { "type": "string", "enum": ["member_history", "class_history"] },
                        "member_id": { "type": "string" },
                        "class_id": { "type": "string" }
                    },
                    "required": ["type"]
                }),
                intent_template: "ai.summarize.{type}",
            },
            ToolDefinition {
                name: "ai_generate",
                description: "Generate draft content. `type` selects the kind.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "type": { "type": "string", "enum": ["followup_message", "counseling_agenda"] },
                        "member_id": { "type": "string" },
                        "tone": { "type": "string" }
                    },
                    "required": ["type"]
                }),
                intent_template: "ai.generate.{type}",
            },
            ToolDefinition {
                name: "create_notification_task",
                description: "Create an approvable guardian-notification task. Never sends directly.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "type": { "type": "string", "enum": ["late", "absent", "overdue", "general"] },
                        "member_ids": { "type": "array", "items": { "type": "string" } },
                        "message": { "type": "string" }
                    },
                    "required": ["type"]
                }),
                intent_template: "attendance.create.notify_guardians_{type}",
            },
            ToolDefinition {
                name: "draft_message",
                description: "Draft a message as an approvable task. Never sends directly.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "type": {
                            "type": "string",
                            "enum": ["absence_notice", "overdue_notice", "general_notice", "payment_link"]
                        },
                        "member_id": { "type": "string" },
                        "message": { "type": "string" }
                    },
                    "required": ["type"]
                }),
                intent_template: "message.draft.{type}",
            },
            ToolDefinition {
                name: EXECUTE_L2_INTENT,
                description: "Request execution of an autonomous intent. The user must confirm in a separate step; this call never performs the side effect itself.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "intent_key": { "type": "string" },
                        "params": { "type": "object" }
                    },
                    "required": ["intent_key", "params"]
                }),
                intent_template: "",
            },
        ];

        let by_name = tools.iter().enumerate().map(|(index, tool)| (tool.name, index)).collect();
        Self { tools, by_name }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ToolCatalog, EXECUTE_L2_INTENT};
    use taskdeck_core::{IntentRegistry, ToolError};

    #[test]
    fn static_templates_resolve_without_arguments() {
        let catalog = ToolCatalog::builtin();
        let key = catalog.map_to_intent("search_member", &json!({ "query": "kim" })).unwrap();
        assert_eq!(key, "member.query.search");
    }

    #[test]
    fn type_placeholder_substitutes_from_arguments() {
        let catalog = ToolCatalog::builtin();
        let key = catalog.map_to_intent("query_attendance", &json!({ "type": "late" })).unwrap();
        assert_eq!(key, "attendance.query.late");

        let key = catalog.map_to_intent("query_message_log", &json!({ "type": "failed" })).unwrap();
        assert_eq!(key, "message.query.failed_log");
    }

    #[test]
    fn missing_type_fails_before_any_handler() {
        let catalog = ToolCatalog::builtin();
        let error = catalog.map_to_intent("query_attendance", &json!({})).unwrap_err();
        assert_eq!(error, ToolError::MissingParam("type".to_string()));
    }

    #[test]
    fn execute_l2_intent_takes_its_key_from_arguments() {
        let catalog = ToolCatalog::builtin();
        let key = catalog
            .map_to_intent(
                EXECUTE_L2_INTENT,
                &json!({ "intent_key": "message.exec.send_announcement", "params": {} }),
            )
            .unwrap();
        assert_eq!(key, "message.exec.send_announcement");

        let error = catalog.map_to_intent(EXECUTE_L2_INTENT, &json!({})).unwrap_err();
        assert_eq!(error, ToolError::MissingParam("intent_key".to_string()));
    }

    #[test]
    fn unknown_tools_are_rejected() {
        let catalog = ToolCatalog::builtin();
        let error = catalog.map_to_intent("drop_database", &json!({})).unwrap_err();
        assert!(matches!(error, ToolError::HandlerNotFound(_)));
    }

    #[test]
    fn every_type_enum_value_resolves_to_a_registered_intent() {
        let catalog = ToolCatalog::builtin();
        let registry = IntentRegistry::builtin();

        for tool in catalog.definitions() {
            if tool.name == EXECUTE_L2_INTENT {
                continue;
            }
            let subtypes: Vec<String> = tool.parameters["properties"]["type"]["enum"]
                .as_array()
                .map(|values| {
                    values
                        .iter()
                        .filter_map(|value| value.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_else(|| vec![String::new()]);

            for subtype in subtypes {
                let args = if subtype.is_empty() {
                    json!({ "query": "x", "member_id": "m-1" })
                } else {
                    json!({ "type": subtype })
                };
                let key = catalog.map_to_intent(tool.name, &args).unwrap();
                assert!(
                    registry.resolve(&key).is_some(),
                    "tool {} resolved to unregistered intent {key}",
                    tool.name
                );
            }
        }
    }
}
