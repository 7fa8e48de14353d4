use serde_json::Value;

use crate::errors::ToolError;

/// Accepted JSON shape for a single intent parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Boolean,
    Object,
    Array,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ParamField {
    pub name: &'static str,
    pub param_type: ParamType,
    pub required: bool,
    pub allowed_values: Option<&'static [&'static str]>,
}

/// Structural validator for the JSON arguments an intent accepts.
///
/// Unknown fields are tolerated on purpose: the language model frequently adds
/// extra context keys, and rejecting them would turn harmless chatter into
/// hard failures. Only declared fields are checked.
#[derive(Clone, Debug, Default)]
pub struct ParamSchema {
    fields: Vec<ParamField>,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn required(mut self, name: &'static str, param_type: ParamType) -> Self {
        self.fields.push(ParamField { name, param_type, required: true, allowed_values: None });
        self
    }

    pub fn optional(mut self, name: &'static str, param_type: ParamType) -> Self {
        self.fields.push(ParamField { name, param_type, required: false, allowed_values: None });
        self
    }

    pub fn required_enum(mut self, name: &'static str, allowed: &'static [&'static str]) -> Self {
        self.fields.push(ParamField {
            name,
            param_type: ParamType::String,
            required: true,
            allowed_values: Some(allowed),
        });
        self
    }

    pub fn fields(&self) -> &[ParamField] {
        &self.fields
    }

    /// Checks `args` against the declared fields and returns the value
    /// unchanged on success.
    pub fn validate(&self, args: &Value) -> Result<(), ToolError> {
        let map = match args {
            Value::Object(map) => map,
            Value::Null if self.fields.iter().all(|field| !field.required) => return Ok(()),
            other => {
                return Err(ToolError::InputType(format!(
                    "arguments must be a JSON object, got {}",
                    json_type_name(other)
                )));
            }
        };

        for field in &self.fields {
            let value = match map.get(field.name) {
                Some(value) if !value.is_null() => value,
                _ if field.required => {
                    return Err(ToolError::MissingParam(field.name.to_string()));
                }
                _ => continue,
            };

            if !field.param_type.matches(value) {
                return Err(ToolError::InputType(format!(
                    "parameter `{}` must be of type {}, got {}",
                    field.name,
                    field.param_type.as_str(),
                    json_type_name(value)
                )));
            }

            if let Some(allowed) = field.allowed_values {
                let text = value.as_str().unwrap_or_default();
                if !allowed.contains(&text) {
                    return Err(ToolError::InputType(format!(
                        "parameter `{}` must be one of [{}], got `{text}`",
                        field.name,
                        allowed.join(", ")
                    )));
                }
            }
        }

        Ok(())
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ParamSchema, ParamType};
    use crate::errors::ToolError;

    fn member_lookup_schema() -> ParamSchema {
        ParamSchema::new()
            .required("member_id", ParamType::String)
            .optional("include_history", ParamType::Boolean)
    }

    #[test]
    fn accepts_well_formed_arguments() {
        let schema = member_lookup_schema();
        let result = schema.validate(&json!({ "member_id": "m-1", "include_history": true }));
        assert!(result.is_ok());
    }

    #[test]
    fn tolerates_undeclared_extra_fields() {
        let schema = member_lookup_schema();
        let result = schema.validate(&json!({ "member_id": "m-1", "note": "from chat" }));
        assert!(result.is_ok());
    }

    #[test]
    fn missing_required_field_is_reported_by_name() {
        let schema = member_lookup_schema();
        let error = schema.validate(&json!({ "include_history": false })).unwrap_err();
        assert_eq!(error, ToolError::MissingParam("member_id".to_string()));
    }

    #[test]
    fn null_counts_as_missing_for_required_fields() {
        let schema = member_lookup_schema();
        let error = schema.validate(&json!({ "member_id": null })).unwrap_err();
        assert_eq!(error, ToolError::MissingParam("member_id".to_string()));
    }

    #[test]
    fn wrong_type_is_a_contract_violation() {
        let schema = member_lookup_schema();
        let error = schema.validate(&json!({ "member_id": 42 })).unwrap_err();
        assert!(matches!(error, ToolError::InputType(_)));
    }

    #[test]
    fn enum_fields_reject_unlisted_values() {
        let schema = ParamSchema::new().required_enum("type", &["late", "absent"]);
        assert!(schema.validate(&json!({ "type": "late" })).is_ok());
        let error = schema.validate(&json!({ "type": "tardy" })).unwrap_err();
        assert!(matches!(error, ToolError::InputType(_)));
    }

    #[test]
    fn non_object_arguments_are_rejected() {
        let schema = member_lookup_schema();
        let error = schema.validate(&json!("member_id=m-1")).unwrap_err();
        assert!(matches!(error, ToolError::InputType(_)));
    }

    #[test]
    fn null_arguments_pass_when_nothing_is_required() {
        let schema = ParamSchema::new().optional("limit", ParamType::Integer);
        assert!(schema.validate(&serde_json::Value::Null).is_ok());
    }
}
