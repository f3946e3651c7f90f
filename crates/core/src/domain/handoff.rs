use serde::{Deserialize, Serialize};

use crate::domain::tool::{ParameterKind, ParameterSchema, ToolCallRequest, ToolSchema};

pub const TRANSFER_TOOL_PREFIX: &str = "transfer_to_";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffRequest {
    pub target_agent_name: String,
    pub reason: Option<String>,
}

/// One accepted transfer, recorded on the run result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub from: String,
    pub to: String,
    pub reason: Option<String>,
    pub turn: u32,
}

pub fn transfer_tool_name(target: &str) -> String {
    format!("{TRANSFER_TOOL_PREFIX}{target}")
}

pub fn is_transfer_call(request: &ToolCallRequest) -> bool {
    request.tool_name.starts_with(TRANSFER_TOOL_PREFIX)
}

pub fn parse_transfer_call(request: &ToolCallRequest) -> Option<HandoffRequest> {
    let target = request.tool_name.strip_prefix(TRANSFER_TOOL_PREFIX)?;
    if target.is_empty() {
        return None;
    }
    let reason = request
        .arguments
        .get("reason")
        .and_then(|value| value.as_str())
        .map(str::to_owned)
        .filter(|reason| !reason.trim().is_empty());

    Some(HandoffRequest { target_agent_name: target.to_owned(), reason })
}

pub fn transfer_tool_schema(target: &str) -> ToolSchema {
    ToolSchema {
        name: transfer_tool_name(target),
        description: format!("Transfer the conversation to the {target} agent."),
        parameters: ParameterSchema::new().optional(
            "reason",
            ParameterKind::String,
            "why control is being handed over",
        ),
    }
}

pub fn transfer_tool_schemas<'a>(targets: impl IntoIterator<Item = &'a str>) -> Vec<ToolSchema> {
    targets.into_iter().map(transfer_tool_schema).collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{parse_transfer_call, transfer_tool_name, transfer_tool_schema};
    use crate::domain::tool::ToolCallRequest;

    #[test]
    fn transfer_call_parses_target_and_optional_reason() {
        let with_reason = ToolCallRequest::new(
            "c1",
            transfer_tool_name("Writer"),
            json!({ "reason": "draft is ready" }),
        );
        let bare = ToolCallRequest::new("c2", "transfer_to_Writer", json!(null));

        let parsed = parse_transfer_call(&with_reason).expect("transfer call should parse");
        assert_eq!(parsed.target_agent_name, "Writer");
        assert_eq!(parsed.reason.as_deref(), Some("draft is ready"));
        assert_eq!(parse_transfer_call(&bare).and_then(|request| request.reason), None);
    }

    #[test]
    fn ordinary_and_malformed_calls_are_not_transfers() {
        assert!(parse_transfer_call(&ToolCallRequest::new("c1", "search", json!({}))).is_none());
        assert!(parse_transfer_call(&ToolCallRequest::new("c2", "transfer_to_", json!({})))
            .is_none());
    }

    #[test]
    fn transfer_schema_requires_no_parameters() {
        let schema = transfer_tool_schema("Writer");

        assert_eq!(schema.name, "transfer_to_Writer");
        assert!(schema.parameters.parameters.iter().all(|parameter| !parameter.required));
        assert!(schema.parameters.validate(&json!({})).is_ok());
    }
}
