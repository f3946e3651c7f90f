use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::context::ContextVariables;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, tool_name: impl Into<String>, arguments: Value) -> Self {
        Self { id: id.into(), tool_name: tool_name.into(), arguments }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailureKind {
    NotFound,
    InvalidArguments,
    Timeout,
    Execution,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub kind: ToolFailureKind,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    pub success: bool,
    pub value: Option<Value>,
    pub error: Option<ToolFailure>,
    pub elapsed: Duration,
}

impl ToolResult {
    pub fn succeeded(request: &ToolCallRequest, value: Value, elapsed: Duration) -> Self {
        Self {
            call_id: request.id.clone(),
            tool_name: request.tool_name.clone(),
            success: true,
            value: Some(value),
            error: None,
            elapsed,
        }
    }

    pub fn failed(
        request: &ToolCallRequest,
        kind: ToolFailureKind,
        message: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            call_id: request.id.clone(),
            tool_name: request.tool_name.clone(),
            success: false,
            value: None,
            error: Some(ToolFailure { kind, message: message.into() }),
            elapsed,
        }
    }

    /// Payload sent back to the model as the tool message content.
    pub fn to_content(&self) -> Value {
        match (&self.value, &self.error) {
            (Some(value), _) if self.success => value.clone(),
            (_, Some(error)) => {
                json!({ "error": { "kind": error.kind, "message": error.message } })
            }
            _ => Value::Null,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Execution(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParameterKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub kind: ParameterKind,
    pub required: bool,
    pub description: String,
}

/// Keyword-style parameter list for a tool.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSchema {
    pub parameters: Vec<Parameter>,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(
        mut self,
        name: impl Into<String>,
        kind: ParameterKind,
        description: impl Into<String>,
    ) -> Self {
        self.parameters.push(Parameter {
            name: name.into(),
            kind,
            required: true,
            description: description.into(),
        });
        self
    }

    pub fn optional(
        mut self,
        name: impl Into<String>,
        kind: ParameterKind,
        description: impl Into<String>,
    ) -> Self {
        self.parameters.push(Parameter {
            name: name.into(),
            kind,
            required: false,
            description: description.into(),
        });
        self
    }

    /// `null` is accepted as an empty argument object. Unknown keys are ignored.
    pub fn validate(&self, arguments: &Value) -> Result<(), ToolError> {
        let empty = Map::new();
        let object = match arguments {
            Value::Null => &empty,
            Value::Object(object) => object,
            other => {
                return Err(ToolError::InvalidArguments(format!(
                    "expected a JSON object of keyword arguments, got `{other}`"
                )))
            }
        };

        for parameter in &self.parameters {
            match object.get(&parameter.name) {
                None | Some(Value::Null) if parameter.required => {
                    return Err(ToolError::InvalidArguments(format!(
                        "missing required argument `{}`",
                        parameter.name
                    )));
                }
                None | Some(Value::Null) => {}
                Some(value) if !parameter.kind.accepts(value) => {
                    return Err(ToolError::InvalidArguments(format!(
                        "argument `{}` must be of type {}",
                        parameter.name,
                        parameter.kind.as_str()
                    )));
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    pub fn to_json_schema(&self) -> Value {
        let properties = self
            .parameters
            .iter()
            .map(|parameter| {
                let mut property = Map::new();
                property.insert("type".to_owned(), json!(parameter.kind.as_str()));
                if !parameter.description.is_empty() {
                    property.insert("description".to_owned(), json!(parameter.description));
                }
                (parameter.name.clone(), Value::Object(property))
            })
            .collect::<Map<_, _>>();
        let required = self
            .parameters
            .iter()
            .filter(|parameter| parameter.required)
            .map(|parameter| parameter.name.clone())
            .collect::<Vec<_>>();

        json!({ "type": "object", "properties": properties, "required": required })
    }
}

/// What the model sees of a tool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: ParameterSchema,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn schema(&self) -> ParameterSchema;

    async fn invoke(&self, arguments: Value, context: &ContextVariables)
        -> Result<Value, ToolError>;

    fn descriptor(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_owned(),
            description: self.description().to_owned(),
            parameters: self.schema(),
        }
    }
}

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send>>;

type ToolHandler = Arc<dyn Fn(Value, ContextVariables) -> ToolFuture + Send + Sync>;

/// Adapts an async closure into a [`Tool`].
#[derive(Clone)]
pub struct FnTool {
    name: String,
    description: String,
    schema: ParameterSchema,
    handler: ToolHandler,
}

impl FnTool {
    pub fn new<F, Fut>(name: impl Into<String>, schema: ParameterSchema, handler: F) -> Self
    where
        F: Fn(Value, ContextVariables) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            schema,
            handler: Arc::new(move |arguments, context| Box::pin(handler(arguments, context))),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl std::fmt::Debug for FnTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTool").field("name", &self.name).finish_non_exhaustive()
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> ParameterSchema {
        self.schema.clone()
    }

    async fn invoke(
        &self,
        arguments: Value,
        context: &ContextVariables,
    ) -> Result<Value, ToolError> {
        (self.handler)(arguments, context.clone()).await
    }
}
