use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Deserialize)]
pub struct Request {
	pub jsonrpc: String,
	#[serde(default)]
	pub id: Value,
	pub method: String,
	#[serde(default)]
	pub params: Value,
}

impl Request {
	pub fn is_notification(&self) -> bool {
		self.method.starts_with("notifications/")
	}
}

#[derive(Debug, Serialize)]
pub struct Response {
	pub jsonrpc: &'static str,
	pub id: Value,
	#[serde(flatten)]
	pub payload: Payload,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Payload {
	Result(Value),
	Error(ErrorObject),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorObject {
	pub code: i64,
	pub message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
}

impl Response {
	pub fn ok(id: Value, result: Value) -> Self {
		Self {
			jsonrpc: JSONRPC_VERSION,
			id,
			payload: Payload::Result(result)
		}
	}
	pub fn err(id: Value, error: ProtocolError) -> Self {
		Self {
			jsonrpc: JSONRPC_VERSION,
			id,
			payload: Payload::Error(error.into_object())
		}
	}
	pub fn is_error(&self) -> bool {
		matches!(self.payload, Payload::Error(_))
	}
}

/// JSON-RPC level failure. Backend failures never use this type; they travel
/// as a successful response carrying an error [`ToolResult`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message} ({code})")]
pub struct ProtocolError {
	pub code: i64,
	pub message: String,
	pub data: Option<Value>,
}

impl ProtocolError {
	pub fn new(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
		Self {
			code,
			message: message.into(),
			data
		}
	}
	pub fn parse_error(detail: impl Into<String>) -> Self {
		Self::new(PARSE_ERROR, "Parse error", Some(Value::String(detail.into())))
	}
	pub fn method_not_found(method: &str) -> Self {
		Self::new(METHOD_NOT_FOUND, "Method not found", Some(Value::String(method.to_string())))
	}
	pub fn invalid_params(detail: impl Into<String>) -> Self {
		Self::new(INVALID_PARAMS, "Invalid params", Some(Value::String(detail.into())))
	}
	pub fn unknown_tool(name: &str) -> Self {
		Self::new(INVALID_PARAMS, "Unknown tool", Some(Value::String(format!("Tool not found: {}", name))))
	}
	pub fn access_denied(detail: impl Into<String>) -> Self {
		Self::new(INVALID_PARAMS, "Access denied", Some(Value::String(detail.into())))
	}
	pub fn internal(detail: impl Into<String>) -> Self {
		Self::new(INTERNAL_ERROR, "Internal error", Some(Value::String(detail.into())))
	}
	fn into_object(self) -> ErrorObject {
		ErrorObject {
			code: self.code,
			message: self.message,
			data: self.data
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Content {
	Text {
		text: String,
	},
	Image {
		data: String,
		#[serde(rename = "mimeType")]
		mime_type: String,
	},
	Audio {
		data: String,
		#[serde(rename = "mimeType")]
		mime_type: String,
	},
}

impl Content {
	pub fn text(text: impl Into<String>) -> Self {
		Content::Text {
			text: text.into()
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
	pub content: Vec<Content>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub structured_content: Option<Value>,
	#[serde(skip_serializing_if = "std::ops::Not::not")]
	pub is_error: bool,
}

impl ToolResult {
	pub fn success(content: Vec<Content>) -> Self {
		Self {
			content,
			structured_content: None,
			is_error: false
		}
	}
	pub fn failure(code: &str, message: impl Into<String>) -> Self {
		Self {
			content: vec![Content::text(message)],
			structured_content: Some(json!({ "code": code })),
			is_error: true
		}
	}
}
