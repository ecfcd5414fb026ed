use crate::backend::ToolBackend;
use crate::logging::Logger;
use crate::protocol::{ProtocolError, Request, Response, ToolResult, JSONRPC_VERSION, PROTOCOL_VERSION};
use crate::registry::ToolRegistry;
use crate::sandbox::PathSandbox;
use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::instrument::WithSubscriber;
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug, Clone)]
pub struct AgentInfo {
	pub name: &'static str,
	pub version: &'static str,
	pub session_id: String,
}

pub struct Server<B: ToolBackend> {
	info: AgentInfo,
	registry: ToolRegistry,
	sandbox: PathSandbox,
	backend: B,
}

#[derive(Debug, Deserialize)]
struct CallParams {
	name: String,
	#[serde(default)]
	arguments: Option<Value>,
}

impl<B: ToolBackend> Server<B> {
	pub fn new(info: AgentInfo, registry: ToolRegistry, sandbox: PathSandbox, backend: B) -> Self {
		Self {
			info,
			registry,
			sandbox,
			backend
		}
	}

	/// Serves stdin/stdout until end of input, logging through `logger`.
	pub async fn run(&self, logger: &Logger) -> Result<()> {
		let reader = BufReader::new(io::stdin());
		let writer = io::BufWriter::new(io::stdout());
		self.serve(reader, writer)
			.with_subscriber(logger.dispatch().clone())
			.await
	}

	/// One request per line, one response line per non-notification request,
	/// strictly in order. Only end of input or an I/O failure ends the loop.
	pub async fn serve<R, W>(&self, mut reader: R, mut writer: W) -> Result<()>
	where
		R: AsyncBufRead + Unpin,
		W: AsyncWrite + Unpin, {
		info!(
			agent = self.info.name,
			session_id = %self.info.session_id,
			tools = self.registry.len(),
			roots = ?self.sandbox.roots().iter().map(|root| root.path().display().to_string()).collect::<Vec<_>>(),
			"listening on stdio"
		);
		let mut buf = Vec::new();
		loop {
			buf.clear();
			let read = reader.read_until(b'\n', &mut buf).await?;
			if read == 0 {
				break;
			}
			let response = match std::str::from_utf8(&buf) {
				Ok(line) => {
					if line.trim().is_empty() {
						continue;
					}
					self.handle_line(line).await
				}
				Err(err) => {
					warn!("discarding line that is not valid UTF-8");
					Some(Response::err(Value::Null, ProtocolError::parse_error(err.to_string())))
				}
			};
			if let Some(response) = response {
				write_response(&mut writer, response).await?;
			}
		}
		info!("end of input; shutting down");
		Ok(())
	}

	async fn handle_line(&self, line: &str) -> Option<Response> {
		let req: Request = match serde_json::from_str(line) {
			Ok(req) => req,
			Err(err) => {
				warn!(error = %err, "malformed request");
				return Some(Response::err(Value::Null, ProtocolError::parse_error(err.to_string())));
			}
		};
		let tool_name = extract_tool_name(&req);
		let span = info_span!(
			"mcp.request",
			"mcp.session_id" = %self.info.session_id,
			"mcp.method" = %req.method,
			"mcp.id" = %req.id,
			"mcp.tool_name" = tool_name.as_deref().unwrap_or(""),
		);
		self.handle_request(req)
			.instrument(span)
			.await
	}

	async fn handle_request(&self, req: Request) -> Option<Response> {
		info!("request received");
		if req.is_notification() {
			if req.jsonrpc != JSONRPC_VERSION {
				warn!(jsonrpc = %req.jsonrpc, "dropping notification with unsupported jsonrpc version");
			}
			else {
				debug!("notification acknowledged");
			}
			return None;
		}
		if req.jsonrpc != JSONRPC_VERSION {
			return Some(Response::err(
				req.id,
				ProtocolError::parse_error(format!("unsupported jsonrpc version: {}", req.jsonrpc))
			));
		}
		let response = match self.route(&req).await {
			Ok(result) => Response::ok(req.id, result),
			Err(err) => {
				warn!(code = err.code, message = %err.message, data = ?err.data, "request failed");
				Response::err(req.id, err)
			}
		};
		Some(response)
	}

	async fn route(&self, req: &Request) -> Result<Value, ProtocolError> {
		match req.method.as_str() {
			"initialize" => Ok(json!({
				"protocolVersion": PROTOCOL_VERSION,
				"capabilities": {
					"tools": {}
				},
				"serverInfo": {
					"name": self.info.name,
					"version": self.info.version
				}
			})),
			"tools/list" => Ok(self.registry.listing().clone()),
			"tools/call" => {
				let params: CallParams = serde_json::from_value(req.params.clone())
					.map_err(|err| ProtocolError::invalid_params(format!("tools/call params: {}", err)))?;
				let result = self.call_tool(&params).await?;
				serde_json::to_value(result).map_err(|err| ProtocolError::internal(err.to_string()))
			}
			other => Err(ProtocolError::method_not_found(other)),
		}
	}

	async fn call_tool(&self, params: &CallParams) -> Result<ToolResult, ProtocolError> {
		let call: B::Call = self.registry.prepare(&self.sandbox, &params.name, params.arguments.as_ref())?;
		info!(?call, "tool called");
		match self.backend.execute(call).await {
			Ok(output) => {
				info!("backend succeeded");
				Ok(output.into_tool_result())
			}
			Err(err) => {
				warn!(code = err.code(), error = %err, "backend failed");
				Ok(err.into_tool_result())
			}
		}
	}
}

fn extract_tool_name(req: &Request) -> Option<String> {
	if req.method != "tools/call" {
		return None;
	}
	req.params
		.get("name")
		.and_then(Value::as_str)
		.map(|value| value.to_string())
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, resp: Response) -> Result<()> {
	let is_error = resp.is_error();
	let line = match serde_json::to_string(&resp) {
		Ok(line) => line,
		Err(err) => {
			warn!(error = %err, "response serialization failed");
			serde_json::to_string(&Response::err(resp.id, ProtocolError::internal(err.to_string())))?
		}
	};
	writer.write_all(line.as_bytes()).await?;
	writer.write_all(b"\n").await?;
	writer.flush().await?;
	info!(is_error, bytes = line.len(), "response sent");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::{BackendError, BackendOutput};
	use crate::protocol::INVALID_PARAMS;
	use crate::registry::{Property, ToolDefinition};
	use crate::sandbox::Root;
	use std::cell::Cell;

	#[derive(Debug, Deserialize)]
	#[serde(tag = "name", content = "arguments", rename_all = "snake_case")]
	enum EchoCall {
		Echo {
			text: String,
		},
		Touch {
			path: String,
		},
		Fail {},
	}

	#[derive(Default)]
	struct EchoBackend {
		calls: Cell<usize>,
	}

	impl ToolBackend for EchoBackend {
		type Call = EchoCall;

		async fn execute(&self, call: EchoCall) -> Result<BackendOutput, BackendError> {
			self.calls.set(self.calls.get() + 1);
			match call {
				EchoCall::Echo { text } => Ok(BackendOutput::text(text)),
				EchoCall::Touch { path } => Ok(BackendOutput::text(path)),
				EchoCall::Fail {} => Err(BackendError::failed("BOOM", "backend exploded")),
			}
		}
	}

	fn server(dir: &tempfile::TempDir) -> Server<EchoBackend> {
		let registry = ToolRegistry::new(vec![
			ToolDefinition::new("echo", "echo text").property("text", Property::string("text").required()),
			ToolDefinition::new("touch", "touch a path").property("path", Property::path("path").required()),
			ToolDefinition::new("fail", "always fails"),
		]);
		let root = Root::new(dir.path()).expect("root");
		let info = AgentInfo {
			name: "test-agent",
			version: "0.0.1",
			session_id: "session".to_string()
		};
		Server::new(info, registry, PathSandbox::new(vec![root]), EchoBackend::default())
	}

	async fn exchange(server: &Server<EchoBackend>, input: &str) -> Vec<Value> {
		let mut output: Vec<u8> = Vec::new();
		server.serve(input.as_bytes(), &mut output).await.expect("serve");
		String::from_utf8(output)
			.expect("utf8 output")
			.lines()
			.map(|line| serde_json::from_str(line).expect("json line"))
			.collect()
	}

	#[tokio::test]
	async fn malformed_line_does_not_stop_the_loop() {
		let dir = tempfile::tempdir().expect("tempdir");
		let server = server(&dir);
		let input = "{not json\n{\"jsonrpc\":\"2.0\",\"id\":7,\"method\":\"tools/list\"}\n";
		let lines = exchange(&server, input).await;
		assert_eq!(lines.len(), 2);
		assert_eq!(lines[0]["id"], Value::Null);
		assert_eq!(lines[0]["error"]["code"], json!(-32700));
		assert_eq!(lines[1]["id"], json!(7));
		assert_eq!(lines[1]["result"]["tools"].as_array().map(Vec::len), Some(3));
	}

	#[tokio::test]
	async fn notifications_and_blank_lines_are_silent() {
		let dir = tempfile::tempdir().expect("tempdir");
		let server = server(&dir);
		let input = "\n   \n{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n";
		assert!(exchange(&server, input).await.is_empty());
	}

	#[tokio::test]
	async fn initialize_advertises_empty_tools_capability() {
		let dir = tempfile::tempdir().expect("tempdir");
		let server = server(&dir);
		let input = "{\"jsonrpc\":\"2.0\",\"id\":\"init\",\"method\":\"initialize\",\"params\":{}}\n";
		let lines = exchange(&server, input).await;
		assert_eq!(lines[0]["result"]["protocolVersion"], json!(PROTOCOL_VERSION));
		assert_eq!(lines[0]["result"]["capabilities"], json!({ "tools": {} }));
		assert_eq!(lines[0]["result"]["serverInfo"]["name"], json!("test-agent"));
	}

	#[tokio::test]
	async fn unknown_tool_matches_the_wire_format() {
		let dir = tempfile::tempdir().expect("tempdir");
		let server = server(&dir);
		let mut output: Vec<u8> = Vec::new();
		let input = "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/call\",\"params\":{\"name\":\"nope\",\"arguments\":{}}}\n";
		server.serve(input.as_bytes(), &mut output).await.expect("serve");
		assert_eq!(
			String::from_utf8(output).expect("utf8"),
			"{\"jsonrpc\":\"2.0\",\"id\":1,\"error\":{\"code\":-32602,\"message\":\"Unknown tool\",\"data\":\"Tool not found: nope\"}}\n"
		);
	}

	#[tokio::test]
	async fn unknown_method_keeps_the_request_id() {
		let dir = tempfile::tempdir().expect("tempdir");
		let server = server(&dir);
		let input = "{\"jsonrpc\":\"2.0\",\"id\":\"abc\",\"method\":\"resources/list\"}\n";
		let lines = exchange(&server, input).await;
		assert_eq!(lines[0]["id"], json!("abc"));
		assert_eq!(lines[0]["error"]["code"], json!(-32601));
	}

	#[tokio::test]
	async fn backend_failure_is_a_successful_response() {
		let dir = tempfile::tempdir().expect("tempdir");
		let server = server(&dir);
		let input = "{\"jsonrpc\":\"2.0\",\"id\":3,\"method\":\"tools/call\",\"params\":{\"name\":\"fail\"}}\n";
		let lines = exchange(&server, input).await;
		assert!(lines[0].get("error").is_none());
		assert_eq!(lines[0]["result"]["isError"], json!(true));
		assert_eq!(lines[0]["result"]["content"][0]["text"], json!("backend exploded"));
		assert_eq!(lines[0]["result"]["structuredContent"]["code"], json!("BOOM"));
	}

	#[tokio::test]
	async fn rejected_paths_never_reach_the_backend() {
		let dir = tempfile::tempdir().expect("tempdir");
		let server = server(&dir);
		let input = "{\"jsonrpc\":\"2.0\",\"id\":4,\"method\":\"tools/call\",\"params\":{\"name\":\"touch\",\"arguments\":{\"path\":\"/\"}}}\n\
			{\"jsonrpc\":\"2.0\",\"id\":5,\"method\":\"tools/call\",\"params\":{\"name\":\"echo\",\"arguments\":{}}}\n";
		let lines = exchange(&server, input).await;
		assert_eq!(lines.len(), 2);
		assert_eq!(lines[0]["error"]["code"], json!(INVALID_PARAMS));
		assert_eq!(lines[0]["error"]["message"], json!("Access denied"));
		assert_eq!(lines[1]["error"]["data"], json!("missing required argument: text"));
		assert_eq!(server.backend.calls.get(), 0);
	}

	#[tokio::test]
	async fn responses_follow_request_order() {
		let dir = tempfile::tempdir().expect("tempdir");
		let server = server(&dir);
		let mut input = String::new();
		for id in 0..5 {
			input.push_str(&format!(
				"{{\"jsonrpc\":\"2.0\",\"id\":{},\"method\":\"tools/call\",\"params\":{{\"name\":\"echo\",\"arguments\":{{\"text\":\"n{}\"}}}}}}\n",
				id, id
			));
		}
		let lines = exchange(&server, &input).await;
		let ids: Vec<Value> = lines.iter().map(|line| line["id"].clone()).collect();
		assert_eq!(ids, (0..5).map(|id| json!(id)).collect::<Vec<_>>());
		assert_eq!(lines[4]["result"]["content"][0]["text"], json!("n4"));
		assert_eq!(server.backend.calls.get(), 5);
	}

	#[tokio::test]
	async fn invalid_utf8_is_a_parse_error() {
		let dir = tempfile::tempdir().expect("tempdir");
		let server = server(&dir);
		let mut input: Vec<u8> = vec![0xff, 0xfe, b'\n'];
		input.extend_from_slice(b"{\"jsonrpc\":\"2.0\",\"id\":9,\"method\":\"tools/list\"}\n");
		let mut output: Vec<u8> = Vec::new();
		server.serve(input.as_slice(), &mut output).await.expect("serve");
		let text = String::from_utf8(output).expect("utf8");
		let lines: Vec<&str> = text.lines().collect();
		assert_eq!(lines.len(), 2);
		assert!(lines[0].contains("-32700"));
		assert!(lines[1].contains("\"id\":9"));
	}

	#[tokio::test]
	async fn wrong_jsonrpc_version_is_rejected_with_its_id() {
		let dir = tempfile::tempdir().expect("tempdir");
		let server = server(&dir);
		let input = "{\"jsonrpc\":\"1.0\",\"id\":11,\"method\":\"tools/list\"}\n";
		let lines = exchange(&server, input).await;
		assert_eq!(lines[0]["id"], json!(11));
		assert_eq!(lines[0]["error"]["code"], json!(-32700));
	}

	#[tokio::test]
	async fn notification_with_wrong_version_stays_silent() {
		let dir = tempfile::tempdir().expect("tempdir");
		let server = server(&dir);
		let input = concat!(
			"{\"jsonrpc\":\"1.0\",\"method\":\"notifications/initialized\"}\n",
			"{\"jsonrpc\":\"2.0\",\"id\":13,\"method\":\"tools/list\"}\n"
		);
		let lines = exchange(&server, input).await;
		assert_eq!(lines.len(), 1);
		assert_eq!(lines[0]["id"], json!(13));
	}

	#[tokio::test]
	async fn request_events_reach_the_default_log() {
		let dir = tempfile::tempdir().expect("tempdir");
		let logs = tempfile::tempdir().expect("logs");
		let logger = crate::logging::init("loop-agent", Some(logs.path()));
		let server = server(&dir);
		let input = "{\"jsonrpc\":\"2.0\",\"id\":14,\"method\":\"tools/list\"}\n";
		let mut output: Vec<u8> = Vec::new();
		server.serve(input.as_bytes(), &mut output)
			.with_subscriber(logger.dispatch().clone())
			.await
			.expect("serve");
		let contents = std::fs::read_to_string(logs.path().join("loop-agent.log")).expect("log");
		assert!(contents.contains("request received"));
		assert!(contents.contains("response sent"));
	}

	#[tokio::test]
	async fn tools_call_without_name_is_invalid_params() {
		let dir = tempfile::tempdir().expect("tempdir");
		let server = server(&dir);
		let input = "{\"jsonrpc\":\"2.0\",\"id\":12,\"method\":\"tools/call\",\"params\":{\"arguments\":{}}}\n";
		let lines = exchange(&server, input).await;
		assert_eq!(lines[0]["error"]["code"], json!(INVALID_PARAMS));
		assert_eq!(lines[0]["error"]["message"], json!("Invalid params"));
	}
}
