use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

struct RpcClient {
	child: Child,
	stdin: ChildStdin,
	stdout: BufReader<ChildStdout>,
	next_id: u64,
	_logs: tempfile::TempDir,
}

impl RpcClient {
	fn spawn(bin: &str, root: &Path) -> Self {
		let mut command = Command::new(bin);
		command.arg(root).current_dir(root);
		Self::start(command)
	}
	fn spawn_with_env_roots(bin: &str, roots: &str, cwd: &Path) -> Self {
		let mut command = Command::new(bin);
		command.env("MCP_ALLOWED_ROOTS", roots).current_dir(cwd);
		Self::start(command)
	}
	fn start(mut command: Command) -> Self {
		let logs = tempfile::tempdir().expect("log dir");
		let mut child = command
			.env("MCP_LOG_DIR", logs.path())
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::null())
			.spawn()
			.expect("spawn agent");
		let stdin = child.stdin
			.take()
			.expect("stdin");
		let stdout = child.stdout
			.take()
			.expect("stdout");
		Self {
			child,
			stdin,
			stdout: BufReader::new(stdout),
			next_id: 1,
			_logs: logs
		}
	}
	fn write_line(&mut self, line: &str) {
		writeln!(self.stdin, "{}", line).expect("write request");
		self.stdin
			.flush()
			.expect("flush request");
	}
	fn read_line(&mut self) -> String {
		let mut line = String::new();
		let bytes = self.stdout
			.read_line(&mut line)
			.expect("read response");
		if bytes == 0 {
			panic!("agent exited unexpectedly");
		}
		line.trim_end().to_string()
	}
	/// Writes one raw line and returns the next raw response line.
	fn send_raw(&mut self, line: &str) -> String {
		self.write_line(line);
		self.read_line()
	}
	fn send(&mut self, method: &str, params: Value) -> Value {
		let id = self.next_id;
		self.next_id += 1;
		let req = json!({
			"jsonrpc": "2.0",
			"id": id,
			"method": method,
			"params": params
		});
		let line = serde_json::to_string(&req).expect("serialize request");
		let resp: Value = serde_json::from_str(&self.send_raw(&line)).expect("response json");
		assert_eq!(resp.get("id").and_then(Value::as_u64), Some(id));
		resp
	}
	fn call(&mut self, tool: &str, arguments: Value) -> Value {
		self.send("tools/call", json!({ "name": tool, "arguments": arguments }))
	}
}

impl Drop for RpcClient {
	fn drop(&mut self) {
		let _ = self.child.kill();
		let _ = self.child.wait();
	}
}

const FS: &str = env!("CARGO_BIN_EXE_mcp-fs");
const GIT: &str = env!("CARGO_BIN_EXE_mcp-git");

fn text_of(resp: &Value) -> &str {
	resp.pointer("/result/content/0/text")
		.and_then(Value::as_str)
		.expect("text content")
}

fn assert_access_denied(resp: &Value) {
	let error = resp.get("error").expect("error");
	assert_eq!(error.get("code").and_then(Value::as_i64), Some(-32602));
	assert_eq!(error.get("message").and_then(Value::as_str), Some("Access denied"));
}

#[test]
fn initialize_reports_protocol_and_tools_capability() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(FS, root.path());
	let resp = client.send("initialize", json!({
		"protocolVersion": "2024-11-05",
		"capabilities": {},
		"clientInfo": { "name": "test", "version": "0" }
	}));
	let result = resp.get("result").expect("result");
	assert_eq!(result.get("protocolVersion"), Some(&json!("2024-11-05")));
	assert_eq!(result.get("capabilities"), Some(&json!({ "tools": {} })));
	assert_eq!(result.pointer("/serverInfo/name"), Some(&json!("mcp-fs")));
}

#[test]
fn tool_listing_is_byte_identical_across_calls() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(FS, root.path());
	let request = r#"{"jsonrpc":"2.0","id":7,"method":"tools/list"}"#;
	let first = client.send_raw(request);
	client.call("write_file", json!({ "path": "x.txt", "content": "x" }));
	let second = client.send_raw(request);
	assert_eq!(first, second);
	let listing: Value = serde_json::from_str(&first).expect("json");
	let names: Vec<&str> = listing.pointer("/result/tools")
		.and_then(Value::as_array)
		.expect("tools")
		.iter()
		.filter_map(|tool| tool.get("name").and_then(Value::as_str))
		.collect();
	assert!(names.contains(&"read_file"));
	assert!(names.contains(&"list_allowed_directories"));
}

#[test]
fn unknown_tool_yields_exact_error_line() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(FS, root.path());
	let line = client.send_raw(r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"nope","arguments":{}}}"#);
	assert_eq!(
		line,
		r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"Unknown tool","data":"Tool not found: nope"}}"#
	);
}

#[test]
fn notifications_and_garbage_do_not_stop_the_loop() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(FS, root.path());
	client.write_line(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#);
	let parse = client.send_raw("{not json");
	let parse: Value = serde_json::from_str(&parse).expect("json");
	assert_eq!(parse.get("id"), Some(&Value::Null));
	assert_eq!(parse.pointer("/error/code").and_then(Value::as_i64), Some(-32700));
	let resp = client.send("ping/unknown", json!({}));
	assert_eq!(resp.pointer("/error/code").and_then(Value::as_i64), Some(-32601));
	assert_eq!(resp.pointer("/error/data"), Some(&json!("ping/unknown")));
}

#[test]
fn write_then_read_and_edit_inside_root() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(FS, root.path());
	let resp = client.call("write_file", json!({ "path": "notes/todo.txt", "content": "alpha\nbeta\n" }));
	assert!(resp.pointer("/result/isError").is_none());
	assert_eq!(std::fs::read_to_string(root.path().join("notes/todo.txt")).expect("read"), "alpha\nbeta\n");
	let resp = client.call("edit_file", json!({
		"path": "notes/todo.txt",
		"edits": [{ "oldText": "beta", "newText": "gamma" }]
	}));
	assert!(text_of(&resp).contains("+gamma"));
	let resp = client.call("read_file", json!({ "path": "notes/todo.txt", "tail": 1 }));
	assert_eq!(text_of(&resp), "gamma");
}

#[test]
fn missing_file_is_a_tool_failure_not_a_protocol_error() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(FS, root.path());
	let resp = client.call("read_file", json!({ "path": "absent.txt" }));
	assert!(resp.get("error").is_none());
	assert_eq!(resp.pointer("/result/isError"), Some(&json!(true)));
	assert_eq!(resp.pointer("/result/structuredContent/code"), Some(&json!("FILE_NOT_FOUND")));
}

#[test]
fn invalid_arguments_are_rejected_before_execution() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(FS, root.path());
	let resp = client.call("write_file", json!({ "path": "x.txt" }));
	assert_eq!(resp.pointer("/error/code").and_then(Value::as_i64), Some(-32602));
	assert_eq!(resp.pointer("/error/data"), Some(&json!("missing required argument: content")));
	assert!(!root.path().join("x.txt").exists());
}

#[test]
fn paths_outside_root_are_denied() {
	let parent = tempfile::tempdir().expect("tempdir");
	let root = parent.path().join("root");
	std::fs::create_dir_all(&root).expect("root");
	std::fs::write(parent.path().join("outside.txt"), "secret").expect("outside");
	let mut client = RpcClient::spawn(FS, &root);
	let resp = client.call("read_file", json!({ "path": "../outside.txt" }));
	assert_access_denied(&resp);
	assert_eq!(
		resp.pointer("/error/data"),
		Some(&json!("Access denied - path outside allowed directories: ../outside.txt"))
	);
	let resp = client.call("write_file", json!({ "path": "/tmp/../etc/escape.txt", "content": "x" }));
	assert_access_denied(&resp);
}

#[test]
fn move_checks_both_source_and_destination() {
	let parent = tempfile::tempdir().expect("tempdir");
	let root = parent.path().join("root");
	std::fs::create_dir_all(&root).expect("root");
	std::fs::write(root.join("inside.txt"), "inside").expect("inside");
	std::fs::write(parent.path().join("outside.txt"), "outside").expect("outside");
	let mut client = RpcClient::spawn(FS, &root);
	let resp = client.call("move_file", json!({ "source": "inside.txt", "destination": "../moved.txt" }));
	assert_access_denied(&resp);
	assert!(root.join("inside.txt").exists());
	let resp = client.call("move_file", json!({ "source": "../outside.txt", "destination": "pulled.txt" }));
	assert_access_denied(&resp);
	assert!(parent.path().join("outside.txt").exists());
	let resp = client.call("move_file", json!({ "source": "inside.txt", "destination": "renamed.txt" }));
	assert!(resp.pointer("/result/isError").is_none());
	assert!(root.join("renamed.txt").exists());
}

#[cfg(unix)]
#[test]
fn symlinks_cannot_escape_the_root() {
	let root = tempfile::tempdir().expect("root");
	let outside = tempfile::tempdir().expect("outside");
	std::fs::write(outside.path().join("secret.txt"), "secret").expect("secret");
	std::os::unix::fs::symlink(outside.path(), root.path().join("link")).expect("symlink");
	let mut client = RpcClient::spawn(FS, root.path());
	let resp = client.call("read_file", json!({ "path": "link/secret.txt" }));
	assert_access_denied(&resp);
	let resp = client.call("write_file", json!({ "path": "link/planted.txt", "content": "x" }));
	assert_access_denied(&resp);
	assert!(!outside.path().join("planted.txt").exists());
	let resp = client.call("write_file", json!({ "path": "missing/../link/planted.txt", "content": "x" }));
	assert_access_denied(&resp);
	assert!(!outside.path().join("planted.txt").exists());
}

#[test]
fn filesystem_agent_refuses_to_start_without_roots() {
	let logs = tempfile::tempdir().expect("logs");
	let output = Command::new(FS)
		.env_remove("MCP_ALLOWED_ROOTS")
		.env("MCP_LOG_DIR", logs.path())
		.stdin(Stdio::null())
		.output()
		.expect("run mcp-fs");
	assert!(!output.status.success());
	let stderr = String::from_utf8_lossy(&output.stderr);
	assert!(stderr.contains("usage: mcp-fs"));
}

fn git_available() -> bool {
	Command::new("git")
		.arg("--version")
		.output()
		.map(|output| output.status.success())
		.unwrap_or(false)
}

#[test]
fn git_agent_confines_repository_paths() {
	let parent = tempfile::tempdir().expect("tempdir");
	let root = parent.path().join("work");
	std::fs::create_dir_all(root.join("repo")).expect("repo dir");
	let roots = root.to_string_lossy().to_string();
	let mut client = RpcClient::spawn_with_env_roots(GIT, &roots, parent.path());
	let resp = client.call("git_status", json!({ "repository_path": parent.path() }));
	assert_access_denied(&resp);
	if !git_available() {
		return;
	}
	let init = Command::new("git")
		.arg("-C")
		.arg(root.join("repo"))
		.arg("init")
		.output()
		.expect("git init");
	assert!(init.status.success());
	let resp = client.call("git_status", json!({ "repository_path": root.join("repo") }));
	assert!(resp.pointer("/result/isError").is_none());
	let resp = client.call("git_show", json!({ "repository_path": root.join("repo"), "revision": "--help" }));
	assert_eq!(resp.pointer("/result/isError"), Some(&json!(true)));
	assert_eq!(resp.pointer("/result/structuredContent/code"), Some(&json!("INVALID_REFERENCE")));
}
