use crate::protocol::{Content, ToolResult};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// The external system a tool delegates to once its arguments have been
/// validated and every path argument has passed the sandbox.
pub trait ToolBackend {
	/// Typed tool invocation, decoded from `{"name": .., "arguments": {..}}`.
	type Call: DeserializeOwned + std::fmt::Debug;

	fn execute(&self, call: Self::Call) -> impl Future<Output = Result<BackendOutput, BackendError>>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendOutput {
	pub content: Vec<Content>,
	pub stderr: String,
}

impl BackendOutput {
	pub fn text(stdout: impl Into<String>) -> Self {
		Self {
			content: vec![Content::text(stdout)],
			stderr: String::new()
		}
	}
	pub fn image(data: String, mime_type: impl Into<String>) -> Self {
		Self {
			content: vec![Content::Image {
				data,
				mime_type: mime_type.into()
			}],
			stderr: String::new()
		}
	}
	pub fn audio(data: String, mime_type: impl Into<String>) -> Self {
		Self {
			content: vec![Content::Audio {
				data,
				mime_type: mime_type.into()
			}],
			stderr: String::new()
		}
	}
	pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
		self.stderr = stderr.into();
		self
	}
	pub fn into_tool_result(self) -> ToolResult {
		let mut content = self.content;
		let stderr = self.stderr.trim();
		if !stderr.is_empty() {
			content.push(Content::text(format!("stderr:\n{}", stderr)));
		}
		ToolResult::success(content)
	}
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
	#[error("{message}")]
	Failed {
		code: &'static str,
		message: String,
	},
	#[error("{action} {path}: {reason}", reason = io_reason(.source))]
	Io {
		action: &'static str,
		path: String,
		#[source]
		source: std::io::Error,
	},
	#[error("{program} exited with {status}")]
	Exit {
		program: String,
		status: String,
		stderr: String,
	},
	#[error("failed to run {program}: {source}")]
	Spawn {
		program: String,
		#[source]
		source: std::io::Error,
	},
}

impl BackendError {
	pub fn failed(code: &'static str, message: impl Into<String>) -> Self {
		BackendError::Failed {
			code,
			message: message.into()
		}
	}
	pub fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
		BackendError::Io {
			action,
			path: path.display().to_string(),
			source
		}
	}
	pub fn code(&self) -> &'static str {
		match self {
			BackendError::Failed { code, .. } => *code,
			BackendError::Io { source, .. } => match source.kind() {
				std::io::ErrorKind::NotFound => "FILE_NOT_FOUND",
				std::io::ErrorKind::PermissionDenied => "PERMISSION_DENIED",
				std::io::ErrorKind::AlreadyExists => "TARGET_EXISTS",
				std::io::ErrorKind::InvalidData => "INVALID_DATA",
				_ => "IO_ERROR",
			},
			BackendError::Exit { .. } => "COMMAND_FAILED",
			BackendError::Spawn { .. } => "COMMAND_UNAVAILABLE",
		}
	}
	pub fn into_tool_result(self) -> ToolResult {
		let mut message = self.to_string();
		if let BackendError::Exit { stderr, .. } = &self {
			let stderr = stderr.trim();
			if !stderr.is_empty() {
				message.push('\n');
				message.push_str(stderr);
			}
		}
		ToolResult::failure(self.code(), message)
	}
}

fn io_reason(err: &std::io::Error) -> String {
	match err.kind() {
		std::io::ErrorKind::NotFound => "not found".to_string(),
		std::io::ErrorKind::PermissionDenied => "permission denied".to_string(),
		std::io::ErrorKind::AlreadyExists => "already exists".to_string(),
		_ => err.to_string(),
	}
}

/// Runs `program` to completion and captures its output. A non-zero exit is
/// reported as [`BackendError::Exit`] with the captured stderr.
pub async fn run_command(program: &str, args: &[String], cwd: Option<&Path>) -> Result<BackendOutput, BackendError> {
	let mut command = Command::new(program);
	command.args(args)
		.stdin(Stdio::null())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		.kill_on_drop(true);
	if let Some(dir) = cwd {
		command.current_dir(dir);
	}
	let output = command.output()
		.await
		.map_err(|source| BackendError::Spawn {
			program: program.to_string(),
			source
		})?;
	let stdout = String::from_utf8_lossy(&output.stdout).to_string();
	let stderr = String::from_utf8_lossy(&output.stderr).to_string();
	if !output.status.success() {
		let status = match output.status.code() {
			Some(code) => format!("status {}", code),
			None => "a signal".to_string(),
		};
		return Err(BackendError::Exit {
			program: program.to_string(),
			status,
			stderr
		});
	}
	Ok(BackendOutput::text(stdout).with_stderr(stderr))
}
