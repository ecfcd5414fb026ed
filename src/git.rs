//! Version-control agent. Each tool maps onto one `git -C <repository_path>`
//! invocation.

use crate::backend::{run_command, BackendError, BackendOutput, ToolBackend};
use crate::registry::{Property, ToolDefinition};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
#[serde(tag = "name", content = "arguments", rename_all = "snake_case")]
pub enum GitCall {
	GitStatus(RepoArgs),
	GitDiffUnstaged(ContextArgs),
	GitDiffStaged(ContextArgs),
	GitDiff(DiffArgs),
	GitLog(LogArgs),
	GitShow(ShowArgs),
	GitBranch(BranchArgs),
	GitAdd(AddArgs),
	GitCommit(CommitArgs),
	GitCreateBranch(CreateBranchArgs),
	GitCheckout(CheckoutArgs),
}

#[derive(Debug, Deserialize)]
pub struct RepoArgs {
	pub repository_path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct ContextArgs {
	pub repository_path: PathBuf,
	pub context_lines: u32,
}

#[derive(Debug, Deserialize)]
pub struct DiffArgs {
	pub repository_path: PathBuf,
	pub target: String,
}

#[derive(Debug, Deserialize)]
pub struct LogArgs {
	pub repository_path: PathBuf,
	pub max_count: u32,
}

#[derive(Debug, Deserialize)]
pub struct ShowArgs {
	pub repository_path: PathBuf,
	pub revision: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchType {
	Local,
	Remote,
	All,
}

#[derive(Debug, Deserialize)]
pub struct BranchArgs {
	pub repository_path: PathBuf,
	pub branch_type: BranchType,
}

#[derive(Debug, Deserialize)]
pub struct AddArgs {
	pub repository_path: PathBuf,
	pub files: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CommitArgs {
	pub repository_path: PathBuf,
	pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateBranchArgs {
	pub repository_path: PathBuf,
	pub branch_name: String,
	pub base_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutArgs {
	pub repository_path: PathBuf,
	pub branch_name: String,
}

fn repository() -> Property {
	Property::path("Path of the git working tree.").required()
}

pub fn tool_definitions() -> Vec<ToolDefinition> {
	vec![
		ToolDefinition::new("git_status", "Show the working tree status.")
			.property("repository_path", repository()),
		ToolDefinition::new("git_diff_unstaged", "Show changes in the working tree that are not yet staged.")
			.property("repository_path", repository())
			.property("context_lines", Property::integer("Lines of context around each change.").default_value(json!(3))),
		ToolDefinition::new("git_diff_staged", "Show changes that are staged for commit.")
			.property("repository_path", repository())
			.property("context_lines", Property::integer("Lines of context around each change.").default_value(json!(3))),
		ToolDefinition::new("git_diff", "Show differences between the working tree and a branch or commit.")
			.property("repository_path", repository())
			.property("target", Property::string("Branch or commit to compare with.").required()),
		ToolDefinition::new("git_log", "Show recent commits.")
			.property("repository_path", repository())
			.property("max_count", Property::integer("Maximum number of commits to show.").default_value(json!(10))),
		ToolDefinition::new("git_show", "Show the contents of a commit.")
			.property("repository_path", repository())
			.property("revision", Property::string("Commit, tag or branch to show.").required()),
		ToolDefinition::new("git_branch", "List branches.")
			.property("repository_path", repository())
			.property(
				"branch_type",
				Property::string("Which branches to list.")
					.one_of(&["local", "remote", "all"])
					.default_value(json!("local"))
			),
		ToolDefinition::new("git_add", "Stage files for commit.")
			.property("repository_path", repository())
			.property("files", Property::string_list("Paths relative to the repository root.").required()),
		ToolDefinition::new("git_commit", "Record staged changes with a message.")
			.property("repository_path", repository())
			.property("message", Property::string("Commit message.").required()),
		ToolDefinition::new("git_create_branch", "Create a new branch, optionally from a base branch.")
			.property("repository_path", repository())
			.property("branch_name", Property::string("Name of the new branch.").required())
			.property("base_branch", Property::string("Branch or commit to start from. Defaults to HEAD.")),
		ToolDefinition::new("git_checkout", "Switch to an existing branch.")
			.property("repository_path", repository())
			.property("branch_name", Property::string("Branch to switch to.").required()),
	]
}

/// One planned `git` invocation.
#[derive(Debug, PartialEq)]
pub struct GitCommand {
	pub args: Vec<String>,
	/// Reported when git itself prints nothing on success.
	pub summary: Option<String>,
}

impl GitCommand {
	fn new(repo: &Path, args: &[&str]) -> Self {
		let mut full = vec!["-C".to_string(), repo.display().to_string()];
		full.extend(args.iter().map(|arg| arg.to_string()));
		Self {
			args: full,
			summary: None
		}
	}
	fn arg(mut self, arg: impl Into<String>) -> Self {
		self.args.push(arg.into());
		self
	}
	fn summary(mut self, summary: impl Into<String>) -> Self {
		self.summary = Some(summary.into());
		self
	}
}

// A leading dash would be parsed by git as an option.
fn reference<'a>(label: &str, value: &'a str) -> Result<&'a str, BackendError> {
	if value.trim().is_empty() {
		return Err(BackendError::failed("INVALID_REFERENCE", format!("{} is empty", label)));
	}
	if value.starts_with('-') {
		return Err(BackendError::failed("INVALID_REFERENCE", format!("{} cannot start with '-': {}", label, value)));
	}
	Ok(value)
}

pub fn plan(call: &GitCall) -> Result<GitCommand, BackendError> {
	let command = match call {
		GitCall::GitStatus(args) => GitCommand::new(&args.repository_path, &["status"]),
		GitCall::GitDiffUnstaged(args) => GitCommand::new(&args.repository_path, &["diff"])
			.arg(format!("--unified={}", args.context_lines))
			.summary("No unstaged changes"),
		GitCall::GitDiffStaged(args) => GitCommand::new(&args.repository_path, &["diff", "--cached"])
			.arg(format!("--unified={}", args.context_lines))
			.summary("No staged changes"),
		GitCall::GitDiff(args) => GitCommand::new(&args.repository_path, &["diff"])
			.arg(reference("target", &args.target)?)
			.arg("--")
			.summary(format!("No differences with {}", args.target)),
		GitCall::GitLog(args) => GitCommand::new(&args.repository_path, &["log"])
			.arg(format!("--max-count={}", args.max_count))
			.arg("--format=commit %H%nAuthor: %an <%ae>%nDate: %ad%nMessage: %s%n")
			.summary("No commits"),
		GitCall::GitShow(args) => GitCommand::new(&args.repository_path, &["show"])
			.arg(reference("revision", &args.revision)?)
			.arg("--"),
		GitCall::GitBranch(args) => {
			let command = GitCommand::new(&args.repository_path, &["branch"]);
			let command = match args.branch_type {
				BranchType::Local => command,
				BranchType::Remote => command.arg("--remotes"),
				BranchType::All => command.arg("--all"),
			};
			command.summary("No branches")
		}
		GitCall::GitAdd(args) => {
			if args.files.is_empty() {
				return Err(BackendError::failed("NO_FILES", "files is empty"));
			}
			let mut command = GitCommand::new(&args.repository_path, &["add", "--"]);
			for file in &args.files {
				command = command.arg(file.as_str());
			}
			command.summary("Files staged successfully")
		}
		GitCall::GitCommit(args) => {
			if args.message.trim().is_empty() {
				return Err(BackendError::failed("EMPTY_MESSAGE", "commit message is empty"));
			}
			GitCommand::new(&args.repository_path, &["commit", "-m"]).arg(args.message.as_str())
		}
		GitCall::GitCreateBranch(args) => {
			let name = reference("branch_name", &args.branch_name)?;
			let command = GitCommand::new(&args.repository_path, &["branch", name]);
			match &args.base_branch {
				Some(base) => command.arg(reference("base_branch", base)?)
					.summary(format!("Created branch '{}' from '{}'", name, base)),
				None => command.summary(format!("Created branch '{}'", name)),
			}
		}
		GitCall::GitCheckout(args) => {
			let name = reference("branch_name", &args.branch_name)?;
			GitCommand::new(&args.repository_path, &["checkout", name, "--"])
				.summary(format!("Switched to branch '{}'", name))
		}
	};
	Ok(command)
}

pub struct GitBackend;

impl ToolBackend for GitBackend {
	type Call = GitCall;

	async fn execute(&self, call: GitCall) -> Result<BackendOutput, BackendError> {
		let command = plan(&call)?;
		let output = run_command("git", &command.args, None).await?;
		let printed = output.content
			.iter()
			.any(|content| !matches!(content, crate::protocol::Content::Text { text } if text.trim().is_empty()));
		match command.summary {
			Some(summary) if !printed => Ok(BackendOutput::text(summary).with_stderr(output.stderr)),
			_ => Ok(output),
		}
	}
}
