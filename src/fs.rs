//! Filesystem agent. Every path reaching this module has already been
//! confined by the sandbox.

use crate::backend::{BackendError, BackendOutput, ToolBackend};
use crate::registry::{Property, ToolDefinition};
use crate::sandbox::PathSandbox;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use filetime::{set_file_times, FileTime};
use globset::{GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use serde::Deserialize;
use serde_json::{json, Value};
use similar::TextDiff;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::fs;

#[derive(Debug, Deserialize)]
#[serde(tag = "name", content = "arguments", rename_all = "snake_case")]
pub enum FsCall {
	ReadFile(ReadFileArgs),
	ReadMultipleFiles(ReadMultipleFilesArgs),
	ReadMediaFile(PathArgs),
	WriteFile(WriteFileArgs),
	EditFile(EditFileArgs),
	CreateDirectory(PathArgs),
	ListDirectory(PathArgs),
	DirectoryTree(PathArgs),
	MoveFile(TransferArgs),
	CopyFile(TransferArgs),
	DeletePath(PathArgs),
	SearchFiles(SearchFilesArgs),
	GetFileInfo(PathArgs),
	ListAllowedDirectories {},
}

#[derive(Debug, Deserialize)]
pub struct PathArgs {
	pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct ReadFileArgs {
	pub path: PathBuf,
	pub head: Option<usize>,
	pub tail: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ReadMultipleFilesArgs {
	pub paths: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct WriteFileArgs {
	pub path: PathBuf,
	pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct EditFileArgs {
	pub path: PathBuf,
	pub edits: Vec<EditOperation>,
	#[serde(rename = "dryRun", default)]
	pub dry_run: bool,
}

#[derive(Debug, Deserialize)]
pub struct EditOperation {
	#[serde(rename = "oldText")]
	pub old_text: String,
	#[serde(rename = "newText")]
	pub new_text: String,
}

#[derive(Debug, Deserialize)]
pub struct TransferArgs {
	pub source: PathBuf,
	pub destination: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct SearchFilesArgs {
	pub path: PathBuf,
	pub pattern: String,
	#[serde(rename = "excludePatterns", default)]
	pub exclude_patterns: Vec<String>,
}

pub fn tool_definitions() -> Vec<ToolDefinition> {
	vec![
		ToolDefinition::new(
			"read_file",
			"Read the complete contents of a file as text. Use head or tail to read only the first or last N lines."
		)
			.property("path", Property::path("Path of the file to read.").required())
			.property("head", Property::integer("If provided, return only the first N lines."))
			.property("tail", Property::integer("If provided, return only the last N lines.")),
		ToolDefinition::new(
			"read_multiple_files",
			"Read several files at once. Files that cannot be read are reported inline without failing the call."
		)
			.property("paths", Property::path_list("Paths of the files to read.").required()),
		ToolDefinition::new("read_media_file", "Read an image or audio file and return it base64 encoded with its MIME type.")
			.property("path", Property::path("Path of the media file.").required()),
		ToolDefinition::new("write_file", "Create a new file or overwrite an existing one. Missing parent directories are created.")
			.property("path", Property::path("Path of the file to write.").required())
			.property("content", Property::string("Full file contents.").required()),
		ToolDefinition::new(
			"edit_file",
			"Apply exact text replacements to a file. Each oldText must occur exactly once. Returns a unified diff."
		)
			.property("path", Property::path("Path of the file to edit.").required())
			.property(
				"edits",
				Property::array(
					"Replacements applied in order.",
					Property::object()
						.field("oldText", Property::string("Text to replace; must match exactly once.").required())
						.field("newText", Property::string("Replacement text.").required())
				).required()
			)
			.property("dryRun", Property::boolean("Preview the diff without writing.").default_value(json!(false))),
		ToolDefinition::new("create_directory", "Create a directory, including missing parents. Succeeds if it already exists.")
			.property("path", Property::path("Directory to create.").required()),
		ToolDefinition::new("list_directory", "List entries of a directory, marked [DIR], [FILE] or [LINK].")
			.property("path", Property::path("Directory to list.").required()),
		ToolDefinition::new("directory_tree", "Recursive JSON tree of a directory. Symbolic links are reported, not followed.")
			.property("path", Property::path("Directory to describe.").required()),
		ToolDefinition::new(
			"move_file",
			"Move or rename a file, directory or symbolic link. Fails if the destination exists."
		)
			.property("source", Property::entry_path("Existing path to move. A symbolic link is moved as a link.").required())
			.property("destination", Property::path("New path.").required()),
		ToolDefinition::new(
			"copy_file",
			"Copy a file or directory tree, preserving permissions and timestamps. Fails if the destination exists."
		)
			.property("source", Property::path("Existing path to copy.").required())
			.property("destination", Property::path("Path of the copy.").required()),
		ToolDefinition::new(
			"delete_path",
			"Delete a file, symbolic link or directory tree. Allowed directories themselves cannot be deleted."
		)
			.property("path", Property::entry_path("Path to delete. A symbolic link is removed, not its target.").required()),
		ToolDefinition::new(
			"search_files",
			"Recursively search for names matching a case-insensitive glob. A pattern without wildcards matches as a substring."
		)
			.property("path", Property::path("Directory to search from.").required())
			.property("pattern", Property::string("Glob or substring to match against names and relative paths.").required())
			.property(
				"excludePatterns",
				Property::string_list("Globs of relative paths to skip.").default_value(json!([]))
			),
		ToolDefinition::new("get_file_info", "Size, timestamps, type and permissions of a file or directory.")
			.property("path", Property::path("Path to inspect.").required()),
		ToolDefinition::new("list_allowed_directories", "List the directories this agent may access."),
	]
}

pub struct FsBackend {
	sandbox: PathSandbox,
}

impl FsBackend {
	pub fn new(sandbox: PathSandbox) -> Self {
		Self {
			sandbox
		}
	}
}

impl ToolBackend for FsBackend {
	type Call = FsCall;

	async fn execute(&self, call: FsCall) -> Result<BackendOutput, BackendError> {
		match call {
			FsCall::ReadFile(args) => read_file(&args.path, args.head, args.tail)
				.await
				.map(BackendOutput::text),
			FsCall::ReadMultipleFiles(args) => Ok(BackendOutput::text(read_multiple_files(&args.paths).await)),
			FsCall::ReadMediaFile(args) => read_media_file(&args.path).await,
			FsCall::WriteFile(args) => {
				write_file(&args.path, &args.content).await?;
				Ok(BackendOutput::text(format!("Successfully wrote to {}", args.path.display())))
			}
			FsCall::EditFile(args) => edit_file(&args.path, &args.edits, args.dry_run)
				.await
				.map(BackendOutput::text),
			FsCall::CreateDirectory(args) => {
				fs::create_dir_all(&args.path)
					.await
					.map_err(|err| BackendError::io("create directory", &args.path, err))?;
				Ok(BackendOutput::text(format!("Successfully created directory {}", args.path.display())))
			}
			FsCall::ListDirectory(args) => list_directory(&args.path)
				.await
				.map(BackendOutput::text),
			FsCall::DirectoryTree(args) => {
				let tree = directory_tree(args.path.clone()).await?;
				let text = serde_json::to_string_pretty(&tree)
					.map_err(|err| BackendError::failed("SERIALIZE_FAILED", err.to_string()))?;
				Ok(BackendOutput::text(text))
			}
			FsCall::MoveFile(args) => {
				if self.sandbox.is_root(&args.source) {
					return Err(BackendError::failed("MOVE_ROOT_DENIED", "cannot move root directory"));
				}
				move_path(&args.source, &args.destination).await?;
				Ok(BackendOutput::text(format!(
					"Successfully moved {} to {}",
					args.source.display(),
					args.destination.display()
				)))
			}
			FsCall::CopyFile(args) => {
				copy_path(&args.source, &args.destination).await?;
				Ok(BackendOutput::text(format!(
					"Successfully copied {} to {}",
					args.source.display(),
					args.destination.display()
				)))
			}
			FsCall::DeletePath(args) => {
				if self.sandbox.is_root(&args.path) {
					return Err(BackendError::failed("DELETE_ROOT_DENIED", "cannot delete root directory"));
				}
				delete_path(&args.path).await?;
				Ok(BackendOutput::text(format!("Successfully deleted {}", args.path.display())))
			}
			FsCall::SearchFiles(args) => search_files(&args.path, &args.pattern, &args.exclude_patterns).map(BackendOutput::text),
			FsCall::GetFileInfo(args) => file_info(&args.path)
				.await
				.map(BackendOutput::text),
			FsCall::ListAllowedDirectories {} => {
				let roots = self.sandbox
					.roots()
					.iter()
					.map(|root| root.path().display().to_string())
					.collect::<Vec<_>>();
				Ok(BackendOutput::text(format!("Allowed directories:\n{}", roots.join("\n"))))
			}
		}
	}
}

pub async fn read_file(path: &Path, head: Option<usize>, tail: Option<usize>) -> Result<String, BackendError> {
	if head.is_some() && tail.is_some() {
		return Err(BackendError::failed("INVALID_RANGE", "cannot specify both head and tail"));
	}
	let content = fs::read_to_string(path)
		.await
		.map_err(|err| BackendError::io("read", path, err))?;
	if let Some(count) = head {
		return Ok(content.lines()
			.take(count)
			.collect::<Vec<_>>()
			.join("\n"));
	}
	if let Some(count) = tail {
		let lines: Vec<&str> = content.lines().collect();
		let start = lines.len().saturating_sub(count);
		return Ok(lines[start..].join("\n"));
	}
	Ok(content)
}

async fn read_multiple_files(paths: &[PathBuf]) -> String {
	let mut sections = Vec::with_capacity(paths.len());
	for path in paths {
		match read_file(path, None, None).await {
			Ok(content) => sections.push(format!("{}:\n{}\n", path.display(), content)),
			Err(err) => sections.push(format!("{}: Error - {}", path.display(), err)),
		}
	}
	sections.join("\n---\n")
}

async fn read_media_file(path: &Path) -> Result<BackendOutput, BackendError> {
	let mime = media_type(path).ok_or_else(|| {
		BackendError::failed("UNSUPPORTED_MEDIA", format!("unsupported media type: {}", path.display()))
	})?;
	let bytes = fs::read(path)
		.await
		.map_err(|err| BackendError::io("read", path, err))?;
	let data = BASE64.encode(bytes);
	if mime.starts_with("audio/") {
		Ok(BackendOutput::audio(data, mime))
	}
	else {
		Ok(BackendOutput::image(data, mime))
	}
}

fn media_type(path: &Path) -> Option<&'static str> {
	let ext = path.extension()?.to_str()?.to_ascii_lowercase();
	let mime = match ext.as_str() {
		"png" => "image/png",
		"jpg" | "jpeg" => "image/jpeg",
		"gif" => "image/gif",
		"webp" => "image/webp",
		"bmp" => "image/bmp",
		"svg" => "image/svg+xml",
		"mp3" => "audio/mpeg",
		"wav" => "audio/wav",
		"ogg" => "audio/ogg",
		"flac" => "audio/flac",
		_ => return None,
	};
	Some(mime)
}

pub async fn write_file(path: &Path, content: &str) -> Result<(), BackendError> {
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent)
			.await
			.map_err(|err| BackendError::io("create directory", parent, err))?;
	}
	fs::write(path, content)
		.await
		.map_err(|err| BackendError::io("write", path, err))
}

async fn edit_file(path: &Path, edits: &[EditOperation], dry_run: bool) -> Result<String, BackendError> {
	if edits.is_empty() {
		return Err(BackendError::failed("EMPTY_EDITS", "edits is empty"));
	}
	let existing = fs::read_to_string(path)
		.await
		.map_err(|err| BackendError::io("read", path, err))?;
	let mut updated = existing.clone();
	for (index, edit) in edits.iter().enumerate() {
		if edit.old_text.is_empty() {
			return Err(BackendError::failed("FIND_EMPTY", format!("oldText is empty at index {}", index)));
		}
		match updated.match_indices(&edit.old_text).count() {
			0 => return Err(BackendError::failed("FIND_NOT_FOUND", format!("oldText not found at index {}", index))),
			1 => {}
			_ => return Err(BackendError::failed("FIND_NOT_UNIQUE", format!("oldText not unique at index {}", index))),
		}
		updated = updated.replacen(&edit.old_text, &edit.new_text, 1);
	}
	let diff = make_diff(&existing, &updated, path);
	if !dry_run {
		fs::write(path, &updated)
			.await
			.map_err(|err| BackendError::io("write", path, err))?;
	}
	Ok(diff)
}

fn make_diff(existing: &str, updated: &str, path: &Path) -> String {
	let diff = TextDiff::from_lines(existing, updated);
	diff.unified_diff()
		.context_radius(3)
		.header(&format!("a/{}", path.display()), &format!("b/{}", path.display()))
		.to_string()
}

async fn list_directory(path: &Path) -> Result<String, BackendError> {
	let mut entries = fs::read_dir(path)
		.await
		.map_err(|err| BackendError::io("list", path, err))?;
	let mut lines = Vec::new();
	while let Some(entry) = entries.next_entry()
		.await
		.map_err(|err| BackendError::io("list", path, err))? {
		let kind = match entry.file_type().await {
			Ok(kind) if kind.is_symlink() => "[LINK]",
			Ok(kind) if kind.is_dir() => "[DIR]",
			_ => "[FILE]",
		};
		lines.push((entry.file_name().to_string_lossy().to_string(), kind));
	}
	lines.sort();
	if lines.is_empty() {
		return Ok("Directory is empty".to_string());
	}
	Ok(lines.into_iter()
		.map(|(name, kind)| format!("{} {}", kind, name))
		.collect::<Vec<_>>()
		.join("\n"))
}

fn directory_tree(path: PathBuf) -> Pin<Box<dyn Future<Output = Result<Vec<Value>, BackendError>>>> {
	Box::pin(
		async move {
			let mut entries = fs::read_dir(&path)
				.await
				.map_err(|err| BackendError::io("list", &path, err))?;
			let mut nodes: Vec<(String, Value)> = Vec::new();
			while let Some(entry) = entries.next_entry()
				.await
				.map_err(|err| BackendError::io("list", &path, err))? {
				let name = entry.file_name().to_string_lossy().to_string();
				let kind = entry.file_type()
					.await
					.map_err(|err| BackendError::io("stat", &entry.path(), err))?;
				let node = if kind.is_symlink() {
					json!({ "name": name, "type": "symlink" })
				}
				else if kind.is_dir() {
					let children = directory_tree(entry.path()).await?;
					json!({ "name": name, "type": "directory", "children": children })
				}
				else {
					json!({ "name": name, "type": "file" })
				};
				nodes.push((name, node));
			}
			nodes.sort_by(|a, b| a.0.cmp(&b.0));
			Ok(nodes.into_iter().map(|(_, node)| node).collect())
		}
	)
}

pub async fn move_path(from: &Path, to: &Path) -> Result<(), BackendError> {
	if fs::symlink_metadata(to).await.is_ok() {
		return Err(BackendError::failed("TARGET_EXISTS", format!("target exists: {}", to.display())));
	}
	match fs::rename(from, to).await {
		Ok(_) => return Ok(()),
		Err(err) => {
			if !is_cross_device(&err) {
				return Err(BackendError::io("move", from, err));
			}
		}
	}
	let meta = fs::symlink_metadata(from)
		.await
		.map_err(|err| BackendError::io("stat", from, err))?;
	if meta.file_type().is_symlink() {
		copy_link(from, to).await?;
		fs::remove_file(from)
			.await
			.map_err(|err| BackendError::io("remove", from, err))?;
	}
	else if meta.is_dir() {
		copy_dir_recursive(from.to_path_buf(), to.to_path_buf()).await?;
		fs::remove_dir_all(from)
			.await
			.map_err(|err| BackendError::io("remove", from, err))?;
	}
	else {
		copy_file_with_meta(from, to).await?;
		fs::remove_file(from)
			.await
			.map_err(|err| BackendError::io("remove", from, err))?;
	}
	Ok(())
}

pub async fn copy_path(from: &Path, to: &Path) -> Result<(), BackendError> {
	if fs::symlink_metadata(to).await.is_ok() {
		return Err(BackendError::failed("TARGET_EXISTS", format!("target exists: {}", to.display())));
	}
	let meta = fs::metadata(from)
		.await
		.map_err(|err| BackendError::io("stat", from, err))?;
	if meta.is_dir() {
		if to.starts_with(from) {
			return Err(BackendError::failed("COPY_INTO_SELF", "cannot copy a directory into itself"));
		}
		copy_dir_recursive(from.to_path_buf(), to.to_path_buf()).await
	}
	else {
		copy_file_with_meta(from, to).await
	}
}

pub async fn delete_path(path: &Path) -> Result<(), BackendError> {
	let meta = fs::symlink_metadata(path)
		.await
		.map_err(|err| BackendError::io("stat", path, err))?;
	let result = if meta.is_dir() {
		fs::remove_dir_all(path).await
	}
	else {
		fs::remove_file(path).await
	};
	result.map_err(|err| BackendError::io("delete", path, err))
}

async fn copy_file_with_meta(from: &Path, to: &Path) -> Result<(), BackendError> {
	if let Some(parent) = to.parent() {
		fs::create_dir_all(parent)
			.await
			.map_err(|err| BackendError::io("create directory", parent, err))?;
	}
	fs::copy(from, to)
		.await
		.map_err(|err| BackendError::io("copy", from, err))?;
	copy_meta(from, to).await
}

async fn copy_meta(from: &Path, to: &Path) -> Result<(), BackendError> {
	let meta = fs::metadata(from)
		.await
		.map_err(|err| BackendError::io("stat", from, err))?;
	fs::set_permissions(to, meta.permissions())
		.await
		.map_err(|err| BackendError::io("set permissions", to, err))?;
	let atime = FileTime::from_last_access_time(&meta);
	let mtime = FileTime::from_last_modification_time(&meta);
	set_file_times(to, atime, mtime).map_err(|err| BackendError::io("set times", to, err))
}

// Symbolic links are recreated as links, never followed, so a link that
// points outside the sandbox does not pull outside content into it.
fn copy_dir_recursive(from: PathBuf, to: PathBuf) -> Pin<Box<dyn Future<Output = Result<(), BackendError>>>> {
	Box::pin(
		async move {
			fs::create_dir_all(&to)
				.await
				.map_err(|err| BackendError::io("create directory", &to, err))?;
			let mut entries = fs::read_dir(&from)
				.await
				.map_err(|err| BackendError::io("list", &from, err))?;
			while let Some(entry) = entries.next_entry()
				.await
				.map_err(|err| BackendError::io("list", &from, err))? {
				let src = entry.path();
				let dst = to.join(entry.file_name());
				let meta = fs::symlink_metadata(&src)
					.await
					.map_err(|err| BackendError::io("stat", &src, err))?;
				if meta.file_type().is_symlink() {
					copy_link(&src, &dst).await?;
				}
				else if meta.is_dir() {
					copy_dir_recursive(src, dst).await?;
				}
				else {
					copy_file_with_meta(&src, &dst).await?;
				}
			}
			copy_meta(&from, &to).await
		}
	)
}

#[cfg(unix)]
async fn copy_link(src: &Path, dst: &Path) -> Result<(), BackendError> {
	let target = fs::read_link(src)
		.await
		.map_err(|err| BackendError::io("read link", src, err))?;
	fs::symlink(&target, dst)
		.await
		.map_err(|err| BackendError::io("create link", dst, err))
}

#[cfg(not(unix))]
async fn copy_link(src: &Path, _dst: &Path) -> Result<(), BackendError> {
	Err(BackendError::failed(
		"UNSUPPORTED_LINK",
		format!("cannot copy symbolic link {}", src.display())
	))
}

fn is_cross_device(err: &std::io::Error) -> bool {
	err.raw_os_error() == Some(libc::EXDEV)
}

pub fn search_files(root: &Path, pattern: &str, exclude: &[String]) -> Result<String, BackendError> {
	let matcher = build_matcher(pattern)?;
	let exclude_set = build_exclude_set(exclude)?;
	let mut builder = WalkBuilder::new(root);
	builder.standard_filters(false);
	builder.follow_links(false);
	if let Some(excludes) = exclude_set {
		let base = root.to_path_buf();
		builder.filter_entry(move |entry| !excludes.is_match(relative_display(&base, entry.path())));
	}
	let mut matches = Vec::new();
	for entry in builder.build() {
		let entry = entry.map_err(|err| BackendError::failed("WALK_FAILED", err.to_string()))?;
		let path = entry.path();
		if path == root {
			continue;
		}
		let file_name = match path.file_name().and_then(|name| name.to_str()) {
			Some(name) => name,
			None => continue,
		};
		if matcher.is_match(file_name) || matcher.is_match(relative_display(root, path)) {
			matches.push(path.display().to_string());
		}
	}
	if matches.is_empty() {
		return Ok("No matches found".to_string());
	}
	Ok(matches.join("\n"))
}

fn build_matcher(pattern: &str) -> Result<GlobMatcher, BackendError> {
	let has_wildcard = pattern.chars().any(|c| matches!(c, '*' | '?' | '[' | '{'));
	let glob = if has_wildcard {
		pattern.to_string()
	}
	else {
		format!("*{}*", pattern)
	};
	let mut builder = GlobBuilder::new(&glob);
	builder.case_insensitive(true);
	let glob = builder.build().map_err(|err| BackendError::failed("INVALID_GLOB", format!("invalid glob: {}", err)))?;
	Ok(glob.compile_matcher())
}

fn build_exclude_set(patterns: &[String]) -> Result<Option<GlobSet>, BackendError> {
	if patterns.is_empty() {
		return Ok(None);
	}
	let mut builder = GlobSetBuilder::new();
	for pattern in patterns {
		let glob = GlobBuilder::new(pattern)
			.literal_separator(true)
			.build()
			.map_err(|err| BackendError::failed("INVALID_GLOB", format!("invalid exclude glob: {}", err)))?;
		builder.add(glob);
	}
	let set = builder.build().map_err(|err| BackendError::failed("INVALID_GLOB", format!("invalid exclude set: {}", err)))?;
	Ok(Some(set))
}

fn relative_display(root: &Path, path: &Path) -> String {
	if let Ok(rel) = path.strip_prefix(root) {
		return rel.to_string_lossy().to_string();
	}
	path.to_string_lossy().to_string()
}

async fn file_info(path: &Path) -> Result<String, BackendError> {
	let meta = fs::metadata(path)
		.await
		.map_err(|err| BackendError::io("stat", path, err))?;
	let mut lines = vec![format!("size: {}", meta.len())];
	for (label, time) in [
		("created", meta.created()),
		("modified", meta.modified()),
		("accessed", meta.accessed()),
	] {
		if let Ok(time) = time {
			let stamp: chrono::DateTime<chrono::Utc> = time.into();
			lines.push(format!("{}: {}", label, stamp.to_rfc3339()));
		}
	}
	lines.push(format!("isDirectory: {}", meta.is_dir()));
	lines.push(format!("isFile: {}", meta.is_file()));
	lines.push(format!("permissions: {}", permissions(&meta)));
	Ok(lines.join("\n"))
}

#[cfg(unix)]
fn permissions(meta: &std::fs::Metadata) -> String {
	use std::os::unix::fs::PermissionsExt;
	format!("{:o}", meta.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn permissions(meta: &std::fs::Metadata) -> String {
	if meta.permissions().readonly() {
		"readonly".to_string()
	}
	else {
		"readwrite".to_string()
	}
}
