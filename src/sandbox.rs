//! Containment checks for user-supplied paths.
//!
//! A candidate is accepted only when its symlink-resolved form is one of the
//! configured roots or lies underneath one. Candidates that do not exist yet
//! are resolved through their longest existing prefix so that a symlinked
//! directory partway down the path is still followed before the check.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
	#[error("Access denied - path outside allowed directories: {candidate}")]
	AccessDenied {
		candidate: String,
	},
	#[error("root directory {path} is not usable: {reason}")]
	InvalidRoot {
		path: String,
		reason: String,
	},
}

impl SandboxError {
	fn denied(candidate: &str) -> Self {
		SandboxError::AccessDenied {
			candidate: candidate.to_string()
		}
	}
}

/// An allowed directory, canonical and known to exist when constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Root {
	path: PathBuf,
}

impl Root {
	pub fn new(path: impl AsRef<Path>) -> Result<Self, SandboxError> {
		let raw = path.as_ref();
		let display = raw.to_string_lossy().to_string();
		let invalid = |reason: String| SandboxError::InvalidRoot {
			path: display.clone(),
			reason
		};
		let cwd = std::env::current_dir().map_err(|err| invalid(err.to_string()))?;
		let home = dirs::home_dir();
		let absolute = absolutize(&expand_home(raw, home.as_deref()), &cwd);
		let canonical = absolute.canonicalize().map_err(|err| invalid(err.to_string()))?;
		if !canonical.is_dir() {
			return Err(invalid("not a directory".to_string()));
		}
		Ok(Self {
			path: canonical
		})
	}
	pub fn path(&self) -> &Path {
		&self.path
	}
}

#[derive(Debug, Clone)]
pub struct PathSandbox {
	roots: Vec<Root>,
}

impl PathSandbox {
	pub fn new(roots: Vec<Root>) -> Self {
		Self {
			roots
		}
	}
	pub fn roots(&self) -> &[Root] {
		&self.roots
	}
	/// Resolves `candidate` against the process cwd and home directory and
	/// returns the canonical path when it is contained by a root.
	pub fn validate(&self, candidate: &str) -> Result<PathBuf, SandboxError> {
		let cwd = std::env::current_dir().map_err(|_| SandboxError::denied(candidate))?;
		let home = dirs::home_dir();
		self.validate_from(candidate, &cwd, home.as_deref())
	}
	pub fn validate_from(&self, candidate: &str, cwd: &Path, home: Option<&Path>) -> Result<PathBuf, SandboxError> {
		if candidate.is_empty() {
			return Err(SandboxError::denied(candidate));
		}
		let absolute = absolutize(&expand_home(Path::new(candidate), home), cwd);
		let resolved = resolve(&absolute).ok_or_else(|| SandboxError::denied(candidate))?;
		if self.contains(&resolved) {
			Ok(resolved)
		}
		else {
			Err(SandboxError::denied(candidate))
		}
	}
	/// Resolves everything but the final component, which is kept as named.
	/// Operations that remove or rename an entry use this so a symlink is
	/// acted on as a link rather than through its target.
	pub fn validate_entry(&self, candidate: &str) -> Result<PathBuf, SandboxError> {
		let cwd = std::env::current_dir().map_err(|_| SandboxError::denied(candidate))?;
		let home = dirs::home_dir();
		self.validate_entry_from(candidate, &cwd, home.as_deref())
	}
	pub fn validate_entry_from(&self, candidate: &str, cwd: &Path, home: Option<&Path>) -> Result<PathBuf, SandboxError> {
		if candidate.is_empty() {
			return Err(SandboxError::denied(candidate));
		}
		let absolute = absolutize(&expand_home(Path::new(candidate), home), cwd);
		// no literal leaf (`/` or a trailing `..`): fall back to full resolution
		let (Some(parent), Some(leaf)) = (absolute.parent(), absolute.file_name()) else {
			return self.validate_from(candidate, cwd, home);
		};
		let entry = resolve(parent)
			.ok_or_else(|| SandboxError::denied(candidate))?
			.join(leaf);
		if self.contains(&entry) {
			Ok(entry)
		}
		else {
			Err(SandboxError::denied(candidate))
		}
	}
	/// Component-wise containment, so `/data2` never matches root `/data`.
	pub fn contains(&self, resolved: &Path) -> bool {
		self.roots
			.iter()
			.any(|root| resolved.starts_with(&root.path))
	}
	pub fn is_root(&self, resolved: &Path) -> bool {
		self.roots
			.iter()
			.any(|root| root.path == resolved)
	}
}

pub fn expand_home(path: &Path, home: Option<&Path>) -> PathBuf {
	let Some(home) = home else {
		return path.to_path_buf();
	};
	let mut components = path.components();
	match components.next() {
		Some(Component::Normal(first)) if first == "~" => home.join(components.as_path()),
		_ => path.to_path_buf(),
	}
}

fn absolutize(path: &Path, cwd: &Path) -> PathBuf {
	if path.is_absolute() {
		path.to_path_buf()
	}
	else {
		cwd.join(path)
	}
}

/// Symlink-resolves `absolute`, falling back to the longest existing prefix
/// when the leaf (or more) does not exist yet. `None` means the path cannot
/// be resolved safely.
fn resolve(absolute: &Path) -> Option<PathBuf> {
	if let Ok(canonical) = absolute.canonicalize() {
		return Some(canonical);
	}
	let (prefix, tail) = longest_existing_prefix(absolute)?;
	let crosses_parent = tail.iter().any(|part| part == "..");
	let mut joined = prefix;
	for part in tail {
		joined.push(part);
	}
	let cleaned = normalize_path(&joined);
	if crosses_parent {
		// A `..` in the unresolved tail may step back onto an existing entry,
		// possibly a symlink, so the cleaned path goes through resolution again.
		// The second pass has no `..` left in its tail.
		return resolve(&cleaned);
	}
	Some(cleaned)
}

fn longest_existing_prefix(absolute: &Path) -> Option<(PathBuf, Vec<OsString>)> {
	let mut raw = PathBuf::new();
	let mut resolved: Option<PathBuf> = None;
	let mut components = absolute.components().peekable();
	while let Some(&component) = components.peek() {
		let next = raw.join(component.as_os_str());
		match next.canonicalize() {
			Ok(canonical) => {
				raw = next;
				resolved = Some(canonical);
				components.next();
			}
			Err(_) => {
				if matches!(component, Component::Normal(_)) && std::fs::symlink_metadata(&next).is_ok() {
					// the entry exists but cannot be resolved: a dangling or looping link
					return None;
				}
				break;
			}
		}
	}
	let prefix = resolved?;
	let tail = components
		.filter(|component| !matches!(component, Component::CurDir))
		.map(|component| component.as_os_str().to_os_string())
		.collect();
	Some((prefix, tail))
}

/// Lexical cleanup of `.` and `..` on an absolute path whose existing part
/// is already canonical. `..` stops at the filesystem root.
fn normalize_path(path: &Path) -> PathBuf {
	let mut out = PathBuf::new();
	for component in path.components() {
		match component {
			Component::CurDir => {}
			Component::ParentDir => {
				if out.file_name().is_some() {
					out.pop();
				}
			}
			other => out.push(other.as_os_str()),
		}
	}
	out
}
