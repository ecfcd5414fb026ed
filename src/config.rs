use crate::sandbox::Root;
use anyhow::{anyhow, Result};
use std::path::PathBuf;

pub const ALLOWED_ROOTS_ENV: &str = "MCP_ALLOWED_ROOTS";
pub const LOG_DIR_ENV: &str = "MCP_LOG_DIR";

/// How an agent treats unusable or absent root directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootPolicy {
	/// Every root must be usable and at least one is required.
	Strict,
	/// Unusable roots are skipped; with none left the home directory is used.
	HomeFallback,
}

#[derive(Debug, Clone)]
pub struct Config {
	pub roots: Vec<Root>,
	pub log_dir: Option<PathBuf>,
	pub session_id: String,
	/// Roots skipped under [`RootPolicy::HomeFallback`], logged once the
	/// logger exists.
	pub skipped_roots: Vec<String>,
}

/// Raw inputs, split out of the process environment so they can be tested.
#[derive(Debug, Clone, Default)]
pub struct Sources {
	pub args: Vec<String>,
	pub env_roots: Option<String>,
	pub env_log_dir: Option<String>,
	pub home: Option<PathBuf>,
	pub data_dir: Option<PathBuf>,
}

impl Sources {
	pub fn from_env() -> Self {
		Self {
			args: std::env::args().skip(1).collect(),
			env_roots: std::env::var(ALLOWED_ROOTS_ENV).ok(),
			env_log_dir: std::env::var(LOG_DIR_ENV).ok(),
			home: dirs::home_dir(),
			data_dir: dirs::data_local_dir()
		}
	}
}

pub fn load_config(agent: &str, policy: RootPolicy) -> Result<Config> {
	Config::from_sources(agent, policy, Sources::from_env())
}

impl Config {
	pub fn from_sources(agent: &str, policy: RootPolicy, sources: Sources) -> Result<Config> {
		let mut raw_roots: Vec<String> = Vec::new();
		for arg in &sources.args {
			if arg.starts_with('-') {
				return Err(anyhow!("unknown argument: {}\n{}", arg, usage(agent)));
			}
			if !arg.trim().is_empty() {
				raw_roots.push(arg.clone());
			}
		}
		if raw_roots.is_empty() {
			if let Some(env_roots) = &sources.env_roots {
				for value in env_roots.split(',') {
					let trimmed = value.trim();
					if !trimmed.is_empty() {
						raw_roots.push(trimmed.to_string());
					}
				}
			}
		}
		let (roots, skipped_roots) = match policy {
			RootPolicy::Strict => (strict_roots(agent, &raw_roots)?, Vec::new()),
			RootPolicy::HomeFallback => fallback_roots(&raw_roots, sources.home.as_ref())?,
		};
		let log_dir = match sources.env_log_dir {
			Some(dir) if !dir.trim().is_empty() => Some(PathBuf::from(dir)),
			_ => sources.data_dir.map(|dir| dir.join("mcp-agents").join("logs")),
		};
		Ok(Config {
			roots,
			log_dir,
			session_id: uuid::Uuid::new_v4().to_string(),
			skipped_roots
		})
	}
}

fn strict_roots(agent: &str, raw_roots: &[String]) -> Result<Vec<Root>> {
	if raw_roots.is_empty() {
		return Err(anyhow!("no allowed directories given\n{}", usage(agent)));
	}
	let mut roots = Vec::new();
	for raw in raw_roots {
		let root = Root::new(raw)?;
		if !roots.contains(&root) {
			roots.push(root);
		}
	}
	Ok(roots)
}

fn fallback_roots(raw_roots: &[String], home: Option<&PathBuf>) -> Result<(Vec<Root>, Vec<String>)> {
	let mut roots = Vec::new();
	let mut skipped = Vec::new();
	for raw in raw_roots {
		match Root::new(raw) {
			Ok(root) => {
				if !roots.contains(&root) {
					roots.push(root);
				}
			}
			Err(err) => skipped.push(err.to_string()),
		}
	}
	if !roots.is_empty() {
		return Ok((roots, skipped));
	}
	let home = home.ok_or_else(|| anyhow!("no usable root directory and no home directory to fall back to"))?;
	Ok((vec![Root::new(home)?], skipped))
}

fn usage(agent: &str) -> String {
	format!(
		"usage: {} <allowed-directory> [additional-directories...] (or set {})",
		agent, ALLOWED_ROOTS_ENV
	)
}
