use anyhow::Result;
use mcp_agents::config::{load_config, RootPolicy};
use mcp_agents::git::{tool_definitions, GitBackend};
use mcp_agents::logging;
use mcp_agents::registry::ToolRegistry;
use mcp_agents::sandbox::PathSandbox;
use mcp_agents::server::{AgentInfo, Server};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
	let config = load_config("mcp-git", RootPolicy::HomeFallback)?;
	let logger = logging::init("mcp-git", config.log_dir.as_deref());
	tracing::dispatcher::with_default(logger.dispatch(), || {
		for skipped in &config.skipped_roots {
			tracing::warn!(reason = %skipped, "skipping unusable root");
		}
	});
	let server = Server::new(
		AgentInfo {
			name: "mcp-git",
			version: env!("CARGO_PKG_VERSION"),
			session_id: config.session_id
		},
		ToolRegistry::new(tool_definitions()),
		PathSandbox::new(config.roots),
		GitBackend
	);
	server.run(&logger).await
}
