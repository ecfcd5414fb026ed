use anyhow::Result;
use mcp_agents::config::{load_config, RootPolicy};
use mcp_agents::fs::{tool_definitions, FsBackend};
use mcp_agents::logging;
use mcp_agents::registry::ToolRegistry;
use mcp_agents::sandbox::PathSandbox;
use mcp_agents::server::{AgentInfo, Server};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
	let config = load_config("mcp-fs", RootPolicy::Strict)?;
	let logger = logging::init("mcp-fs", config.log_dir.as_deref());
	let sandbox = PathSandbox::new(config.roots);
	let server = Server::new(
		AgentInfo {
			name: "mcp-fs",
			version: env!("CARGO_PKG_VERSION"),
			session_id: config.session_id
		},
		ToolRegistry::new(tool_definitions()),
		sandbox.clone(),
		FsBackend::new(sandbox)
	);
	server.run(&logger).await
}
