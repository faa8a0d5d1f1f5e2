use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wide_deep_bandit::config::Config;
use wide_deep_bandit::mcp::McpServer;
use wide_deep_bandit::storage::StorageManager;
use wide_deep_bandit::tools::ToolHandler;
use wide_deep_bandit::WideDeepBandit;

fn main() -> Result<()> {
    // Init tracing (stderr so it doesn't interfere with MCP stdio)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Create default config if missing
    Config::create_default_if_missing();
    let config = Config::global();

    // Init storage and restore the agent if a snapshot exists
    let storage = StorageManager::new()?;
    let name = &config.server.agent_name;
    let agent = match storage.load_agent(name, config.agent.seed)? {
        Some(agent) => agent,
        None => {
            info!("Starting fresh agent {}", name);
            WideDeepBandit::new(config.agent.clone())?
        }
    };
    let handler = ToolHandler::new(agent, storage, name.clone(), config.server.snapshot_every);

    // Create MCP server and register tools
    let mut server = McpServer::new("wide-deep-bandit", env!("CARGO_PKG_VERSION"));

    for tool in ToolHandler::get_tools() {
        let h = handler.clone();
        let name = tool.name.clone();
        server.register_tool(tool, move |args| h.handle(&name, args));
    }

    // Run on stdio until EOF, then persist whatever was recorded
    let served = server.run();
    handler.flush()?;
    served
}
