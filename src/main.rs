use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use mcpquery::agent::{Agent, AgentSettings};
use mcpquery::cli::{self, ChatLoop, Memory};
use mcpquery::config::AppConfig;
use mcpquery::llm::create_provider;
use mcpquery::mcp::McpClient;
use mcpquery::session;
use mcpquery::tools::ToolRegistry;

/// Ask an LLM questions it can answer with tools from an MCP server.
#[derive(Parser, Debug)]
#[command(name = "mcpquery", version, about)]
struct Args {
    /// Answer this query and exit instead of starting the prompt loop
    query: Option<String>,

    /// Config file (default: ~/.mcpquery/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// MCP server endpoint
    #[arg(long)]
    server: Option<String>,

    /// LLM provider: openai_compatible or anthropic
    #[arg(long)]
    provider: Option<String>,

    #[arg(long)]
    model: Option<String>,

    /// Maximum completion rounds per query
    #[arg(long)]
    max_rounds: Option<u32>,

    /// Carry conversation history between queries
    #[arg(long)]
    memory: bool,

    /// Resume a saved session (implies --memory)
    #[arg(long, value_name = "ID")]
    resume: Option<String>,

    /// List saved sessions and exit
    #[arg(long, conflicts_with_all = ["query", "resume"])]
    sessions: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => AppConfig::load_from(path)?,
        None => {
            // Auto-generate config file on first run
            let config_path = AppConfig::config_path()?;
            if !config_path.exists() {
                let path = AppConfig::save_default()?;
                println!("[Config] Created default config: {}", path.display());
                println!("[Config] Edit it to set your model, server url, etc.");
            }
            AppConfig::load()?
        }
    };

    if let Some(server) = &args.server {
        config.server.url = server.clone();
    }
    if let Some(provider) = &args.provider {
        config.llm.provider = provider.clone();
    }
    if let Some(model) = &args.model {
        config.llm.model = model.clone();
    }
    if let Some(max_rounds) = args.max_rounds {
        config.agent.max_rounds = max_rounds;
    }
    if args.memory || args.resume.is_some() {
        config.agent.memory = true;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if args.sessions {
        let sessions = session::list_sessions(&session::sessions_dir()?)?;
        if sessions.is_empty() {
            println!("No saved sessions.");
        }
        for s in sessions {
            println!("{}  {}  {} messages  {}", s.id, s.created_at, s.messages.len(), s.server_url);
        }
        return Ok(());
    }

    let config = load_config(&args)?;
    tracing::info!(
        provider = %config.llm.provider,
        model = %config.llm.model,
        server = %config.server.url,
        "configuration loaded"
    );

    let llm = create_provider(&config)?;

    let client = Arc::new(
        McpClient::connect(&config.server)
            .await
            .context("failed to connect to server")?,
    );
    let descriptors = client
        .list_tools()
        .await
        .context("failed to load tools from server")?;
    let registry = ToolRegistry::new(descriptors);

    println!("Connected to server with tools:");
    for name in registry.names() {
        println!("- {}", name);
    }

    let agent = Agent::new(
        llm,
        Box::new(client.clone()),
        registry,
        AgentSettings::from_config(&config),
    );

    let sessions_dir = session::sessions_dir()?;
    let history = match &args.resume {
        Some(id) => {
            let data = session::load_session(&sessions_dir, id)?;
            println!("[Session] Resumed {} ({} messages)", data.id, data.messages.len());
            data.messages
        }
        None => Vec::new(),
    };
    let mut memory = Memory::new(config.agent.memory, history);

    let result = match &args.query {
        Some(query) => match cli::ask(&agent, &mut memory, query).await {
            Ok(outcome) => {
                println!("{}", cli::render_outcome(&outcome));
                Ok(())
            }
            Err(e) => Err(e.into()),
        },
        None => {
            ChatLoop {
                agent: &agent,
                memory,
                server_url: config.server.url.clone(),
                sessions_dir,
            }
            .run()
            .await
        }
    };

    client.close().await;
    result
}
