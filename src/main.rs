use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sessionvault::cli::{agents, delete, list, read, search, Target};
use sessionvault::config::Config;
use sessionvault::model::{MessageWindow, PageRequest, SearchMode};
use sessionvault::provider::ProviderRegistry;

#[derive(Parser)]
#[command(name = "sessionvault")]
#[command(about = "Browse, search and edit AI coding-agent session histories, locally or over SSH")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Remote host alias from the config (or a bare hostname)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Print JSON instead of a table
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered agents and whether their data exists
    Agents,

    /// List sessions of a project, newest first
    List {
        /// Agent id (claude, codex, gemini, opencode)
        #[arg(short, long)]
        agent: String,

        /// Project directory (defaults to the current directory)
        #[arg(short, long)]
        project: Option<String>,

        #[arg(long, default_value_t = 20)]
        page_size: usize,

        /// Session id the previous page ended with
        #[arg(long)]
        cursor: Option<String>,
    },

    /// Read a window of a session's messages, counted back from the newest
    Read {
        #[arg(short, long)]
        agent: String,

        session_id: String,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Search a project's sessions
    Search {
        #[arg(short, long)]
        agent: String,

        query: String,

        #[arg(short, long)]
        project: Option<String>,

        /// title, user, assistant or all
        #[arg(long, default_value = "all")]
        mode: SearchMode,
    },

    /// Print the file backing a session
    Path {
        #[arg(short, long)]
        agent: String,

        session_id: String,
    },

    /// Delete a user message and the replies that follow it
    Delete {
        #[arg(short, long)]
        agent: String,

        session_id: String,

        user_message_uuid: String,

        /// Match the user message by its text when the id is not found
        #[arg(long)]
        fallback: Option<String>,
    },
}

fn project_or_cwd(project: Option<String>) -> Result<String> {
    match project {
        Some(project) => Ok(shellexpand::tilde(&project).to_string()),
        None => Ok(std::env::current_dir()?.to_string_lossy().into_owned()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Load config
    let config = Config::load(cli.config.as_deref())?;
    let remote = cli.host.as_deref().map(|alias| config.host(alias));

    // Initialize provider registry
    let registry = ProviderRegistry::new(&config);

    match cli.command {
        Commands::Agents => {
            agents::run(&registry, remote.as_ref(), cli.json).await?;
        }
        Commands::List {
            agent,
            project,
            page_size,
            cursor,
        } => {
            let target = Target::resolve(&registry, &agent, remote)?;
            let page = PageRequest {
                cursor,
                limit: page_size,
            };
            list::run(&target, &project_or_cwd(project)?, page, cli.json).await?;
        }
        Commands::Read {
            agent,
            session_id,
            offset,
            limit,
        } => {
            let target = Target::resolve(&registry, &agent, remote)?;
            read::run(&target, &session_id, MessageWindow { offset, limit }, cli.json).await?;
        }
        Commands::Search {
            agent,
            query,
            project,
            mode,
        } => {
            let target = Target::resolve(&registry, &agent, remote)?;
            search::run(&target, &project_or_cwd(project)?, &query, mode, cli.json).await?;
        }
        Commands::Path { agent, session_id } => {
            let target = Target::resolve(&registry, &agent, remote)?;
            read::path(&target, &session_id, cli.json).await?;
        }
        Commands::Delete {
            agent,
            session_id,
            user_message_uuid,
            fallback,
        } => {
            let target = Target::resolve(&registry, &agent, remote)?;
            delete::run(
                &target,
                &session_id,
                &user_message_uuid,
                fallback.as_deref(),
                cli.json,
            )
            .await?;
        }
    }

    Ok(())
}
