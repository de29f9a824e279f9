//! Steward CLI - multi-account automation runner.
//!
//! Single binary that provides:
//! - `steward run` - run cycle workers until interrupted
//! - `steward status` - fast account overview
//! - `steward account` - account management
//! - `steward proxy` - proxy pool management

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use steward_core::{
    AccountRegistry, BotController, ProxyPool, SessionSnapshot, Settings, StartOutcome,
};

#[derive(Parser)]
#[command(name = "steward")]
#[command(about = "Multi-account browser game automation", version)]
struct Cli {
    /// Data directory holding accounts, proxies and settings
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run cycle workers until interrupted
    Run {
        /// Run a single account instead of all of them
        #[arg(long)]
        account: Option<String>,
    },

    /// Show account status
    Status,

    /// Account management
    Account {
        #[command(subcommand)]
        command: AccountCommands,
    },

    /// Proxy pool management
    Proxy {
        #[command(subcommand)]
        command: ProxyCommands,
    },
}

#[derive(Subcommand)]
enum AccountCommands {
    /// Add an account
    Add {
        /// Server/market code, e.g. `en`
        #[arg(long)]
        server: String,

        /// World identifier, e.g. `en123`
        #[arg(long)]
        world: String,

        #[arg(long)]
        username: String,

        /// Proxy id to bind the account to
        #[arg(long)]
        proxy: Option<String>,

        /// JSON file with a captured session snapshot
        #[arg(long)]
        session_file: Option<PathBuf>,
    },

    /// List accounts
    Ls,

    /// Remove an account
    Rm { id: String },
}

#[derive(Subcommand)]
enum ProxyCommands {
    /// Add proxies from `ip:port[:user:pass]` lines
    Add {
        /// File with one proxy per line; reads the arguments otherwise
        #[arg(long)]
        file: Option<PathBuf>,

        /// Proxy lines given directly
        lines: Vec<String>,
    },

    /// List proxies
    Ls,

    /// Remove a proxy
    Rm { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    fmt().with_env_filter(filter).with_target(false).init();

    let data_dir = cli.data_dir.unwrap_or_else(|| PathBuf::from(".steward"));

    match cli.command {
        Commands::Run { account } => run_workers(&data_dir, account).await,
        Commands::Status => show_status(&data_dir),
        Commands::Account { command } => handle_account(&data_dir, command),
        Commands::Proxy { command } => handle_proxy(&data_dir, command),
    }
}

async fn run_workers(data_dir: &PathBuf, account: Option<String>) -> Result<()> {
    let settings = Settings::load_or_default(data_dir)?;
    let registry = AccountRegistry::load(data_dir)?;
    let proxies = ProxyPool::load(data_dir)?;
    let controller = BotController::new(registry.clone(), proxies, settings);

    let targets: Vec<String> = match account {
        Some(id) => vec![id],
        None => registry.list().into_iter().map(|a| a.id).collect(),
    };
    if targets.is_empty() {
        bail!("no accounts configured; add one with `steward account add`");
    }

    for id in &targets {
        match controller.start(id)? {
            StartOutcome::Started => tracing::info!(account = %id, "worker started"),
            StartOutcome::AlreadyRunning => tracing::info!(account = %id, "already running"),
            StartOutcome::UnknownAccount => tracing::warn!(account = %id, "unknown account"),
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupt received, shutting down");
    controller.shutdown().await;
    Ok(())
}

fn show_status(data_dir: &PathBuf) -> Result<()> {
    let registry = AccountRegistry::load(data_dir)?;
    let proxies = ProxyPool::load(data_dir)?;

    let accounts = registry.list();
    println!("Steward Status");
    println!("==============");
    println!();
    println!("Accounts: {}", accounts.len());
    for account in &accounts {
        println!(
            "  {} {} [{:?}/{:?}]",
            account.id,
            account.label(),
            account.status,
            account.cycle_state
        );
        println!(
            "      wood {} stone {} iron {} | storage {} | pop {}/{} | points {} | incomings {}",
            account.resources.wood,
            account.resources.stone,
            account.resources.iron,
            account.storage,
            account.population.current,
            account.population.max,
            account.points,
            account.incomings
        );
        if let Some(last) = &account.last_cycle {
            println!("      last cycle {last}");
        }
    }
    println!();
    println!("Proxies: {}", proxies.list().len());
    for proxy in proxies.list() {
        println!(
            "  {} {}:{} [{:?}] {}",
            proxy.id,
            proxy.ip,
            proxy.port,
            proxy.status,
            proxy.assigned_to.as_deref().unwrap_or("unassigned")
        );
    }
    Ok(())
}

fn handle_account(data_dir: &PathBuf, command: AccountCommands) -> Result<()> {
    let registry = AccountRegistry::load(data_dir)?;
    let proxies = ProxyPool::load(data_dir)?;

    match command {
        AccountCommands::Add {
            server,
            world,
            username,
            proxy,
            session_file,
        } => {
            if let Some(ref id) = proxy {
                if proxies.get(id).is_none() {
                    bail!("unknown proxy id {id}");
                }
            }
            let record = registry.add_account(&server, &world, &username, proxy, &proxies)?;
            if let Some(path) = session_file {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read session from {}", path.display()))?;
                let snapshot: SessionSnapshot = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse session from {}", path.display()))?;
                registry.with_account(&record.id, |account| account.session = Some(snapshot));
                registry.save()?;
            }
            println!("Added account {} ({})", record.id, record.label());
            Ok(())
        }
        AccountCommands::Ls => {
            for account in registry.list() {
                println!(
                    "{} {} session={} proxy={}",
                    account.id,
                    account.label(),
                    if account.session.is_some() { "yes" } else { "no" },
                    account.proxy_id.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        AccountCommands::Rm { id } => {
            match registry.delete_account(&id, &proxies)? {
                Some(record) => println!("Removed account {}", record.label()),
                None => bail!("unknown account id {id}"),
            }
            Ok(())
        }
    }
}

fn handle_proxy(data_dir: &PathBuf, command: ProxyCommands) -> Result<()> {
    let pool = ProxyPool::load(data_dir)?;

    match command {
        ProxyCommands::Add { file, lines } => {
            let raw = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read proxies from {}", path.display()))?,
                None => lines.join("\n"),
            };
            if raw.trim().is_empty() {
                bail!("no proxy lines given");
            }
            let added = pool.add_from_text(&raw)?;
            println!("Added {} proxies", added.len());
            for proxy in added {
                println!("  {} {}:{}", proxy.id, proxy.ip, proxy.port);
            }
            Ok(())
        }
        ProxyCommands::Ls => {
            for proxy in pool.list() {
                println!(
                    "{} {}:{} [{:?}] {}",
                    proxy.id,
                    proxy.ip,
                    proxy.port,
                    proxy.status,
                    proxy.assigned_to.as_deref().unwrap_or("unassigned")
                );
            }
            Ok(())
        }
        ProxyCommands::Rm { id } => {
            if pool.get(&id).is_none() {
                bail!("unknown proxy id {id}");
            }
            pool.delete(&id)?;
            println!("Removed proxy {id}");
            Ok(())
        }
    }
}
