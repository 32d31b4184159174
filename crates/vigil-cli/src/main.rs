//! vigil - run relay policy scripts against JSON input.
//!
//! # Configuration
//!
//! Configuration is loaded from multiple sources with priority:
//!
//! 1. CLI arguments (highest priority)
//! 2. Environment variables (`VIGIL_*`)
//! 3. Project config (`<config-root>/.vigil/config.toml`)
//! 4. Global config (`~/.vigil/config.toml`)
//! 5. Default values (lowest priority)
//!
//! # Usage
//!
//! ```text
//! vigil init
//! echo '{"kind":1,"content":"hi",...}' | vigil event --store events.jsonl
//! echo '{"kinds":[1]}' | vigil filter --pubkey <hex>
//! ```
//!
//! Every input line produces one decision line on stdout, e.g.
//! `{"reject":true,"message":"notes cannot have tags"}`. Logs go to stderr.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use vigil_lua::{ensure_default_scripts, PolicyEngine, PolicyInput, PolicyService};
use vigil_runtime::config::{ConfigLoader, VigilConfig};
use vigil_runtime::{ConnectionSnapshot, MemoryStore};
use vigil_types::{Decision, Event, Filter, TypeError};

/// vigil - relay policy scripts
#[derive(Parser, Debug)]
#[command(name = "vigil")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Directory holding `.vigil/config.toml` (defaults to current directory)
    #[arg(long, global = true, value_name = "DIR")]
    config_root: Option<PathBuf>,

    /// Override the policy scripts directory
    #[arg(long, global = true, value_name = "DIR")]
    scripts_dir: Option<PathBuf>,

    /// Log filter directive (overrides RUST_LOG and the config file)
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write the default policy scripts if they are missing
    Init,
    /// Decide on events read as JSON lines from stdin
    Event(DecideArgs),
    /// Decide on subscription filters read as JSON lines from stdin
    Filter(DecideArgs),
}

#[derive(Args, Debug)]
struct DecideArgs {
    /// JSONL file of events to preload into the in-memory store
    #[arg(long, value_name = "FILE")]
    store: Option<PathBuf>,

    /// Remote address reported to scripts as `conn.ip`
    #[arg(long, default_value = "127.0.0.1")]
    ip: String,

    /// Authenticated public key reported as `conn.pubkey`
    #[arg(long)]
    pubkey: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum InputKind {
    Event,
    Filter,
}

impl InputKind {
    fn parse(self, line: &str) -> Result<PolicyInput, TypeError> {
        Ok(match self {
            Self::Event => PolicyInput::Event(Event::from_json(line)?),
            Self::Filter => PolicyInput::Filter(Filter::from_json(line)?),
        })
    }
}

fn load_config(cli: &Cli) -> Result<VigilConfig> {
    let root = match &cli.config_root {
        Some(root) => root.clone(),
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    let root = std::path::absolute(&root)
        .with_context(|| format!("invalid config root {}", root.display()))?;

    let mut config = ConfigLoader::new()
        .with_project_root(&root)
        .load()
        .context("failed to load configuration")?;

    if let Some(dir) = &cli.scripts_dir {
        config.scripts.dir.clone_from(dir);
    }
    if config.scripts.dir.is_relative() {
        config.scripts.dir = root.join(&config.scripts.dir);
    }
    Ok(config)
}

/// Log filter: `--log-level` > `RUST_LOG` > config `log.level`.
fn init_tracing(cli_level: Option<&str>, config_level: &str) {
    let filter = match cli_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config_level)),
    };
    let layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .init();
}

fn run_init(config: &VigilConfig) -> Result<()> {
    let created = ensure_default_scripts(&config.scripts).with_context(|| {
        format!("cannot write scripts to {}", config.scripts.dir.display())
    })?;
    if created.is_empty() {
        println!("Scripts already present in {}", config.scripts.dir.display());
    }
    for path in created {
        println!("Created {}", path.display());
    }
    Ok(())
}

async fn run_decide(config: &VigilConfig, kind: InputKind, args: DecideArgs) -> Result<()> {
    ensure_default_scripts(&config.scripts).with_context(|| {
        format!("cannot write scripts to {}", config.scripts.dir.display())
    })?;

    let store = MemoryStore::new();
    if let Some(path) = &args.store {
        let file = std::fs::File::open(path)
            .with_context(|| format!("cannot open store file {}", path.display()))?;
        let loaded = store
            .load_jsonl(std::io::BufReader::new(file))
            .with_context(|| format!("cannot load store file {}", path.display()))?;
        info!(events = loaded, path = %path.display(), "Store loaded");
    }

    let engine = Arc::new(PolicyEngine::new(config, Arc::new(store)));
    let service = PolicyService::new(engine);

    let mut conn = ConnectionSnapshot::new(args.ip);
    if let Some(pubkey) = args.pubkey {
        conn = conn.with_pubkey(pubkey);
    }

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let decision = match kind.parse(line) {
            Ok(input) => service.decide(input, &conn).await,
            Err(e) => {
                warn!(error = %e, "Malformed input line");
                Decision::reject(format!("error: invalid input: {e}"))
            }
        };
        let mut out = serde_json::to_string(&decision)?;
        out.push('\n');
        stdout.write_all(out.as_bytes()).await?;
    }
    stdout.flush().await?;

    service.on_disconnect(conn.id);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(cli.log_level.as_deref(), &config.log.level);
    info!(scripts = %config.scripts.dir.display(), "Configuration loaded");

    match cli.command {
        Command::Init => run_init(&config),
        Command::Event(args) => run_decide(&config, InputKind::Event, args).await,
        Command::Filter(args) => run_decide(&config, InputKind::Filter, args).await,
    }
}
