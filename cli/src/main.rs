use std::convert::Infallible;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use sqlswitch::{Clock, ConfigError, PgOpener, Selector, SwitchConfig, SwitchError, SystemClock};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to read config file {path}: {source}")]
    ConfigFile { path: PathBuf, source: std::io::Error },
    #[error("{0}")]
    Route(#[from] SwitchError<Infallible>),
    #[error("{0}")]
    Connect(#[from] SwitchError<sqlx::Error>),
    #[error("health query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("invalid JSON output: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "sqlswitch", about = "Resolve and test composite sqlswitch connection strings")]
struct Cli {
    #[command(flatten)]
    policy: PolicyArgs,

    #[command(subcommand)]
    command: Command,
}

/// Policy layers, lowest first: defaults, `--config`, `SQLSWITCH_*` env, flags.
#[derive(Args, Debug, Default)]
struct PolicyArgs {
    /// JSON file with `phase` and boundary timestamps.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "SQLSWITCH_PHASE")]
    phase: Option<String>,

    #[arg(long, global = true, env = "SQLSWITCH_SRC_POOL_END")]
    src_pool_end: Option<i64>,

    #[arg(long, global = true, env = "SQLSWITCH_DST_POOL_START")]
    dst_pool_start: Option<i64>,

    #[arg(long, global = true, env = "SQLSWITCH_DST_POOL_END")]
    dst_pool_end: Option<i64>,

    #[arg(long, global = true, env = "SQLSWITCH_BAK_POOL_START")]
    bak_pool_start: Option<i64>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print which endpoint the policy selects, without connecting.
    Resolve {
        composite: String,
        /// Evaluate at this Unix timestamp instead of now.
        #[arg(long)]
        at: Option<i64>,
        #[arg(long)]
        json: bool,
    },
    /// Open the selected endpoint and run `SELECT 1`.
    Connect {
        #[arg(env = "DATABASE_URL")]
        composite: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let config = load_config(&cli.policy)?;

    match cli.command {
        Command::Resolve { composite, at, json } => run_resolve(config, &composite, at, json),
        Command::Connect { composite } => run_connect(config, &composite).await,
    }
}

fn load_config(args: &PolicyArgs) -> Result<SwitchConfig, CliError> {
    let base = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|source| CliError::ConfigFile { path: path.clone(), source })?;
            SwitchConfig::from_json(&raw)?
        }
        None => SwitchConfig::default(),
    };
    Ok(apply_overrides(base, args))
}

fn apply_overrides(mut config: SwitchConfig, args: &PolicyArgs) -> SwitchConfig {
    if let Some(phase) = &args.phase {
        config.phase.clone_from(phase);
    }
    if let Some(ts) = args.src_pool_end {
        config.src_pool_end = ts;
    }
    if let Some(ts) = args.dst_pool_start {
        config.dst_pool_start = ts;
    }
    if let Some(ts) = args.dst_pool_end {
        config.dst_pool_end = ts;
    }
    if let Some(ts) = args.bak_pool_start {
        config.bak_pool_start = ts;
    }
    config
}

fn run_resolve(config: SwitchConfig, composite: &str, at: Option<i64>, json: bool) -> Result<(), CliError> {
    println!("{}", resolve_output(config, composite, at, json)?);
    Ok(())
}

fn resolve_output(config: SwitchConfig, composite: &str, at: Option<i64>, json: bool) -> Result<String, CliError> {
    let clock = move || at.unwrap_or_else(|| SystemClock.now_unix());
    let selector = Selector::with_clock(PgOpener, clock);
    selector.apply_config(config);

    let resolution = selector.resolve(composite)?;
    if json {
        Ok(serde_json::to_string_pretty(&serde_json::json!({
            "target": resolution.target.as_str(),
            "endpoint": resolution.endpoint,
        }))?)
    } else {
        Ok(format!("{}\t{}", resolution.target, resolution.endpoint))
    }
}

async fn run_connect(config: SwitchConfig, composite: &str) -> Result<(), CliError> {
    let selector = Selector::new(PgOpener);
    selector.apply_config(config);

    let mut conn = selector.open(composite).await?;
    let one: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&mut conn).await?;
    tracing::debug!(result = one, "health query ok");

    println!("ok\t{}", selector.last_endpoint().unwrap_or_default());
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
