use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use maptree::cli::{self, RunOptions};
use maptree::config::{DecodeConfig, EngineConfig, EngineMode, LoggingConfig, MapTreeConfig};
use maptree::engine::RollbackPolicy;
use maptree::tree::OrphanPolicy;
use maptree::{MapTreeError, Result};

/// Load a resource tree, replay UI intents against it and print the result.
#[derive(Parser, Debug)]
#[command(name = "maptree", version, about)]
struct Cli {
    /// Backend node list (JSON array or `{ "data": [...] }`)
    input: PathBuf,

    /// JSON array of intents to apply after loading
    #[arg(long)]
    script: Option<PathBuf>,

    /// Explicit config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// "sync" (local only) or "async" (through the repository)
    #[arg(long)]
    mode: Option<String>,

    /// On rejection: "rollback" or "reconcile"
    #[arg(long)]
    rollback: Option<String>,

    /// Records with a missing parent: "root" or "reject"
    #[arg(long)]
    orphans: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// Print nested-set JSON instead of an outline
    #[arg(long)]
    json: bool,
}

impl Cli {
    /// Flags as a partial config layered on top of the files.
    fn overrides(&self) -> Result<MapTreeConfig> {
        fn parse<T>(value: &Option<String>, flag: &str, f: fn(&str) -> Option<T>) -> Result<Option<T>> {
            match value {
                Some(v) => f(v)
                    .map(Some)
                    .ok_or_else(|| MapTreeError::InvalidInput(format!("--{} {}", flag, v))),
                None => Ok(None),
            }
        }

        Ok(MapTreeConfig {
            engine: EngineConfig {
                mode: parse(&self.mode, "mode", EngineMode::from_str)?,
                rollback: parse(&self.rollback, "rollback", RollbackPolicy::from_str)?,
            },
            decode: DecodeConfig {
                orphans: parse(&self.orphans, "orphans", OrphanPolicy::from_str)?,
            },
            logging: LoggingConfig {
                level: self.log_level.clone(),
            },
            ..Default::default()
        })
    }
}

fn setup_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn try_main(args: Cli) -> Result<()> {
    let overrides = args.overrides()?;
    let config = MapTreeConfig::load(args.config.as_deref(), Some(&overrides));
    setup_tracing(config.log_level());
    tracing::debug!(?config, "configuration resolved");

    let options = RunOptions {
        input: args.input,
        script: args.script,
        json: args.json,
    };
    let report = cli::run(&options, &config).await?;
    if options.script.is_some() {
        tracing::info!(applied = report.applied, failed = report.failed, "script finished");
    }
    print!("{}", report.output);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    match try_main(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("maptree: {}", e);
            ExitCode::FAILURE
        }
    }
}
