use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use harvest_api::{DirArchive, GatherConfig, HarvestApi, InProcApi, RunSummary, TaskInfo};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "harvestctl", version, about = "Harvest: cluster telemetry gatherer")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List every gathering task and its kind
    Catalog,
    /// Run the enabled tasks and write the archive under DIR
    Gather {
        #[arg(long = "out")]
        out: PathBuf,
        /// YAML configuration file
        #[arg(long = "config", env = "HARVEST_CONFIG")]
        config: Option<PathBuf>,
        /// Only run these task ids (repeatable)
        #[arg(long = "only", num_args = 1..)]
        only: Vec<String>,
    },
    /// List the files of an archive directory
    Records {
        #[arg(long = "out")]
        out: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("HARVEST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("HARVEST_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid HARVEST_METRICS_ADDR; expected host:port");
        }
    }
}

fn print_catalog(tasks: &[TaskInfo], output: Output) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<60} KIND", "TASK");
            for t in tasks {
                println!("{:<60} {}", t.id, t.kind);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(tasks)?),
    }
    Ok(())
}

fn print_summary(summary: &RunSummary, out: &Path, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            println!(
                "gathered {} tasks in {}ms: {} files ({} bytes) under {}",
                summary.tasks,
                summary.took_ms,
                summary.archive.written,
                summary.archive.bytes,
                out.display()
            );
            for r in summary.reports.iter().filter(|r| !r.errors.is_empty() || r.timed_out) {
                let reason = r.errors.first().or(r.warnings.first()).map(String::as_str).unwrap_or_default();
                println!("  failed {}: {}", r.name, reason);
            }
            for path in &summary.archive.dropped {
                println!("  dropped {path} (archive size limit)");
            }
            for e in &summary.errors {
                println!("  error: {e}");
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(summary)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let api = InProcApi::new();

    match cli.command {
        Commands::Catalog => {
            let tasks = api.catalog().await?;
            print_catalog(&tasks, cli.output)?;
        }
        Commands::Gather { out, config, only } => {
            let cfg = GatherConfig::load(config.as_deref())?;
            info!(out = %out.display(), only = only.len(), "gather invoked");
            std::fs::create_dir_all(&out).with_context(|| format!("creating {}", out.display()))?;
            let mut archive = DirArchive::new(&out, cfg.archive_max_bytes);
            match api.gather(&cfg, &only, &mut archive).await {
                Ok(summary) => print_summary(&summary, &out, cli.output)?,
                Err(e) => {
                    error!(error = %e, "gather failed");
                    return Err(e.into());
                }
            }
        }
        Commands::Records { out } => {
            let files = DirArchive::list(&out)?;
            match cli.output {
                Output::Human => {
                    for f in &files {
                        println!("{f}");
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&files)?),
            }
        }
    }
    Ok(())
}
