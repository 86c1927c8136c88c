use std::{collections::HashMap, path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{Context, Result};
use asset_sync::{
    checkpoint::CheckpointStore,
    config::Settings,
    orchestrator::{Orchestrator, OrchestratorConfig},
    plan::build_plan,
    providers::build_governor,
};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use storage_service::{
    Catalog, PartitionWriter, WriterConfig,
    catalog::render,
    health::{GapGranularity, HealthCheckOptions},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(version, about = "Keep a local bar lake in sync with market data providers")]
struct Cli {
    /// Default log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Ingest every job in the config file.
    Run {
        #[arg(long, value_name = "FILE")]
        config: PathBuf,
    },
    /// Report coverage and gaps of the stored lake.
    Health {
        #[arg(long, value_name = "DIR")]
        data_root: PathBuf,
        #[arg(long, value_enum, default_value_t = Granularity::Bar)]
        granularity: Granularity,
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run a read-only SQL query over the `bars` table.
    Query {
        #[arg(long, value_name = "DIR")]
        data_root: PathBuf,
        sql: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Granularity {
    Bar,
    Partition,
}

impl From<Granularity> for GapGranularity {
    fn from(g: Granularity) -> Self {
        match g {
            Granularity::Bar => GapGranularity::Bar,
            Granularity::Partition => GapGranularity::Partition,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.cmd {
        Cmd::Run { config } => run(config).await,
        Cmd::Health {
            data_root,
            granularity,
            json,
        } => {
            let catalog = Catalog::open(&data_root)?;
            let report = catalog
                .health_check(HealthCheckOptions {
                    granularity: granularity.into(),
                    window: None,
                })
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("partitions: {}", report.partition_count);
                println!("rows (estimate): {}", report.row_count_estimate);
                if let Some((first, last)) = report.date_range_covered {
                    println!("covered: {first} .. {last}");
                }
                for gap in &report.gaps {
                    println!("gap {}/{}: {} .. {}", gap.symbol, gap.timeframe, gap.start, gap.end);
                }
                for path in &report.unreadable_partitions {
                    println!("unreadable: {}", path.display());
                }
            }
            Ok(if report.unreadable_partitions.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Cmd::Query { data_root, sql } => {
            let catalog = Catalog::open(&data_root)?;
            let batches = catalog.query(&sql).await?;
            println!("{}", render(&batches)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(config: PathBuf) -> Result<ExitCode> {
    let settings =
        Settings::load(&config).with_context(|| format!("loading {}", config.display()))?;
    let jobs = build_plan(&settings.jobs, Utc::now())?;
    info!(jobs = jobs.len(), data_root = %settings.data_root.display(), "plan built");

    let mut governors = HashMap::new();
    for job in &jobs {
        if governors.contains_key(&job.provider) {
            continue;
        }
        match build_governor(job.provider, &settings.provider(job.provider)) {
            Ok(governor) => {
                governors.insert(job.provider, governor);
            }
            // jobs for this provider fail individually
            Err(e) => warn!(provider = %job.provider, error = %e, "provider unavailable"),
        }
    }

    let writer = PartitionWriter::new(
        &settings.data_root,
        WriterConfig {
            zstd_level: settings.storage.zstd_level,
        },
    )?;
    let checkpoints = CheckpointStore::open(&settings.checkpoint_db)?;
    let providers: Vec<_> = governors.keys().copied().collect();
    let orchestrator = providers.into_iter().fold(
        Orchestrator::new(
            governors,
            Arc::new(writer),
            checkpoints,
            OrchestratorConfig::from(&settings.orchestrator),
        ),
        |orchestrator, id| {
            orchestrator.with_request_params(id, settings.provider(id).request_params(id))
        },
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing in-flight batches");
                cancel.cancel();
            }
        }
    });

    let summary = orchestrator.run(jobs, cancel).await?;
    println!("{summary}");
    Ok(if summary.all_completed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
