use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobtrack_core::{load_app_config, AppConfig};
use jobtrack_storage::{NotionConfig, NotionStore, RecordStore};
use jobtrack_sync::{report_markdown, run_sync_once_from_config, SyncPipeline};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobtrack")]
#[command(about = "Mirror a careers board into a Notion database")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one full sync and exit with the run's status.
    Sync,
    /// Verify credentials and the database schema.
    Check,
    /// Fetch and normalize postings without writing anything.
    Preview {
        #[arg(long)]
        office: Option<String>,
    },
    /// Summarize past run reports.
    Report {
        #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
        runs: u64,
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_level.clone()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_app_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config);

    match run(cli.command.unwrap_or(Commands::Sync), &config).await {
        Ok(code) => code,
        Err(err) => {
            let message = format!("{err:#}");
            tracing::error!(error = %message, "jobtrack failed");
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, config: &AppConfig) -> Result<ExitCode> {
    match command {
        Commands::Sync => {
            let summary = run_sync_once_from_config(config).await?;
            let status = summary.exit_status();
            println!(
                "sync {:?}: run_id={} created={} updated={} unchanged={} closed={} skipped={} failed_offices={}",
                status,
                summary.run_id,
                summary.created(),
                summary.updated(),
                summary.unchanged(),
                summary.closed(),
                summary.skipped(),
                summary.failed_offices().len()
            );
            Ok(ExitCode::from(status.code()))
        }
        Commands::Check => {
            let store = NotionStore::new(NotionConfig {
                api_base: config.notion_api_base.clone(),
                api_key: config.notion_api_key.clone(),
                database_id: config.notion_database_id.clone(),
                notion_version: config.notion_version.clone(),
                timeout: config.http_timeout(),
                user_agent: Some(config.user_agent.clone()),
            })?;
            store.verify_access().await.context("verifying Notion credentials")?;
            let missing = store
                .missing_fields()
                .await
                .context("reading Notion database schema")?;
            if missing.is_empty() {
                println!("ok: credentials valid, database exposes every tracked property");
                return Ok(ExitCode::SUCCESS);
            }
            for field in &missing {
                println!(
                    "missing or mistyped property: {} ({field})",
                    jobtrack_storage::notion::property_name(*field)
                );
            }
            Ok(ExitCode::FAILURE)
        }
        Commands::Preview { office } => {
            let pipeline = SyncPipeline::from_config(config)?;
            let postings = pipeline.preview(office.as_deref()).await?;
            for p in &postings {
                println!(
                    "{}\t{}\t{}\t{}\t{}\t{}",
                    p.req_id, p.office, p.department, p.experience, p.title, p.apply_url
                );
            }
            println!("{} postings", postings.len());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Report { runs, dir } => {
            let dir = dir
                .or_else(|| config.reports_dir.clone())
                .context("no reports directory; pass --dir or set JOBTRACK_REPORTS_DIR")?;
            let runs = usize::try_from(runs).unwrap_or(usize::MAX);
            println!("{}", report_markdown(runs, &dir)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
