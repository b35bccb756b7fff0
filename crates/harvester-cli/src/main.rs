use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use harvester_client::search::{DEFAULT_ENDPOINT, TOKEN_VAR};
use harvester_client::{ApiConfig, HttpCatalog, ReqwestSearchApi};
use harvester_core::catalog::{CatalogFormat, DEFAULT_KEY_FIELD, FileCatalog, load_catalog};
use harvester_core::{
    AppError, HarvestConfig, HarvestPipeline, JsonlSink, RunStatus, TracingReporter, Worklist,
    load_completed,
};

#[derive(Parser)]
#[command(
    name = "harvester",
    version,
    about = "Resumable, rate-limit aware harvester for a per-key search API"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch every catalog key not yet present in the output file
    Run {
        #[command(flatten)]
        source: SourceArgs,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Show how much of the catalog is still to be fetched
    Pending {
        #[command(flatten)]
        source: SourceArgs,

        /// Also print the pending keys, one per line
        #[arg(long, default_value_t = false)]
        list: bool,
    },
}

#[derive(Args)]
struct SourceArgs {
    /// Catalog location: a local file or an http(s) URL
    #[arg(short, long, env = "HARVESTER_CATALOG")]
    catalog: String,

    /// Catalog layout (jsonl or csv). Inferred from the location if omitted
    #[arg(long, env = "HARVESTER_CATALOG_FORMAT")]
    format: Option<CatalogFormat>,

    /// Field of each catalog entry holding the raw key
    #[arg(long, env = "HARVESTER_CATALOG_FIELD", default_value = DEFAULT_KEY_FIELD)]
    field: String,

    /// Append-only JSON lines output file
    #[arg(short, long, env = "HARVESTER_OUTPUT", default_value = "output.jsonl")]
    output: PathBuf,
}

#[derive(Args)]
struct RunArgs {
    /// API token (reads from YELP_TOKEN env var if not provided)
    #[arg(long, env = "YELP_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Search endpoint
    #[arg(long, env = "HARVESTER_API_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    endpoint: String,

    /// Results requested per key
    #[arg(long, env = "HARVESTER_PAGE_SIZE", default_value_t = 50)]
    page_size: u32,

    /// Result ordering requested from the API
    #[arg(long, env = "HARVESTER_SORT_BY", default_value = "distance")]
    sort_by: String,

    /// Keys fetched concurrently
    #[arg(short = 'p', long, env = "HARVESTER_CONCURRENCY", default_value_t = 2)]
    concurrency: usize,

    /// Seconds the gate stays closed after a rate-limit response
    #[arg(long, env = "HARVESTER_COOL_DOWN_SECS", default_value_t = 30 * 60)]
    cool_down_secs: u64,

    /// Failures tolerated before the run aborts
    #[arg(long, env = "HARVESTER_MAX_FAILURES", default_value_t = 10)]
    max_failures: u64,

    /// Log progress every N processed keys
    #[arg(long, env = "HARVESTER_PROGRESS_EVERY", default_value_t = 100)]
    progress_every: u64,

    /// Timeout of a single API call, in seconds
    #[arg(long, env = "HARVESTER_CALL_TIMEOUT_SECS", default_value_t = 30)]
    call_timeout_secs: u64,

    /// Longest wait for passage at a closed gate, in seconds
    #[arg(long, env = "HARVESTER_GATE_CEILING_SECS", default_value_t = 2 * 60 * 60)]
    gate_ceiling_secs: u64,

    /// Stop scheduling new keys after this many seconds
    #[arg(long, env = "HARVESTER_DEADLINE_SECS")]
    deadline_secs: Option<u64>,

    /// Fetch at most this many keys
    #[arg(short, long, env = "HARVESTER_LIMIT")]
    limit: Option<usize>,

    /// Retries of a key after rate-limit responses
    #[arg(long, env = "HARVESTER_MAX_RATE_LIMIT_RETRIES", default_value_t = 5)]
    max_rate_limit_retries: u32,

    /// HTTP status the API uses for rate limiting
    #[arg(long, env = "HARVESTER_RATE_LIMIT_STATUS", default_value_t = 429)]
    rate_limit_status: u16,
}

impl RunArgs {
    fn harvest_config(&self) -> HarvestConfig {
        HarvestConfig::default()
            .with_concurrency(self.concurrency)
            .with_cool_down(Duration::from_secs(self.cool_down_secs))
            .with_fatal_error_ceiling(self.max_failures)
            .with_progress_interval(self.progress_every)
            .with_call_timeout(Duration::from_secs(self.call_timeout_secs))
            .with_gate_ceiling(Duration::from_secs(self.gate_ceiling_secs))
            .with_run_deadline(self.deadline_secs.map(Duration::from_secs))
            .with_max_keys(self.limit)
            .with_max_rate_limit_retries(self.max_rate_limit_retries)
            .with_rate_limit_status(self.rate_limit_status)
    }

    fn api_config(&self) -> Result<ApiConfig, AppError> {
        let token = self.token.clone().ok_or_else(|| {
            AppError::ConfigError(format!("{TOKEN_VAR} not set. Required to call the search API."))
        })?;
        Ok(ApiConfig::new(token)?
            .with_endpoint(&self.endpoint)?
            .with_page_size(self.page_size)?
            .with_sort_by(self.sort_by.clone())
            .with_timeout(Duration::from_secs(self.call_timeout_secs)))
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Setup tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("harvester=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { source, run } => cmd_run(&source, &run).await,
        Commands::Pending { source, list } => {
            cmd_pending(&source, list).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Catalog minus what the output already holds.
async fn resolve_worklist(source: &SourceArgs, limit: Option<usize>) -> Result<Worklist> {
    let format = source
        .format
        .unwrap_or_else(|| CatalogFormat::infer(&source.catalog));

    let full = if HttpCatalog::handles(&source.catalog) {
        let catalog = HttpCatalog::new(&source.catalog)?;
        load_catalog(&catalog, format, &source.field).await?
    } else {
        load_catalog(&FileCatalog::new(&source.catalog), format, &source.field).await?
    };

    let completed = load_completed(&source.output).await;
    Ok(Worklist::build(&full, &completed, limit))
}

async fn cmd_run(source: &SourceArgs, run: &RunArgs) -> Result<ExitCode> {
    // 1. Configuration, before touching anything
    let api_config = run.api_config()?;
    let config = run.harvest_config();
    config.validate()?;

    // 2. Worklist
    let worklist = resolve_worklist(source, config.max_keys).await?;
    if worklist.is_empty() {
        tracing::info!("Nothing left to fetch");
    }

    // 3. Pipeline
    let api = ReqwestSearchApi::new(api_config).context("Failed to create HTTP client")?;
    let sink = JsonlSink::open(&source.output)
        .await
        .with_context(|| format!("Failed to open output file: {}", source.output.display()))?;
    let pipeline = HarvestPipeline::new(config, api, sink, Arc::new(TracingReporter))?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, letting in-flight calls finish");
            on_interrupt.cancel();
        }
    });

    // 4. Run
    let summary = pipeline
        .run(&worklist, cancel)
        .await
        .context("Failed to flush output file")?;

    println!("{}", serde_json::to_string_pretty(&summary)?);

    if summary.status == RunStatus::Aborted {
        let err = AppError::Aborted {
            failures: summary.fatal_failures,
        };
        tracing::error!("{err}");
        return Ok(ExitCode::from(err.exit_code()));
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_pending(source: &SourceArgs, list: bool) -> Result<()> {
    let worklist = resolve_worklist(source, None).await?;

    println!(
        "{} of {} keys done, {} pending",
        worklist.completed,
        worklist.total,
        worklist.remaining()
    );

    if list {
        for key in &worklist.keys {
            println!("{key}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_map_to_config() {
        let cli = Cli::try_parse_from([
            "harvester",
            "run",
            "--catalog",
            "places.csv",
            "--token",
            "t",
            "-p",
            "4",
            "--max-failures",
            "3",
            "--deadline-secs",
            "600",
            "--limit",
            "30000",
        ])
        .unwrap();

        let Commands::Run { source, run } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(source.output, PathBuf::from("output.jsonl"));
        assert_eq!(source.field, "postcode");

        let config = run.harvest_config();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.fatal_error_ceiling, 3);
        assert_eq!(config.run_deadline, Some(Duration::from_secs(600)));
        assert_eq!(config.max_keys, Some(30000));
        assert_eq!(config.cool_down, Duration::from_secs(1800));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn format_flag_parses() {
        let cli = Cli::try_parse_from([
            "harvester",
            "pending",
            "--catalog",
            "https://example.com/feed",
            "--format",
            "csv",
        ])
        .unwrap();
        let Commands::Pending { source, list } = cli.command else {
            panic!("expected pending");
        };
        assert_eq!(source.format, Some(CatalogFormat::Csv));
        assert!(!list);
    }

    fn run_args(token: Option<&str>) -> RunArgs {
        let cli = Cli::try_parse_from(["harvester", "run", "--catalog", "c.jsonl"]).unwrap();
        let Commands::Run { mut run, .. } = cli.command else {
            panic!("expected run");
        };
        // Independent of any YELP_TOKEN in the test environment.
        run.token = token.map(str::to_string);
        run
    }

    #[test]
    fn missing_token_is_a_config_error() {
        let err = run_args(None).api_config().unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
        assert!(err.is_pre_flight());
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn blank_token_is_a_config_error() {
        let err = run_args(Some("   ")).api_config().unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn token_builds_api_config() {
        let config = run_args(Some("secret")).api_config().unwrap();
        assert_eq!(config.token, "secret");
    }
}
