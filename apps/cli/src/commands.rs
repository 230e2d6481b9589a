//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use kbflow_core::{CoordinatorConfig, DatasetStatus, RunCoordinator, RunMode, RunRequest, Services};
use kbflow_shared::{
    Action, AppConfig, DatasetRef, DatasetRegistry, Params, Principal, RunId, RunLedgerEntry,
    RunResult, init_config, load_config,
};
use kbflow_steps::{DEFAULT_STEPS, STEP_NAMES, build_pipeline};
use kbflow_storage::Storage;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// kbflow: run text pipelines over datasets and track every run.
#[derive(Parser)]
#[command(
    name = "kbflow",
    version,
    about = "Run text-processing pipelines over datasets with a durable run ledger.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Principal to act as (defaults to `defaults.principal` from config).
    #[arg(long, env = "KBFLOW_PRINCIPAL", global = true)]
    pub principal: Option<String>,

    /// Database path (defaults to `storage.db_path` from config).
    #[arg(long, env = "KBFLOW_DB", global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Add source items to a dataset, creating it if needed.
    Ingest {
        /// Dataset name.
        #[arg(short, long)]
        dataset: String,

        /// Files whose contents become one item each.
        files: Vec<PathBuf>,

        /// Inline text items (can be specified multiple times).
        #[arg(long)]
        text: Vec<String>,
    },

    /// Run a pipeline over one or more datasets.
    Run {
        /// Dataset names or ids. Defaults to every dataset you own.
        #[arg(short, long)]
        dataset: Vec<String>,

        /// Steps to chain, comma-separated.
        #[arg(long, value_delimiter = ',')]
        steps: Vec<String>,

        /// Pipeline name recorded in the ledger (defaults to the step list).
        #[arg(long)]
        name: Option<String>,

        /// Return once runs are started and follow them from here.
        #[arg(long)]
        background: bool,

        /// Skip items this pipeline already completed.
        #[arg(long)]
        incremental: bool,

        /// Batch size for steps that accept batches.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Parameter override as key=value (value parsed as JSON when possible).
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, serde_json::Value)>,
    },

    /// Show a run's ledger entry.
    Status {
        /// Run id.
        run_id: String,
    },

    /// List datasets with their latest run.
    Datasets {
        /// Dataset names or ids. Defaults to every dataset you own.
        #[arg(short, long)]
        dataset: Vec<String>,
    },

    /// Grant another principal access to a dataset.
    Grant {
        /// Dataset name or id.
        #[arg(short, long)]
        dataset: String,

        /// Principal receiving the grant.
        #[arg(long)]
        to: String,

        /// Actions to grant (comma-separated).
        #[arg(long, value_delimiter = ',', default_value = "read")]
        action: Vec<ActionArg>,
    },

    /// List the built-in steps.
    Steps,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum ActionArg {
    Read,
    Write,
    Delete,
    Share,
}

impl From<ActionArg> for Action {
    fn from(arg: ActionArg) -> Self {
        match arg {
            ActionArg::Read => Action::Read,
            ActionArg::Write => Action::Write,
            ActionArg::Delete => Action::Delete,
            ActionArg::Share => Action::Share,
        }
    }
}

fn parse_param(raw: &str) -> std::result::Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{raw}'"));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "kbflow=warn",
        1 => "kbflow=info",
        2 => "kbflow=debug",
        _ => "kbflow=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Everything a command needs: resolved config, identity, and storage.
struct Session {
    config: AppConfig,
    principal: Principal,
    storage: Arc<Storage>,
}

impl Session {
    async fn open(cli: &Cli) -> Result<Self> {
        let config = load_config()?;
        let principal = Principal::new(
            cli.principal
                .clone()
                .unwrap_or_else(|| config.defaults.principal.clone()),
        );
        let db_path = match &cli.db {
            Some(path) => path.clone(),
            None => config.storage.resolved_db_path()?,
        };
        let storage = Storage::open(&db_path)
            .await
            .wrap_err_with(|| format!("opening database at {}", db_path.display()))?;
        Ok(Self {
            config,
            principal,
            storage: Arc::new(storage),
        })
    }

    fn coordinator(&self) -> RunCoordinator {
        RunCoordinator::new(
            Services::shared(self.storage.clone()),
            CoordinatorConfig::from(&self.config),
        )
    }
}

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::Steps => {
            cmd_steps();
            return Ok(());
        }
        Command::Config { action } => {
            return match action {
                ConfigAction::Init => cmd_config_init(),
                ConfigAction::Show => cmd_config_show(),
            };
        }
        _ => {}
    }

    let session = Session::open(&cli).await?;
    match cli.command {
        Command::Ingest {
            dataset,
            files,
            text,
        } => cmd_ingest(&session, &dataset, &files, text).await,
        Command::Run {
            dataset,
            steps,
            name,
            background,
            incremental,
            batch_size,
            params,
        } => {
            let options = RunOptions {
                datasets: parse_refs(&dataset)?,
                steps,
                name,
                background,
                incremental,
                batch_size,
                params: params.into_iter().collect(),
            };
            cmd_run(&session, options).await
        }
        Command::Status { run_id } => cmd_status(&session, &run_id).await,
        Command::Datasets { dataset } => cmd_datasets(&session, &parse_refs(&dataset)?).await,
        Command::Grant {
            dataset,
            to,
            action,
        } => cmd_grant(&session, &dataset, &to, &action).await,
        Command::Steps | Command::Config { .. } => Ok(()),
    }
}

fn parse_refs(raw: &[String]) -> Result<Vec<DatasetRef>> {
    raw.iter()
        .map(|r| r.parse::<DatasetRef>().map_err(Into::into))
        .collect()
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

#[instrument(skip_all, fields(dataset = %dataset))]
async fn cmd_ingest(
    session: &Session,
    dataset: &str,
    files: &[PathBuf],
    texts: Vec<String>,
) -> Result<()> {
    if files.is_empty() && texts.is_empty() {
        return Err(eyre!("nothing to ingest: pass files or --text"));
    }

    let dataset_id = session
        .storage
        .create_if_absent(dataset, &session.principal)
        .await?;

    let mut payloads = Vec::with_capacity(files.len() + texts.len());
    for path in files {
        let content = tokio::fs::read_to_string(path)
            .await
            .wrap_err_with(|| format!("reading {}", path.display()))?;
        payloads.push(serde_json::json!({
            "text": content,
            "source": path.display().to_string(),
        }));
    }
    payloads.extend(texts.into_iter().map(serde_json::Value::String));

    let before = session.storage.list_items(dataset_id).await?.len();
    for payload in payloads {
        session.storage.add_item(dataset_id, payload).await?;
    }
    let after = session.storage.list_items(dataset_id).await?.len();

    info!(dataset, %dataset_id, added = after - before, "items ingested");
    println!();
    println!("  Dataset: {dataset} ({dataset_id})");
    println!("  Added:   {}", after - before);
    println!("  Total:   {after}");
    println!();
    Ok(())
}

struct RunOptions {
    datasets: Vec<DatasetRef>,
    steps: Vec<String>,
    name: Option<String>,
    background: bool,
    incremental: bool,
    batch_size: Option<usize>,
    params: Params,
}

#[instrument(skip_all, fields(principal = %session.principal))]
async fn cmd_run(session: &Session, options: RunOptions) -> Result<()> {
    let defaults = &session.config.defaults;
    let steps: Vec<&str> = if options.steps.is_empty() {
        DEFAULT_STEPS.to_vec()
    } else {
        options.steps.iter().map(String::as_str).collect()
    };
    let batch_size = options.batch_size.unwrap_or(defaults.batch_size);
    let name = options.name.unwrap_or_else(|| steps.join("+"));
    let pipeline = Arc::new(build_pipeline(&name, &steps, batch_size)?);

    let mode = if options.background {
        RunMode::Background
    } else {
        defaults.mode.parse()?
    };
    let request = RunRequest::new(pipeline, session.principal.clone())
        .datasets(options.datasets)
        .mode(mode)
        .incremental(options.incremental || defaults.incremental)
        .params(options.params);

    info!(pipeline = %name, %mode, "starting run");
    let coordinator = session.coordinator();
    let progress = CliProgress::new();

    let results = match mode {
        RunMode::Blocking => {
            progress.phase(&format!("Running {name}"));
            let cancel = CancellationToken::new();
            let run = coordinator.run_pipeline_until(request, cancel.clone());
            tokio::pin!(run);
            tokio::select! {
                results = &mut run => results?,
                _ = tokio::signal::ctrl_c() => {
                    warn!("interrupted, cancelling runs");
                    progress.phase("Cancelling");
                    cancel.cancel();
                    run.await?
                }
            }
        }
        RunMode::Background => {
            let started = coordinator.run_pipeline(request).await?;
            for result in &started {
                progress.println(format!(
                    "  started {} on dataset {}",
                    result.run_id, result.dataset_id
                ));
            }
            follow(&coordinator, &started, &progress).await?;
            let mut finished = Vec::with_capacity(started.len());
            for result in started {
                finished.push(RunResult::from(coordinator.get_status(result.run_id).await?));
            }
            finished
        }
    };
    progress.finish();

    print_results(&results);
    if results.iter().any(|r| r.error.is_some()) {
        return Err(eyre!("one or more runs did not complete"));
    }
    Ok(())
}

/// Poll the ledger for background runs until every one is terminal.
async fn follow(
    coordinator: &RunCoordinator,
    started: &[RunResult],
    progress: &CliProgress,
) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut interrupted => {
                warn!("interrupted, cancelling background runs");
                progress.phase("Cancelling");
                coordinator.cancel_background().await;
                return Ok(());
            }
        }

        let mut done = 0;
        let mut processed = 0;
        for result in started {
            let entry = coordinator.get_status(result.run_id).await?;
            processed += entry.processed_count;
            if entry.status.is_terminal() {
                done += 1;
            }
        }
        progress.phase(&format!(
            "[{done}/{}] runs finished, {processed} units processed",
            started.len()
        ));
        if done == started.len() {
            coordinator.wait_background().await;
            return Ok(());
        }
    }
}

async fn cmd_status(session: &Session, run_id: &str) -> Result<()> {
    let run_id: RunId = run_id
        .parse()
        .map_err(|e| eyre!("invalid run id '{run_id}': {e}"))?;
    let entry = session.coordinator().get_status(run_id).await?;
    print_entry(&entry);
    Ok(())
}

async fn cmd_datasets(session: &Session, references: &[DatasetRef]) -> Result<()> {
    let statuses = session
        .coordinator()
        .dataset_status(references, &session.principal)
        .await?;
    if statuses.is_empty() {
        println!("No datasets.");
        return Ok(());
    }

    println!();
    for DatasetStatus {
        dataset,
        latest_run,
    } in &statuses
    {
        let items = session.storage.list_items(dataset.id).await?.len();
        let latest = match latest_run {
            Some(entry) => format!(
                "{} {} ({} processed)",
                entry.pipeline_name, entry.status, entry.processed_count
            ),
            None => "never run".to_string(),
        };
        println!("  {:<20} {}  {items:>5} items  {latest}", dataset.name, dataset.id);
    }
    println!();
    Ok(())
}

async fn cmd_grant(
    session: &Session,
    dataset: &str,
    to: &str,
    actions: &[ActionArg],
) -> Result<()> {
    let reference: DatasetRef = dataset.parse()?;
    let dataset_id = session
        .storage
        .resolve(&reference)
        .await?
        .ok_or_else(|| eyre!("unknown dataset '{dataset}'"))?;
    let record = session
        .storage
        .get_dataset(dataset_id)
        .await?
        .ok_or_else(|| eyre!("unknown dataset '{dataset}'"))?;
    if record.owner != session.principal.as_str() {
        return Err(eyre!(
            "only the owner ({}) can grant access to '{}'",
            record.owner,
            record.name
        ));
    }

    let grantee = Principal::new(to);
    for action in actions {
        let action = Action::from(*action);
        session.storage.grant(dataset_id, &grantee, action).await?;
        println!("Granted {action} on '{}' to {grantee}", record.name);
    }
    Ok(())
}

fn cmd_steps() {
    println!();
    for name in STEP_NAMES {
        let marker = if DEFAULT_STEPS.contains(&name) { "*" } else { " " };
        println!("  {marker} {name}");
    }
    println!();
    println!("  * run when --steps is not given");
    println!();
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_results(results: &[RunResult]) {
    println!();
    for result in results {
        println!(
            "  {}  {:<20} processed {:>5}  skipped {:>5}  run {}",
            result.dataset_id,
            result.status.as_str(),
            result.processed_count,
            result.skipped_count,
            result.run_id
        );
        if let Some(error) = &result.error {
            let task = error.task.as_deref().unwrap_or("-");
            println!("      {} in {task}: {}", error.kind, error.message);
        }
    }
    println!();
}

fn print_entry(entry: &RunLedgerEntry) {
    println!();
    println!("  Run:       {}", entry.run_id);
    println!("  Dataset:   {}", entry.dataset_id);
    println!("  Pipeline:  {}", entry.pipeline_name);
    println!("  Status:    {}", entry.status);
    println!("  Started:   {}", entry.started_at.to_rfc3339());
    println!("  Updated:   {}", entry.updated_at.to_rfc3339());
    if let Some(completed) = entry.completed_at {
        println!("  Completed: {}", completed.to_rfc3339());
    }
    println!("  Processed: {}", entry.processed_count);
    println!("  Skipped:   {}", entry.skipped_count);
    if let Some(error) = &entry.error {
        println!("  Error:     {} ({})", error.message, error.kind);
        if let Some(task) = &error.task {
            println!("  Task:      {task}");
        }
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Spinner shown while runs are in flight.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    fn phase(&self, message: &str) {
        self.spinner.set_message(message.to_string());
    }

    fn println(&self, line: String) {
        self.spinner.println(line);
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}
