//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use tracing::info;
use wise_core::{TaskExecutor, TaskScheduler, URL_MARK, UrlMarkArgs, url_mark_executor};
use wise_shared::{
    AppConfig, SchedulerConfig, Task, TaskQuery, TaskStatus, UrlMarkConfig, init_config,
    load_config, load_config_from, resolve_db_path, validate_config,
};
use wise_spiders::Spider;
use wise_storage::{PipelineStore, StepStore, Storage, TaskStore};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Wise: capture web pages through durable, resumable task pipelines.
#[derive(Parser)]
#[command(
    name = "wise",
    version,
    about = "Capture web pages through durable, resumable task pipelines.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.wise/wise.toml.
    #[arg(long, global = true, env = "WISE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database file, overriding `storage.db_path`.
    #[arg(long, global = true, env = "WISE_DB")]
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
    /// Run the scheduler until interrupted.
    Serve {
        /// Worker pool size, overriding `scheduler.pool_size`.
        #[arg(long)]
        pool_size: Option<usize>,
    },

    /// Submit a URL for capture.
    Submit {
        url: String,

        /// Task name (defaults to the URL).
        #[arg(short, long)]
        name: Option<String>,
    },

    /// List tasks, newest first.
    List {
        /// Filter by status (init, running, retry, success, failed, cancelled).
        #[arg(long)]
        status: Option<TaskStatus>,

        /// Filter by task type.
        #[arg(long = "type")]
        task_type: Option<String>,

        /// Filter by name substring.
        #[arg(long)]
        name: Option<String>,

        #[arg(long, default_value = "1")]
        page: u32,

        #[arg(long, default_value = "20")]
        page_size: u32,
    },

    /// Show a task and its step chain.
    Show {
        tid: String,

        /// Print the detail as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Cancel a task.
    Cancel { tid: String },

    /// Re-queue a failed task with a fresh retry budget.
    Retry { tid: String },

    /// Re-queue a cancelled task.
    Resume { tid: String },

    /// Configuration management.
    Config {
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

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "wise=info",
        1 => "wise=debug",
        _ => "wise=trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let ctx = CommandContext::load(cli.config.as_deref(), cli.db)?;

    match cli.command {
        Command::Serve { pool_size } => cmd_serve(&ctx, pool_size).await,
        Command::Submit { url, name } => cmd_submit(&ctx, &url, name.as_deref()).await,
        Command::List {
            status,
            task_type,
            name,
            page,
            page_size,
        } => {
            let query = TaskQuery {
                page,
                page_size,
                name,
                status,
                task_type,
            };
            cmd_list(&ctx, &query).await
        }
        Command::Show { tid, json } => cmd_show(&ctx, &tid, json).await,
        Command::Cancel { tid } => cmd_cancel(&ctx, &tid).await,
        Command::Retry { tid } => cmd_retry(&ctx, &tid).await,
        Command::Resume { tid } => cmd_resume(&ctx, &tid).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&ctx),
        },
    }
}

/// Resolved configuration shared by every command.
struct CommandContext {
    config: AppConfig,
    db_path: PathBuf,
}

impl CommandContext {
    fn load(config_path: Option<&Path>, db: Option<PathBuf>) -> Result<Self> {
        let config = match config_path {
            Some(path) => load_config_from(path)?,
            None => load_config()?,
        };
        let db_path = match db {
            Some(path) => path,
            None => resolve_db_path(&config)?,
        };
        Ok(Self { config, db_path })
    }

    async fn open_store(&self) -> Result<Arc<dyn PipelineStore>> {
        Ok(Arc::new(Storage::open(&self.db_path).await?))
    }

    async fn open_readonly(&self) -> Result<Storage> {
        if !self.db_path.exists() {
            return Err(eyre!(
                "no database at {}; submit a task first",
                self.db_path.display()
            ));
        }
        Ok(Storage::open_readonly(&self.db_path).await?)
    }

    /// A scheduler over `store` with the built-in pipelines registered.
    fn scheduler(&self, store: Arc<dyn PipelineStore>) -> Result<TaskScheduler> {
        let url_mark = UrlMarkConfig::from(&self.config);
        let spider = Arc::new(Spider::new(url_mark.request_timeout)?);

        let scheduler = TaskScheduler::new(store.clone(), SchedulerConfig::from(&self.config));
        let executor: Arc<dyn TaskExecutor> =
            Arc::new(url_mark_executor(store, spider, &url_mark));
        scheduler.register(executor);
        Ok(scheduler)
    }

    async fn open_scheduler(&self) -> Result<TaskScheduler> {
        let store = self.open_store().await?;
        self.scheduler(store)
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_serve(ctx: &CommandContext, pool_size: Option<usize>) -> Result<()> {
    let mut config = ctx.config.clone();
    if let Some(pool_size) = pool_size {
        config.scheduler.pool_size = u32::try_from(pool_size)?;
        validate_config(&config)?;
    }
    let ctx = CommandContext {
        config,
        db_path: ctx.db_path.clone(),
    };

    let scheduler = ctx.open_scheduler().await?;
    scheduler.start().await?;
    info!(db = %ctx.db_path.display(), "serving; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, waiting for running tasks");
    scheduler.stop().await;
    Ok(())
}

async fn cmd_submit(ctx: &CommandContext, url: &str, name: Option<&str>) -> Result<()> {
    let scheduler = ctx.open_scheduler().await?;
    let params = serde_json::to_value(UrlMarkArgs {
        url: url.to_string(),
    })?;
    let task = scheduler
        .submit(URL_MARK, &params, name.unwrap_or(url))
        .await?;

    println!("Submitted {}", task.tid);
    println!("  type:  {}", task.task_type);
    println!("  steps: {}", task.total_steps);
    Ok(())
}

async fn cmd_list(ctx: &CommandContext, query: &TaskQuery) -> Result<()> {
    let storage = ctx.open_readonly().await?;
    let page = storage.list_tasks(query).await?;

    if page.items.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<10}  {:<9}  {:>5}  {:>5}  NAME",
        "TID", "TYPE", "STATUS", "STEP", "RETRY"
    );
    for task in &page.items {
        println!(
            "{:<36}  {:<10}  {:<9}  {:>5}  {:>5}  {}",
            task.tid,
            task.task_type,
            task.status,
            format!("{}/{}", task.current_step, task.total_steps),
            task.retry_count,
            task.name
        );
    }
    println!();
    println!(
        "Page {} ({} of {} tasks)",
        query.page.max(1),
        page.items.len(),
        page.total
    );
    Ok(())
}

async fn cmd_show(ctx: &CommandContext, tid: &str, as_json: bool) -> Result<()> {
    let storage = ctx.open_readonly().await?;
    let task = storage.get_task(tid)
        .await?
        .ok_or_else(|| eyre!("task not found: {tid}"))?;
    let steps = storage.steps_by_task(tid).await?;

    if as_json {
        let detail = wise_shared::TaskDetail { task, steps };
        println!("{}", serde_json::to_string_pretty(&detail)?);
        return Ok(());
    }

    print_task(&task);
    println!();
    println!("  {:<3}  {:<8}  {:<9}  {:>8}  ERROR", "#", "STATE", "STATUS", "MS");
    for step in &steps {
        println!(
            "  {:<3}  {:<8}  {:<9}  {:>8}  {}",
            step.index, step.code, step.status, step.duration_ms, step.error
        );
    }
    Ok(())
}

fn print_task(task: &Task) {
    println!("Task {}", task.tid);
    println!("  name:    {}", task.name);
    println!("  type:    {}", task.task_type);
    println!("  status:  {}", task.status);
    println!(
        "  state:   {} (step {}/{})",
        task.current_state, task.current_step, task.total_steps
    );
    println!("  retries: {}", task.retry_count);
    println!("  created: {}", task.created_at.to_rfc3339());
    println!("  updated: {}", task.updated_at.to_rfc3339());
    if !task.error.is_empty() {
        println!("  error:   {}", task.error);
    }
}

async fn cmd_cancel(ctx: &CommandContext, tid: &str) -> Result<()> {
    ctx.open_scheduler().await?.cancel_task(tid).await?;
    println!("Cancelled {tid}");
    Ok(())
}

async fn cmd_retry(ctx: &CommandContext, tid: &str) -> Result<()> {
    ctx.open_scheduler().await?.retry_task(tid).await?;
    println!("Re-queued {tid}");
    Ok(())
}

async fn cmd_resume(ctx: &CommandContext, tid: &str) -> Result<()> {
    ctx.open_scheduler().await?.resume_task(tid).await?;
    println!("Resumed {tid}");
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(ctx: &CommandContext) -> Result<()> {
    let toml_str = toml::to_string_pretty(&ctx.config)?;
    println!("{toml_str}");
    println!("# database: {}", ctx.db_path.display());
    Ok(())
}
