//! probectl - command-line client for the probe browser-testing platform.
//!
//! Starts remote test runs and follows them until they settle.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod bundle;
mod client;
mod fatal;
mod interrupt;
mod launcher;
mod poller;
mod render;
mod session;
mod summary;
#[cfg(test)]
mod test_support;

use bundle::{BundleError, SourceBundle};
use clap::{Args, Parser, Subcommand};
use client::{ApiContext, Client, ClientError, RunBackend, StartRunRequest};
use fatal::{ExitCode, FatalError};
use launcher::LaunchPlan;
use probe_core::config::ConfigError;
use probe_core::types::{normalize_script_path, RunId, RunStatus, StepRecord};
use probe_core::Config;
use render::{ConsoleSink, OutputFormat, OutputSink, StepReporter, Tone};
use session::{SessionLimits, TestRunSession};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use summary::{FatalReport, SessionResult};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// CLI client for the probe browser-testing platform.
#[derive(Parser)]
#[command(name = "probectl")]
#[command(about = "Run remote browser tests and follow their results")]
#[command(version)]
struct Cli {
    /// API base URL (default: https://api.probe.dev)
    #[arg(long, global = true, env = "PROBE_API_URL")]
    api_url: Option<String>,

    /// API token
    #[arg(long, global = true, env = "PROBE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Act on behalf of another account (administrators only)
    #[arg(long, global = true, env = "PROBE_ACCOUNT")]
    account: Option<String>,

    /// Config file path (overrides .probe/config)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, short, global = true, value_enum)]
    output: Option<OutputFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a test run and follow it until it settles
    Run(RunArgs),

    /// Show the steps and status of a test run
    Result {
        /// Test run ID
        run_id: String,
    },

    /// Print the steps of a saved JSON result again
    Replay {
        /// JSON file written by `run --output json`
        file: PathBuf,
    },

    /// Stop a running test run
    Stop {
        /// Test run ID
        run_id: String,
    },

    /// Show test slot usage of a project
    Concurrency {
        /// Project ID or name
        project: String,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Project ID or name
    project: String,

    /// Script path relative to the project root
    script: String,

    /// Browser to run the test in
    #[arg(long)]
    browser: Option<String>,

    /// Viewport width in pixels
    #[arg(long)]
    width: Option<u32>,

    /// Viewport height in pixels
    #[arg(long)]
    height: Option<u32>,

    /// Region the browser runs in
    #[arg(long)]
    region: Option<String>,

    /// Dataset name to run the test with
    #[arg(long, conflicts_with_all = ["data", "secrets"])]
    dataset: Option<String>,

    /// Inline JSON test data, or @path to a JSON file
    #[arg(long)]
    data: Option<String>,

    /// Inline JSON secrets, or @path to a JSON file
    #[arg(long)]
    secrets: Option<String>,

    /// Upload test code from this local directory instead of using project files
    #[arg(long)]
    code_dir: Option<PathBuf>,

    /// Minutes to keep trying to start the run
    #[arg(long)]
    start_timeout: Option<u64>,

    /// Fail instead of relaunching when the platform reports a system error
    #[arg(long)]
    disable_system_error_retry: bool,

    /// User agent of the browser running the test
    #[arg(long)]
    user_agent: Option<String>,
}

#[derive(Debug, thiserror::Error)]
enum CommandError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    Fatal(#[from] FatalError),
    #[error("{0}")]
    Input(String),
}

impl CommandError {
    fn exit_code(&self) -> ExitCode {
        match self {
            Self::Fatal(err) => err.code,
            _ => ExitCode::Generic,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_env("PROBE_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(ExitCode::Generic.code());
        }
    };

    let format = cli.output.unwrap_or_else(|| {
        OutputFormat::parse(&config.output).unwrap_or_else(|| {
            warn!(output = %config.output, "unknown output format in config, using text");
            OutputFormat::Text
        })
    });
    let sink: Arc<dyn OutputSink> = Arc::new(ConsoleSink::new(format));
    let client = Arc::new(Client::new(ApiContext::new(
        &config.api_url,
        config.token.as_deref(),
        config.account.as_deref(),
    )));

    let result = match cli.command {
        Command::Run(args) => run_test(client, sink, &config, args).await,
        Command::Result { run_id } => show_result(&client, sink, &run_id).await,
        Command::Replay { file } => replay_result(sink, &file),
        Command::Stop { run_id } => stop_run(&client, sink.as_ref(), &run_id).await,
        Command::Concurrency { project } => show_concurrency(&client, sink.as_ref(), &project).await,
    };

    match result {
        Ok(code) => std::process::exit(code.code()),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(e.exit_code().code());
        }
    }
}

/// Config files first, then global flags and their env vars.
fn load_config(cli: &Cli) -> Result<Config, CommandError> {
    let cwd = std::env::current_dir().map_err(|e| CommandError::Input(e.to_string()))?;
    let mut config = Config::load(&cwd, cli.config.as_deref())?;
    if let Some(api_url) = &cli.api_url {
        config.api_url.clone_from(api_url);
    }
    if cli.token.is_some() {
        config.token.clone_from(&cli.token);
    }
    if cli.account.is_some() {
        config.account.clone_from(&cli.account);
    }
    Ok(config)
}

/// Inline JSON, or the content of a JSON file when prefixed with `@`.
fn parse_json_arg(flag: &str, raw: &str) -> Result<serde_json::Value, CommandError> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| CommandError::Input(format!("{flag}: cannot read {path}: {e}")))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).map_err(|e| CommandError::Input(format!("{flag}: invalid JSON: {e}")))
}

async fn build_bundle(code_dir: Option<PathBuf>) -> Result<Option<SourceBundle>, CommandError> {
    let Some(dir) = code_dir else {
        return Ok(None);
    };
    let bundle = tokio::task::spawn_blocking(move || SourceBundle::from_dir(&dir))
        .await
        .map_err(|e| CommandError::Input(format!("bundling test code failed: {e}")))??;
    if bundle.is_empty() {
        return Err(CommandError::Input(format!(
            "test code directory {} contains no files",
            bundle.root().display()
        )));
    }
    info!(
        root = %bundle.root().display(),
        files = bundle.files().len(),
        "bundled local test code"
    );
    Ok(Some(bundle))
}

/// Ctrl-C listener registered once for the whole session, so presses that
/// arrive while the first one is being handled are buffered, not lost.
#[derive(Debug)]
struct Interrupts {
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
}

impl Interrupts {
    fn register() -> Result<Self, CommandError> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let sigint = signal(SignalKind::interrupt())
                .map_err(|e| CommandError::Input(format!("cannot listen for Ctrl-C: {e}")))?;
            Ok(Self { sigint })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Next Ctrl-C. Never resolves if the listener is gone.
    async fn recv(&mut self) {
        #[cfg(unix)]
        let received = self.sigint.recv().await.is_some();
        #[cfg(not(unix))]
        let received = tokio::signal::ctrl_c().await.is_ok();
        if !received {
            std::future::pending::<()>().await;
        }
    }
}

async fn run_test(
    client: Arc<Client>,
    sink: Arc<dyn OutputSink>,
    config: &Config,
    args: RunArgs,
) -> Result<ExitCode, CommandError> {
    let data = args
        .data
        .as_deref()
        .map(|raw| parse_json_arg("--data", raw))
        .transpose()?;
    let secrets = args
        .secrets
        .as_deref()
        .map(|raw| parse_json_arg("--secrets", raw))
        .transpose()?;

    // Zip the local code while the project is looked up.
    let (bundle, project) = futures::future::try_join(build_bundle(args.code_dir.clone()), async {
        client
            .find_project(&args.project)
            .await
            .map_err(CommandError::from)
    })
    .await?;
    info!(
        project_id = %project.id,
        project = %project.name,
        space = %project.space_name,
        "resolved project"
    );

    let dataset_id = match &args.dataset {
        Some(name) => Some(
            client
                .resolve_dataset_id(&project.id, name)
                .await?
                .ok_or_else(|| ClientError::DatasetNotFound(name.clone()))?,
        ),
        None => None,
    };
    // A dataset replaces inline data.
    let (data, secrets) = if dataset_id.is_some() {
        (None, None)
    } else {
        (data, secrets)
    };

    let request = StartRunRequest {
        script: normalize_script_path(&args.script),
        browser: args.browser.unwrap_or_else(|| config.browser.clone()),
        width: args.width.unwrap_or(config.width),
        height: args.height.unwrap_or(config.height),
        region: args.region.unwrap_or_else(|| config.region.clone()),
        user_agent: args.user_agent.or_else(|| config.user_agent.clone()),
        dataset_id,
        data,
        secrets,
        bundle_sha256: bundle.as_ref().map(|b| b.sha256().to_string()),
    };

    let mut limits = SessionLimits::from_config(config);
    if let Some(minutes) = args.start_timeout {
        limits.start_timeout = session::minutes(minutes);
    }
    if args.disable_system_error_retry {
        limits.disable_system_error_retry = true;
    }

    sink.notice(
        Tone::Info,
        &format!(
            "Running {} in project {} ({}) on {} {}x{}",
            request.script,
            project.name,
            project.space_name,
            request.browser,
            request.width,
            request.height
        ),
    );

    let backend: Arc<dyn RunBackend> = client;
    let mut session = TestRunSession::new(
        Arc::clone(&backend),
        Arc::clone(&sink),
        LaunchPlan {
            project_id: project.id.clone(),
            request,
            bundle,
        },
        limits,
    );
    let tracker = session.tracker();
    let mut interrupts = Interrupts::register()?;

    let finished = tokio::select! {
        result = session.run() => Some(result),
        () = interrupts.recv() => None,
    };
    let outcome = match finished {
        Some(result) => result,
        None => Err(interrupt::handle_interrupt(
            backend.as_ref(),
            &tracker,
            sink.as_ref(),
            interrupts.recv(),
        )
        .await),
    };

    match outcome {
        Ok(outcome) => Ok(SessionResult::from_outcome(&outcome, &config.api_url).emit(sink.as_ref())),
        Err(fatal) => {
            debug!(
                launch_attempts = session.launch_attempts(),
                launches = session.launches(),
                system_errors = session.system_errors(),
                backoffs = session.backoffs(),
                "session ended on a fatal condition"
            );
            FatalReport::new(&fatal, session.steps()).emit(sink.as_ref());
            Err(fatal.into())
        }
    }
}

async fn show_result(
    client: &Client,
    sink: Arc<dyn OutputSink>,
    run_id: &str,
) -> Result<ExitCode, CommandError> {
    let run_id = RunId::new(run_id);
    let result = client
        .run_result(&run_id)
        .await?
        .ok_or_else(|| ClientError::NotFound(format!("no result for test run {run_id} yet")))?;

    let mut reporter = StepReporter::new(Arc::clone(&sink));
    for step in &result.steps {
        reporter.report(step);
    }

    let status = RunStatus::parse(&result.status);
    sink.notice(
        Tone::Info,
        &format!(
            "Test run {run_id}: {} ({} steps)",
            result.status.to_uppercase(),
            reporter.count()
        ),
    );
    sink.emit_json(&serde_json::json!({
        "testRunId": run_id,
        "status": result.status,
        "steps": reporter.records(),
    }));

    Ok(match status {
        Some(RunStatus::Success) => ExitCode::Success,
        Some(s) if s.is_pending() => ExitCode::Success,
        _ => ExitCode::TestFailed,
    })
}

/// Saved result document; only the steps are needed to replay it.
#[derive(serde::Deserialize)]
struct SavedResult {
    #[serde(default)]
    status: Option<String>,
    steps: Vec<StepRecord>,
}

fn replay_result(sink: Arc<dyn OutputSink>, file: &Path) -> Result<ExitCode, CommandError> {
    let content = std::fs::read_to_string(file)
        .map_err(|e| CommandError::Input(format!("cannot read {}: {e}", file.display())))?;
    let saved: SavedResult = serde_json::from_str(&content)
        .map_err(|e| CommandError::Input(format!("{}: not a result document: {e}", file.display())))?;

    let mut reporter = StepReporter::new(Arc::clone(&sink));
    for record in &saved.steps {
        reporter.replay(record);
    }
    if let Some(status) = &saved.status {
        sink.notice(
            Tone::Info,
            &format!("{}: {} ({} steps)", file.display(), status.to_uppercase(), reporter.count()),
        );
    }
    Ok(ExitCode::Success)
}

async fn stop_run(
    client: &Client,
    sink: &dyn OutputSink,
    run_id: &str,
) -> Result<ExitCode, CommandError> {
    let run_id = RunId::new(run_id);
    client.stop_run(&run_id).await?;
    sink.notice(Tone::Info, &format!("Test run {run_id} stopped"));
    sink.emit_json(&serde_json::json!({ "testRunId": run_id, "stopped": true }));
    Ok(ExitCode::Success)
}

async fn show_concurrency(
    client: &Client,
    sink: &dyn OutputSink,
    project: &str,
) -> Result<ExitCode, CommandError> {
    let project = client.find_project(project).await?;
    let slots = client.concurrency(&project.id).await?;
    sink.notice(
        Tone::Info,
        &format!(
            "{} ({}): {} running, {} available, {} total",
            project.name, project.id, slots.running, slots.available, slots.total
        ),
    );
    sink.emit_json(&serde_json::json!({
        "projectId": project.id,
        "running": slots.running,
        "available": slots.available,
        "total": slots.total,
    }));
    Ok(ExitCode::Success)
}
