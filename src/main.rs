//! Driftless CLI entrypoint.
//!
//! This is the main entrypoint for the driftless command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use driftless::cli::{Cli, Commands, OutputFormat, OutputFormatter, StateCommands};
use driftless::config::{
    find_config_file, ConfigParser, ConfigValidator, DriftlessConfig, StateBackend,
};
use driftless::error::{ConfigError, DriftlessError, Result};
use driftless::provider::{GatewayClient, ProviderRegistry};
use driftless::reconciler::{build_graph, Reconciler, RunOutcome};
use driftless::state::{LocalStateStore, S3StateStore, StateStore, STATE_DIR};

use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code for errors raised before execution.
const ERROR_EXIT: u8 = 1;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_format);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::from(ERROR_EXIT);
        }
    };

    let formatter = OutputFormatter::new(cli.output);
    match runtime.block_on(run(cli, &formatter)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}", formatter.error(&e.to_string()));
            ExitCode::from(ERROR_EXIT)
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool, format: OutputFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        OutputFormat::Json => builder.json().init(),
        OutputFormat::Text => builder.init(),
    }
}

/// Main async entry point. Returns the process exit code.
async fn run(cli: Cli, formatter: &OutputFormatter) -> Result<u8> {
    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force).map(|()| 0),
        Commands::Validate { warnings } => cmd_validate(cli.config.as_ref(), warnings, formatter),
        Commands::Plan { detailed } => cmd_plan(cli.config.as_ref(), detailed, formatter).await,
        Commands::Apply { yes } => cmd_apply(cli.config.as_ref(), yes, formatter).await,
        Commands::Drift => cmd_drift(cli.config.as_ref(), formatter).await,
        Commands::Destroy { yes } => cmd_destroy(cli.config.as_ref(), yes, formatter).await,
        Commands::State { command } => {
            cmd_state(cli.config.as_ref(), command, formatter).await.map(|()| 0)
        }
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new driftless project in: {}", path.display());

    let config_path = path.join("driftless.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    // Check if files exist
    if !force && config_path.exists() {
        eprintln!("Declaration already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/driftless.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(".env") || !existing.contains(&state_entry) {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# driftless")?;
            if !existing.contains(".env") {
                writeln!(file, ".env")?;
            }
            if !existing.contains(&state_entry) {
                writeln!(file, "{state_entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Copy .env.example to .env and set DRIFTLESS_PROVIDER_TOKEN");
    eprintln!("  2. Replace the placeholder images in driftless.yaml");
    eprintln!("  3. Run 'driftless validate' to check the declaration");
    eprintln!("  4. Run 'driftless plan' to see what will change");
    eprintln!("  5. Run 'driftless apply' to reconcile");

    Ok(())
}

/// Validate the declaration.
fn cmd_validate(config_path: Option<&PathBuf>, show_warnings: bool, formatter: &OutputFormatter) -> Result<u8> {
    let (config, _) = load_config(config_path)?;
    let result = ConfigValidator::new().check(&config);

    emit(&formatter.format_validation(&config.unit(), &result, show_warnings));
    if !result.is_valid() {
        return Ok(ERROR_EXIT);
    }

    // No request is sent; the registry only answers kind and output questions.
    let endpoint = config.provider.endpoint.as_deref().unwrap_or("http://localhost");
    let client = Arc::new(GatewayClient::new(endpoint, "")?);
    let registry = ProviderRegistry::from_config(&client, &config.provider);
    let graph = build_graph(&config, &registry)?;
    if !formatter.is_json() {
        eprintln!("Build order: {}", graph.order_ids().join(" -> "));
    }
    Ok(0)
}

/// Show the change set.
async fn cmd_plan(config_path: Option<&PathBuf>, detailed: bool, formatter: &OutputFormatter) -> Result<u8> {
    let (config, config_file) = load_validated_config(config_path)?;
    let store = create_state_store(&config, &config_file).await?;
    let registry = create_registry(&config)?;

    let plan = Reconciler::new(&config, store, registry).plan().await?;
    emit(&formatter.format_plan(&plan, detailed));
    Ok(0)
}

/// Reconcile towards the declaration.
async fn cmd_apply(config_path: Option<&PathBuf>, auto_approve: bool, formatter: &OutputFormatter) -> Result<u8> {
    let (config, config_file) = load_validated_config(config_path)?;
    let store = create_state_store(&config, &config_file).await?;
    let registry = create_registry(&config)?;
    let reconciler = Reconciler::new(&config, store, registry);

    let plan = reconciler.plan().await?;
    if plan.is_empty() {
        emit(&formatter.format_plan(&plan, false));
        return Ok(0);
    }

    if !auto_approve {
        eprintln!("{}", formatter.format_plan(&plan, true));
        if !confirm("Do you want to apply this change set? [y/N]: ", "y")? {
            eprintln!("Apply cancelled.");
            return Ok(0);
        }
    }

    let outcome = reconciler.with_cancellation(cancel_on_ctrl_c()).apply().await?;
    Ok(finish(&outcome, formatter))
}

/// Delete every recorded resource.
async fn cmd_destroy(config_path: Option<&PathBuf>, auto_approve: bool, formatter: &OutputFormatter) -> Result<u8> {
    let (config, config_file) = load_config(config_path)?;
    let store = create_state_store(&config, &config_file).await?;
    let registry = create_registry(&config)?;

    let Some(state) = store.load().await? else {
        eprintln!("No state found for {}; nothing to destroy.", config.unit());
        return Ok(0);
    };
    if state.is_empty() {
        eprintln!("No resources recorded for {}.", config.unit());
        return Ok(0);
    }

    eprintln!("The following resources will be destroyed:");
    for record in state.records.values() {
        eprintln!("  - {} {} ({})", record.kind, record.id, record.physical_id);
    }

    if !auto_approve && !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")? {
        eprintln!("Destruction cancelled.");
        return Ok(0);
    }

    let outcome = Reconciler::new(&config, store, registry)
        .with_cancellation(cancel_on_ctrl_c())
        .destroy()
        .await?;
    Ok(finish(&outcome, formatter))
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<u8> {
    let (config, config_file) = load_config(config_path)?;
    let store = create_state_store(&config, &config_file).await?;
    let registry = create_registry(&config)?;

    let report = Reconciler::new(&config, store, registry).check_drift().await?;
    emit(&formatter.format_drift(&report));
    Ok(0)
}

/// State management commands.
async fn cmd_state(config_path: Option<&PathBuf>, command: StateCommands, formatter: &OutputFormatter) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    let store = create_state_store(&config, &config_file).await?;

    match command {
        StateCommands::Show => {
            if let Some(state) = store.load().await? {
                emit(&formatter.format_state(&state));
                let lock = store.get_lock_info().await?;
                if let Some(lock) = lock.filter(|_| !formatter.is_json()) {
                    eprintln!(
                        "Locked by {} for {} since {} ({}s left)",
                        lock.holder,
                        lock.operation,
                        lock.acquired_at.format("%Y-%m-%d %H:%M:%S"),
                        lock.remaining_secs()
                    );
                }
            } else {
                eprintln!("No state found for {} ({}).", config.unit(), store.location());
            }
        }
        StateCommands::Lock { holder } => {
            let lock = store.acquire_lock(holder.as_deref().unwrap_or(""), "manual").await?;
            emit(&formatter.success(&format!("State locked: {} (held by {})", lock.lock_id, lock.holder)));
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                store.force_unlock().await?;
                emit(&formatter.success("State forcefully unlocked."));
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                emit(&formatter.success("State unlocked."));
            } else {
                eprintln!("{}", formatter.warning("Please provide --lock-id or use --force"));
            }
        }
        StateCommands::Rm { id } => {
            let registry = ProviderRegistry::new();
            let record = Reconciler::new(&config, store, registry).forget(&id).await?;
            emit(&formatter.success(&format!(
                "Removed '{id}' from state; {} {} was left in place.",
                record.kind, record.physical_id
            )));
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Writes command output to stdout.
fn emit(output: &str) {
    let mut stdout = std::io::stdout().lock();
    if let Err(e) = writeln!(stdout, "{output}") {
        warn!("Failed to write output: {e}");
    }
}

/// Prints the run report and maps its status to an exit code.
fn finish(outcome: &RunOutcome, formatter: &OutputFormatter) -> u8 {
    emit(&formatter.format_report(&outcome.report));
    u8::try_from(outcome.exit_code()).unwrap_or(ERROR_EXIT)
}

/// Asks for confirmation on stderr.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Flips a watch channel on the first Ctrl-C.
fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; letting in-flight operations finish");
            let _ = tx.send(true);
        }
    });
    rx
}

/// Resolves the declaration path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Loads the declaration with `.env` and environment overrides applied.
fn load_config(config_path: Option<&PathBuf>) -> Result<(DriftlessConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading declaration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(base_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;
    Ok((config, config_file))
}

/// Loads and validates the declaration, logging warnings.
fn load_validated_config(config_path: Option<&PathBuf>) -> Result<(DriftlessConfig, PathBuf)> {
    let (config, config_file) = load_config(config_path)?;
    let result = ConfigValidator::new().validate(&config)?;
    for warning in &result.warnings {
        warn!("{warning}");
    }
    Ok((config, config_file))
}

fn base_dir(config_file: &Path) -> PathBuf {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf()
}

/// Creates the state store the declaration selects.
async fn create_state_store(config: &DriftlessConfig, config_file: &Path) -> Result<Arc<dyn StateStore>> {
    let unit = config.unit();
    let store: Arc<dyn StateStore> = match config.state.backend {
        StateBackend::Local => {
            let root = config
                .state
                .path
                .as_ref()
                .map_or_else(|| base_dir(config_file).join(STATE_DIR), PathBuf::from);
            Arc::new(LocalStateStore::new(root, &unit))
        }
        StateBackend::S3 => {
            let bucket = config.state.bucket.as_deref().ok_or_else(|| {
                DriftlessError::Config(ConfigError::ValidationError {
                    message: String::from("S3 bucket not configured"),
                    field: Some(String::from("state.bucket")),
                })
            })?;
            Arc::new(
                S3StateStore::new(
                    bucket,
                    config.state.prefix.as_deref(),
                    config.state.region.as_deref(),
                    config.state.endpoint.as_deref(),
                    &unit,
                )
                .await?,
            )
        }
    };
    debug!("Using {} state at {}", store.backend_type(), store.location());
    Ok(store)
}

/// Creates the adapter registry for the provider gateway.
fn create_registry(config: &DriftlessConfig) -> Result<ProviderRegistry> {
    let endpoint = config.provider.endpoint.as_deref().ok_or_else(|| {
        DriftlessError::Config(ConfigError::ValidationError {
            message: String::from("No provider endpoint configured"),
            field: Some(String::from("provider.endpoint")),
        })
    })?;
    let token = ConfigParser::provider_token(config)?;
    let client = Arc::new(GatewayClient::with_timeout(endpoint, &token, config.provider.timeout_secs)?);
    Ok(ProviderRegistry::from_config(&client, &config.provider))
}
