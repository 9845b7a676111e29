use clap::Parser;
use modelyard_cli::commands::{cli, project, serve};
use modelyard_core::api::{self as core_api, CliError};
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

static LOG_GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
    std::sync::OnceLock::new();

#[tokio::main]
async fn main() {
    let exit = match real_main().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e}");
            exit_code_for_error(&e)
        }
    };

    std::process::exit(exit);
}

async fn real_main() -> Result<i32, CliError> {
    let args = cli::Args::parse();
    let project_dir = args.command.project_dir().clone();
    let cfg = core_api::load_for_project(Some(&project_dir))
        .map_err(|e| CliError::Config(format!("{e:#}")))?;
    init_tracing(&cfg.logging, &project_dir).map_err(CliError::Config)?;

    match args.command {
        cli::Commands::Init(a) => project::handle_init(a, cfg).await?,
        cli::Commands::ImportTable(a) => project::handle_import_table(a, cfg).await?,
        cli::Commands::DropTable(a) => project::handle_drop_table(a, cfg).await?,
        cli::Commands::Serve(a) => serve::handle_serve(a, cfg).await?,
    }
    Ok(0)
}

fn exit_code_for_error(e: &CliError) -> i32 {
    // 0: success
    // 11: config error
    // 20: IO error (project files, database, network)
    // 30: action rejected or failed
    // 50: internal/uncategorized
    match e {
        CliError::Config(_) => 11,
        CliError::Io(_) | CliError::Engine(_) | CliError::Command(_) => 20,
        CliError::Sync(core_api::SyncError::Action(_)) => 30,
        CliError::Sync(core_api::SyncError::Snapshot(_)) => 50,
        CliError::Sync(_) => 20,
        CliError::Action(_) | CliError::ActionFailed { .. } => 30,
        CliError::Anyhow(_) => 50,
    }
}

fn init_tracing(logging: &core_api::LoggingConfig, project_dir: &Path) -> Result<(), String> {
    if !logging.enabled {
        return Ok(());
    }

    let filter = match std::env::var("RUST_LOG") {
        Ok(v) if !v.trim().is_empty() => EnvFilter::from_default_env(),
        _ => EnvFilter::try_new(logging.level.clone()).map_err(|e| e.to_string())?,
    };

    let mut maybe_writer = None;

    if logging.file {
        let dir = match logging
            .directory
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            Some(d) => PathBuf::from(d),
            None => project_dir.join("logs"),
        };

        std::fs::create_dir_all(&dir).map_err(|e| format!("create log dir failed: {e}"))?;
        let appender = tracing_appender::rolling::daily(dir, "modelyard.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        let _ = LOG_GUARD.set(guard);
        maybe_writer = Some(non_blocking);
    }

    if !logging.console && maybe_writer.is_none() {
        return Err("logging disabled for both console and file".to_string());
    }

    let console_layer = logging.console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(atty::is(atty::Stream::Stderr))
    });

    let file_layer = maybe_writer.map(|w| {
        tracing_subscriber::fmt::layer()
            .with_writer(w)
            .with_ansi(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(())
}
