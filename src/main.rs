use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use termsql::config::{self, Config};
use termsql::core::db::{ConnectionManager, DriverCatalog, DriverLoader, DriverRegistry};
use termsql::repl::{self, Session};
use termsql::results_grid::{render_error, Viewport};
use termsql::storage::{FileStore, ProfileStore};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

fn main() -> ExitCode {
    // Usage: termsql [config.toml]
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(config::default_config_path);

    let config = match config::load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", render_error(&e));
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config);
    info!("Starting termsql with config {}", config_path.display());

    let profiles = ProfileStore::new(FileStore::new(config.profiles_path()));
    let loader = DriverLoader::new(
        Arc::new(DriverRegistry::with_builtin()),
        Arc::new(DriverCatalog::builtin()),
    )
    .with_classpath(config.drivers.classpath.clone());
    let connections = Arc::new(ConnectionManager::new(loader));

    match Session::new(profiles, connections, Viewport::with_rows(config.row_limit())) {
        Ok(session) => {
            repl::run_repl(session);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to start worker: {}", e);
            eprintln!("{}", render_error(&e));
            ExitCode::FAILURE
        }
    }
}
