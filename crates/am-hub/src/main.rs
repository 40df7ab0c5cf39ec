use am_hub::{router, Args, HubConfig, HubState};
use am_storage::AssignmentStore;
use clap::Parser;
use std::fs::{File, OpenOptions};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = match HubConfig::load(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config_error: {err}");
            std::process::exit(2);
        }
    };
    init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    // Opening once up front applies migrations before any request arrives.
    if let Err(err) = AssignmentStore::open(&config.database) {
        error!(event = "store_open_failed", database = %config.database.display(), error = %err);
        return;
    }

    let state = match HubState::new(config.clone()) {
        Ok(state) => Arc::new(state),
        Err(err) => {
            error!(event = "invalid_config", error = %err);
            return;
        }
    };
    let app = router(state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %config.addr,
        database = %config.database.display(),
        cdc = config.enable_cdc
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "hub_error", error = %err);
    }
    info!(event = "hub_stop");
}

/// Events go to stdout, and also to `<log_dir>/am-hub-<database>.log` when a
/// log directory is configured, so hubs sharing a directory keep separate files.
fn init_logging(config: &HubConfig) {
    let level = match std::env::var("AM_LOG_LEVEL") {
        _ if config.debug => "debug".to_string(),
        Ok(level) if !level.trim().is_empty() => level,
        _ => "info".to_string(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let writer = match open_log_file(&config.log_dir, &config.database) {
        Ok(Some(file)) => BoxMakeWriter::new(io::stdout.and(Arc::new(file))),
        Ok(None) => BoxMakeWriter::new(io::stdout),
        Err(err) => {
            eprintln!("log_file_error: {err}");
            BoxMakeWriter::new(io::stdout)
        }
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn log_file_name(database: &Path) -> String {
    match database.file_stem().and_then(|stem| stem.to_str()) {
        Some(stem) if !stem.is_empty() => format!("am-hub-{stem}.log"),
        _ => "am-hub.log".to_string(),
    }
}

fn open_log_file(log_dir: &str, database: &Path) -> io::Result<Option<File>> {
    if log_dir.trim().is_empty() {
        return Ok(None);
    }
    let dir = Path::new(log_dir.trim());
    std::fs::create_dir_all(dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(log_file_name(database)))?;
    Ok(Some(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn log_file_is_named_after_the_database() {
        assert_eq!(log_file_name(Path::new("/data/assignments.db")), "am-hub-assignments.log");
        assert_eq!(log_file_name(Path::new("staging")), "am-hub-staging.log");
        assert_eq!(log_file_name(Path::new("")), "am-hub.log");
    }

    #[test]
    fn log_file_is_optional() {
        let dir = TempDir::new().expect("temp dir");
        assert!(open_log_file("  ", Path::new("am.db")).expect("no dir").is_none());

        let logs = dir.path().join("logs");
        let logs = logs.to_str().expect("utf-8 path");
        assert!(open_log_file(logs, Path::new("am.db")).expect("open").is_some());
        assert!(dir.path().join("logs").join("am-hub-am.log").exists());
    }
}
