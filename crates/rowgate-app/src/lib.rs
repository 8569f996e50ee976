#![forbid(unsafe_code)]

//! The Rowgate binary: CLI parsing, configuration loading and the run
//! loop around the API server.
//!
//! Exit codes: 0 on a clean check or normal shutdown, 1 on load or setup
//! failures, 2 when `--check` finds validation errors.

pub mod cli;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use clap::Parser;
use tracing::warn;

use rowgate_api::{RuntimeInterface, Server};
use rowgate_config::{load_config, ConfigFormat, ServerConfig};
use rowgate_telemetry::{init_logging, LogFormat, LoggingConfig};

use crate::cli::{Cli, LogType};

/// Parse arguments, run the requested mode and return the process exit
/// code.
pub async fn run() -> u8 {
    let cli = Cli::parse();

    if cli.version {
        println!("rowgate v{}", env!("CARGO_PKG_VERSION"));
        return 0;
    }

    let Some(path) = cli.config_file else {
        eprintln!("rowgate: a config file is required");
        return 1;
    };

    let format = if cli.yaml {
        ConfigFormat::Yaml
    } else {
        ConfigFormat::from_path(&path)
    };
    let config = match load_config(&path, format) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("rowgate: {err}");
            return 1;
        }
    };

    if cli.check {
        return check(&path, &config);
    }

    let logging = LoggingConfig {
        format: match cli.logtype {
            LogType::Text => LogFormat::Text,
            LogType::Json => LogFormat::Json,
        },
        ansi: !cli.no_color,
    };
    if let Err(err) = init_logging(&logging) {
        eprintln!("rowgate: {err}");
        return 1;
    }

    let mut server = match Server::new(config, memory_cache_runtime()) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("rowgate: failed to create server: {err}");
            return 1;
        }
    };
    if let Err(err) = server.start().await {
        eprintln!("rowgate: failed to start server: {err}");
        return 1;
    }

    if tokio::signal::ctrl_c().await.is_err() {
        warn!("failed to wait for interrupt signal; shutting down");
    }

    if let Err(err) = server.stop(Duration::from_secs(60)).await {
        eprintln!("rowgate: warning: failed to stop server: {err}");
    }

    0
}

fn check(path: &std::path::Path, config: &ServerConfig) -> u8 {
    let mut warnings = 0usize;
    let mut errors = 0usize;
    for finding in config.validate() {
        if finding.is_warning() {
            print!("warning: ");
            warnings += 1;
        } else {
            print!("error: ");
            errors += 1;
        }
        println!("{}", finding.message);
    }
    if warnings > 0 || errors > 0 {
        println!("\n{}: {errors} error(s), {warnings} warning(s)", path.display());
    }
    if errors > 0 {
        2
    } else {
        0
    }
}

// The binary's default runtime interface: an in-process cache, no metric
// sink, no extra script globals.
fn memory_cache_runtime() -> RuntimeInterface {
    let store: Arc<RwLock<HashMap<u64, Vec<u8>>>> = Arc::new(RwLock::new(HashMap::new()));
    let get_store = Arc::clone(&store);
    RuntimeInterface {
        cache_get: Some(Box::new(move |key| {
            get_store.read().ok()?.get(&key).cloned()
        })),
        cache_set: Some(Box::new(move |key, value| {
            if let Ok(mut map) = store.write() {
                match value {
                    Some(value) if !value.is_empty() => {
                        map.insert(key, value);
                    }
                    _ => {
                        map.remove(&key);
                    }
                }
            }
        })),
        ..RuntimeInterface::default()
    }
}
