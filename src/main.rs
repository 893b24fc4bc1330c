pub mod models {
    pub mod tado;
}

pub mod approval;
pub mod client;
pub mod config;
pub mod health;
pub mod notify;
pub mod services {
    pub mod auth;
    pub mod engine;
    pub mod presence;
    pub mod windows;
}

use crate::config::Config;
use crate::health::StatusCell;
use crate::services::engine;
use log::{error, info};
use std::path::Path;
use std::sync::Arc;

pub fn run() -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (token_file={}, check_interval={:.1}s, retry_interval={:.1}s, healthcheck_port={}, automated_approval={})",
        cfg.token_file.display(),
        cfg.check_interval.as_secs_f64(),
        cfg.retry_interval.as_secs_f64(),
        cfg.healthcheck_port,
        cfg.automation_configured()
    );

    // 2) Make sure the token file's directory exists before anything writes it
    if let Some(parent) = cfg.token_file.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("cannot create token directory {}: {}", parent.display(), e))?;
            info!("Created token directory {}", parent.display());
        }
    }

    // 3) Liveness responder on its own thread
    let status = StatusCell::shared();
    health::spawn(cfg.healthcheck_port, Arc::clone(&status));

    // 4) Reconciliation engine (never returns)
    engine::run(&cfg, status)
}

/// Load `.env` from the working directory into the process environment.
/// Values already present in the environment win.
fn load_dotenv() {
    use std::fs::File;
    use std::io::{BufRead, BufReader};

    let path = Path::new(".env");
    let Ok(file) = File::open(path) else { return };
    for line in BufReader::new(file).lines() {
        let Ok(line) = line else { break };
        if let Some((key, value)) = parse_env_assignment(&line) {
            if std::env::var_os(&key).is_none() {
                // Updating process-level environment variables is unsafe on
                // some targets.
                unsafe {
                    std::env::set_var(key, value);
                }
            }
        }
    }
}

/// `KEY=VALUE` with optional `export` prefix, quoting and `#` comments.
/// Malformed lines are ignored.
fn parse_env_assignment(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let rest = trimmed
        .strip_prefix("export ")
        .map(str::trim_start)
        .unwrap_or(trimmed);
    let (key, value) = rest.split_once('=')?;
    let key = key.trim();
    if key.is_empty() || key.chars().any(|c| c.is_whitespace()) {
        return None;
    }
    let value = value.trim();
    let value = if value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')))
    {
        &value[1..value.len() - 1]
    } else {
        value.split('#').next().unwrap_or_default().trim_end()
    };
    Some((key.to_string(), value.to_string()))
}

fn main() {
    // Init logging after the environment so RUST_LOG from .env is respected.
    load_dotenv();
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    info!(
        "tado-autoassist {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
