//! Minimal runtime configuration helpers.
//! Everything is environment-sourced; only the token file path is required.

use log::warn;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CHECK_INTERVAL_SECS: f64 = 10.0;
pub const DEFAULT_RETRY_INTERVAL_SECS: f64 = 30.0;
pub const DEFAULT_HEALTHCHECK_PORT: u16 = 8080;
pub const DEFAULT_WEBDRIVER_URL: &str = "http://localhost:4444";

#[derive(Debug, Clone)]
pub struct Config {
    /// Refresh-token file; its parent directory is created at startup.
    pub token_file: PathBuf,
    /// Steady-state reconciliation cadence.
    pub check_interval: Duration,
    /// Delay after errors and between authorization retries.
    pub retry_interval: Duration,
    /// Port for the liveness responder.
    pub healthcheck_port: u16,
    /// Account credentials for automated device-approval; both must be set
    /// for automation to run, otherwise manual approval is the only path.
    pub username: Option<String>,
    pub password: Option<String>,
    /// WebDriver endpoint used by the approval automation.
    pub webdriver_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let token_file = match std::env::var("TADO_TOKEN_FILE") {
            Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
            _ => {
                return Err("TADO_TOKEN_FILE must be set to the refresh-token file path".to_string());
            }
        };

        let check_interval = interval_from_env("TADO_CHECK_INTERVAL", DEFAULT_CHECK_INTERVAL_SECS);
        let retry_interval = interval_from_env("TADO_RETRY_INTERVAL", DEFAULT_RETRY_INTERVAL_SECS);

        let healthcheck_port = match std::env::var("TADO_HEALTHCHECK_PORT") {
            Err(_) => DEFAULT_HEALTHCHECK_PORT,
            Ok(s) => match s.trim().parse::<u16>() {
                Ok(p) => p,
                Err(_) => {
                    warn!(
                        "TADO_HEALTHCHECK_PORT is not a valid port ({:?}); using default {}",
                        s, DEFAULT_HEALTHCHECK_PORT
                    );
                    DEFAULT_HEALTHCHECK_PORT
                }
            },
        };

        let username = nonempty_env("TADO_USERNAME");
        let password = nonempty_env("TADO_PASSWORD");
        let webdriver_url =
            nonempty_env("TADO_WEBDRIVER_URL").unwrap_or_else(|| DEFAULT_WEBDRIVER_URL.to_string());

        Ok(Config {
            token_file,
            check_interval,
            retry_interval,
            healthcheck_port,
            username,
            password,
            webdriver_url,
        })
    }

    pub fn automation_configured(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}

fn nonempty_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn interval_from_env(var: &str, default_secs: f64) -> Duration {
    parse_interval(std::env::var(var).ok().as_deref(), var, default_secs)
}

/// Seconds as a float, strictly positive. Anything else falls back to the
/// default with a warning; interval misconfiguration is never fatal.
fn parse_interval(raw: Option<&str>, var: &str, default_secs: f64) -> Duration {
    match raw {
        None => Duration::from_secs_f64(default_secs),
        Some(s) => match s.trim().parse::<f64>() {
            Ok(v) if v > 0.0 && v.is_finite() => Duration::from_secs_f64(v),
            _ => {
                warn!(
                    "{} is invalid ({:?}); using default {}s",
                    var, s, default_secs
                );
                Duration::from_secs_f64(default_secs)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_parses_float_seconds() {
        assert_eq!(
            parse_interval(Some("2.5"), "TADO_CHECK_INTERVAL", 10.0),
            Duration::from_millis(2500)
        );
    }

    #[test]
    fn interval_falls_back_on_garbage() {
        for raw in ["abc", "", "-3", "0", "NaN", "inf"] {
            assert_eq!(
                parse_interval(Some(raw), "TADO_CHECK_INTERVAL", 10.0),
                Duration::from_secs(10),
                "raw {:?} should fall back",
                raw
            );
        }
    }

    #[test]
    fn interval_defaults_when_unset() {
        assert_eq!(
            parse_interval(None, "TADO_RETRY_INTERVAL", 30.0),
            Duration::from_secs(30)
        );
    }
}
