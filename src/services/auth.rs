//! Session establishment: drive the device-code authorization until the
//! account is usable, retrying indefinitely.
//!
//! Retry-forever is an explicit loop with a sleep, one initialization
//! attempt per iteration. There is no higher authority to escalate to;
//! failure visibility is the health endpoint and the log.

use log::{info, warn};
use std::thread;

use crate::approval::BrowserApproval;
use crate::client::{ActivationStatus, TadoApiError, TadoClient};
use crate::config::Config;
use crate::health::{SessionStatus, StatusCell};
use crate::models::tado::HomeId;
use crate::notify::Notifier;

/// A fully activated session, bound to the account's home.
pub struct Session {
    pub client: TadoClient,
    pub home_id: HomeId,
}

/// Result of one initialization attempt.
pub enum InitOutcome {
    Ready(Session),
    Retry(String),
}

/// Block until a ready session exists. Never returns a session that is not
/// activated; this is the engine's only way to acquire one.
pub fn obtain_ready_session(
    cfg: &Config,
    notifier: &mut Notifier,
    status: &StatusCell,
    approval: Option<&BrowserApproval>,
) -> Session {
    loop {
        let connect = || TadoClient::new(cfg.token_file.clone());
        match try_initialize(cfg, notifier, status, approval, connect) {
            InitOutcome::Ready(session) => {
                status.set(SessionStatus::Completed);
                return session;
            }
            InitOutcome::Retry(reason) => {
                notifier.announce(&format!(
                    "{} Retrying in {:.0}s.",
                    reason,
                    cfg.retry_interval.as_secs_f64()
                ));
                thread::sleep(cfg.retry_interval);
            }
        }
    }
}

/// One initialization attempt: construct a client (which reuses a persisted
/// token or starts a device authorization), walk the pending approval if
/// needed, and bind the account's home.
pub fn try_initialize(
    cfg: &Config,
    notifier: &mut Notifier,
    status: &StatusCell,
    approval: Option<&BrowserApproval>,
    connect: impl FnOnce() -> Result<TadoClient, TadoApiError>,
) -> InitOutcome {
    let client = match connect() {
        Ok(c) => c,
        Err(e) if e.is_credentials() => {
            status.set(SessionStatus::Failed);
            discard_stale_token(cfg);
            return InitOutcome::Retry(format!("Authorization rejected ({}).", e));
        }
        Err(e) => {
            return InitOutcome::Retry(format!("Could not reach the Tado auth service ({}).", e));
        }
    };

    match client.activation_status() {
        ActivationStatus::Completed => {
            notifier.announce("Tado connection established (persisted token accepted).");
            bind_home(client, notifier, status)
        }
        ActivationStatus::Pending => {
            status.set(SessionStatus::Pending);
            let url = client
                .verification_url()
                .unwrap_or_else(|| "<unknown>".to_string());
            let code = client.user_code().unwrap_or_else(|| "<unknown>".to_string());
            // Deliberately not de-duplicated: an operator reading the log at
            // any point during a long pending phase must see current
            // instructions.
            info!("Device authorization pending. Open {} and confirm code {}", url, code);

            if let Some(automation) = approval {
                if automation.attempt(&url, &code) {
                    info!("Automated approval submitted; waiting for the API to confirm.");
                } else {
                    notifier
                        .announce("Automated approval failed; manual approval is still possible.");
                }
            }

            match client.device_activation() {
                Ok(true) => match client.activation_status() {
                    ActivationStatus::Completed => {
                        notifier.announce("Device authorization confirmed.");
                        bind_home(client, notifier, status)
                    }
                    other => InitOutcome::Retry(format!(
                        "Activation reported success but the session is {:?}.",
                        other
                    )),
                },
                Ok(false) => InitOutcome::Retry(
                    "Device authorization did not complete (code expired or denied).".to_string(),
                ),
                Err(e) if e.is_credentials() => {
                    status.set(SessionStatus::Failed);
                    discard_stale_token(cfg);
                    InitOutcome::Retry(format!("Authorization rejected ({}).", e))
                }
                Err(e) => InitOutcome::Retry(format!("Device activation failed ({}).", e)),
            }
        }
        ActivationStatus::NotStarted => {
            InitOutcome::Retry("Authorization did not start.".to_string())
        }
    }
}

/// Resolve the account's home. Runs on the freshly activated client; a
/// credentials failure here invalidates the session like any other.
fn bind_home(client: TadoClient, notifier: &mut Notifier, status: &StatusCell) -> InitOutcome {
    match discover_home(&client) {
        Ok(home_id) => {
            notifier.announce(&format!("Operating on home {}.", home_id.0));
            InitOutcome::Ready(Session { client, home_id })
        }
        Err(e) if e.is_credentials() => {
            status.set(SessionStatus::Failed);
            InitOutcome::Retry(format!("Authorization rejected during home discovery ({}).", e))
        }
        Err(e) => InitOutcome::Retry(format!("Home discovery failed ({}).", e)),
    }
}

fn discover_home(client: &TadoClient) -> Result<HomeId, TadoApiError> {
    let me = client.get_me()?;
    let mut ids: Vec<HomeId> = me
        .homes
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .filter_map(|h| h.id)
        .collect();
    ids.sort_unstable_by_key(|id| id.0);
    ids.dedup();
    if ids.len() > 1 {
        warn!(
            "Account has {} homes; operating on the first one only",
            ids.len()
        );
    }
    ids.into_iter()
        .next()
        .ok_or_else(|| TadoApiError::Decode("account has no homes".to_string()))
}

fn discard_stale_token(cfg: &Config) {
    match std::fs::remove_file(&cfg.token_file) {
        Ok(()) => info!(
            "Removed stale token file {}; a fresh authorization will start",
            cfg.token_file.display()
        ),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            "Could not remove stale token file {}: {}",
            cfg.token_file.display(),
            e
        ),
    }
}
