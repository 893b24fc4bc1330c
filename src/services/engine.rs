//! Top-level orchestration: authenticate, sync once, then monitor until the
//! session dies.
//!
//! One cooperative loop owns the account; there is exactly one session at a
//! time, and overlapping mutations against the same account would race. The
//! only other execution context is the read-only health responder.

use log::info;
use std::sync::Arc;
use std::thread;

use crate::approval::BrowserApproval;
use crate::client::TadoApiError;
use crate::config::Config;
use crate::health::{SessionStatus, StatusCell};
use crate::notify::Notifier;
use crate::services::auth::{self, Session};
use crate::services::{presence, windows};

/// Run the reconciliation engine forever. Every path back to the top of the
/// loop discards the session entirely; there is no partial reuse.
pub fn run(cfg: &Config, status: Arc<StatusCell>) -> Result<(), String> {
    let approval = BrowserApproval::from_config(cfg);
    if approval.is_some() {
        info!("Automated approval enabled (WebDriver at {})", cfg.webdriver_url);
    } else {
        info!("Automated approval not configured; pending authorizations need manual approval");
    }

    let mut notifier = Notifier::new();
    loop {
        info!("Starting Tado authorization");
        let session = auth::obtain_ready_session(cfg, &mut notifier, &status, approval.as_ref());

        // One presence sync before the steady loop, so a stale mode is
        // corrected right after (re)authorization instead of a tick later.
        if let Err(e) = presence::reconcile(&session.client, session.home_id, &mut notifier) {
            if e.is_credentials() {
                status.set(SessionStatus::Failed);
            }
            notifier.announce(&format!(
                "Initial presence sync failed ({}); restarting authorization in {:.0}s.",
                e,
                cfg.retry_interval.as_secs_f64()
            ));
            thread::sleep(cfg.retry_interval);
            continue;
        }
        notifier.announce("Watching for device location changes and open windows.");

        monitor(cfg, &session, &mut notifier, &status);
        // The session is dropped on the way back to a fresh authorization.
    }
}

/// Steady-state loop: one cycle per tick until the credentials die.
fn monitor(cfg: &Config, session: &Session, notifier: &mut Notifier, status: &StatusCell) {
    loop {
        match run_cycle(session, notifier) {
            Ok(()) => thread::sleep(cfg.check_interval),
            Err(e) if e.is_credentials() => {
                status.set(SessionStatus::Failed);
                notifier.announce(&format!(
                    "Credentials rejected ({}); discarding the session and re-authorizing.",
                    e
                ));
                return;
            }
            Err(e) => {
                notifier.announce(&format!(
                    "{}. Retrying in {:.0}s.",
                    e,
                    cfg.retry_interval.as_secs_f64()
                ));
                thread::sleep(cfg.retry_interval);
            }
        }
    }
}

/// One reconciliation cycle. Open-window checks always run before the
/// presence check; mutations are issued serially within the cycle.
pub fn run_cycle(session: &Session, notifier: &mut Notifier) -> Result<(), TadoApiError> {
    windows::check_zones(&session.client, session.home_id, notifier)?;
    presence::reconcile(&session.client, session.home_id, notifier)
}
