//! Periodic certificate checker. Wakes on the configured schedule, asks the
//! manager to run its validity and revocation checks, and tightens the wake
//! interval after a failed cycle until a cycle succeeds again.

use crate::manager::CertManager;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Spread the first wake so a fleet restarted at once does not stampede the CA
const MAX_START_JITTER: Duration = Duration::from_secs(60);

/// Handle to the background checker task. `Stopped` until `apply` decides the
/// configuration wants one; stopping only cancels between cycles, an in-flight
/// ACME exchange finishes under the HTTP client's timeouts.
#[derive(Debug, Default)]
pub struct CertChecker {
    token: Option<CancellationToken>,
}

impl CertChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.token.is_some()
    }

    /// Restarts the checker to match the configuration: stopped when the
    /// schedule is zero or neither auto-renewal nor revocation checking is
    /// enabled, running with the configured schedules otherwise.
    pub fn apply(&mut self, manager: Arc<CertManager>, config: &crate::config::AcmeConfig) {
        self.stop();
        if !config.scheduler_enabled() {
            debug!("Certificate checker stays stopped for this configuration");
            return;
        }
        let token = CancellationToken::new();
        let schedule = *config.cert_checker_schedule;
        let error_schedule = *config.cert_checker_error_schedule;
        info!(
            "Starting certificate checker with a {} schedule",
            config.cert_checker_schedule
        );
        tokio::spawn(run_loop(manager, schedule, error_schedule, token.clone()));
        self.token = Some(token);
    }

    pub fn stop(&mut self) {
        if let Some(token) = self.token.take() {
            debug!("Stopping certificate checker");
            token.cancel();
        }
    }
}

async fn run_loop(
    manager: Arc<CertManager>,
    schedule: Duration,
    error_schedule: Duration,
    token: CancellationToken,
) {
    let jitter = {
        let mut rng = rand::rng();
        Duration::from_millis(rng.random_range(0..=MAX_START_JITTER.as_millis() as u64))
    };
    let mut wait = schedule.min(error_schedule).min(jitter);
    loop {
        tokio::select! {
            () = token.cancelled() => {
                debug!("Certificate checker cancelled");
                return;
            }
            () = tokio::time::sleep(wait) => {}
        }
        wait = match manager.run_checks().await {
            Ok(()) => schedule,
            Err(e) => {
                warn!("Certificate check cycle failed: {e:#}");
                warn!(
                    "Retrying in {:?} instead of the regular schedule",
                    error_schedule
                );
                error_schedule
            }
        };
    }
}
