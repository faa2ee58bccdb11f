//! Certificate lifecycle orchestration. Every certificate-mutating path
//! (REST, scheduler, configuration reconciliation) funnels through a single
//! async mutex here, so the CA only ever sees one in-flight operation and the
//! keystore swap stays atomic for readers.

use crate::acme;
use crate::acme::client::{AccountRegisterOptions, AcmeClient, AcmeClientBuilder};
use crate::acme::http::{HttpClient, TransportOptions};
use crate::acme::object::{
    AuthorizationStatus, ChallengeStatus, Identifier, InnerChallenge, NewOrderRequest, Order,
    OrderStatus, RevocationReason,
};
use crate::cert::{create_and_sign_csr, load_reqwest_certificates};
use crate::challenge::{Http01Responder, key_authorization};
use crate::config::{AcmeConfig, ConfigError};
use crate::crypto::jws::{JsonWebKey, KeyParameters};
use crate::crypto::keys::{Curve, KeyPair, KeyType};
use crate::history::{AcmeHistory, HistoryEntry};
use crate::keystore::{CertificateRecord, Keystore};
use crate::reconcile::{ReconcileAction, reconcile};
use crate::revocation::{RevocationChecker, RevocationStatus};
use crate::scheduler::CertChecker;
use anyhow::{Context, anyhow, bail};
use std::fmt::{Display, Formatter};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalTrigger {
    /// Operator request through the REST endpoint
    Manual,
    /// Periodic certificate checker
    Scheduled,
    /// Configuration reconciliation decided a new certificate is needed
    ConfigChange,
}

impl Display for RenewalTrigger {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RenewalTrigger::Manual => "manual",
            RenewalTrigger::Scheduled => "scheduled",
            RenewalTrigger::ConfigChange => "configuration change",
        };
        write!(f, "{name}")
    }
}

/// Failure classes of lifecycle operations. The REST layer maps these onto
/// HTTP status codes, the scheduler onto its error schedule.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),
    #[error(
        "certificate was renewed {elapsed:?} ago, the minimum interval between renewals is {minimum:?}"
    )]
    Cooldown { elapsed: Duration, minimum: Duration },
    #[error("no certificate is installed")]
    NoCertificate,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// An ACME client bound to one directory, with a registered account.
/// Rebuilt whenever the configuration or the directory URI changes.
#[derive(Debug)]
struct AcmeSession {
    directory_uri: Url,
    client: AcmeClient,
    account: JsonWebKey,
}

#[derive(Debug)]
struct ManagerState {
    history: AcmeHistory,
    session: Option<AcmeSession>,
    last_renewal: Option<Instant>,
}

pub struct CertManager {
    config: parking_lot::RwLock<Arc<AcmeConfig>>,
    keystore: Keystore,
    responder: Http01Responder,
    account_url: parking_lot::RwLock<Option<Url>>,
    checker: parking_lot::Mutex<CertChecker>,
    state: tokio::sync::Mutex<ManagerState>,
}

impl CertManager {
    /// Validates the configuration and restores any certificate already on
    /// disk. Directory provenance of the restored record comes from the last
    /// history entry; without one the provenance stays unknown.
    pub fn new(config: AcmeConfig) -> Result<Self, LifecycleError> {
        config.validate()?;
        let history = AcmeHistory::load(&config.files.history);
        let keystore = Keystore::new(&config.files.certificate_chain);
        match keystore.restore(history.last_directory_uri().cloned()) {
            Ok(true) => {}
            Ok(false) => debug!("No certificate chain found on disk, starting without one"),
            Err(e) => warn!("Could not restore the stored certificate chain: {e:#}"),
        }
        Ok(Self {
            config: parking_lot::RwLock::new(Arc::new(config)),
            keystore,
            responder: Http01Responder::new(),
            account_url: parking_lot::RwLock::new(None),
            checker: parking_lot::Mutex::new(CertChecker::new()),
            state: tokio::sync::Mutex::new(ManagerState {
                history,
                session: None,
                last_renewal: None,
            }),
        })
    }

    pub fn config(&self) -> Arc<AcmeConfig> {
        self.config.read().clone()
    }

    pub fn active_certificate(&self) -> Option<Arc<CertificateRecord>> {
        self.keystore.active()
    }

    /// The HTTP-01 token map. Clones share state with the one the manager
    /// provisions during challenge validation.
    pub fn responder(&self) -> Http01Responder {
        self.responder.clone()
    }

    pub fn account_url(&self) -> Option<Url> {
        self.account_url.read().clone()
    }

    pub async fn history_entries(&self) -> Vec<HistoryEntry> {
        self.state.lock().await.history.entries().cloned().collect()
    }

    pub fn scheduler_running(&self) -> bool {
        self.checker.lock().is_running()
    }

    pub fn stop_scheduler(&self) {
        self.checker.lock().stop();
    }

    /// Pretends a renewal just completed, so tests can exercise the cooldown.
    #[cfg(test)]
    pub(crate) async fn mark_renewed(&self) {
        self.state.lock().await.last_renewal = Some(Instant::now());
    }

    /// Applies a new configuration: validate, reconcile against the installed
    /// certificate, execute the decided action, and retune the checker. The
    /// previous configuration stays in effect if validation fails.
    pub async fn apply_config(
        self: &Arc<Self>,
        new_config: AcmeConfig,
    ) -> Result<ReconcileAction, LifecycleError> {
        new_config.validate()?;
        let subject = new_config.subject().map_err(ConfigError::from)?;
        let domains = new_config.normalized_domains();
        let mut state = self.state.lock().await;
        // Any cached session may be bound to stale transport settings
        state.session = None;
        let current = self.keystore.active();
        let action = reconcile(
            &new_config.directory_uri,
            subject.common_name(),
            &domains,
            current.as_deref(),
        );
        let new_config = Arc::new(new_config);
        *self.config.write() = new_config.clone();
        let lifetime = current
            .as_ref()
            .map(|record| record.leaf().validity.total_lifetime());
        // Surface clamping warnings once per configuration change
        new_config.effective_renew_before(lifetime, true);
        info!("Configuration accepted, reconciliation decided: {action:?}");
        // Retune the checker first: if the renewal below fails (CA unreachable
        // at boot), the checker still retries it on the error schedule.
        self.checker.lock().apply(Arc::clone(self), &new_config);
        match action {
            ReconcileAction::NoOp => {}
            ReconcileAction::Renew => {
                self.renew(&mut state, &new_config, RenewalTrigger::ConfigChange)
                    .await?;
            }
            ReconcileAction::RenewAndRevoke => {
                if let Some(record) = &current
                    && let Err(e) = self.revoke_at_previous_directory(record, &new_config).await
                {
                    warn!("Could not revoke the certificate at its previous directory: {e:#}");
                }
                self.renew(&mut state, &new_config, RenewalTrigger::ConfigChange)
                    .await?;
            }
        }
        Ok(action)
    }

    /// Requests a new certificate. Manual triggers are rejected while the
    /// cooldown window since the last completed renewal is still open, before
    /// any network traffic happens.
    pub async fn request_certificate(&self, trigger: RenewalTrigger) -> Result<(), LifecycleError> {
        let config = self.config();
        let mut state = self.state.lock().await;
        if trigger == RenewalTrigger::Manual
            && !config.disable_min_renew_window
            && let Some(last_renewal) = state.last_renewal
        {
            let elapsed = last_renewal.elapsed();
            let minimum = *config.renew_cert_min;
            if elapsed < minimum {
                debug!("Rejecting manual renewal, cooldown window is still open");
                return Err(LifecycleError::Cooldown { elapsed, minimum });
            }
        }
        self.renew(&mut state, &config, trigger).await
    }

    /// Revokes the active certificate at the CA it came from. The record
    /// stays installed; a later check cycle replaces it.
    pub async fn revoke_certificate(
        &self,
        reason: Option<RevocationReason>,
    ) -> Result<(), LifecycleError> {
        let config = self.config();
        let mut state = self.state.lock().await;
        let Some(record) = self.keystore.active() else {
            return Err(LifecycleError::NoCertificate);
        };
        let directory_uri = record
            .directory_uri
            .clone()
            .unwrap_or_else(|| config.directory_uri.clone());
        let foreign_session;
        let session = if directory_uri == config.directory_uri {
            self.ensure_session(&mut state, &config).await?
        } else {
            foreign_session = self.new_session(&config, &directory_uri).await?;
            &foreign_session
        };
        session
            .client
            .revoke_certificate(&session.account, record.leaf().as_der_bytes(), reason)
            .await
            .context("Revocation request failed")?;
        info!(
            "Certificate with serial {} revoked; it stays installed until the next renewal",
            record.leaf().serial
        );
        Ok(())
    }

    /// One checker cycle: renew if the certificate is missing, expired or
    /// inside the renewal window, otherwise consult the OCSP responder if
    /// revocation checking is enabled.
    pub async fn run_checks(&self) -> anyhow::Result<()> {
        let config = self.config();
        let Some(record) = self.keystore.active() else {
            if config.auto_renew {
                info!("No certificate installed, requesting initial issuance");
                self.request_certificate(RenewalTrigger::Scheduled).await?;
            }
            return Ok(());
        };
        if config.auto_renew {
            let window = config
                .effective_renew_before(Some(record.leaf().validity.total_lifetime()), false);
            if record.leaf().due_for_renewal(window) {
                info!(
                    "Certificate with serial {} expires {}, renewing",
                    record.leaf().serial,
                    record.leaf().validity.not_after
                );
                self.request_certificate(RenewalTrigger::Scheduled).await?;
                return Ok(());
            }
        }
        if config.revocation.enabled {
            let checker = RevocationChecker::new(config.revocation.ocsp_responder.clone())?;
            if checker.check(&record.chain).await == RevocationStatus::Revoked {
                warn!(
                    "Certificate with serial {} has been revoked, requesting a replacement",
                    record.leaf().serial
                );
                self.request_certificate(RenewalTrigger::Scheduled).await?;
            }
        }
        Ok(())
    }

    async fn renew(
        &self,
        state: &mut ManagerState,
        config: &Arc<AcmeConfig>,
        trigger: RenewalTrigger,
    ) -> Result<(), LifecycleError> {
        let domains = config.normalized_domains();
        let subject = config.subject().map_err(ConfigError::from)?;
        let common_name = subject.common_name().to_string();
        info!(
            "Requesting a certificate for {} ({trigger} trigger)",
            domains.join(", ")
        );
        let record = self
            .try_renew(state, config, &common_name, &domains)
            .await?;
        state.last_renewal = Some(Instant::now());
        state.history.append(&config.directory_uri);
        info!(
            "Certificate with serial {} installed, valid until {}",
            record.leaf().serial,
            record.leaf().validity.not_after
        );
        Ok(())
    }

    async fn try_renew(
        &self,
        state: &mut ManagerState,
        config: &Arc<AcmeConfig>,
        common_name: &str,
        domains: &[String],
    ) -> anyhow::Result<Arc<CertificateRecord>> {
        let session = self.ensure_session(state, config).await?;
        let cert_key = load_or_generate_key(&config.files.certificate_key, "certificate")?;
        let identifiers: Vec<Identifier> = domains
            .iter()
            .map(|domain| {
                domain.parse().unwrap_or(Identifier::Dns {
                    value: domain.clone(),
                })
            })
            .collect();
        let csr = create_and_sign_csr(&cert_key, identifiers.clone(), Some(common_name))
            .context("Creating the CSR failed")?;
        let request = NewOrderRequest { identifiers };
        let (order_url, order) = session
            .client
            .new_order(&session.account, &request)
            .await
            .context("Creating a new order failed")?;
        debug!("Order URL: {order_url}");
        let order = match order.status {
            OrderStatus::Valid | OrderStatus::Ready | OrderStatus::Processing => order,
            OrderStatus::Pending => {
                self.authorize(session, &order)
                    .await
                    .context("Authorizing the requested identifiers failed")?;
                info!("Finished authorizing all identifiers");
                session
                    .client
                    .get_order(&session.account, &order_url)
                    .await
                    .context("Re-fetching the authorized order failed")?
            }
            OrderStatus::Invalid => return Err(order_failure(order)),
        };
        let order = match order.status {
            OrderStatus::Valid => order,
            OrderStatus::Ready | OrderStatus::Processing => session
                .client
                .finalize_order(&session.account, &order, &csr)
                .await
                .context("Finalizing the order failed")?,
            OrderStatus::Pending => {
                bail!("order is still pending after all identifiers were authorized")
            }
            OrderStatus::Invalid => return Err(order_failure(order)),
        };
        let certificate_url = order.certificate.ok_or_else(|| {
            anyhow!("CA did not provide a certificate URL for the finalized order")
        })?;
        debug!("Final certificate available @ {certificate_url}");
        let pem = session
            .client
            .download_certificate(&session.account, &certificate_url)
            .await
            .context("Downloading the certificate failed")?;
        let record = self
            .keystore
            .install(pem, config.directory_uri.clone(), domains.to_vec())?;
        Ok(record)
    }

    /// Walks the order's authorizations and solves each pending one through
    /// the HTTP-01 responder. The token is removed again even when validation
    /// fails, so a later attempt starts clean.
    async fn authorize(&self, session: &AcmeSession, order: &Order) -> anyhow::Result<()> {
        for authz_url in &order.authorizations {
            debug!("Checking authorization @ {authz_url}");
            let authz = session
                .client
                .get_authorization(&session.account, authz_url)
                .await
                .context("Retrieving authorization from server")?;
            let id = authz.identifier.clone();
            match authz.status {
                AuthorizationStatus::Valid => {
                    debug!("Authorization for {id} is already valid");
                }
                AuthorizationStatus::Pending => {
                    info!("Found pending authorization for {id}, trying to authorize");
                    let (challenge_url, token) = authz
                        .challenges
                        .into_iter()
                        .filter(|challenge| matches!(challenge.status, ChallengeStatus::Pending))
                        .find_map(|challenge| match challenge.inner_challenge {
                            InnerChallenge::Http(ref http) => {
                                Some((challenge.url.clone(), http.token.clone()))
                            }
                            InnerChallenge::Unknown => None,
                        })
                        .ok_or_else(|| {
                            anyhow!("authorization for {id} offers no pending http-01 challenge")
                        })?;
                    let authorization = key_authorization(&session.account, &token);
                    self.responder.provision(&token, authorization);
                    let result = session
                        .client
                        .validate_challenge(&session.account, &challenge_url)
                        .await;
                    self.responder.remove(&token);
                    result.with_context(|| {
                        format!("Validating the http-01 challenge for {id} failed")
                    })?;
                    info!("Successfully validated challenge for {id}");
                }
                AuthorizationStatus::Invalid => {
                    let mut problems = String::new();
                    for problem in authz.challenges.into_iter().filter_map(|c| c.error) {
                        problems.push('\n');
                        problems.push_str(&problem.to_string());
                    }
                    bail!("failed to authorize {id}; the CA reported these problems: {problems}");
                }
                AuthorizationStatus::Deactivated
                | AuthorizationStatus::Expired
                | AuthorizationStatus::Revoked => {
                    bail!(
                        "authorization for {id} is in an unusable state (deactivated, expired, or revoked)"
                    );
                }
            }
        }
        Ok(())
    }

    async fn revoke_at_previous_directory(
        &self,
        record: &CertificateRecord,
        config: &AcmeConfig,
    ) -> anyhow::Result<()> {
        let Some(directory_uri) = &record.directory_uri else {
            bail!("the installed certificate has no recorded directory");
        };
        info!("Directory changed, revoking the previous certificate at {directory_uri}");
        let session = self.new_session(config, directory_uri).await?;
        session
            .client
            .revoke_certificate(
                &session.account,
                record.leaf().as_der_bytes(),
                Some(RevocationReason::Superseded),
            )
            .await
            .context("Revocation request failed")?;
        Ok(())
    }

    async fn ensure_session<'a>(
        &self,
        state: &'a mut ManagerState,
        config: &AcmeConfig,
    ) -> anyhow::Result<&'a AcmeSession> {
        let reusable = state
            .session
            .as_ref()
            .is_some_and(|session| session.directory_uri == config.directory_uri);
        if !reusable {
            let new_session = self.new_session(config, &config.directory_uri).await?;
            *self.account_url.write() = account_url_of(&new_session.account);
            return Ok(state.session.insert(new_session));
        }
        state
            .session
            .as_ref()
            .ok_or_else(|| anyhow!("no usable ACME session"))
    }

    async fn new_session(
        &self,
        config: &AcmeConfig,
        directory_uri: &Url,
    ) -> anyhow::Result<AcmeSession> {
        let account_key = load_or_generate_key(&config.files.account_key, "account")?;
        let client = new_acme_client(config, directory_uri).await?;
        let (account, account_url, registered) = client
            .register_account(AccountRegisterOptions {
                key: account_key,
                contact: config.contacts.clone(),
                terms_of_service_agreed: Some(true),
            })
            .await
            .context("Registering the ACME account failed")?;
        debug!(
            "ACME account @ {account_url} has status {:?}",
            registered.status
        );
        Ok(AcmeSession {
            directory_uri: directory_uri.clone(),
            client,
            account,
        })
    }
}

async fn new_acme_client(config: &AcmeConfig, directory_uri: &Url) -> anyhow::Result<AcmeClient> {
    let extra_roots = load_reqwest_certificates(config.transport.trust_roots.iter()).await?;
    let options = TransportOptions {
        connect_timeout: config.transport.connect_timeout.map(|d| *d),
        read_timeout: config.transport.read_timeout.map(|d| *d),
        extra_roots,
    };
    let http_client = HttpClient::try_new_with_options(options)
        .context("Building the ACME HTTP client failed")?;
    let client = AcmeClientBuilder::new(directory_uri.clone())
        .with_http_client(http_client)
        .try_build()
        .await
        .with_context(|| format!("Contacting the ACME directory {directory_uri} failed"))?;
    Ok(client)
}

fn order_failure(order: Order) -> anyhow::Error {
    match order.error {
        Some(problem) => {
            anyhow::Error::from(acme::error::Error::from(problem)).context("Order failed")
        }
        None => anyhow!("order has invalid status, but the CA did not report an error"),
    }
}

fn account_url_of(key: &JsonWebKey) -> Option<Url> {
    match key.get_parameters() {
        KeyParameters::AccountUrl(url) => Some(url.clone()),
        KeyParameters::FullKey(_) => None,
    }
}

fn load_or_generate_key(path: &Path, purpose: &str) -> anyhow::Result<KeyPair> {
    match File::open(path) {
        Ok(file) => KeyPair::load_from_disk(file)
            .with_context(|| format!("Loading the {purpose} key from {} failed", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("Generating a new {purpose} key at {}", path.display());
            let key = KeyPair::generate(KeyType::Ecdsa(Curve::P256))?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!(
                        "Creating directory {} for the {purpose} key failed",
                        parent.display()
                    )
                })?;
            }
            let file = File::create(path).with_context(|| {
                format!("Creating the {purpose} key file {} failed", path.display())
            })?;
            key.save_to_disk(file).with_context(|| {
                format!("Writing the {purpose} key file {} failed", path.display())
            })?;
            Ok(key)
        }
        Err(e) => Err(e).with_context(|| {
            format!("The {purpose} key file {} is not readable", path.display())
        }),
    }
}
