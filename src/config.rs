use crate::dn::{DnError, SubjectDn};
use crate::time::ParsedDuration;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use toml_edit::DocumentMut;
use tracing::warn;
use url::Url;

pub const DEFAULT_RENEW_BEFORE_EXPIRATION: Duration = Duration::from_secs(7 * 86400);
pub const DEFAULT_CHECKER_SCHEDULE: Duration = Duration::from_secs(86400);
pub const DEFAULT_CHECKER_ERROR_SCHEDULE: Duration = Duration::from_secs(3600);
pub const DEFAULT_RENEW_CERT_MIN: Duration = Duration::from_secs(15);
/// Renewal windows below this are suspicious enough to warn about
pub const MIN_SAFE_RENEW_WINDOW: Duration = Duration::from_secs(86400);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no domains configured")]
    NoDomains,
    #[error("invalid subject DN: {0}")]
    InvalidSubjectDn(#[from] DnError),
    #[error("subject CN '{cn}' is not one of the configured domains")]
    CnNotADomain { cn: String },
}

/// One immutable configuration snapshot. Replaced wholesale on every
/// reconciliation; never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeConfig {
    pub directory_uri: Url,
    pub domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_dn: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contacts: Vec<Url>,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default = "default_renew_before")]
    pub renew_before_expiration: ParsedDuration,
    #[serde(default = "default_checker_schedule")]
    pub cert_checker_schedule: ParsedDuration,
    #[serde(default = "default_checker_error_schedule")]
    pub cert_checker_error_schedule: ParsedDuration,
    #[serde(default)]
    pub revocation: RevocationConfig,
    #[serde(default)]
    pub disable_min_renew_window: bool,
    #[serde(default = "default_renew_cert_min")]
    pub renew_cert_min: ParsedDuration,
    #[serde(default = "default_true")]
    pub auto_renew: bool,
    pub files: FileConfig,
    #[serde(default)]
    pub rest: RestConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<ParsedDuration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_timeout: Option<ParsedDuration>,
    /// Extra PEM trust anchors, e.g. a private test CA root
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trust_roots: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevocationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocsp_responder: Option<Url>,
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ocsp_responder: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    pub account_key: PathBuf,
    pub certificate_key: PathBuf,
    pub certificate_chain: PathBuf,
    pub history: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader_token: Option<String>,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            admin_token: None,
            reader_token: None,
        }
    }
}

fn default_renew_before() -> ParsedDuration {
    DEFAULT_RENEW_BEFORE_EXPIRATION.into()
}

fn default_checker_schedule() -> ParsedDuration {
    DEFAULT_CHECKER_SCHEDULE.into()
}

fn default_checker_error_schedule() -> ParsedDuration {
    DEFAULT_CHECKER_ERROR_SCHEDULE.into()
}

fn default_renew_cert_min() -> ParsedDuration {
    DEFAULT_RENEW_CERT_MIN.into()
}

fn default_true() -> bool {
    true
}

fn default_listen() -> SocketAddr {
    "127.0.0.1:9443".parse().expect("hardcoded address")
}

impl AcmeConfig {
    /// Fatal-error validation. Anything caught here is a configuration
    /// mistake the operator must fix; nothing is retried.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let domains = self.normalized_domains();
        if domains.is_empty() {
            return Err(ConfigError::NoDomains);
        }
        let subject = self.subject()?;
        if !domains.iter().any(|d| d == subject.common_name()) {
            return Err(ConfigError::CnNotADomain {
                cn: subject.common_name().to_string(),
            });
        }
        Ok(())
    }

    /// Configured domains with duplicates removed, order preserved.
    pub fn normalized_domains(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for domain in &self.domains {
            let domain = domain.trim();
            if domain.is_empty() {
                continue;
            }
            if !seen.iter().any(|s: &String| s == domain) {
                seen.push(domain.to_string());
            }
        }
        seen
    }

    /// The parsed subject DN template, or `cn=<first domain>` if none is set.
    pub fn subject(&self) -> Result<SubjectDn, DnError> {
        match &self.subject_dn {
            Some(template) => SubjectDn::from_str(template),
            None => {
                let domains = self.normalized_domains();
                let first = domains.first().map_or("", String::as_str);
                Ok(SubjectDn::default_for(first))
            }
        }
    }

    /// Whether the periodic certificate checker should run at all.
    pub fn scheduler_enabled(&self) -> bool {
        !self.cert_checker_schedule.is_zero() && (self.auto_renew || self.revocation.enabled)
    }

    /// The renewal window actually used against a certificate, after
    /// clamping. `lifetime` is the installed certificate's total validity if
    /// one exists. With `warn_adjustments` the clamps log once; the scheduler
    /// passes false so steady-state cycles stay quiet.
    pub fn effective_renew_before(
        &self,
        lifetime: Option<time::Duration>,
        warn_adjustments: bool,
    ) -> time::Duration {
        let configured = *self.renew_before_expiration;
        let minimum = *self.renew_cert_min;
        let mut effective = configured;
        if effective < minimum {
            if warn_adjustments {
                warn!(
                    "renew_before_expiration ({}) is below renew_cert_min ({}), clamping up",
                    self.renew_before_expiration, self.renew_cert_min
                );
            }
            effective = minimum;
        }
        let mut effective =
            time::Duration::try_from(effective).unwrap_or(time::Duration::MAX);
        if let Some(lifetime) = lifetime
            && effective >= lifetime
        {
            if warn_adjustments {
                warn!(
                    "renew_before_expiration ({}) exceeds the certificate lifetime, falling back to the default",
                    self.renew_before_expiration
                );
            }
            let default: time::Duration = time::Duration::try_from(DEFAULT_RENEW_BEFORE_EXPIRATION)
                .unwrap_or(time::Duration::MAX);
            effective = default.min(lifetime / 2);
        }
        if warn_adjustments
            && effective < time::Duration::try_from(MIN_SAFE_RENEW_WINDOW).unwrap_or_default()
        {
            warn!(
                "the effective renewal window ({effective}) is shorter than one day; certificates may expire before a failed renewal can be retried"
            );
        }
        effective
    }
}

pub fn load<P: AsRef<Path>>(file: P) -> anyhow::Result<AcmeConfig> {
    let file = file.as_ref();
    let document = std::fs::read_to_string(file)
        .map_err(|e| anyhow::anyhow!("Reading config file {} failed: {e}", file.display()))?;
    let document = DocumentMut::from_str(&document)?;
    Ok(toml_edit::de::from_document(document)?)
}

pub fn save<P: AsRef<Path>>(config: &AcmeConfig, file: P) -> anyhow::Result<()> {
    // Manually prettify by serializing and deserializing
    let pretty_string = toml_edit::ser::to_string_pretty(config)?;
    if let Some(parent) = file.as_ref().parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(file, pretty_string)?;
    Ok(())
}
