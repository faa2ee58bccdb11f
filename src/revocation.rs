use crate::cert::ParsedX509Certificate;
use crate::ocsp;
use anyhow::{Context, bail};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const OCSP_REQUEST_CONTENT_TYPE: &str = "application/ocsp-request";
const OCSP_RESPONSE_CONTENT_TYPE: &str = "application/ocsp-response";
const RESPONDER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationStatus {
    Good,
    Revoked,
    /// Status could not be determined. Treated like Good by callers; a
    /// flaky responder must not force renewals.
    Unknown,
}

/// Checks the active certificate against its OCSP responder.
#[derive(Debug)]
pub struct RevocationChecker {
    client: reqwest::Client,
    responder_override: Option<Url>,
}

impl RevocationChecker {
    pub fn new(responder_override: Option<Url>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(RESPONDER_TIMEOUT)
            .build()
            .context("building OCSP HTTP client failed")?;
        Ok(Self {
            client,
            responder_override,
        })
    }

    /// Determines the revocation status of the leaf certificate in `chain`.
    /// All failures are soft: they log a warning and yield `Unknown`.
    pub async fn check(&self, chain: &[ParsedX509Certificate]) -> RevocationStatus {
        match self.try_check(chain).await {
            Ok(status) => status,
            Err(e) => {
                warn!("Revocation status could not be determined: {e:#}");
                RevocationStatus::Unknown
            }
        }
    }

    async fn try_check(&self, chain: &[ParsedX509Certificate]) -> anyhow::Result<RevocationStatus> {
        let Some(leaf) = chain.first() else {
            bail!("no certificate installed");
        };
        let Some(issuer) = chain.get(1) else {
            bail!("certificate chain does not include the issuer certificate");
        };
        let responder = match &self.responder_override {
            Some(url) => url.clone(),
            None => {
                let Some(uri) = leaf.ocsp_responders.first() else {
                    bail!("certificate carries no OCSP responder URI");
                };
                Url::parse(uri).context("certificate carries an invalid OCSP responder URI")?
            }
        };
        debug!("Checking revocation status of {} via {responder}", leaf.serial);
        let request =
            ocsp::build_request(&leaf.raw_issuer_name, &issuer.raw_public_key, &leaf.raw_serial);
        let response = self
            .client
            .post(responder.clone())
            .header(reqwest::header::CONTENT_TYPE, OCSP_REQUEST_CONTENT_TYPE)
            .header(reqwest::header::ACCEPT, OCSP_RESPONSE_CONTENT_TYPE)
            .body(request)
            .send()
            .await
            .with_context(|| format!("contacting OCSP responder {responder} failed"))?;
        if !response.status().is_success() {
            bail!(
                "OCSP responder {responder} returned HTTP {}",
                response.status()
            );
        }
        let body = response
            .bytes()
            .await
            .context("reading OCSP response body failed")?;
        let status = ocsp::parse_response(&body).context("parsing OCSP response failed")?;
        Ok(match status {
            ocsp::CertStatus::Good => RevocationStatus::Good,
            ocsp::CertStatus::Revoked => RevocationStatus::Revoked,
            ocsp::CertStatus::Unknown => RevocationStatus::Unknown,
        })
    }
}
