//! REST control endpoint. Exposes certificate operations and read-only
//! summaries under `/acme/v1`, plus the HTTP-01 challenge well-known path so
//! an embedding server can satisfy validations from the same listener.

use crate::config::RestConfig;
use crate::keystore::CertificateRecord;
use crate::manager::{CertManager, LifecycleError, RenewalTrigger};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

const OPERATION_RENEW: &str = "renewCertificate";
const OPERATION_REVOKE: &str = "revokeCertificate";

const BODY_LIMIT: u64 = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// May trigger renewals and revocations
    Admin,
    /// May read summaries
    Reader,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    #[serde(rename = "httpCode")]
    http_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CertificateOperation {
    operation: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceSummary {
    directory_uri: Url,
    domains: Vec<String>,
    auto_renew: bool,
    revocation_checking: bool,
    scheduler_running: bool,
    history: Vec<HistorySummary>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HistorySummary {
    timestamp: String,
    directory_uri: Url,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountSummary {
    account_url: Option<Url>,
    contacts: Vec<Url>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CertificateSummary {
    serial: String,
    subject_common_name: Option<String>,
    not_before: String,
    not_after: String,
    domains: Vec<String>,
    directory_uri: Option<Url>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CertificateSummaryBody {
    certificate: Option<CertificateSummary>,
}

impl CertificateSummary {
    fn from_record(record: &CertificateRecord) -> Self {
        let leaf = record.leaf();
        Self {
            serial: format!("{:x}", leaf.serial),
            subject_common_name: leaf.subject_common_name.clone(),
            not_before: rfc3339(leaf.validity.not_before),
            not_after: rfc3339(leaf.validity.not_after),
            domains: record.domains.clone(),
            directory_uri: record.directory_uri.clone(),
        }
    }
}

fn rfc3339(timestamp: time::OffsetDateTime) -> String {
    timestamp
        .format(&Rfc3339)
        .unwrap_or_else(|_| timestamp.to_string())
}

/// All routes of the control endpoint. Separated from `serve` so tests can
/// drive them through `warp::test` without binding a socket.
pub fn routes(
    manager: Arc<CertManager>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let auth = warp::header::optional::<String>("authorization");

    let challenge = warp::path!(".well-known" / "acme-challenge" / String)
        .and(warp::get())
        .and(with_manager(manager.clone()))
        .and_then(handle_challenge);

    let certificate_ops = warp::path!("acme" / "v1" / "certificate")
        .and(warp::post())
        .and(auth)
        .and(warp::body::content_length_limit(BODY_LIMIT))
        .and(warp::body::json())
        .and(with_manager(manager.clone()))
        .and_then(handle_certificate_operation);

    let certificate_summary = warp::path!("acme" / "v1" / "certificate")
        .and(warp::get())
        .and(auth)
        .and(with_manager(manager.clone()))
        .and_then(handle_certificate_summary);

    let account_summary = warp::path!("acme" / "v1" / "account")
        .and(warp::get())
        .and(auth)
        .and(with_manager(manager.clone()))
        .and_then(handle_account_summary);

    let service_summary = warp::path!("acme" / "v1")
        .and(warp::get())
        .and(auth)
        .and(with_manager(manager))
        .and_then(handle_service_summary);

    challenge
        .or(certificate_ops)
        .or(certificate_summary)
        .or(account_summary)
        .or(service_summary)
        .recover(handle_rejection)
}

/// Binds the control endpoint and serves it until `shutdown` is cancelled.
pub async fn serve(
    manager: Arc<CertManager>,
    listen: SocketAddr,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let routes = routes(manager);
    let (addr, server) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(listen, async move { shutdown.cancelled().await })?;
    info!("REST control endpoint listening on {addr}");
    server.await;
    Ok(())
}

fn with_manager(
    manager: Arc<CertManager>,
) -> impl Filter<Extract = (Arc<CertManager>,), Error = Infallible> + Clone {
    warp::any().map(move || manager.clone())
}

/// Bearer-token check. With no tokens configured the endpoint is open, which
/// test deployments rely on. The admin token always implies read access.
fn authorized(rest: &RestConfig, role: Role, header: Option<&str>) -> bool {
    let mut accepted: Vec<&str> = Vec::new();
    if let Some(admin) = &rest.admin_token {
        accepted.push(admin);
    }
    if role == Role::Reader
        && let Some(reader) = &rest.reader_token
    {
        accepted.push(reader);
    }
    if rest.admin_token.is_none() && rest.reader_token.is_none() {
        return true;
    }
    let Some(token) = header.and_then(|h| h.strip_prefix("Bearer ")) else {
        return false;
    };
    accepted.contains(&token)
}

fn status_reply(code: StatusCode, message: Option<String>) -> warp::reply::WithStatus<warp::reply::Json> {
    let body = StatusBody {
        http_code: code.as_u16(),
        message,
    };
    warp::reply::with_status(warp::reply::json(&body), code)
}

fn forbidden() -> warp::reply::WithStatus<warp::reply::Json> {
    status_reply(StatusCode::FORBIDDEN, Some("not authorized".to_string()))
}

fn lifecycle_error_reply(error: &LifecycleError) -> warp::reply::WithStatus<warp::reply::Json> {
    let code = match error {
        LifecycleError::Config(_) | LifecycleError::NoCertificate => StatusCode::BAD_REQUEST,
        LifecycleError::Cooldown { .. } => StatusCode::TOO_MANY_REQUESTS,
        LifecycleError::Failed(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    status_reply(code, Some(format!("{error:#}")))
}

async fn handle_certificate_operation(
    auth: Option<String>,
    body: CertificateOperation,
    manager: Arc<CertManager>,
) -> Result<impl Reply, Rejection> {
    let config = manager.config();
    if !authorized(&config.rest, Role::Admin, auth.as_deref()) {
        return Ok(forbidden());
    }
    debug!("REST certificate operation: {}", body.operation);
    let reply = match body.operation.as_str() {
        OPERATION_RENEW => match manager.request_certificate(RenewalTrigger::Manual).await {
            Ok(()) => status_reply(StatusCode::OK, Some("certificate renewed".to_string())),
            Err(e) => lifecycle_error_reply(&e),
        },
        OPERATION_REVOKE => {
            let reason = match &body.reason {
                Some(name) => match name.parse() {
                    Ok(reason) => Some(reason),
                    Err(e) => return Ok(status_reply(StatusCode::BAD_REQUEST, Some(e))),
                },
                None => None,
            };
            match manager.revoke_certificate(reason).await {
                Ok(()) => status_reply(StatusCode::OK, Some("certificate revoked".to_string())),
                Err(e) => lifecycle_error_reply(&e),
            }
        }
        other => status_reply(
            StatusCode::BAD_REQUEST,
            Some(format!("unsupported operation '{other}'")),
        ),
    };
    Ok(reply)
}

async fn handle_service_summary(
    auth: Option<String>,
    manager: Arc<CertManager>,
) -> Result<Box<dyn Reply>, Rejection> {
    let config = manager.config();
    if !authorized(&config.rest, Role::Reader, auth.as_deref()) {
        return Ok(Box::new(forbidden()));
    }
    let history = manager
        .history_entries()
        .await
        .into_iter()
        .map(|entry| HistorySummary {
            timestamp: rfc3339(entry.timestamp),
            directory_uri: entry.directory_uri,
        })
        .collect();
    let summary = ServiceSummary {
        directory_uri: config.directory_uri.clone(),
        domains: config.normalized_domains(),
        auto_renew: config.auto_renew,
        revocation_checking: config.revocation.enabled,
        scheduler_running: manager.scheduler_running(),
        history,
    };
    Ok(Box::new(warp::reply::json(&summary)))
}

async fn handle_account_summary(
    auth: Option<String>,
    manager: Arc<CertManager>,
) -> Result<Box<dyn Reply>, Rejection> {
    let config = manager.config();
    if !authorized(&config.rest, Role::Reader, auth.as_deref()) {
        return Ok(Box::new(forbidden()));
    }
    let summary = AccountSummary {
        account_url: manager.account_url(),
        contacts: config.contacts.clone(),
    };
    Ok(Box::new(warp::reply::json(&summary)))
}

async fn handle_certificate_summary(
    auth: Option<String>,
    manager: Arc<CertManager>,
) -> Result<Box<dyn Reply>, Rejection> {
    let config = manager.config();
    if !authorized(&config.rest, Role::Reader, auth.as_deref()) {
        return Ok(Box::new(forbidden()));
    }
    let body = CertificateSummaryBody {
        certificate: manager
            .active_certificate()
            .map(|record| CertificateSummary::from_record(&record)),
    };
    Ok(Box::new(warp::reply::json(&body)))
}

async fn handle_challenge(
    token: String,
    manager: Arc<CertManager>,
) -> Result<Box<dyn Reply>, Rejection> {
    match manager.responder().lookup(&token) {
        Some(authorization) => {
            debug!("Serving http-01 response for token {token}");
            Ok(Box::new(warp::reply::with_header(
                authorization,
                warp::http::header::CONTENT_TYPE,
                "application/octet-stream",
            )))
        }
        None => Err(warp::reject::not_found()),
    }
}

/// Maps warp's built-in rejections onto the JSON status body the rest of the
/// endpoint speaks.
async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Infallible> {
    let (code, message) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "not found")
    } else if rejection
        .find::<warp::reject::UnsupportedMediaType>()
        .is_some()
    {
        (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "expected application/json",
        )
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
    } else if rejection
        .find::<warp::filters::body::BodyDeserializeError>()
        .is_some()
    {
        (StatusCode::BAD_REQUEST, "malformed request body")
    } else if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::BAD_REQUEST, "request body too large")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    };
    Ok(status_reply(code, Some(message.to_string())))
}
