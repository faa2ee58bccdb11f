use crate::acme::error::ProtocolResult;
use crate::acme::object::Nonce;
use reqwest::{Certificate, ClientBuilder, Method, Request, Response};
use serde::Serialize;
use std::time::{Duration, SystemTime};
use url::Url;

// As per RFC8555 Section 6.1, we should conform both to RFC 7525 and supply the name + version
// of our HTTP library.
const USER_AGENT: &str = concat!(
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    " reqwest/",
    env!("REQWEST_VERSION"),
    " ( +",
    env!("CARGO_PKG_REPOSITORY"),
    " )"
);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(120);

const REPLAY_NONCE: &str = "Replay-Nonce";

/// Transport-level settings for talking to the CA. Private test CAs often
/// need an extra trust anchor, and slow CAs may need longer timeouts.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub extra_roots: Vec<Certificate>,
}

#[derive(Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn try_new() -> ProtocolResult<Self> {
        Self::try_new_with_options(TransportOptions::default())
    }

    pub fn try_new_with_options(options: TransportOptions) -> ProtocolResult<Self> {
        let mut builder = ClientBuilder::new();
        for root in options.extra_roots {
            builder = builder.add_root_certificate(root);
        }
        let mut headers = reqwest::header::HeaderMap::new();
        // RFC8555 Section 6.1, "clients SHOULD send an Accept-Language header field in
        // accordance with RFC7231"
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            reqwest::header::HeaderValue::from_static("en"),
        );
        let builder = builder
            // RFC8555 Section 6, "Communications [...] are done over HTTPS [...]", except for test and debug builds where we allow HTTP
            .https_only(!cfg!(any(test, debug_assertions)))
            .user_agent(USER_AGENT)
            .connect_timeout(options.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT))
            .read_timeout(options.read_timeout.unwrap_or(DEFAULT_READ_TIMEOUT))
            .default_headers(headers)
            // Make TRACE logs available for test or debug builds (still needs to be enabled separately)
            .connection_verbose(cfg!(any(test, debug_assertions)));
        Ok(Self {
            client: builder.build()?,
        })
    }

    pub fn extract_nonce(res: &Response) -> Option<Nonce> {
        res.headers()
            .get(REPLAY_NONCE)
            .and_then(|header| header.to_str().ok())
            .and_then(|nonce_value| Nonce::try_from(nonce_value.to_string()).ok())
    }

    pub fn extract_backoff(res: &Response) -> Option<SystemTime> {
        res.headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|header| header.to_str().ok())
            .and_then(parse_retry_after)
    }

    pub fn extract_location(res: &Response) -> Option<Url> {
        res.headers()
            .get(reqwest::header::LOCATION)
            .and_then(|header| header.to_str().ok())
            .and_then(|location_str| parse_url(res.url(), location_str))
    }

    async fn execute(&self, req: Request) -> ProtocolResult<Response> {
        Ok(self.client.execute(req).await?)
    }

    pub async fn get(&self, url: Url) -> ProtocolResult<Response> {
        self.execute(Request::new(Method::GET, url)).await
    }

    pub async fn head(&self, url: Url) -> ProtocolResult<Response> {
        self.execute(Request::new(Method::HEAD, url)).await
    }

    pub async fn post<T: Serialize>(&self, url: Url, body: &T) -> ProtocolResult<Response> {
        let request_builder = self.client.post(url);
        // RFC8555 Section 6.2, "[clients] must have the Content-Type header field set
        // to "application/jose+json""
        let request = request_builder
            .header(
                reqwest::header::CONTENT_TYPE,
                reqwest::header::HeaderValue::from_static("application/jose+json"),
            )
            .json(&body)
            .build()?;
        self.execute(request).await
    }
}

fn parse_retry_after(retry_after: &str) -> Option<SystemTime> {
    // As per RFC9110, the Retry-After header either contains a value in seconds, or
    // a Date/Time string.
    if let Ok(seconds) = retry_after.parse::<u64>() {
        let timeout = Duration::from_secs(seconds);
        SystemTime::now().checked_add(timeout)
    } else {
        // Refer to RFC9110 Date/Time format parsing
        httpdate::parse_http_date(retry_after).ok()
    }
}

fn parse_url(base_url: &Url, raw_url: &str) -> Option<Url> {
    // As per RFC7231, the Location header may contain relative URLs as well as
    // absolute URLs. The Url crate already contains the join logic for this.
    base_url.join(raw_url).ok()
}


#[cfg(test)]
mod tests {
    use super::test_helper::*;
    use super::*;
    use httptest::Expectation;
    use httptest::matchers::contains;
    use httptest::matchers::request::{headers, method_path};
    use httptest::responders::status_code;
    use time::macros::datetime;

    #[test]
    fn test_try_new() {
        let _ = HttpClient::try_new().unwrap();
    }

    #[test]
    fn test_try_new_with_custom_timeouts() {
        let options = TransportOptions {
            connect_timeout: Some(Duration::from_secs(2)),
            read_timeout: Some(Duration::from_secs(5)),
            extra_roots: vec![],
        };
        let _ = HttpClient::try_new_with_options(options).unwrap();
    }

    #[tokio::test]
    async fn test_sends_user_agent() {
        let server = SERVER_POOL.get_server();
        server.expect(
            Expectation::matching(headers(contains(("user-agent", USER_AGENT))))
                .times(3)
                .respond_with(status_code(200)),
        );

        let client = HttpClient::try_new().unwrap();
        client.head(uri_to_url(server.url("/"))).await.unwrap();
        client.post(uri_to_url(server.url("/")), &()).await.unwrap();
        client.get(uri_to_url(server.url("/"))).await.unwrap();
    }

    #[tokio::test]
    async fn test_post_sends_content_type() {
        let server = SERVER_POOL.get_server();
        server.expect(
            Expectation::matching(headers(contains(("content-type", "application/jose+json"))))
                .respond_with(status_code(200)),
        );

        let client = HttpClient::try_new().unwrap();
        client.post(uri_to_url(server.url("/")), &()).await.unwrap();
    }

    #[tokio::test]
    async fn test_extract_nonce() {
        let server = SERVER_POOL.get_server();
        server.expect(
            Expectation::matching(method_path("HEAD", "/"))
                .respond_with(status_code(200).append_header(REPLAY_NONCE, "nonceValue")),
        );

        let client = HttpClient::try_new().unwrap();
        let response = client.head(uri_to_url(server.url("/"))).await.unwrap();
        let nonce = HttpClient::extract_nonce(&response).expect("No nonce found");
        assert_eq!(nonce.to_string(), "nonceValue");
    }

    #[tokio::test]
    async fn test_extract_nonce_with_invalid_nonce() {
        let server = SERVER_POOL.get_server();
        server.expect(
            Expectation::matching(method_path("HEAD", "/"))
                .respond_with(status_code(200).append_header(REPLAY_NONCE, "!invalid-nonce!")),
        );

        let client = HttpClient::try_new().unwrap();
        let response = client.head(uri_to_url(server.url("/"))).await.unwrap();
        assert!(HttpClient::extract_nonce(&response).is_none());
    }

    #[tokio::test]
    async fn test_extract_backoff_with_seconds() {
        let server = SERVER_POOL.get_server();
        server.expect(
            Expectation::matching(method_path("GET", "/"))
                .respond_with(status_code(200).append_header("retry-after", "60")),
        );

        let client = HttpClient::try_new().unwrap();
        let response = client.get(uri_to_url(server.url("/"))).await.unwrap();
        let retry_after =
            HttpClient::extract_backoff(&response).expect("No retry after value or parsed");
        let backoff = retry_after.duration_since(SystemTime::now()).unwrap();
        let difference = backoff.abs_diff(Duration::from_secs(60));
        // Allow some leeway to account for a slow test or jumping clock
        assert!(
            difference < Duration::from_secs(3),
            "Time difference greater than 3s: {difference:?}"
        );
    }

    #[tokio::test]
    async fn test_extract_backoff_with_timestamp() {
        let server = SERVER_POOL.get_server();
        server.expect(
            Expectation::matching(method_path("GET", "/")).respond_with(
                status_code(200).append_header("retry-after", "Sun, 06 Nov 1994 08:49:37 GMT"),
            ),
        );

        let client = HttpClient::try_new().unwrap();
        let response = client.get(uri_to_url(server.url("/"))).await.unwrap();
        let retry_after =
            HttpClient::extract_backoff(&response).expect("No retry after value or parsed");
        assert_eq!(
            retry_after,
            SystemTime::from(datetime!(1994-11-06 08:49:37 UTC))
        );
    }

    #[tokio::test]
    async fn test_extract_backoff_with_invalid_timestamp() {
        let server = SERVER_POOL.get_server();
        server.expect(
            Expectation::matching(method_path("GET", "/")).respond_with(
                status_code(200).append_header("retry-after", "sometime next week, probably"),
            ),
        );

        let client = HttpClient::try_new().unwrap();
        let response = client.get(uri_to_url(server.url("/"))).await.unwrap();
        assert!(HttpClient::extract_backoff(&response).is_none());
    }

    #[tokio::test]
    async fn test_extract_location() {
        let server = SERVER_POOL.get_server();
        server.expect(
            Expectation::matching(method_path("POST", "/")).respond_with(
                status_code(201).append_header("Location", "https://example.com/look-here"),
            ),
        );

        let client = HttpClient::try_new().unwrap();
        let response = client.post(uri_to_url(server.url("/")), &()).await.unwrap();
        let location = HttpClient::extract_location(&response).unwrap();
        assert_eq!(location.as_str(), "https://example.com/look-here");
    }

    #[tokio::test]
    async fn test_extract_location_with_relative_url() {
        let server = SERVER_POOL.get_server();
        server.expect(
            Expectation::matching(method_path("POST", "/"))
                .respond_with(status_code(201).append_header("Location", "/everything-is-relative")),
        );

        let client = HttpClient::try_new().unwrap();
        let response = client.post(uri_to_url(server.url("/")), &()).await.unwrap();
        let location = HttpClient::extract_location(&response).unwrap();
        assert_eq!(location.as_str(), server.url_str("/everything-is-relative"));
    }
}
