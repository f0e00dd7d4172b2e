use crate::errors::{self, FetchError, TransportError};
use crate::metrics_defs::{UPSTREAM_DURATION, UPSTREAM_REQUESTS};
use crate::types::Step;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use http::{Method, StatusCode};
use serde_json::Value;
use shared::{counter, histogram};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use url::Url;

/// Maximum number of characters of an upstream body kept in error messages.
pub const EXCERPT_CHARS: usize = 500;

/// One outbound call. Built per step and not modified afterwards.
#[derive(Clone, Debug)]
pub struct UpstreamRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl UpstreamRequest {
    pub fn get(url: Url, headers: HeaderMap) -> Self {
        Self {
            url,
            method: Method::GET,
            headers,
            body: None,
        }
    }

    /// A request carrying `body` as JSON with the matching content type.
    pub fn json(method: Method, url: Url, mut headers: HeaderMap, body: &Value) -> Self {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self {
            url,
            method,
            headers,
            body: Some(Bytes::from(body.to_string())),
        }
    }
}

/// Status and fully collected body of an upstream response.
#[derive(Clone, Debug)]
pub struct RawResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

/// Performs the network round trip for SafeFetch.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: UpstreamRequest) -> Result<RawResponse, TransportError>;
}

/// Transport backed by a shared reqwest client.
///
/// The deadline covers connecting, sending, receiving headers and collecting
/// the complete body.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout_secs: u64,
}

impl ReqwestTransport {
    pub fn new(timeout_secs: u64) -> errors::Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            timeout_secs,
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: UpstreamRequest) -> Result<RawResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let round_trip = async {
            let response = builder.send().await?;
            let status = response.status();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>(RawResponse { status, body })
        };

        timeout(Duration::from_secs(self.timeout_secs), round_trip)
            .await
            .map_err(|_| TransportError::Timeout(self.timeout_secs))?
            .map_err(|e| TransportError::Request(e.to_string()))
    }
}

struct Fetched {
    status: StatusCode,
    payload: Value,
    raw: Bytes,
}

/// Issues `request` and parses the body as JSON, whatever the status.
///
/// Used where the caller wants the upstream status as well as the payload.
/// A body that is not JSON (including an empty body) is an error regardless
/// of status.
pub async fn fetch_json(
    transport: &dyn Transport,
    request: UpstreamRequest,
    step: Step,
) -> Result<(StatusCode, Value), FetchError> {
    let started = Instant::now();
    let result = fetch(transport, request, step)
        .await
        .map(|fetched| (fetched.status, fetched.payload));
    record(step, started, result.as_ref().err());
    result
}

/// Issues `request` and normalizes the outcome into a JSON payload or a
/// labelled error.
///
/// - 2xx with a JSON body: `Ok(payload)`
/// - non-2xx with a JSON body: [`FetchError::Status`] with a body excerpt
/// - any body that does not parse: [`FetchError::NotJson`] with a body excerpt
/// - transport failure or deadline: [`FetchError::Transport`] / [`FetchError::Timeout`]
pub async fn safe_fetch(
    transport: &dyn Transport,
    request: UpstreamRequest,
    step: Step,
) -> Result<Value, FetchError> {
    let started = Instant::now();
    let result = fetch(transport, request, step)
        .await
        .and_then(|fetched| {
            if fetched.status.is_success() {
                Ok(fetched.payload)
            } else {
                Err(FetchError::Status {
                    step,
                    status: fetched.status,
                    excerpt: excerpt(&fetched.raw),
                })
            }
        });
    record(step, started, result.as_ref().err());
    result
}

async fn fetch(
    transport: &dyn Transport,
    request: UpstreamRequest,
    step: Step,
) -> Result<Fetched, FetchError> {
    let method = request.method.clone();
    let host = request.url.host_str().unwrap_or_default().to_string();

    let response = transport
        .send(request)
        .await
        .map_err(|e| FetchError::from_transport(step, e))?;

    tracing::debug!(
        step = %step,
        method = %method,
        host = %host,
        status = %response.status,
        bytes = response.body.len(),
        "Upstream responded"
    );

    // The body is read once as raw bytes so a failed parse can still be quoted.
    match serde_json::from_slice(&response.body) {
        Ok(payload) => Ok(Fetched {
            status: response.status,
            payload,
            raw: response.body,
        }),
        Err(_) => Err(FetchError::NotJson {
            step,
            status: response.status,
            excerpt: excerpt(&response.body),
        }),
    }
}

fn record(step: Step, started: Instant, error: Option<&FetchError>) {
    let outcome = error.map_or("ok", FetchError::kind);
    counter!(UPSTREAM_REQUESTS, "step" => step.label(), "outcome" => outcome).increment(1);
    histogram!(UPSTREAM_DURATION, "step" => step.label()).record(started.elapsed().as_secs_f64());
}

/// Lossy UTF-8 rendering of at most [`EXCERPT_CHARS`] characters of `body`.
pub fn excerpt(body: &[u8]) -> String {
    String::from_utf8_lossy(body)
        .chars()
        .take(EXCERPT_CHARS)
        .collect()
}
