use crate::config::PassthroughConfig;
use crate::errors::{FetchError, RequestError};
use crate::safe_fetch::{Transport, UpstreamRequest, fetch_json};
use crate::types::{ErrorBody, Step};
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use url::Url;

/// Inbound description of the single call to make.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassthroughRequest {
    #[serde(default)]
    pub target_url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

/// What to send back to the caller.
#[derive(Debug, PartialEq)]
pub enum PassthroughReply {
    /// Upstream JSON with the upstream's own status
    Relay(StatusCode, Value),
    Error(StatusCode, ErrorBody),
}

/// Proxies one call and relays the upstream status and JSON body verbatim.
pub struct Passthrough {
    path: String,
    allowed_hosts: Vec<String>,
    transport: Arc<dyn Transport>,
}

impl Passthrough {
    pub fn new(config: &PassthroughConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            path: config.path.clone(),
            // Parsed URLs report lowercase hosts
            allowed_hosts: config
                .allowed_hosts
                .iter()
                .map(|host| host.to_ascii_lowercase())
                .collect(),
            transport,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Turns the caller's description into an upstream request.
    pub fn build_request(&self, inbound: PassthroughRequest) -> Result<UpstreamRequest, RequestError> {
        let target_url = inbound
            .target_url
            .filter(|url| !url.trim().is_empty())
            .ok_or(RequestError::MissingField("targetUrl"))?;
        let method = inbound
            .method
            .filter(|method| !method.trim().is_empty())
            .ok_or(RequestError::MissingField("method"))?;

        let url = Url::parse(&target_url).map_err(|e| RequestError::InvalidField {
            field: "targetUrl",
            message: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RequestError::InvalidField {
                field: "targetUrl",
                message: format!("unsupported scheme {}", url.scheme()),
            });
        }

        let host = url.host_str().unwrap_or_default();
        if !self.allowed_hosts.is_empty() && !self.allowed_hosts.iter().any(|h| h == host) {
            return Err(RequestError::HostNotAllowed(host.to_string()));
        }

        let method = Method::from_bytes(method.trim().to_uppercase().as_bytes()).map_err(|e| {
            RequestError::InvalidField {
                field: "method",
                message: e.to_string(),
            }
        })?;

        let mut headers = HeaderMap::with_capacity(inbound.headers.len());
        for (name, value) in &inbound.headers {
            let invalid = |message: String| RequestError::InvalidField {
                field: "headers",
                message,
            };
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| invalid(format!("invalid header name {name}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| invalid(format!("invalid value for header {name}")))?;
            headers.insert(name, value);
        }

        // The body is only forwarded when there is one and the method can carry it
        let body = match inbound.body {
            Some(body) if !body.is_null() && method != Method::GET => {
                if !headers.contains_key(CONTENT_TYPE) {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                }
                Some(Bytes::from(body.to_string()))
            }
            _ => None,
        };

        Ok(UpstreamRequest {
            url,
            method,
            headers,
            body,
        })
    }

    pub async fn forward(&self, request: UpstreamRequest) -> PassthroughReply {
        match fetch_json(self.transport.as_ref(), request, Step::Passthrough).await {
            Ok((status, payload)) => PassthroughReply::Relay(status, payload),
            Err(FetchError::NotJson {
                status, excerpt, ..
            }) => PassthroughReply::Error(
                status,
                ErrorBody {
                    error: "Upstream response could not be processed as JSON".to_string(),
                    details: Some(format!("Received: {excerpt}")),
                },
            ),
            Err(e) => {
                tracing::error!(error = %e, "Passthrough call failed");
                PassthroughReply::Error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        error: "Internal proxy error".to_string(),
                        details: Some(e.to_string()),
                    },
                )
            }
        }
    }
}
