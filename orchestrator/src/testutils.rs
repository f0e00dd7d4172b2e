use crate::config::{
    CredentialExchangeConfig, DataSetAConfig, DataSetBConfig, Endpoint, HeaderSource,
    TokenExchangeConfig, Upstreams,
};
use crate::errors::TransportError;
use crate::safe_fetch::{RawResponse, Transport, UpstreamRequest};
use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioExecutor;
use indexmap::IndexMap;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use url::Url;

/// Canned outcome for one upstream path.
#[derive(Clone, Debug)]
pub enum MockReply {
    Respond {
        status: StatusCode,
        body: Bytes,
        delay: Duration,
    },
    Fail(String),
}

impl MockReply {
    pub fn json(status: u16, value: Value) -> Self {
        Self::text(status, &value.to_string())
    }

    pub fn text(status: u16, body: &str) -> Self {
        MockReply::Respond {
            status: StatusCode::from_u16(status).unwrap(),
            body: Bytes::from(body.to_string()),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(self, delay: Duration) -> Self {
        match self {
            MockReply::Respond { status, body, .. } => MockReply::Respond {
                status,
                body,
                delay,
            },
            fail => fail,
        }
    }
}

/// In-memory transport that answers by URL path and records every call.
#[derive(Default)]
pub struct MockTransport {
    replies: HashMap<String, MockReply>,
    calls: Mutex<Vec<UpstreamRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: &str, reply: MockReply) -> Self {
        self.replies.insert(path.to_string(), reply);
        self
    }

    pub fn calls(&self) -> Vec<UpstreamRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_to(&self, path: &str) -> Vec<UpstreamRequest> {
        self.calls()
            .into_iter()
            .filter(|request| request.url.path() == path)
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: UpstreamRequest) -> Result<RawResponse, TransportError> {
        let reply = self.replies.get(request.url.path()).cloned();
        self.calls.lock().unwrap().push(request.clone());

        match reply {
            Some(MockReply::Respond {
                status,
                body,
                delay,
            }) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(RawResponse { status, body })
            }
            Some(MockReply::Fail(message)) => Err(TransportError::Request(message)),
            None => Err(TransportError::Request(format!(
                "no mock reply for {}",
                request.url.path()
            ))),
        }
    }
}

/// Upstreams at `{base}/login`, `/token`, `/rooms` and `/tasks`.
///
/// The login subscription key is read from `LOGIN_SUBSCRIPTION_KEY`.
pub fn test_upstreams(base: &str) -> Upstreams {
    let url = |path: &str| Url::parse(&format!("{base}{path}")).unwrap();

    Upstreams {
        credential_exchange: CredentialExchangeConfig {
            endpoint: Endpoint {
                url: url("/login"),
                headers: IndexMap::from([
                    (
                        "User-Agent".to_string(),
                        HeaderSource::Literal("Mozilla/5.0".to_string()),
                    ),
                    (
                        "Ocp-Apim-Subscription-Key".to_string(),
                        HeaderSource::Env {
                            env: "LOGIN_SUBSCRIPTION_KEY".to_string(),
                        },
                    ),
                ]),
            },
            identifier_field: "user".to_string(),
            secret_field: "password".to_string(),
            token_pointer: "/token".to_string(),
            student_list_pointer: "/students".to_string(),
            student_id_field: "id".to_string(),
            name_pointer: "/name".to_string(),
            email_pointer: "/email".to_string(),
        },
        token_exchange: TokenExchangeConfig {
            endpoint: Endpoint {
                url: url("/token"),
                headers: IndexMap::from([
                    (
                        "x-api-realm".to_string(),
                        HeaderSource::Literal("edusp".to_string()),
                    ),
                    (
                        "x-api-platform".to_string(),
                        HeaderSource::Literal("webclient".to_string()),
                    ),
                ]),
            },
            key_pointer: "/token".to_string(),
        },
        data_set_a: DataSetAConfig {
            endpoint: Endpoint {
                url: url("/rooms"),
                headers: IndexMap::new(),
            },
            student_id_param: "studentId".to_string(),
        },
        data_set_b: DataSetBConfig {
            endpoint: Endpoint {
                url: url("/tasks"),
                headers: IndexMap::new(),
            },
            api_key_header: "x-api-key".to_string(),
        },
    }
}

pub fn login_payload() -> Value {
    json!({
        "token": "session-token",
        "name": "Ana Souza",
        "email": "ana@example.com",
        "students": [{"id": "7788990", "school": "EE Central"}]
    })
}

pub fn access_key_payload() -> Value {
    json!({"token": "access-key", "expires_in": 3600})
}

pub fn data_set_a_payload() -> Value {
    json!({"rooms": [{"id": 1, "name": "3A", "topic": "math"}]})
}

pub fn data_set_b_payload() -> Value {
    json!([{"id": "t-1", "title": "Essay", "due": "2026-11-01", "score": null}])
}

/// Start a mock HTTP server whose replies come from `response_fn`.
///
/// `response_fn` returns the status, the raw body and how long to wait
/// before answering.
pub async fn start_mock_server<F>(response_fn: F) -> u16
where
    F: Fn(&Request<hyper::body::Incoming>) -> (u16, String, Duration) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let response_fn = Arc::new(response_fn);

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let io = hyper_util::rt::TokioIo::new(stream);
            let response_fn = response_fn.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let (status, body, delay) = response_fn(&req);
                    async move {
                        tokio::time::sleep(delay).await;
                        let mut response = Response::new(Full::new(Bytes::from(body)));
                        *response.status_mut() = StatusCode::from_u16(status).unwrap();
                        Ok::<_, Infallible>(response)
                    }
                });

                let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await;
            });
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}
