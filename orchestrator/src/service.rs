use crate::chain::Chain;
use crate::errors::{OrchestratorError, RequestError};
use crate::metrics_defs::{REQUEST_DURATION, REQUESTS_INFLIGHT};
use crate::passthrough::{Passthrough, PassthroughReply, PassthroughRequest};
use crate::types::{ErrorBody, FailureBody, InboundCredentials, StudentRequest};
use http::header::{ALLOW, HeaderValue};
use http::{Method, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::http::{make_error_response, make_json_response};
use shared::{gauge, histogram};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

pub type HandlerBody = BoxBody<Bytes, OrchestratorError>;

/// Inbound bodies larger than this are rejected.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Entry point for the main listener.
///
/// Routes `route_path` to the student chain and, when configured, the
/// passthrough path to the single-call proxy. Both only accept POST.
#[derive(Clone)]
pub struct OrchestratorService {
    route_path: Arc<str>,
    chain: Arc<Chain>,
    passthrough: Option<Arc<Passthrough>>,
}

impl OrchestratorService {
    pub fn new(route_path: &str, chain: Arc<Chain>, passthrough: Option<Arc<Passthrough>>) -> Self {
        Self {
            route_path: route_path.into(),
            chain,
            passthrough,
        }
    }

    pub async fn handle<B>(&self, request: Request<B>) -> Response<HandlerBody>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let started = Instant::now();
        let _inflight = InflightGuard::new();
        let path = request.uri().path().to_owned();

        let (handler, response) = if path == *self.route_path {
            ("student", self.handle_student(request).await)
        } else if let Some(passthrough) = self
            .passthrough
            .as_ref()
            .filter(|passthrough| passthrough.path() == path)
        {
            ("passthrough", handle_passthrough(passthrough, request).await)
        } else {
            tracing::debug!(method = %request.method(), path = %path, "No route matched");
            ("not_found", make_error_response(StatusCode::NOT_FOUND))
        };

        histogram!(
            REQUEST_DURATION,
            "handler" => handler,
            "status" => response.status().as_str().to_owned()
        )
        .record(started.elapsed().as_secs_f64());

        response
    }

    async fn handle_student<B>(&self, request: Request<B>) -> Response<HandlerBody>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if request.method() != Method::POST {
            return method_not_allowed();
        }

        let credentials = match read_json::<StudentRequest, _>(request.into_body())
            .await
            .and_then(validate_credentials)
        {
            Ok(credentials) => credentials,
            Err(e) => return rejection(e),
        };

        match self.chain.run(credentials).await {
            Ok(aggregated) => make_json_response(StatusCode::OK, &aggregated),
            Err(e) => {
                tracing::error!(step = %e.step(), error = %e, "Student chain failed");
                make_json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &FailureBody {
                        success: false,
                        error: format!("{} failed", e.step()),
                        details: e.to_string(),
                    },
                )
            }
        }
    }
}

async fn handle_passthrough<B>(passthrough: &Passthrough, request: Request<B>) -> Response<HandlerBody>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if request.method() != Method::POST {
        return method_not_allowed();
    }

    let upstream_request = match read_json::<PassthroughRequest, _>(request.into_body())
        .await
        .and_then(|inbound| passthrough.build_request(inbound))
    {
        Ok(upstream_request) => upstream_request,
        Err(e) => return rejection(e),
    };

    match passthrough.forward(upstream_request).await {
        PassthroughReply::Relay(status, payload) => make_json_response(status, &payload),
        PassthroughReply::Error(status, body) => make_json_response(status, &body),
    }
}

impl Service<Request<Incoming>> for OrchestratorService {
    type Response = Response<HandlerBody>;
    type Error = OrchestratorError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.handle(req).await) })
    }
}

/// Collects at most [`MAX_BODY_BYTES`] of `body` and decodes it as JSON.
async fn read_json<T, B>(body: B) -> Result<T, RequestError>
where
    T: DeserializeOwned,
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let bytes = Limited::new(body, MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| RequestError::InvalidBody(e.to_string()))?
        .to_bytes();
    let value: Value =
        serde_json::from_slice(&bytes).map_err(|e| RequestError::InvalidBody(e.to_string()))?;
    if !value.is_object() {
        return Err(RequestError::InvalidBody("expected a JSON object".to_string()));
    }
    serde_json::from_value(value).map_err(|e| RequestError::InvalidBody(e.to_string()))
}

fn validate_credentials(request: StudentRequest) -> Result<InboundCredentials, RequestError> {
    let identifier = request
        .identifier
        .filter(|identifier| !identifier.trim().is_empty())
        .ok_or(RequestError::MissingField("identifier"))?;
    let secret = request
        .secret
        .filter(|secret| !secret.is_empty())
        .ok_or(RequestError::MissingField("secret"))?;

    Ok(InboundCredentials { identifier, secret })
}

fn method_not_allowed() -> Response<HandlerBody> {
    let mut response = make_error_response(StatusCode::METHOD_NOT_ALLOWED);
    response
        .headers_mut()
        .insert(ALLOW, HeaderValue::from_static("POST"));
    response
}

fn rejection(error: RequestError) -> Response<HandlerBody> {
    tracing::info!(error = %error, "Rejected request");
    make_json_response(
        error.status(),
        &ErrorBody {
            error: error.to_string(),
            details: None,
        },
    )
}

struct InflightGuard;

impl InflightGuard {
    fn new() -> Self {
        gauge!(REQUESTS_INFLIGHT).increment(1);
        InflightGuard
    }
}

// Also runs when the connection drops and the request future is cancelled.
impl Drop for InflightGuard {
    fn drop(&mut self) {
        gauge!(REQUESTS_INFLIGHT).decrement(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PassthroughConfig;
    use crate::safe_fetch::Transport;
    use crate::testutils::{
        MockReply, MockTransport, access_key_payload, data_set_a_payload, data_set_b_payload,
        login_payload, test_upstreams,
    };
    use http_body_util::Full;
    use serde_json::json;

    fn happy_transport() -> MockTransport {
        MockTransport::new()
            .with("/login", MockReply::json(200, login_payload()))
            .with("/token", MockReply::json(200, access_key_payload()))
            .with("/rooms", MockReply::json(200, data_set_a_payload()))
            .with("/tasks", MockReply::json(200, data_set_b_payload()))
    }

    fn service(transport: &Arc<MockTransport>) -> OrchestratorService {
        let lookup = |_: &str| Some("sub-key".to_string());
        let shared: Arc<dyn Transport> = transport.clone();
        let chain = Chain::new(test_upstreams("http://upstream.test"), shared.clone(), &lookup)
            .unwrap();
        let passthrough = Passthrough::new(
            &PassthroughConfig {
                path: "/api/proxy".to_string(),
                allowed_hosts: vec![],
            },
            shared,
        );
        OrchestratorService::new("/api/student", Arc::new(chain), Some(Arc::new(passthrough)))
    }

    fn request(method: Method, path: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    fn student_request(body: Value) -> Request<Full<Bytes>> {
        request(Method::POST, "/api/student", &body.to_string())
    }

    async fn json_body(response: Response<HandlerBody>) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_success_response() {
        let transport = Arc::new(happy_transport());
        let response = service(&transport)
            .handle(student_request(json!({"identifier": "1000123456sp", "secret": "s3cret"})))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({
                "success": true,
                "studentInfo": {
                    "name": "Ana Souza",
                    "email": "ana@example.com",
                    "identifier": "7788990"
                },
                "dataSetA": data_set_a_payload(),
                "dataSetB": data_set_b_payload()
            })
        );
    }

    #[tokio::test]
    async fn test_non_post_is_rejected_without_upstream_calls() {
        let transport = Arc::new(happy_transport());
        let service = service(&transport);

        for method in [Method::GET, Method::PUT, Method::DELETE] {
            let response = service
                .handle(request(method, "/api/student", r#"{"identifier":"a","secret":"b"}"#))
                .await;
            assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
            assert_eq!(response.headers().get(ALLOW).unwrap(), "POST");
        }

        let response = service.handle(request(Method::GET, "/api/proxy", "")).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_fields_are_rejected_without_upstream_calls() {
        let transport = Arc::new(happy_transport());
        let service = service(&transport);

        let cases = [
            (json!({"secret": "s3cret"}), "identifier"),
            (json!({"identifier": "1000123456sp"}), "secret"),
            (json!({"identifier": "  ", "secret": "s3cret"}), "identifier"),
            (json!({"identifier": "1000123456sp", "secret": ""}), "secret"),
            (json!({"identifier": null, "secret": "s3cret"}), "identifier"),
            (json!({"identifier": "1000123456sp", "secret": null}), "secret"),
        ];
        for (body, field) in cases {
            let response = service.handle(student_request(body)).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body = json_body(response).await;
            assert_eq!(body["error"], json!(format!("Missing required field: {field}")));
        }

        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_body_is_rejected() {
        let transport = Arc::new(happy_transport());
        let service = service(&transport);

        for body in [
            "not json",
            r#"["1000123456sp", "s3cret"]"#,
            r#"{"identifier": 5, "secret": "x"}"#,
        ] {
            let response = service
                .handle(request(Method::POST, "/api/student", body))
                .await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }

        let oversized = format!(
            r#"{{"identifier": "{}", "secret": "x"}}"#,
            "a".repeat(MAX_BODY_BYTES)
        );
        let response = service
            .handle(request(Method::POST, "/api/student", &oversized))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_step_failure_is_uniform_500() {
        let transport = Arc::new(
            happy_transport().with("/login", MockReply::json(403, json!({"message": "blocked"}))),
        );
        let response = service(&transport)
            .handle(student_request(json!({"identifier": "1000123456sp", "secret": "s3cret"})))
            .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["error"], json!("credential exchange failed"));
        let details = body["details"].as_str().unwrap();
        assert!(details.contains("credential exchange"));
        assert!(!details.contains("s3cret"));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_partial_data_is_never_returned() {
        let transport = Arc::new(
            happy_transport().with("/rooms", MockReply::Fail("connection reset".to_string())),
        );
        let response = service(&transport)
            .handle(student_request(json!({"identifier": "1000123456sp", "secret": "s3cret"})))
            .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["error"], json!("data set A fetch failed"));
        assert!(body.get("dataSetB").is_none());
    }

    #[tokio::test]
    async fn test_passthrough_route() {
        let transport = Arc::new(
            MockTransport::new().with("/v1/ping", MockReply::json(201, json!({"pong": true}))),
        );
        let response = service(&transport)
            .handle(request(
                Method::POST,
                "/api/proxy",
                r#"{"targetUrl": "https://api.example.com/v1/ping", "method": "POST", "body": {}}"#,
            ))
            .await;

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(json_body(response).await, json!({"pong": true}));

        let response = service(&transport)
            .handle(request(Method::POST, "/api/proxy", r#"{"method": "GET"}"#))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await,
            json!({"error": "Missing required field: targetUrl"})
        );
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let transport = Arc::new(happy_transport());
        let response = service(&transport)
            .handle(request(Method::POST, "/somewhere", "{}"))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(transport.call_count(), 0);
    }
}
