pub mod chain;
pub mod config;
pub mod errors;
pub mod metrics_defs;
pub mod passthrough;
pub mod safe_fetch;
pub mod service;
pub mod types;

#[cfg(test)]
mod testutils;

use chain::Chain;
use errors::{OrchestratorError, Result};
use passthrough::Passthrough;
use safe_fetch::{ReqwestTransport, Transport};
use service::OrchestratorService;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;

/// Serves the orchestrator and its admin endpoints until either listener fails.
pub async fn run(config: config::Config) -> Result<()> {
    config.validate()?;
    let service = build_service(&config, &|name: &str| std::env::var(name).ok())?;

    let orchestrator_task =
        run_http_service(&config.listener.host, config.listener.port, service);
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        AdminService::<_, OrchestratorError>::new(|| true),
    );

    tokio::try_join!(orchestrator_task, admin_task)?;
    Ok(())
}

/// Wires the transport, chain and passthrough proxy from `config`.
///
/// Header values sourced from the environment are read through `lookup`; a
/// missing variable is a configuration error.
pub fn build_service<F>(
    config: &config::Config,
    lookup: &F,
) -> Result<OrchestratorService>
where
    F: Fn(&str) -> Option<String>,
{
    let transport: Arc<dyn Transport> =
        Arc::new(ReqwestTransport::new(config.timeouts.http_timeout_secs)?);

    let chain = Chain::new(config.upstreams.clone(), transport.clone(), lookup)?;
    let passthrough = config
        .passthrough
        .as_ref()
        .map(|passthrough| Arc::new(Passthrough::new(passthrough, transport.clone())));

    tracing::info!(
        route_path = %config.route_path,
        passthrough = ?config.passthrough.as_ref().map(|p| p.path.as_str()),
        timeout_secs = config.timeouts.http_timeout_secs,
        "Orchestrator configured"
    );

    Ok(OrchestratorService::new(
        &config.route_path,
        Arc::new(chain),
        passthrough,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{start_mock_server, test_upstreams};
    use http_body_util::{BodyExt, Full};
    use hyper::body::Bytes;
    use hyper::{Method, Request, StatusCode};
    use serde_json::{Value, json};
    use std::time::Duration;

    fn test_config(upstream_port: u16) -> config::Config {
        config::Config {
            listener: config::Listener {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            admin_listener: config::Listener {
                host: "127.0.0.1".to_string(),
                port: 3001,
            },
            timeouts: config::Timeouts {
                http_timeout_secs: 5,
            },
            route_path: "/api/student".to_string(),
            upstreams: test_upstreams(&format!("http://127.0.0.1:{upstream_port}")),
            passthrough: None,
        }
    }

    #[test]
    fn test_build_service_requires_env_secrets() {
        let config = test_config(8080);
        let result = build_service(&config, &|_: &str| None);
        assert!(matches!(
            result,
            Err(OrchestratorError::Config(
                config::ValidationError::MissingEnvVar { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn test_end_to_end_over_http() {
        // One upstream server answers all four steps, keyed by path
        let port = start_mock_server(|req| {
            let body = match req.uri().path() {
                "/login" => json!({
                    "token": "session-token",
                    "name": "Ana Souza",
                    "email": "ana@example.com",
                    "students": [{"id": "7788990"}]
                }),
                "/token" => json!({"token": "access-key"}),
                "/rooms" => json!({"rooms": ["3A"]}),
                "/tasks" => json!([{"id": "t-1"}]),
                _ => json!({"error": "unknown"}),
            };
            (200, body.to_string(), Duration::ZERO)
        })
        .await;

        let service = build_service(&test_config(port), &|_: &str| {
            Some("sub-key".to_string())
        })
        .unwrap();

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/student")
            .body(Full::new(Bytes::from(
                r#"{"identifier": "1000123456sp", "secret": "s3cret"}"#,
            )))
            .unwrap();
        let response = service.handle(request).await;

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["studentInfo"]["identifier"], json!("7788990"));
        assert_eq!(body["dataSetA"], json!({"rooms": ["3A"]}));
        assert_eq!(body["dataSetB"], json!([{"id": "t-1"}]));
    }
}
