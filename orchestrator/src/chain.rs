//! The student chain: credential exchange, token exchange, then two data
//! fetches in parallel, aggregated into a single response.
//!
//! Each [`Stage`] is advanced by exactly one transition. The first error ends
//! the invocation; there is no retry and no partial result.

use crate::config::{Upstreams, ValidationError};
use crate::errors::ChainError;
use crate::metrics_defs::CHAIN_FAILURES;
use crate::safe_fetch::{Transport, UpstreamRequest, safe_fetch};
use crate::types::{
    AccessKey, AggregatedResponse, InboundCredentials, SessionToken, Step, StudentIdentifier,
    StudentInfo,
};
use http::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use http::Method;
use serde_json::{Map, Value, json};
use shared::counter;
use std::sync::Arc;

/// What the credential exchange yields for the rest of the chain.
#[derive(Clone, Debug)]
pub struct Session {
    pub token: SessionToken,
    pub student_id: StudentIdentifier,
    pub name: Value,
    pub email: Value,
}

/// Position of one invocation in the chain.
#[derive(Debug)]
pub enum Stage {
    CredentialExchange(InboundCredentials),
    TokenExchange(Session),
    DataFetch {
        session: Session,
        access_key: AccessKey,
    },
    Aggregated(AggregatedResponse),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::CredentialExchange(_) => "credential_exchange",
            Stage::TokenExchange(_) => "token_exchange",
            Stage::DataFetch { .. } => "data_fetch",
            Stage::Aggregated(_) => "aggregated",
        }
    }
}

/// Fixed headers for each upstream, resolved once at startup.
#[derive(Clone, Debug)]
struct ResolvedHeaders {
    credential_exchange: HeaderMap,
    token_exchange: HeaderMap,
    data_set_a: HeaderMap,
    data_set_b: HeaderMap,
}

pub struct Chain {
    transport: Arc<dyn Transport>,
    upstreams: Upstreams,
    headers: ResolvedHeaders,
    api_key_header: HeaderName,
}

impl Chain {
    /// Builds the chain, resolving `env` header sources through `lookup`.
    pub fn new<F>(
        upstreams: Upstreams,
        transport: Arc<dyn Transport>,
        lookup: &F,
    ) -> Result<Self, ValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let headers = ResolvedHeaders {
            credential_exchange: upstreams
                .credential_exchange
                .endpoint
                .resolve_headers(lookup)?,
            token_exchange: upstreams.token_exchange.endpoint.resolve_headers(lookup)?,
            data_set_a: upstreams.data_set_a.endpoint.resolve_headers(lookup)?,
            data_set_b: upstreams.data_set_b.endpoint.resolve_headers(lookup)?,
        };
        let api_key_header = HeaderName::from_bytes(upstreams.data_set_b.api_key_header.as_bytes())
            .map_err(|_| {
                ValidationError::InvalidHeaderName(upstreams.data_set_b.api_key_header.clone())
            })?;

        Ok(Self {
            transport,
            upstreams,
            headers,
            api_key_header,
        })
    }

    /// Runs the whole chain for one invocation.
    pub async fn run(
        &self,
        credentials: InboundCredentials,
    ) -> Result<AggregatedResponse, ChainError> {
        let mut stage = Stage::CredentialExchange(credentials);
        loop {
            stage = match stage {
                Stage::Aggregated(response) => return Ok(response),
                current => match self.advance(current).await {
                    Ok(next) => next,
                    Err(e) => {
                        counter!(CHAIN_FAILURES, "step" => e.step().label()).increment(1);
                        return Err(e);
                    }
                },
            };
        }
    }

    /// Performs the single transition out of `stage`.
    pub async fn advance(&self, stage: Stage) -> Result<Stage, ChainError> {
        tracing::debug!(stage = stage.name(), "Advancing chain");

        match stage {
            Stage::CredentialExchange(credentials) => {
                let session = self.credential_exchange(credentials).await?;
                Ok(Stage::TokenExchange(session))
            }
            Stage::TokenExchange(session) => {
                let access_key = self.token_exchange(&session.token).await?;
                Ok(Stage::DataFetch {
                    session,
                    access_key,
                })
            }
            Stage::DataFetch {
                session,
                access_key,
            } => {
                let (data_set_a, data_set_b) = self.fetch_data_sets(&session, &access_key).await?;
                Ok(Stage::Aggregated(AggregatedResponse {
                    success: true,
                    student_info: StudentInfo {
                        name: session.name,
                        email: session.email,
                        identifier: session.student_id.0,
                    },
                    data_set_a,
                    data_set_b,
                }))
            }
            aggregated @ Stage::Aggregated(_) => Ok(aggregated),
        }
    }

    async fn credential_exchange(
        &self,
        credentials: InboundCredentials,
    ) -> Result<Session, ChainError> {
        let step = Step::CredentialExchange;
        let config = &self.upstreams.credential_exchange;

        let mut body = Map::new();
        body.insert(
            config.identifier_field.clone(),
            Value::String(credentials.identifier),
        );
        body.insert(config.secret_field.clone(), Value::String(credentials.secret));

        let request = UpstreamRequest::json(
            Method::POST,
            config.endpoint.url.clone(),
            self.headers.credential_exchange.clone(),
            &Value::Object(body),
        );
        let payload = safe_fetch(self.transport.as_ref(), request, step).await?;

        let token = payload
            .pointer(&config.token_pointer)
            .and_then(header_safe_string)
            .ok_or(ChainError::MissingField {
                step,
                field: "token",
            })?;

        let student_id = payload
            .pointer(&config.student_list_pointer)
            .and_then(Value::as_array)
            .and_then(|students| students.first())
            .and_then(|first| first.get(&config.student_id_field))
            .and_then(identifier_string)
            .ok_or(ChainError::MissingField {
                step,
                field: "student identifier",
            })?;

        let field = |pointer: &str| payload.pointer(pointer).cloned().unwrap_or(Value::Null);

        Ok(Session {
            token: SessionToken(token),
            student_id: StudentIdentifier(student_id),
            name: field(&config.name_pointer),
            email: field(&config.email_pointer),
        })
    }

    async fn token_exchange(&self, token: &SessionToken) -> Result<AccessKey, ChainError> {
        let step = Step::TokenExchange;
        let config = &self.upstreams.token_exchange;

        let request = UpstreamRequest::json(
            Method::POST,
            config.endpoint.url.clone(),
            self.headers.token_exchange.clone(),
            &json!({ "token": token.0 }),
        );
        let payload = safe_fetch(self.transport.as_ref(), request, step).await?;

        payload
            .pointer(&config.key_pointer)
            .and_then(header_safe_string)
            .map(AccessKey)
            .ok_or(ChainError::MissingField {
                step,
                field: "access key",
            })
    }

    /// Both fetches run concurrently; the first failure drops the other.
    async fn fetch_data_sets(
        &self,
        session: &Session,
        access_key: &AccessKey,
    ) -> Result<(Value, Value), ChainError> {
        let config_a = &self.upstreams.data_set_a;
        let mut url_a = config_a.endpoint.url.clone();
        url_a
            .query_pairs_mut()
            .append_pair(&config_a.student_id_param, &session.student_id.0);
        let mut headers_a = self.headers.data_set_a.clone();
        let bearer = format!("Bearer {}", session.token.0);
        headers_a.insert(
            AUTHORIZATION,
            sensitive_value(&bearer, Step::CredentialExchange, "token")?,
        );

        let mut headers_b = self.headers.data_set_b.clone();
        headers_b.insert(
            self.api_key_header.clone(),
            sensitive_value(&access_key.0, Step::TokenExchange, "access key")?,
        );

        let transport = self.transport.as_ref();
        let (data_set_a, data_set_b) = tokio::try_join!(
            safe_fetch(transport, UpstreamRequest::get(url_a, headers_a), Step::DataSetA),
            safe_fetch(
                transport,
                UpstreamRequest::get(self.upstreams.data_set_b.endpoint.url.clone(), headers_b),
                Step::DataSetB,
            ),
        )?;

        Ok((data_set_a, data_set_b))
    }
}

/// A non-empty string that can be carried in a header value.
fn header_safe_string(value: &Value) -> Option<String> {
    value
        .as_str()
        .filter(|s| !s.is_empty() && HeaderValue::from_str(s).is_ok())
        .map(str::to_string)
}

/// Identifiers may come back as strings or numbers.
fn identifier_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn sensitive_value(
    raw: &str,
    step: Step,
    field: &'static str,
) -> Result<HeaderValue, ChainError> {
    let mut value =
        HeaderValue::from_str(raw).map_err(|_| ChainError::MissingField { step, field })?;
    value.set_sensitive(true);
    Ok(value)
}
