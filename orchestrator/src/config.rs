use http::header::{HeaderMap, HeaderName, HeaderValue};
use indexmap::IndexMap;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Upstream timeout cannot be 0")]
    InvalidTimeout,

    #[error("Route path must start with '/': {0}")]
    InvalidRoutePath(String),

    #[error("Route path is used twice: {0}")]
    DuplicateRoutePath(String),

    #[error("Invalid JSON pointer for {field}: {pointer}")]
    InvalidPointer { field: &'static str, pointer: String },

    #[error("Empty request field name: {0}")]
    EmptyFieldName(&'static str),

    #[error("Invalid header name: {0}")]
    InvalidHeaderName(String),

    #[error("Invalid value for header {0}")]
    InvalidHeaderValue(String),

    #[error("Environment variable {env} for header {header} is not set")]
    MissingEnvVar { header: String, env: String },
}

/// Orchestrator configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Main listener for incoming requests
    pub listener: Listener,
    /// Admin listener for health and readiness probes
    pub admin_listener: Listener,
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Path of the aggregated student endpoint
    #[serde(default = "default_route_path")]
    pub route_path: String,
    pub upstreams: Upstreams,
    /// Single-call proxy endpoint. Disabled when absent.
    #[serde(default)]
    pub passthrough: Option<PassthroughConfig>,
}

fn default_route_path() -> String {
    "/api/student".to_string()
}

impl Config {
    /// Validates the orchestrator configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;
        if self.timeouts.http_timeout_secs == 0 {
            return Err(ValidationError::InvalidTimeout);
        }

        validate_route_path(&self.route_path)?;
        if let Some(passthrough) = &self.passthrough {
            validate_route_path(&passthrough.path)?;
            if passthrough.path == self.route_path {
                return Err(ValidationError::DuplicateRoutePath(passthrough.path.clone()));
            }
        }

        self.upstreams.validate()
    }
}

fn validate_route_path(path: &str) -> Result<(), ValidationError> {
    if !path.starts_with('/') {
        return Err(ValidationError::InvalidRoutePath(path.to_string()));
    }
    Ok(())
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Timeouts {
    /// Deadline for a single upstream call, including reading the body
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

fn default_http_timeout_secs() -> u64 {
    30
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

/// Where a header value comes from.
///
/// Secrets such as subscription keys should use the `env` form so they never
/// appear in the config file:
///
/// ```yaml
/// headers:
///   User-Agent: "Mozilla/5.0"
///   Ocp-Apim-Subscription-Key: { env: CREDENTIALS_SUBSCRIPTION_KEY }
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum HeaderSource {
    Literal(String),
    Env { env: String },
}

/// An upstream URL plus the fixed headers sent with every call to it
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Endpoint {
    pub url: Url,
    #[serde(default)]
    pub headers: IndexMap<String, HeaderSource>,
}

impl Endpoint {
    fn validate(&self) -> Result<(), ValidationError> {
        for (name, source) in &self.headers {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ValidationError::InvalidHeaderName(name.clone()))?;
            if let HeaderSource::Literal(value) = source {
                HeaderValue::from_str(value)
                    .map_err(|_| ValidationError::InvalidHeaderValue(name.clone()))?;
            }
        }
        Ok(())
    }

    /// Builds the header map, reading `env` sources through `lookup`.
    pub fn resolve_headers<F>(&self, lookup: &F) -> Result<HeaderMap, ValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, source) in &self.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ValidationError::InvalidHeaderName(name.clone()))?;

            let value = match source {
                HeaderSource::Literal(value) => HeaderValue::from_str(value),
                HeaderSource::Env { env } => {
                    let raw = lookup(env).ok_or_else(|| ValidationError::MissingEnvVar {
                        header: name.clone(),
                        env: env.clone(),
                    })?;
                    HeaderValue::from_str(&raw).map(|mut value| {
                        value.set_sensitive(true);
                        value
                    })
                }
            }
            .map_err(|_| ValidationError::InvalidHeaderValue(name.clone()))?;

            headers.insert(header_name, value);
        }
        Ok(headers)
    }
}

/// The four upstream calls of the student chain
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Upstreams {
    pub credential_exchange: CredentialExchangeConfig,
    pub token_exchange: TokenExchangeConfig,
    pub data_set_a: DataSetAConfig,
    pub data_set_b: DataSetBConfig,
}

impl Upstreams {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let login = &self.credential_exchange;
        login.endpoint.validate()?;
        if login.identifier_field.is_empty() {
            return Err(ValidationError::EmptyFieldName("identifier_field"));
        }
        if login.secret_field.is_empty() {
            return Err(ValidationError::EmptyFieldName("secret_field"));
        }
        if login.student_id_field.is_empty() {
            return Err(ValidationError::EmptyFieldName("student_id_field"));
        }
        validate_pointer("token_pointer", &login.token_pointer)?;
        validate_pointer("student_list_pointer", &login.student_list_pointer)?;
        validate_pointer("name_pointer", &login.name_pointer)?;
        validate_pointer("email_pointer", &login.email_pointer)?;

        self.token_exchange.endpoint.validate()?;
        validate_pointer("key_pointer", &self.token_exchange.key_pointer)?;

        self.data_set_a.endpoint.validate()?;
        if self.data_set_a.student_id_param.is_empty() {
            return Err(ValidationError::EmptyFieldName("student_id_param"));
        }

        self.data_set_b.endpoint.validate()?;
        HeaderName::from_bytes(self.data_set_b.api_key_header.as_bytes())
            .map_err(|_| ValidationError::InvalidHeaderName(self.data_set_b.api_key_header.clone()))?;

        Ok(())
    }
}

/// A JSON pointer is either empty (the whole document) or starts with '/'.
fn validate_pointer(field: &'static str, pointer: &str) -> Result<(), ValidationError> {
    if pointer.is_empty() || pointer.starts_with('/') {
        Ok(())
    } else {
        Err(ValidationError::InvalidPointer {
            field,
            pointer: pointer.to_string(),
        })
    }
}

/// Step 1: trades identifier/secret for a session token
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CredentialExchangeConfig {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    /// Request body field carrying the inbound identifier
    #[serde(default = "default_identifier_field")]
    pub identifier_field: String,
    /// Request body field carrying the inbound secret
    #[serde(default = "default_secret_field")]
    pub secret_field: String,
    #[serde(default = "default_token_pointer")]
    pub token_pointer: String,
    /// Points at the list whose first element holds the student identifier
    #[serde(default = "default_student_list_pointer")]
    pub student_list_pointer: String,
    #[serde(default = "default_student_id_field")]
    pub student_id_field: String,
    #[serde(default = "default_name_pointer")]
    pub name_pointer: String,
    #[serde(default = "default_email_pointer")]
    pub email_pointer: String,
}

fn default_identifier_field() -> String {
    "user".to_string()
}

fn default_secret_field() -> String {
    "password".to_string()
}

fn default_token_pointer() -> String {
    "/token".to_string()
}

fn default_student_list_pointer() -> String {
    "/students".to_string()
}

fn default_student_id_field() -> String {
    "id".to_string()
}

fn default_name_pointer() -> String {
    "/name".to_string()
}

fn default_email_pointer() -> String {
    "/email".to_string()
}

/// Step 2: trades the session token for a second access key
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TokenExchangeConfig {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    #[serde(default = "default_token_pointer")]
    pub key_pointer: String,
}

/// Step 3a: data fetched with the session token as bearer credential
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct DataSetAConfig {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    #[serde(default = "default_student_id_param")]
    pub student_id_param: String,
}

fn default_student_id_param() -> String {
    "studentId".to_string()
}

/// Step 3b: data fetched with the second access key in a custom header
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct DataSetBConfig {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
}

fn default_api_key_header() -> String {
    "x-api-key".to_string()
}

/// Single-call proxy configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct PassthroughConfig {
    #[serde(default = "default_passthrough_path")]
    pub path: String,
    /// Hosts the proxy may call. Empty allows any host.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
}

fn default_passthrough_path() -> String {
    "/api/proxy".to_string()
}
