use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identifies which stage of the chain produced an outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Step {
    CredentialExchange,
    TokenExchange,
    DataSetA,
    DataSetB,
    Passthrough,
}

impl Step {
    pub const fn label(&self) -> &'static str {
        match self {
            Step::CredentialExchange => "credential exchange",
            Step::TokenExchange => "token exchange",
            Step::DataSetA => "data set A fetch",
            Step::DataSetB => "data set B fetch",
            Step::Passthrough => "passthrough",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Body of a student request as received. `null` and absent fields are
/// both `None`.
#[derive(Deserialize)]
pub struct StudentRequest {
    pub identifier: Option<String>,
    pub secret: Option<String>,
}

/// Identifier/secret pair supplied by the caller, both non-empty.
#[derive(Clone)]
pub struct InboundCredentials {
    pub identifier: String,
    pub secret: String,
}

// Keeps the secret out of logs and panic messages.
impl fmt::Debug for InboundCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundCredentials")
            .field("identifier", &self.identifier)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Bearer credential returned by the credential exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(pub String);

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(<redacted>)")
    }
}

/// Second, differently scoped key returned by the token exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessKey(pub String);

impl fmt::Debug for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessKey(<redacted>)")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StudentIdentifier(pub String);

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StudentInfo {
    pub name: Value,
    pub email: Value,
    pub identifier: String,
}

/// Success variant of the aggregated response.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedResponse {
    pub success: bool,
    pub student_info: StudentInfo,
    pub data_set_a: Value,
    pub data_set_b: Value,
}

/// Failure variant of the aggregated response.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FailureBody {
    pub success: bool,
    pub error: String,
    pub details: String,
}

/// Body used for rejections that happen before any upstream call, and by the
/// passthrough proxy.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}
