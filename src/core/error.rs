use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IamError {
    /// Error response returned by the cloud API
    #[error("API error {code}: {message}")]
    Api { code: u16, message: String },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Error retrieving IAM policy for {resource}: {source}")]
    Read {
        resource: String,
        #[source]
        source: Box<IamError>,
    },

    #[error("Error applying IAM policy for {resource}: {source}")]
    Apply {
        resource: String,
        #[source]
        source: Box<IamError>,
    },

    #[error("Error applying IAM policy to {resource}: Too many conflicts. Latest error: {source}")]
    TooManyConflicts {
        resource: String,
        #[source]
        source: Box<IamError>,
    },

    #[error("Error applying IAM policy to {resource}: Waited too long for propagation")]
    PropagationTimeout { resource: String },

    #[error("Empty IAM policy returned for {0}")]
    EmptyPolicy(String),

    #[error("Invalid IAM policy: {0}")]
    InvalidPolicy(String),

    #[error("Batch {batch_key:?} for request {debug_id:?} returned error: {source}. To debug individual requests, try disabling batching")]
    Batch {
        batch_key: String,
        debug_id: String,
        #[source]
        source: Arc<IamError>,
    },

    #[error("Request {batch_key} timed out after {timeout:?}")]
    BatchTimeout { batch_key: String, timeout: Duration },

    #[error("Unable to extend existing batch {batch_key:?} with request {debug_id:?}: {source}")]
    Combine {
        batch_key: String,
        debug_id: String,
        #[source]
        source: Box<IamError>,
    },

    #[error("Request batcher {0:?} is stopped")]
    BatcherStopped(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, IamError>;

fn quota_per_minute_regex() -> &'static Regex {
    static QUOTA: OnceLock<Regex> = OnceLock::new();
    QUOTA.get_or_init(|| {
        Regex::new(r"Quota exceeded for quota metric '(?P<metric>.*)' and limit '(?P<limit>.* per minute)' of service")
            .expect("quota pattern is valid")
    })
}

impl IamError {
    /// Shorthand for an API error response
    pub fn api(code: u16, message: impl Into<String>) -> Self {
        IamError::Api {
            code,
            message: message.into(),
        }
    }

    /// The innermost API error, looking through engine and batch wrappers
    pub fn root(&self) -> &IamError {
        match self {
            IamError::Read { source, .. }
            | IamError::Apply { source, .. }
            | IamError::TooManyConflicts { source, .. }
            | IamError::Combine { source, .. } => source.root(),
            IamError::Batch { source, .. } => source.root(),
            other => other,
        }
    }

    /// HTTP status code of the underlying API error, if any
    pub fn code(&self) -> Option<u16> {
        match self.root() {
            IamError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    fn api_message(&self) -> Option<&str> {
        match self.root() {
            IamError::Api { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Quota exhaustion: 429, or a 403 carrying a per-minute quota message
    pub fn is_quota(&self) -> bool {
        match (self.code(), self.api_message()) {
            (Some(429), _) => true,
            (Some(403), Some(message)) => quota_per_minute_regex().is_match(message),
            _ => false,
        }
    }

    /// The write's base policy is stale (409 conflict or 412 precondition failed)
    pub fn is_conflict(&self) -> bool {
        matches!(self.code(), Some(409) | Some(412))
    }

    /// A member of the written policy names a service account that no longer exists
    pub fn is_service_account_not_found(&self) -> bool {
        match (self.code(), self.api_message()) {
            (Some(400), Some(message)) => {
                message.contains("Service account") && message.contains("does not exist")
            }
            _ => false,
        }
    }

    /// Quota limit named by a per-minute 403 quota message
    pub(crate) fn quota_limit(&self) -> Option<String> {
        let message = self.api_message()?;
        quota_per_minute_regex()
            .captures(message)
            .and_then(|caps| caps.name("limit"))
            .map(|m| m.as_str().to_string())
    }
}
