//! IAM policy document structure
//!
//! The generic policy shape shared by every IAM-capable resource:
//! bindings of roles to members, per-service audit configuration, and an
//! etag used by the API to detect concurrent writers.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Policy version requested on reads and set on writes (needed for conditions)
pub const IAM_POLICY_VERSION: i32 = 3;

/// Opaque concurrency token, base64 on the wire
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Etag(Vec<u8>);

impl Etag {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Etag(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for Etag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Etag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Etag)
            .map_err(serde::de::Error::custom)
    }
}

/// Condition attached to a binding
///
/// Opaque to merge logic; it only participates in binding identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expr {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    pub expression: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Expr {
    pub fn new(title: impl Into<String>, expression: impl Into<String>) -> Self {
        Expr {
            title: title.into(),
            description: String::new(),
            expression: expression.into(),
            location: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Grants a role to a set of members, optionally under a condition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Binding {
    pub role: String,

    /// Principals such as `user:alice@example.com`; semantically a set
    #[serde(default)]
    pub members: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Expr>,
}

impl Binding {
    pub fn new<I, S>(role: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Binding {
            role: role.into(),
            members: members.into_iter().map(Into::into).collect(),
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: Expr) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// Members exempted from one log type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogConfig {
    /// e.g. `DATA_READ`, `DATA_WRITE`, `ADMIN_READ`
    pub log_type: String,

    #[serde(default)]
    pub exempted_members: Vec<String>,
}

impl AuditLogConfig {
    pub fn new<I, S>(log_type: impl Into<String>, exempted_members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AuditLogConfig {
            log_type: log_type.into(),
            exempted_members: exempted_members.into_iter().map(Into::into).collect(),
        }
    }
}

/// Audit logging configuration for one service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditConfig {
    /// Service name, or `allServices`
    pub service: String,

    #[serde(default)]
    pub audit_log_configs: Vec<AuditLogConfig>,
}

impl AuditConfig {
    pub fn new(service: impl Into<String>, audit_log_configs: Vec<AuditLogConfig>) -> Self {
        AuditConfig {
            service: service.into(),
            audit_log_configs,
        }
    }
}

/// Complete IAM policy document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[serde(default)]
    pub version: i32,

    #[serde(default, skip_serializing_if = "Etag::is_empty")]
    pub etag: Etag,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<Binding>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audit_configs: Vec<AuditConfig>,
}

impl Policy {
    /// Create a new empty policy
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding to this policy
    pub fn add_binding(&mut self, binding: Binding) {
        self.bindings.push(binding);
    }

    /// Add an audit config to this policy
    pub fn add_audit_config(&mut self, audit_config: AuditConfig) {
        self.audit_configs.push(audit_config);
    }

    /// Parse policy from JSON; unknown fields are dropped
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize policy to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Structural equality ignoring binding order, member order and duplicates
    pub fn is_equivalent(&self, other: &Policy) -> bool {
        super::merge::compare_policies(self, other)
    }
}
