//! Merge algorithms for bindings and audit configs
//!
//! Bindings are keyed by role plus condition; audit configs by service and
//! log type. Every function goes through an ordered map, so output is sorted
//! and deterministic, member lists are deduplicated, and keys left without
//! members disappear.

use super::{AuditConfig, AuditLogConfig, Binding, Expr, Policy};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct ConditionKey {
    title: String,
    description: String,
    expression: String,
}

impl ConditionKey {
    fn from_condition(condition: Option<&Expr>) -> Self {
        match condition {
            Some(expr) => ConditionKey {
                title: expr.title.clone(),
                description: expr.description.clone(),
                expression: expr.expression.clone(),
            },
            None => ConditionKey::default(),
        }
    }

    fn to_condition(&self) -> Option<Expr> {
        if *self == ConditionKey::default() {
            return None;
        }
        Some(Expr {
            title: self.title.clone(),
            description: self.description.clone(),
            expression: self.expression.clone(),
            location: None,
        })
    }
}

/// Identity of a binding: role plus condition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct BindingKey {
    role: String,
    condition: ConditionKey,
}

impl BindingKey {
    fn of(binding: &Binding) -> Self {
        BindingKey {
            role: binding.role.clone(),
            condition: ConditionKey::from_condition(binding.condition.as_ref()),
        }
    }

    fn to_binding(&self, members: &BTreeSet<String>) -> Binding {
        Binding {
            role: self.role.clone(),
            members: members.iter().cloned().collect(),
            condition: self.condition.to_condition(),
        }
    }
}

type BindingMap = BTreeMap<BindingKey, BTreeSet<String>>;

/// service -> log type -> exempted members
type AuditConfigMap = BTreeMap<String, BTreeMap<String, BTreeSet<String>>>;

fn member_is_case_sensitive(member: &str) -> bool {
    member.contains("allAuthenticatedUsers")
        || member.contains("allUsers")
        || member.starts_with("principalSet:")
        || member.starts_with("principal:")
        || member.starts_with("principalHierarchy:")
}

/// Lower-case the value part of a `<type>:<value>` member
///
/// The type prefix is always preserved, as is any `deleted:` marker.
/// Special and workload-identity principals are case sensitive and kept
/// as is.
pub fn normalize_member_casing(member: &str) -> String {
    if let Some(rest) = member.strip_prefix("deleted:") {
        if member_is_case_sensitive(rest) {
            return member.to_string();
        }
        return match rest.split_once(':') {
            Some((kind, value)) => format!("deleted:{}:{}", kind, value.to_lowercase()),
            None => member.to_string(),
        };
    }

    if member_is_case_sensitive(member) {
        return member.to_string();
    }
    match member.split_once(':') {
        Some((kind, value)) => format!("{}:{}", kind, value.to_lowercase()),
        None => member.to_string(),
    }
}

fn create_bindings_map(bindings: &[Binding]) -> BindingMap {
    let mut map = BindingMap::new();
    for binding in bindings {
        let key = BindingKey::of(binding);
        let members = map.entry(key.clone()).or_default();
        members.extend(binding.members.iter().map(|m| normalize_member_casing(m)));
        if members.is_empty() {
            map.remove(&key);
        }
    }
    map
}

fn list_from_bindings_map(map: &BindingMap) -> Vec<Binding> {
    map.iter()
        .filter(|(_, members)| !members.is_empty())
        .map(|(key, members)| key.to_binding(members))
        .collect()
}

/// Flatten bindings so each role+condition has a single binding
pub fn merge_bindings(bindings: &[Binding]) -> Vec<Binding> {
    list_from_bindings_map(&create_bindings_map(bindings))
}

/// Replace the binding with the same role and condition in place, or append
///
/// Used to set a role's membership to exactly the given members.
pub fn overwrite_binding(mut bindings: Vec<Binding>, new_binding: Binding) -> Vec<Binding> {
    let key = BindingKey::of(&new_binding);
    match bindings.iter().position(|b| BindingKey::of(b) == key) {
        Some(idx) => bindings[idx] = new_binding,
        None => bindings.push(new_binding),
    }
    bindings
}

/// Remove a single role+condition binding
pub fn filter_bindings_with_role_and_condition(
    bindings: &[Binding],
    role: &str,
    condition: Option<&Expr>,
) -> Vec<Binding> {
    let mut map = create_bindings_map(bindings);
    map.remove(&BindingKey {
        role: role.to_string(),
        condition: ConditionKey::from_condition(condition),
    });
    list_from_bindings_map(&map)
}

/// Remove the given role+condition/member pairs
pub fn subtract_from_bindings(bindings: &[Binding], to_remove: &[Binding]) -> Vec<Binding> {
    let mut current = create_bindings_map(bindings);
    for (key, remove_set) in create_bindings_map(to_remove) {
        if let Some(members) = current.get_mut(&key) {
            for member in &remove_set {
                members.remove(member);
            }
            if members.is_empty() {
                current.remove(&key);
            }
        }
    }
    list_from_bindings_map(&current)
}

/// Equal as sets of role+condition/member pairs
pub fn compare_bindings(a: &[Binding], b: &[Binding]) -> bool {
    create_bindings_map(a) == create_bindings_map(b)
}

/// Members present in exactly one of the two binding lists, per role+condition
pub fn missing_bindings(a: &[Binding], b: &[Binding]) -> Vec<Binding> {
    let a_map = create_bindings_map(a);
    let b_map = create_bindings_map(b);

    let mut results = BindingMap::new();
    for (key, a_members) in &a_map {
        match b_map.get(key) {
            Some(b_members) => {
                let diff: BTreeSet<String> =
                    a_members.symmetric_difference(b_members).cloned().collect();
                if !diff.is_empty() {
                    results.insert(key.clone(), diff);
                }
            }
            None => {
                results.insert(key.clone(), a_members.clone());
            }
        }
    }
    for (key, b_members) in &b_map {
        if !a_map.contains_key(key) {
            results.insert(key.clone(), b_members.clone());
        }
    }
    list_from_bindings_map(&results)
}

fn create_audit_configs_map(audit_configs: &[AuditConfig]) -> AuditConfigMap {
    let mut map = AuditConfigMap::new();
    for config in audit_configs {
        let log_types = map.entry(config.service.clone()).or_default();
        for log_config in &config.audit_log_configs {
            log_types
                .entry(log_config.log_type.clone())
                .or_default()
                .extend(log_config.exempted_members.iter().cloned());
        }
    }
    map
}

fn list_from_audit_configs_map(map: &AuditConfigMap) -> Vec<AuditConfig> {
    map.iter()
        .filter(|(_, log_types)| !log_types.is_empty())
        .map(|(service, log_types)| AuditConfig {
            service: service.clone(),
            audit_log_configs: log_types
                .iter()
                .map(|(log_type, members)| AuditLogConfig {
                    log_type: log_type.clone(),
                    exempted_members: members.iter().cloned().collect(),
                })
                .collect(),
        })
        .collect()
}

/// Flatten audit configs so each service has one entry and each
/// (service, log type) pair one log config with the union of exemptions
pub fn merge_audit_configs(audit_configs: &[AuditConfig]) -> Vec<AuditConfig> {
    list_from_audit_configs_map(&create_audit_configs_map(audit_configs))
}

/// Drop every audit config for `service`
pub fn remove_all_audit_configs_with_service(
    audit_configs: &[AuditConfig],
    service: &str,
) -> Vec<AuditConfig> {
    let mut map = create_audit_configs_map(audit_configs);
    map.remove(service);
    list_from_audit_configs_map(&map)
}

/// Equal as sets of (service, log type, exempted member)
pub fn compare_audit_configs(a: &[AuditConfig], b: &[AuditConfig]) -> bool {
    create_audit_configs_map(a) == create_audit_configs_map(b)
}

/// Same etag, version, bindings and audit configs, ignoring ordering
pub fn compare_policies(a: &Policy, b: &Policy) -> bool {
    if a.etag != b.etag {
        debug!("policies etag differ: {:?} vs {:?}", a.etag, b.etag);
        return false;
    }
    if a.version != b.version {
        debug!("policies version differ: {} vs {}", a.version, b.version);
        return false;
    }
    if !compare_bindings(&a.bindings, &b.bindings) {
        debug!("policies bindings differ: {:?} vs {:?}", a.bindings, b.bindings);
        return false;
    }
    if !compare_audit_configs(&a.audit_configs, &b.audit_configs) {
        debug!(
            "policies audit configs differ: {:?} vs {:?}",
            a.audit_configs, b.audit_configs
        );
        return false;
    }
    true
}
