//! Policy modify-functions
//!
//! A [`ModifyFn`] mutates a freshly read policy in place. It must be
//! idempotent: the engine re-applies it after a conflict, and uses
//! "applying it again changes nothing" to confirm that a write has
//! propagated. The engine cannot check this; every constructor here is
//! idempotent because it rebuilds the affected section through a merge.

use super::merge::{
    filter_bindings_with_role_and_condition, merge_audit_configs, merge_bindings,
    overwrite_binding, remove_all_audit_configs_with_service, subtract_from_bindings,
};
use super::{AuditConfig, Binding, Expr, Policy, IAM_POLICY_VERSION};
use crate::error::Result;
use std::sync::Arc;

/// Caller-supplied policy mutation
pub type ModifyFn = Arc<dyn Fn(&mut Policy) -> Result<()> + Send + Sync>;

/// Wrap a closure as a [`ModifyFn`]
pub fn modify_fn<F>(f: F) -> ModifyFn
where
    F: Fn(&mut Policy) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Grant `role` to `member`, keeping existing members
pub fn add_member(role: impl Into<String>, member: impl Into<String>, condition: Option<Expr>) -> ModifyFn {
    let binding = Binding {
        role: role.into(),
        members: vec![member.into()],
        condition,
    };
    modify_fn(move |policy| {
        policy.bindings.push(binding.clone());
        policy.bindings = merge_bindings(&policy.bindings);
        policy.version = IAM_POLICY_VERSION;
        Ok(())
    })
}

/// Revoke `role` from `member`
pub fn remove_member(role: impl Into<String>, member: impl Into<String>, condition: Option<Expr>) -> ModifyFn {
    let binding = Binding {
        role: role.into(),
        members: vec![member.into()],
        condition,
    };
    modify_fn(move |policy| {
        policy.bindings = subtract_from_bindings(&policy.bindings, std::slice::from_ref(&binding));
        policy.version = IAM_POLICY_VERSION;
        Ok(())
    })
}

/// Set the members of a role+condition to exactly those of `binding`
///
/// An empty member list removes the binding.
pub fn set_binding(binding: Binding) -> ModifyFn {
    modify_fn(move |policy| {
        let current = merge_bindings(&policy.bindings);
        policy.bindings = merge_bindings(&overwrite_binding(current, binding.clone()));
        policy.version = IAM_POLICY_VERSION;
        Ok(())
    })
}

/// Drop a role+condition binding entirely
pub fn remove_binding(role: impl Into<String>, condition: Option<Expr>) -> ModifyFn {
    let role = role.into();
    modify_fn(move |policy| {
        policy.bindings =
            filter_bindings_with_role_and_condition(&policy.bindings, &role, condition.as_ref());
        policy.version = IAM_POLICY_VERSION;
        Ok(())
    })
}

/// Replace the audit config of one service
pub fn set_audit_config(audit_config: AuditConfig) -> ModifyFn {
    modify_fn(move |policy| {
        let mut configs =
            remove_all_audit_configs_with_service(&policy.audit_configs, &audit_config.service);
        configs.push(audit_config.clone());
        policy.audit_configs = merge_audit_configs(&configs);
        Ok(())
    })
}

/// Drop every audit config of `service`
pub fn remove_audit_config(service: impl Into<String>) -> ModifyFn {
    let service = service.into();
    modify_fn(move |policy| {
        policy.audit_configs = remove_all_audit_configs_with_service(&policy.audit_configs, &service);
        Ok(())
    })
}

/// Replace bindings and audit configs with those of `desired`, keeping the
/// fetched etag
pub fn set_policy(desired: Policy) -> ModifyFn {
    let bindings = merge_bindings(&desired.bindings);
    let audit_configs = merge_audit_configs(&desired.audit_configs);
    modify_fn(move |policy| {
        policy.bindings = bindings.clone();
        policy.audit_configs = audit_configs.clone();
        policy.version = IAM_POLICY_VERSION;
        Ok(())
    })
}

/// Apply each function in order, stopping at the first error
pub fn chain(modifiers: Vec<ModifyFn>) -> ModifyFn {
    modify_fn(move |policy| {
        for modify in &modifiers {
            modify(policy)?;
        }
        Ok(())
    })
}
