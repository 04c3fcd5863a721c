//! Field-level comparison of a desired policy against its remote counterpart.

use serde_json::json;

use crate::models::{FieldChange, PolicyRule, PolicySpec, ReconcileAction, RemotePolicy, RuleAction};

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDiff {
    pub action: ReconcileAction,
    pub changes: Vec<FieldChange>,
}

impl PolicyDiff {
    pub fn changed_fields(&self) -> Vec<&str> {
        self.changes.iter().map(|c| c.field.as_str()).collect()
    }
}

/// Pure: never touches the provider. Only an update carries field changes.
pub fn diff_policy(spec: &PolicySpec, remote: Option<&RemotePolicy>) -> PolicyDiff {
    let Some(remote) = remote else {
        return PolicyDiff {
            action: ReconcileAction::Create,
            changes: Vec::new(),
        };
    };

    let mut changes = Vec::new();
    if spec.name.trim() != remote.name.trim() {
        changes.push(change("name", json!(remote.name), json!(spec.name)));
    }
    if spec.session_duration_minutes != remote.session_duration_minutes {
        changes.push(change(
            "sessionDurationMinutes",
            json!(remote.session_duration_minutes),
            json!(spec.session_duration_minutes),
        ));
    }
    if spec.require_mfa != remote.require_mfa {
        changes.push(change("requireMfa", json!(remote.require_mfa), json!(spec.require_mfa)));
    }
    if !rules_equal(&spec.rules, &remote.rules) {
        changes.push(change(
            "rules",
            rules_json(&remote.rules),
            rules_json(&spec.rules),
        ));
    }

    let action = if changes.is_empty() {
        ReconcileAction::Skip
    } else {
        ReconcileAction::Update
    };
    PolicyDiff { action, changes }
}

/// Order-insensitive multiset comparison.
pub fn rules_equal(a: &[PolicyRule], b: &[PolicyRule]) -> bool {
    sorted_rules(a) == sorted_rules(b)
}

fn sorted_rules(rules: &[PolicyRule]) -> Vec<(String, String, RuleAction)> {
    let mut normalized: Vec<_> = rules.iter().map(PolicyRule::normalized).collect();
    normalized.sort();
    normalized
}

fn rules_json(rules: &[PolicyRule]) -> serde_json::Value {
    let sorted: Vec<_> = sorted_rules(rules)
        .into_iter()
        .map(|(rule_type, value, action)| {
            json!({"type": rule_type, "value": value, "action": action.as_str()})
        })
        .collect();
    json!(sorted)
}

fn change(field: &str, old: serde_json::Value, new: serde_json::Value) -> FieldChange {
    FieldChange {
        field: field.to_string(),
        old,
        new,
    }
}
