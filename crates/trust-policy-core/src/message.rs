//! Commit message templates recording each policy mutation.
//!
//! Messages are part of the audit trail: tooling reads them back to tell
//! which action produced a commit, so every template must round-trip through
//! [`PolicyAction::parse`].

use std::fmt;

/// A policy mutation as recorded in a commit message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyAction {
    InitializeRoot,
    AddRootKey { key_id: String },
    RemoveRootKey { key_id: String },
    UpdateRootThreshold { threshold: usize },
    UpdateTargetsThreshold { threshold: usize },
    AddTargetsKey { key_id: String },
    RemoveTargetsKey { key_id: String },
    SignRoot { key_id: String },
    InitializeTargets { role: String },
    AddRule { rule: String, role: String },
    UpdateRule { rule: String, role: String },
    RemoveRule { rule: String, role: String },
    /// Keys are listed as `(key_type, key_id)` pairs.
    AddKeys { role: String, keys: Vec<(String, String)> },
    SignTargets { key_id: String, role: String },
}

impl fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyAction::InitializeRoot => f.write_str("Initialize root of trust"),
            PolicyAction::AddRootKey { key_id } => write!(f, "Add root key '{key_id}' to root"),
            PolicyAction::RemoveRootKey { key_id } => {
                write!(f, "Remove root key '{key_id}' from root")
            }
            PolicyAction::UpdateRootThreshold { threshold } => {
                write!(f, "Update root threshold to {threshold}")
            }
            PolicyAction::UpdateTargetsThreshold { threshold } => {
                write!(f, "Update policy threshold to {threshold}")
            }
            PolicyAction::AddTargetsKey { key_id } => {
                write!(f, "Add policy key '{key_id}' to root")
            }
            PolicyAction::RemoveTargetsKey { key_id } => {
                write!(f, "Remove policy key '{key_id}' from root")
            }
            PolicyAction::SignRoot { key_id } => {
                write!(f, "Add signature from key '{key_id}' to root")
            }
            PolicyAction::InitializeTargets { role } => write!(f, "Initialize policy '{role}'"),
            PolicyAction::AddRule { rule, role } => {
                write!(f, "Add rule '{rule}' to policy '{role}'")
            }
            PolicyAction::UpdateRule { rule, role } => {
                write!(f, "Update rule '{rule}' in policy '{role}'")
            }
            PolicyAction::RemoveRule { rule, role } => {
                write!(f, "Remove rule '{rule}' from policy '{role}'")
            }
            PolicyAction::AddKeys { role, keys } => {
                writeln!(f, "Add keys to policy '{role}'")?;
                for (key_type, key_id) in keys {
                    write!(f, "\n{key_type}:{key_id}")?;
                }
                Ok(())
            }
            PolicyAction::SignTargets { key_id, role } => {
                write!(f, "Add signature from key '{key_id}' to policy '{role}'")
            }
        }
    }
}

impl PolicyAction {
    /// Recovers the action from a commit message, or `None` for foreign messages.
    pub fn parse(message: &str) -> Option<Self> {
        let (summary, body) = match message.split_once('\n') {
            Some((summary, body)) => (summary, Some(body)),
            None => (message, None),
        };

        if let Some(role) = quoted_between(summary, "Add keys to policy '", "'") {
            let keys = body
                .unwrap_or_default()
                .lines()
                .filter(|line| !line.is_empty())
                .map(|line| {
                    line.split_once(':')
                        .map(|(key_type, key_id)| (key_type.to_string(), key_id.to_string()))
                })
                .collect::<Option<Vec<_>>>()?;
            return Some(PolicyAction::AddKeys { role, keys });
        }
        if body.is_some() {
            return None;
        }

        if summary == "Initialize root of trust" {
            return Some(PolicyAction::InitializeRoot);
        }
        if let Some(threshold) = summary.strip_prefix("Update root threshold to ") {
            return threshold
                .parse()
                .ok()
                .map(|threshold| PolicyAction::UpdateRootThreshold { threshold });
        }
        if let Some(threshold) = summary.strip_prefix("Update policy threshold to ") {
            return threshold
                .parse()
                .ok()
                .map(|threshold| PolicyAction::UpdateTargetsThreshold { threshold });
        }
        if let Some(key_id) = quoted_between(summary, "Add root key '", "' to root") {
            return Some(PolicyAction::AddRootKey { key_id });
        }
        if let Some(key_id) = quoted_between(summary, "Remove root key '", "' from root") {
            return Some(PolicyAction::RemoveRootKey { key_id });
        }
        if let Some(key_id) = quoted_between(summary, "Add policy key '", "' to root") {
            return Some(PolicyAction::AddTargetsKey { key_id });
        }
        if let Some(key_id) = quoted_between(summary, "Remove policy key '", "' from root") {
            return Some(PolicyAction::RemoveTargetsKey { key_id });
        }
        if let Some(key_id) = quoted_between(summary, "Add signature from key '", "' to root") {
            return Some(PolicyAction::SignRoot { key_id });
        }
        if let Some(role) = quoted_between(summary, "Initialize policy '", "'") {
            return Some(PolicyAction::InitializeTargets { role });
        }
        if let Some((key_id, role)) =
            quoted_pair(summary, "Add signature from key '", "' to policy '")
        {
            return Some(PolicyAction::SignTargets { key_id, role });
        }
        if let Some((rule, role)) = quoted_pair(summary, "Add rule '", "' to policy '") {
            return Some(PolicyAction::AddRule { rule, role });
        }
        if let Some((rule, role)) = quoted_pair(summary, "Update rule '", "' in policy '") {
            return Some(PolicyAction::UpdateRule { rule, role });
        }
        if let Some((rule, role)) = quoted_pair(summary, "Remove rule '", "' from policy '") {
            return Some(PolicyAction::RemoveRule { rule, role });
        }
        None
    }
}

fn quoted_between(summary: &str, prefix: &str, suffix: &str) -> Option<String> {
    let value = summary.strip_prefix(prefix)?.strip_suffix(suffix)?;
    (!value.contains('\'')).then(|| value.to_string())
}

fn quoted_pair(summary: &str, prefix: &str, separator: &str) -> Option<(String, String)> {
    let rest = summary.strip_prefix(prefix)?.strip_suffix('\'')?;
    let (first, second) = rest.split_once(separator)?;
    if first.contains('\'') || second.contains('\'') {
        return None;
    }
    Some((first.to_string(), second.to_string()))
}
