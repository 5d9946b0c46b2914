//! Decides whether keys may mutate a role and whether a policy is fully signed.
//!
//! Mutator gates run before any metadata is transformed. Verification runs over
//! a loaded [`PolicyState`] and is what a promotion from staging to the active
//! ref must pass.

use crate::envelope::{count_valid_signatures, Envelope};
use crate::error::{PolicyError, Result};
use crate::key::Key;
use crate::metadata::RootMetadata;
use crate::role::{RoleName, ROOT_ROLE_NAME, TARGETS_ROLE_NAME};
use crate::state::{PolicyState, RuleMatch};

/// Requires `key_id` to be one of the current root keys.
pub fn authorize_root_mutation(root: &RootMetadata, key_id: &str) -> Result<()> {
    if root.is_root_key(key_id) {
        return Ok(());
    }
    tracing::warn!(key_id, version = root.version, "key is not a root key");
    Err(PolicyError::UnauthorizedKey {
        key_id: key_id.to_string(),
    })
}

/// Requires `key_id` to be a root key of the current root or of the root it superseded.
///
/// Old keys must be able to co-sign a rotation that removed them, otherwise
/// the new root could never reach the previous threshold.
pub fn authorize_root_signature(
    current: &RootMetadata,
    previous: Option<&RootMetadata>,
    key_id: &str,
) -> Result<()> {
    if previous.is_some_and(|previous| previous.is_root_key(key_id)) {
        return Ok(());
    }
    authorize_root_mutation(current, key_id)
}

/// Checks the mutator against the delegating roles named by the caller.
///
/// With no delegating role named the check is skipped: a role may have
/// several parents and the engine does not guess which one authorizes.
pub fn authorize_targets_mutation(
    state: &PolicyState,
    role: &RoleName,
    key_id: &str,
    delegated_by: &[String],
) -> Result<()> {
    if delegated_by.is_empty() {
        tracing::debug!(role = %role, "no delegating role named, mutator authorization skipped");
        return Ok(());
    }

    if role.is_top_level_targets() {
        if state.root_metadata()?.is_targets_key(key_id) {
            return Ok(());
        }
    } else {
        for parent in delegated_by {
            let doc = state.get_targets_metadata(parent)?;
            let authorized = doc
                .rule(role.as_str())
                .is_some_and(|rule| rule.key_ids.contains(key_id));
            if authorized {
                tracing::debug!(role = %role, parent = %parent, key_id, "mutator authorized by parent");
                return Ok(());
            }
        }
    }

    tracing::warn!(role = %role, key_id, parents = ?delegated_by, "mutator not authorized by delegating roles");
    Err(PolicyError::UnauthorizedKey {
        key_id: key_id.to_string(),
    })
}

/// Verifies a sequence of root envelopes ordered by version and returns the newest root.
///
/// Version 1 must meet its own threshold. Every later version must meet the
/// previous root's threshold with the previous root's keys and its own
/// threshold with its own keys.
pub fn verify_root_chain(roots: &[Envelope]) -> Result<RootMetadata> {
    let mut previous: Option<RootMetadata> = None;
    for envelope in roots {
        let root: RootMetadata = envelope.metadata()?;
        let expected = match &previous {
            None => 1,
            Some(previous) => previous.version.checked_add(1).ok_or_else(|| {
                verification_failed(
                    ROOT_ROLE_NAME,
                    format!("root version {} has no successor", previous.version),
                )
            })?,
        };
        if root.version != expected {
            return Err(verification_failed(
                ROOT_ROLE_NAME,
                format!("expected root version {expected}, found {}", root.version),
            ));
        }
        if let Some(previous) = &previous {
            require_threshold(
                envelope,
                &previous.authorized_root_keys(),
                previous.roles.root.threshold,
                ROOT_ROLE_NAME,
                &format!("root version {} against version {}", root.version, previous.version),
            )?;
        }
        require_threshold(
            envelope,
            &root.authorized_root_keys(),
            root.roles.root.threshold,
            ROOT_ROLE_NAME,
            &format!("root version {}", root.version),
        )?;
        tracing::debug!(version = root.version, "verified root version");
        previous = Some(root);
    }
    previous.ok_or(PolicyError::PolicyNotInitialized)
}

/// Verifies every rule file of `state` against the keys that delegate to it.
///
/// `targets` is checked against the root; a delegated role must satisfy at
/// least one of the parents that name it. Rule files no parent names carry no
/// authority and are skipped.
pub fn verify_rule_files(state: &PolicyState, root: &RootMetadata) -> Result<()> {
    if let Some(envelope) = &state.targets_envelope {
        require_threshold(
            envelope,
            &root.authorized_targets_keys(),
            root.roles.targets.threshold,
            TARGETS_ROLE_NAME,
            TARGETS_ROLE_NAME,
        )?;
    }

    for (role, envelope) in &state.delegation_envelopes {
        let parents = state.parents_of(role)?;
        if parents.is_empty() {
            tracing::warn!(role = %role, "rule file is not delegated by any role, skipping");
            continue;
        }
        let mut best = 0;
        let mut satisfied = false;
        for (parent, doc) in &parents {
            let Some(rule) = doc.rule(role) else {
                continue;
            };
            let valid = count_valid_signatures(envelope, &doc.authorized_keys(role)?);
            if valid >= rule.threshold {
                tracing::debug!(role = %role, parent = %parent, valid, "verified delegated role");
                satisfied = true;
                break;
            }
            best = best.max(valid);
        }
        if !satisfied {
            return Err(verification_failed(
                role,
                format!(
                    "no delegating rule is satisfied ({best} valid signature(s) at best across {} parent(s))",
                    parents.len()
                ),
            ));
        }
    }
    Ok(())
}

/// Returns the first rule whose pattern matches `target`.
///
/// Rule files are walked from `targets` depth first in declaration order, so
/// earlier rules take precedence over later ones and over their own children.
pub fn find_rule_for(state: &PolicyState, target: &str) -> Result<Option<RuleMatch>> {
    state.walk_rules(|role, delegation| {
        delegation.matches(target).then(|| RuleMatch {
            role: role.to_string(),
            delegation: delegation.clone(),
        })
    })
}

fn require_threshold(
    envelope: &Envelope,
    keys: &[Key],
    threshold: usize,
    role: &str,
    what: &str,
) -> Result<()> {
    let valid = count_valid_signatures(envelope, keys);
    if valid < threshold {
        tracing::warn!(role, valid, threshold, "threshold not met");
        return Err(verification_failed(
            role,
            format!("{what} has {valid} of {threshold} required signature(s)"),
        ));
    }
    Ok(())
}

fn verification_failed(role: &str, reason: String) -> PolicyError {
    PolicyError::VerificationFailed {
        role: role.to_string(),
        reason,
    }
}
