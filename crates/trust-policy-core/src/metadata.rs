//! Root and rule-file metadata plus the pure functions that mutate them.
//!
//! Every mutator consumes a document and returns the updated copy, leaving
//! persistence and signing to the callers. Delegation order is significant:
//! the first matching rule wins during authorization, so new rules are only
//! ever appended and updates replace a rule in place.

use std::collections::{BTreeMap, BTreeSet};

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{PolicyError, Result};
use crate::key::Key;
use crate::role::RoleName;

/// `type` field of root documents.
pub const ROOT_METADATA_TYPE: &str = "root";
/// `type` field of rule files.
pub const TARGETS_METADATA_TYPE: &str = "targets";

/// Key ids and signature threshold for a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    #[serde(rename = "keyids")]
    pub key_ids: BTreeSet<String>,
    pub threshold: usize,
}

impl Role {
    fn single(key_id: &str) -> Self {
        Self {
            key_ids: BTreeSet::from([key_id.to_string()]),
            threshold: 1,
        }
    }
}

/// Roles declared by the root of trust.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootRoles {
    pub root: Role,
    pub targets: Role,
}

/// The trust anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootMetadata {
    #[serde(rename = "type")]
    pub metadata_type: String,
    pub version: u64,
    /// Every key referenced by [`RootRoles`], indexed by key id.
    pub keys: BTreeMap<String, Key>,
    pub roles: RootRoles,
}

impl RootMetadata {
    /// Keys allowed to sign the root itself.
    pub fn authorized_root_keys(&self) -> Vec<Key> {
        self.keys_for(&self.roles.root)
    }

    /// Keys allowed to sign the top-level rule file.
    pub fn authorized_targets_keys(&self) -> Vec<Key> {
        self.keys_for(&self.roles.targets)
    }

    pub fn is_root_key(&self, key_id: &str) -> bool {
        self.roles.root.key_ids.contains(key_id)
    }

    pub fn is_targets_key(&self, key_id: &str) -> bool {
        self.roles.targets.key_ids.contains(key_id)
    }

    pub fn bump_version(&mut self) -> Result<()> {
        self.version = next_version(self.version)?;
        Ok(())
    }

    fn keys_for(&self, role: &Role) -> Vec<Key> {
        role.key_ids
            .iter()
            .filter_map(|key_id| self.keys.get(key_id).cloned())
            .collect()
    }

    /// Drops keys no longer referenced by any role.
    fn prune_keys(&mut self) {
        let referenced: BTreeSet<String> = self
            .roles
            .root
            .key_ids
            .union(&self.roles.targets.key_ids)
            .cloned()
            .collect();
        self.keys.retain(|key_id, _| referenced.contains(key_id));
    }
}

/// A named grant of authority over a set of patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub name: String,
    #[serde(rename = "keyids")]
    pub key_ids: BTreeSet<String>,
    /// Glob patterns over refs or paths, e.g. `git:refs/heads/main`.
    pub paths: BTreeSet<String>,
    pub threshold: usize,
}

impl Delegation {
    /// Compiles every pattern of the rule into one set.
    pub fn pattern_set(&self) -> Result<GlobSet> {
        compile_patterns(&self.paths)
    }

    /// Returns `true` when any of the rule's patterns matches `target`.
    ///
    /// A rule whose patterns no longer compile matches nothing.
    pub fn matches(&self, target: &str) -> bool {
        match self.pattern_set() {
            Ok(set) => set.is_match(target),
            Err(err) => {
                tracing::warn!(rule = %self.name, error = %err, "skipping rule with invalid patterns");
                false
            }
        }
    }
}

/// Delegation section of a rule file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegations {
    /// Key pool shared by the role's rules and its own signer set.
    pub keys: BTreeMap<String, Key>,
    /// Ordered rules; position determines precedence.
    pub roles: Vec<Delegation>,
}

/// A rule file (top-level `targets` or a delegated role).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetsMetadata {
    #[serde(rename = "type")]
    pub metadata_type: String,
    pub version: u64,
    pub delegations: Delegations,
}

impl TargetsMetadata {
    pub fn has_rule(&self, rule_name: &str) -> bool {
        self.delegations
            .roles
            .iter()
            .any(|delegation| delegation.name == rule_name)
    }

    pub fn rule(&self, rule_name: &str) -> Option<&Delegation> {
        self.delegations
            .roles
            .iter()
            .find(|delegation| delegation.name == rule_name)
    }

    /// Resolves the keys authorized by `rule_name` from the key pool.
    pub fn authorized_keys(&self, rule_name: &str) -> Result<Vec<Key>> {
        let delegation = self
            .rule(rule_name)
            .ok_or_else(|| PolicyError::RuleNotFound(rule_name.to_string()))?;
        Ok(delegation
            .key_ids
            .iter()
            .filter_map(|key_id| self.delegations.keys.get(key_id).cloned())
            .collect())
    }

    pub fn bump_version(&mut self) -> Result<()> {
        self.version = next_version(self.version)?;
        Ok(())
    }
}

fn next_version(version: u64) -> Result<u64> {
    version
        .checked_add(1)
        .ok_or(PolicyError::VersionOverflow { version })
}

/// Creates version 1 of the root with `initial_key` as sole root and targets key.
pub fn initialize_root(initial_key: &Key) -> RootMetadata {
    RootMetadata {
        metadata_type: ROOT_METADATA_TYPE.to_string(),
        version: 1,
        keys: BTreeMap::from([(initial_key.key_id.clone(), initial_key.clone())]),
        roles: RootRoles {
            root: Role::single(&initial_key.key_id),
            targets: Role::single(&initial_key.key_id),
        },
    }
}

/// Adds a key to the set allowed to sign the root.
pub fn add_root_key(mut root: RootMetadata, key: &Key) -> Result<RootMetadata> {
    check_key_ids(std::slice::from_ref(key))?;
    root.keys.insert(key.key_id.clone(), key.clone());
    root.roles.root.key_ids.insert(key.key_id.clone());
    Ok(root)
}

/// Removes a root key, refusing to leave the root unsatisfiable.
pub fn remove_root_key(mut root: RootMetadata, key_id: &str) -> Result<RootMetadata> {
    remove_from_role(&mut root.roles.root, key_id)?;
    root.prune_keys();
    Ok(root)
}

/// Adds a key to the set allowed to sign the top-level rule file.
pub fn add_targets_key(mut root: RootMetadata, key: &Key) -> Result<RootMetadata> {
    check_key_ids(std::slice::from_ref(key))?;
    root.keys.insert(key.key_id.clone(), key.clone());
    root.roles.targets.key_ids.insert(key.key_id.clone());
    Ok(root)
}

/// Removes a top-level targets key, refusing to leave the role unsatisfiable.
pub fn remove_targets_key(mut root: RootMetadata, key_id: &str) -> Result<RootMetadata> {
    remove_from_role(&mut root.roles.targets, key_id)?;
    root.prune_keys();
    Ok(root)
}

pub fn update_root_threshold(mut root: RootMetadata, threshold: usize) -> Result<RootMetadata> {
    validate_threshold(threshold, root.roles.root.key_ids.len())?;
    root.roles.root.threshold = threshold;
    Ok(root)
}

pub fn update_targets_threshold(mut root: RootMetadata, threshold: usize) -> Result<RootMetadata> {
    validate_threshold(threshold, root.roles.targets.key_ids.len())?;
    root.roles.targets.threshold = threshold;
    Ok(root)
}

fn remove_from_role(role: &mut Role, key_id: &str) -> Result<()> {
    if !role.key_ids.contains(key_id) {
        return Err(PolicyError::KeyNotFound {
            key_id: key_id.to_string(),
        });
    }
    let remaining = role.key_ids.len() - 1;
    if remaining < role.threshold {
        return Err(PolicyError::CannotRemoveLastKey {
            remaining,
            threshold: role.threshold,
        });
    }
    role.key_ids.remove(key_id);
    Ok(())
}

/// Creates an empty rule file.
pub fn initialize_targets() -> TargetsMetadata {
    TargetsMetadata {
        metadata_type: TARGETS_METADATA_TYPE.to_string(),
        version: 1,
        delegations: Delegations::default(),
    }
}

/// Appends a new rule to the end of the rule list.
pub fn add_delegation(
    mut doc: TargetsMetadata,
    rule_name: &str,
    keys: &[Key],
    patterns: &[String],
    threshold: usize,
) -> Result<TargetsMetadata> {
    reject_reserved(rule_name)?;
    if doc.has_rule(rule_name) {
        return Err(PolicyError::DuplicateRuleName(rule_name.to_string()));
    }
    let delegation = build_delegation(&mut doc, rule_name, keys, patterns, threshold)?;
    doc.delegations.roles.push(delegation);
    Ok(doc)
}

/// Replaces an existing rule while keeping its position.
pub fn update_delegation(
    mut doc: TargetsMetadata,
    rule_name: &str,
    keys: &[Key],
    patterns: &[String],
    threshold: usize,
) -> Result<TargetsMetadata> {
    reject_reserved(rule_name)?;
    let Some(position) = doc
        .delegations
        .roles
        .iter()
        .position(|delegation| delegation.name == rule_name)
    else {
        return Err(PolicyError::RuleNotFound(rule_name.to_string()));
    };
    doc.delegations.roles[position] =
        build_delegation(&mut doc, rule_name, keys, patterns, threshold)?;
    Ok(doc)
}

/// Removes a rule. Keys stay in the pool since other rules may reference them.
pub fn remove_delegation(mut doc: TargetsMetadata, rule_name: &str) -> Result<TargetsMetadata> {
    reject_reserved(rule_name)?;
    let before = doc.delegations.roles.len();
    doc.delegations
        .roles
        .retain(|delegation| delegation.name != rule_name);
    if doc.delegations.roles.len() == before {
        return Err(PolicyError::RuleNotFound(rule_name.to_string()));
    }
    Ok(doc)
}

/// Adds keys to the role's key pool without touching its rules.
pub fn add_key(mut doc: TargetsMetadata, keys: &[Key]) -> Result<TargetsMetadata> {
    check_key_ids(keys)?;
    for key in keys {
        doc.delegations.keys.insert(key.key_id.clone(), key.clone());
    }
    Ok(doc)
}

fn build_delegation(
    doc: &mut TargetsMetadata,
    rule_name: &str,
    keys: &[Key],
    patterns: &[String],
    threshold: usize,
) -> Result<Delegation> {
    check_key_ids(keys)?;
    let key_ids: BTreeSet<String> = keys.iter().map(|key| key.key_id.clone()).collect();
    validate_threshold(threshold, key_ids.len())?;
    compile_patterns(patterns)?;
    for key in keys {
        doc.delegations.keys.insert(key.key_id.clone(), key.clone());
    }
    Ok(Delegation {
        name: rule_name.to_string(),
        key_ids,
        paths: patterns.iter().cloned().collect(),
        threshold,
    })
}

/// Rejects the trust anchor's name as a rule or rule-file name.
pub fn reject_reserved(name: &str) -> Result<()> {
    if RoleName::parse(name).is_root() {
        return Err(PolicyError::InvalidPolicyName);
    }
    Ok(())
}

/// A threshold must be reachable with the listed keys and never zero.
pub fn validate_threshold(threshold: usize, keys: usize) -> Result<()> {
    if threshold < 1 || threshold > keys {
        return Err(PolicyError::InvalidThreshold { threshold, keys });
    }
    Ok(())
}

/// Key ids are pool indexes, so each must be derived from its own material.
pub fn check_key_ids(keys: &[Key]) -> Result<()> {
    match keys.iter().find(|key| !key.has_consistent_id()) {
        Some(key) => Err(PolicyError::KeyIdMismatch {
            key_id: key.key_id.clone(),
        }),
        None => Ok(()),
    }
}

/// Compiles rule patterns (glob syntax) into a single matcher.
pub fn compile_patterns<I, P>(patterns: I) -> Result<GlobSet>
where
    I: IntoIterator<Item = P>,
    P: AsRef<str>,
{
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let pattern = pattern.as_ref();
        let glob = Glob::new(pattern).map_err(|err| PolicyError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: err.to_string(),
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|err| PolicyError::InvalidPattern {
        pattern: String::new(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::key::{Ed25519Signer, Signer};

    fn key(seed: u8) -> Key {
        Ed25519Signer::from_seed(&[seed; 32])
            .unwrap()
            .public_key()
            .clone()
    }

    fn patterns(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn initialize_root_trusts_the_initial_key_for_both_roles() {
        let a = key(1);
        let root = initialize_root(&a);
        assert_eq!(root.version, 1);
        assert_eq!(root.authorized_root_keys(), vec![a.clone()]);
        assert_eq!(root.authorized_targets_keys(), vec![a.clone()]);
        assert_eq!(root.roles.root.threshold, 1);
        assert_eq!(root.roles.targets.threshold, 1);
    }

    #[test]
    fn targets_keys_cannot_drop_below_threshold() {
        let a = key(1);
        let b = key(2);
        let root = add_targets_key(initialize_root(&a), &b).unwrap();
        let root = update_targets_threshold(root, 2).unwrap();
        let err = remove_targets_key(root.clone(), &b.key_id).unwrap_err();
        assert!(matches!(
            err,
            PolicyError::CannotRemoveLastKey {
                remaining: 1,
                threshold: 2
            }
        ));

        let root = update_targets_threshold(root, 1).unwrap();
        let root = remove_targets_key(root, &b.key_id).unwrap();
        assert!(!root.is_targets_key(&b.key_id));
        assert!(!root.keys.contains_key(&b.key_id));
    }

    #[test]
    fn removing_an_unknown_key_is_reported() {
        let root = initialize_root(&key(1));
        assert!(matches!(
            remove_root_key(root, "missing"),
            Err(PolicyError::KeyNotFound { .. })
        ));
    }

    #[test]
    fn shared_keys_survive_removal_from_one_role() {
        let a = key(1);
        let b = key(2);
        let root = add_root_key(initialize_root(&a), &b).unwrap();
        let root = remove_root_key(root, &a.key_id).unwrap();
        assert!(root.is_targets_key(&a.key_id));
        assert!(root.keys.contains_key(&a.key_id));
    }

    #[test]
    fn thresholds_must_be_reachable() {
        let root = initialize_root(&key(1));
        assert!(matches!(
            update_root_threshold(root.clone(), 0),
            Err(PolicyError::InvalidThreshold { .. })
        ));
        assert!(matches!(
            update_root_threshold(root, 2),
            Err(PolicyError::InvalidThreshold {
                threshold: 2,
                keys: 1
            })
        ));
    }

    #[test]
    fn add_delegation_appends_in_order() {
        let doc = initialize_targets();
        let doc = add_delegation(doc, "first", &[key(1)], &patterns(&["git:refs/heads/main"]), 1)
            .unwrap();
        let doc = add_delegation(doc, "second", &[key(2)], &patterns(&["git:refs/tags/*"]), 1)
            .unwrap();
        let names: Vec<_> = doc.delegations.roles.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["first", "second"]);
        assert_eq!(doc.delegations.keys.len(), 2);
    }

    #[test]
    fn add_delegation_rejects_duplicates_and_bad_thresholds() {
        let doc = add_delegation(initialize_targets(), "rule", &[key(1)], &[], 1).unwrap();
        assert!(matches!(
            add_delegation(doc.clone(), "rule", &[key(2)], &patterns(&["other"]), 1),
            Err(PolicyError::DuplicateRuleName(name)) if name == "rule"
        ));
        assert!(matches!(
            add_delegation(doc.clone(), "other", &[key(2)], &[], 2),
            Err(PolicyError::InvalidThreshold { .. })
        ));
        assert!(matches!(
            add_delegation(doc.clone(), "other", &[], &[], 1),
            Err(PolicyError::InvalidThreshold { .. })
        ));
        // The same key listed twice still counts once.
        assert!(matches!(
            add_delegation(doc, "other", &[key(2), key(2)], &[], 2),
            Err(PolicyError::InvalidThreshold { threshold: 2, keys: 1 })
        ));
    }

    #[test]
    fn rule_names_are_case_sensitive() {
        let doc = add_delegation(initialize_targets(), "Rule", &[key(1)], &[], 1).unwrap();
        assert!(add_delegation(doc, "rule", &[key(1)], &[], 1).is_ok());
    }

    #[test]
    fn reserved_name_is_checked_before_anything_else() {
        let doc = add_delegation(initialize_targets(), "rule", &[key(1)], &[], 1).unwrap();
        for result in [
            add_delegation(doc.clone(), "root", &[], &[], 0),
            update_delegation(doc.clone(), "root", &[], &[], 0),
            remove_delegation(doc.clone(), "root"),
        ] {
            assert!(matches!(result, Err(PolicyError::InvalidPolicyName)));
        }
    }

    #[test]
    fn update_delegation_keeps_position() {
        let doc = initialize_targets();
        let doc = add_delegation(doc, "a", &[key(1)], &patterns(&["x"]), 1).unwrap();
        let doc = add_delegation(doc, "b", &[key(1)], &patterns(&["y"]), 1).unwrap();
        let doc = add_delegation(doc, "c", &[key(1)], &patterns(&["z"]), 1).unwrap();
        let doc = update_delegation(doc, "b", &[key(2), key(3)], &patterns(&["w"]), 2).unwrap();
        let names: Vec<_> = doc.delegations.roles.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        let updated = doc.rule("b").unwrap();
        assert_eq!(updated.threshold, 2);
        assert_eq!(updated.paths, BTreeSet::from(["w".to_string()]));
        assert_eq!(doc.authorized_keys("b").unwrap().len(), 2);
    }

    #[test]
    fn update_and_remove_require_existing_rules() {
        let doc = initialize_targets();
        assert!(matches!(
            update_delegation(doc.clone(), "missing", &[key(1)], &[], 1),
            Err(PolicyError::RuleNotFound(_))
        ));
        assert!(matches!(
            remove_delegation(doc, "missing"),
            Err(PolicyError::RuleNotFound(_))
        ));
    }

    #[test]
    fn remove_delegation_drops_only_the_named_rule() {
        let doc = add_delegation(initialize_targets(), "a", &[key(1)], &[], 1).unwrap();
        let doc = add_delegation(doc, "b", &[key(2)], &[], 1).unwrap();
        let doc = remove_delegation(doc, "a").unwrap();
        assert!(!doc.has_rule("a"));
        assert!(doc.has_rule("b"));
    }

    #[test]
    fn add_key_leaves_rules_untouched() {
        let doc = add_delegation(initialize_targets(), "a", &[key(1)], &[], 1).unwrap();
        let updated = add_key(doc.clone(), &[key(5), key(6)]).unwrap();
        assert_eq!(updated.delegations.roles, doc.delegations.roles);
        assert_eq!(updated.delegations.keys.len(), 3);
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        let err = add_delegation(initialize_targets(), "a", &[key(1)], &patterns(&["[unclosed"]), 1)
            .unwrap_err();
        assert!(matches!(err, PolicyError::InvalidPattern { .. }));
    }

    #[test]
    fn delegations_match_glob_patterns() {
        let doc = add_delegation(
            initialize_targets(),
            "protect-releases",
            &[key(1)],
            &patterns(&["git:refs/tags/v*", "file:docs/*"]),
            1,
        )
        .unwrap();
        let rule = doc.rule("protect-releases").unwrap();
        assert!(rule.matches("git:refs/tags/v1.0.0"));
        assert!(rule.matches("file:docs/README.md"));
        assert!(!rule.matches("git:refs/heads/main"));
    }

    /// `key(3)`'s id carried over the material of `key(99)`.
    fn forged_key() -> Key {
        Key {
            key_id: key(3).key_id,
            ..key(99)
        }
    }

    #[test]
    fn forged_key_ids_cannot_take_over_a_pooled_key() {
        let doc = add_delegation(initialize_targets(), "r1", &[key(3)], &[], 1).unwrap();
        let err = add_delegation(doc.clone(), "r2", &[forged_key()], &[], 1).unwrap_err();
        assert!(matches!(err, PolicyError::KeyIdMismatch { ref key_id } if *key_id == key(3).key_id));
        assert!(matches!(
            update_delegation(doc.clone(), "r1", &[forged_key()], &[], 1),
            Err(PolicyError::KeyIdMismatch { .. })
        ));
        assert!(matches!(
            add_key(doc.clone(), &[key(5), forged_key()]),
            Err(PolicyError::KeyIdMismatch { .. })
        ));
        assert_eq!(doc.authorized_keys("r1").unwrap(), vec![key(3)]);
    }

    #[test]
    fn forged_key_ids_are_rejected_by_root_mutators() {
        let root = initialize_root(&key(1));
        assert!(matches!(
            add_root_key(root.clone(), &forged_key()),
            Err(PolicyError::KeyIdMismatch { .. })
        ));
        assert!(matches!(
            add_targets_key(root, &forged_key()),
            Err(PolicyError::KeyIdMismatch { .. })
        ));
    }

    #[test]
    fn versions_never_wrap() {
        let mut root = initialize_root(&key(1));
        root.version = u64::MAX;
        assert!(matches!(
            root.bump_version(),
            Err(PolicyError::VersionOverflow { version: u64::MAX })
        ));
        assert_eq!(root.version, u64::MAX);

        let mut doc = initialize_targets();
        doc.bump_version().unwrap();
        assert_eq!(doc.version, 2);
        doc.version = u64::MAX;
        assert!(doc.bump_version().is_err());
    }

    #[test]
    fn pattern_sets_cover_every_pattern() {
        let set = compile_patterns(["git:refs/heads/main", "git:refs/tags/*"]).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.is_match("git:refs/tags/v2"));
        assert!(!set.is_match("git:refs/heads/dev"));
        assert!(compile_patterns(Vec::<String>::new()).unwrap().is_empty());
    }

    #[test]
    fn root_metadata_round_trips() {
        let root = add_targets_key(initialize_root(&key(1)), &key(2)).unwrap();
        let bytes = serde_json::to_vec(&root).unwrap();
        let decoded: RootMetadata = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, root);
    }

    proptest! {
        #[test]
        fn targets_metadata_round_trips(
            names in proptest::collection::btree_set("[a-z][a-z0-9-]{0,12}", 0..6),
            seeds in proptest::collection::vec(1u8..32, 1..4),
        ) {
            let keys: Vec<Key> = seeds.iter().map(|seed| key(*seed)).collect();
            let mut doc = initialize_targets();
            for name in names.iter().filter(|name| name.as_str() != "root") {
                doc = add_delegation(doc, name, &keys, &[format!("git:refs/heads/{name}")], 1)
                    .unwrap();
            }
            let bytes = serde_json::to_vec(&doc).unwrap();
            let decoded: TargetsMetadata = serde_json::from_slice(&bytes).unwrap();
            prop_assert_eq!(decoded, doc);
        }
    }
}
