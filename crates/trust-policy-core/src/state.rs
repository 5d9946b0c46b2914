//! Transactional snapshot of every policy document on a ref.
//!
//! A [`PolicyState`] is loaded fresh from the store at the start of each
//! mutation, edited in memory, and written back as exactly one commit whose
//! parent is the tip it was loaded from. Nothing survives across operations.

use std::collections::{BTreeMap, BTreeSet};

use crate::envelope::Envelope;
use crate::error::{PolicyError, Result, StoreResultExt};
use crate::key::Signer;
use crate::metadata::{Delegation, RootMetadata, TargetsMetadata};
use crate::role::{RoleName, TARGETS_ROLE_NAME};
use crate::store::{ObjectId, ObjectStore, TreeObject};

/// Directory holding one envelope per role inside the policy tree.
pub const METADATA_DIR: &str = "metadata";

/// A rule located somewhere in the delegation graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    /// Role whose rule file declares the rule.
    pub role: String,
    pub delegation: Delegation,
}

/// In-memory set of envelopes read from one policy commit.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyState {
    pub root_envelope: Envelope,
    pub targets_envelope: Option<Envelope>,
    /// Delegated rule files keyed by role name.
    pub delegation_envelopes: BTreeMap<String, Envelope>,
    tip: Option<ObjectId>,
}

impl PolicyState {
    /// Starts a policy with only a root envelope and no history.
    pub fn new(root_envelope: Envelope) -> Self {
        Self {
            root_envelope,
            targets_envelope: None,
            delegation_envelopes: BTreeMap::new(),
            tip: None,
        }
    }

    /// Loads the policy currently pointed at by `ref_name`.
    pub fn load_current<S: ObjectStore + ?Sized>(store: &S, ref_name: &str) -> Result<Self> {
        let Some(tip) = store.read_ref(ref_name).context("reading policy ref")? else {
            return Err(PolicyError::PolicyNotInitialized);
        };
        Self::load_commit(store, &tip)
    }

    /// Loads the policy recorded by a specific commit.
    pub fn load_commit<S: ObjectStore + ?Sized>(store: &S, commit_id: &ObjectId) -> Result<Self> {
        let commit = store
            .read_commit(commit_id)
            .context("reading policy commit")?;
        let tree = store.read_tree(&commit.tree).context("reading policy tree")?;

        let mut root_envelope = None;
        let mut targets_envelope = None;
        let mut delegation_envelopes = BTreeMap::new();
        for (path, blob_id) in &tree.entries {
            let Some(role) = role_from_path(path) else {
                tracing::debug!(path = %path, "ignoring non-metadata tree entry");
                continue;
            };
            let bytes = store
                .read_blob(blob_id)
                .context("reading metadata envelope")?;
            let envelope: Envelope = serde_json::from_slice(&bytes)?;
            match role {
                RoleName::Root => root_envelope = Some(envelope),
                role if role.is_top_level_targets() => targets_envelope = Some(envelope),
                RoleName::Targets(name) => {
                    delegation_envelopes.insert(name, envelope);
                }
            }
        }

        let root_envelope = root_envelope.ok_or(PolicyError::PolicyNotInitialized)?;
        Ok(Self {
            root_envelope,
            targets_envelope,
            delegation_envelopes,
            tip: Some(commit_id.clone()),
        })
    }

    /// Commit the state was loaded from, if any.
    pub fn tip(&self) -> Option<&ObjectId> {
        self.tip.as_ref()
    }

    pub fn root_metadata(&self) -> Result<RootMetadata> {
        self.root_envelope.metadata()
    }

    /// Returns `true` when a rule file with the given name exists.
    pub fn has_targets_role(&self, role_name: &str) -> bool {
        match RoleName::parse(role_name) {
            RoleName::Root => false,
            role if role.is_top_level_targets() => self.targets_envelope.is_some(),
            RoleName::Targets(name) => self.delegation_envelopes.contains_key(&name),
        }
    }

    /// Searches every rule file for a rule named `rule_name`.
    pub fn has_rule_name(&self, rule_name: &str) -> Result<bool> {
        for (_, envelope) in self.rule_file_envelopes() {
            let doc: TargetsMetadata = envelope.metadata()?;
            if doc.has_rule(rule_name) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn get_targets_metadata(&self, role_name: &str) -> Result<TargetsMetadata> {
        let role = RoleName::parse(role_name);
        match self.envelope_for(&role) {
            Some(envelope) if !role.is_root() => envelope.metadata(),
            _ => Err(PolicyError::MetadataNotFound(role_name.to_string())),
        }
    }

    pub fn envelope_for(&self, role: &RoleName) -> Option<&Envelope> {
        match role {
            RoleName::Root => Some(&self.root_envelope),
            role if role.is_top_level_targets() => self.targets_envelope.as_ref(),
            RoleName::Targets(name) => self.delegation_envelopes.get(name),
        }
    }

    /// Replaces the envelope stored for `role`.
    pub fn set_envelope(&mut self, role: &RoleName, envelope: Envelope) {
        match role {
            RoleName::Root => self.root_envelope = envelope,
            role if role.is_top_level_targets() => self.targets_envelope = Some(envelope),
            RoleName::Targets(name) => {
                self.delegation_envelopes.insert(name.clone(), envelope);
            }
        }
    }

    /// Rule files present in the state, top-level first.
    fn rule_file_envelopes(&self) -> impl Iterator<Item = (&str, &Envelope)> {
        self.targets_envelope
            .iter()
            .map(|envelope| (TARGETS_ROLE_NAME, envelope))
            .chain(
                self.delegation_envelopes
                    .iter()
                    .map(|(name, envelope)| (name.as_str(), envelope)),
            )
    }

    /// Rule files that delegate to `role_name`, with their decoded metadata.
    ///
    /// A role may have several parents; all of them are returned.
    pub fn parents_of(&self, role_name: &str) -> Result<Vec<(String, TargetsMetadata)>> {
        let mut parents = Vec::new();
        for (name, envelope) in self.rule_file_envelopes() {
            let doc: TargetsMetadata = envelope.metadata()?;
            if doc.has_rule(role_name) {
                parents.push((name.to_string(), doc));
            }
        }
        Ok(parents)
    }

    /// Walks the delegation graph from `targets`, depth first in declaration
    /// order, visiting every reachable rule once.
    ///
    /// The visitor returns `Some` to stop the walk early.
    pub fn walk_rules<T>(
        &self,
        mut visit: impl FnMut(&str, &Delegation) -> Option<T>,
    ) -> Result<Option<T>> {
        let mut visited = BTreeSet::new();
        self.walk_role(TARGETS_ROLE_NAME, &mut visited, &mut visit)
    }

    fn walk_role<T>(
        &self,
        role_name: &str,
        visited: &mut BTreeSet<String>,
        visit: &mut impl FnMut(&str, &Delegation) -> Option<T>,
    ) -> Result<Option<T>> {
        if !visited.insert(role_name.to_string()) {
            return Ok(None);
        }
        let role = RoleName::parse(role_name);
        if role.is_root() {
            return Ok(None);
        }
        let Some(envelope) = self.envelope_for(&role) else {
            return Ok(None);
        };
        let doc: TargetsMetadata = envelope.metadata()?;
        for delegation in &doc.delegations.roles {
            if let Some(found) = visit(role_name, delegation) {
                return Ok(Some(found));
            }
            if let Some(found) = self.walk_role(&delegation.name, visited, visit)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Role names reachable from `targets`, in traversal order.
    pub fn reachable_roles(&self) -> Result<Vec<String>> {
        let mut roles = Vec::new();
        if self.targets_envelope.is_some() {
            roles.push(TARGETS_ROLE_NAME.to_string());
        }
        self.walk_rules(|_, delegation| {
            if self.delegation_envelopes.contains_key(&delegation.name)
                && !roles.contains(&delegation.name)
            {
                roles.push(delegation.name.clone());
            }
            None::<()>
        })?;
        Ok(roles)
    }

    /// Writes every envelope and moves `ref_name` to a new commit on top of the loaded tip.
    ///
    /// Fails with a ref conflict when the ref no longer points at the tip this
    /// state was loaded from.
    pub fn commit<S: ObjectStore + ?Sized>(
        &self,
        store: &S,
        ref_name: &str,
        message: &str,
        signer: Option<&dyn Signer>,
    ) -> Result<ObjectId> {
        let mut tree = TreeObject::default();
        let roles = std::iter::once((RoleName::Root, &self.root_envelope))
            .chain(
                self.targets_envelope
                    .iter()
                    .map(|envelope| (RoleName::top_level_targets(), envelope)),
            )
            .chain(
                self.delegation_envelopes
                    .iter()
                    .map(|(name, envelope)| (RoleName::Targets(name.clone()), envelope)),
            );
        for (role, envelope) in roles {
            let blob = store
                .write_blob(&serde_json::to_vec(envelope)?)
                .context("writing metadata envelope")?;
            tree.entries.insert(role_path(&role), blob);
        }
        let tree_id = store.write_tree(&tree).context("writing policy tree")?;

        let parents = self.tip.iter().cloned().collect();
        let commit = store
            .write_commit(parents, tree_id, message, signer)
            .context("writing policy commit")?;
        store
            .update_ref(ref_name, self.tip.as_ref(), &commit)
            .context("updating policy ref")?;
        tracing::debug!(
            policy_ref = ref_name,
            commit = %commit,
            signed = signer.is_some(),
            "committed policy"
        );
        Ok(commit)
    }
}

/// Tree path of a role's envelope, e.g. `metadata/root.json`.
pub fn role_path(role: &RoleName) -> String {
    format!("{METADATA_DIR}/{}", role.file_name())
}

fn role_from_path(path: &str) -> Option<RoleName> {
    let name = path
        .strip_prefix(METADATA_DIR)?
        .strip_prefix('/')?
        .strip_suffix(".json")?;
    if name.is_empty() || name.contains('/') {
        return None;
    }
    Some(RoleName::parse(name))
}
