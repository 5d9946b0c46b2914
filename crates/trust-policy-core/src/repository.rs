//! High-level policy mutations over an [`ObjectStore`].
//!
//! Each operation is one read-modify-write transaction against the staging
//! ref: load the current [`PolicyState`], check preconditions, transform and
//! re-sign the affected document, then commit. All checks run before the
//! commit, so a failed operation never moves the ref. A commit that loses a
//! race is retried from a fresh load up to the configured number of attempts.

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;

use crate::authorization::{
    authorize_root_mutation, authorize_root_signature, authorize_targets_mutation,
    verify_root_chain, verify_rule_files,
};
use crate::config::PolicyEnv;
use crate::envelope::{create_envelope, sign_envelope, Envelope};
use crate::error::{PolicyError, Result, StoreResultExt};
use crate::key::{Key, Signer};
use crate::message::PolicyAction;
use crate::metadata::{self, reject_reserved, RootMetadata, TargetsMetadata};
use crate::role::RoleName;
use crate::state::{PolicyState, RuleMatch};
use crate::store::{ObjectId, ObjectStore};

/// Caller-supplied scope of a single mutation.
pub struct MutationContext<'a> {
    signer: &'a dyn Signer,
    delegated_by: Vec<String>,
    sign_commit: Option<bool>,
    cancellation: CancellationToken,
}

impl<'a> MutationContext<'a> {
    pub fn new(signer: &'a dyn Signer) -> Self {
        Self {
            signer,
            delegated_by: Vec::new(),
            sign_commit: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Names the delegating role(s) whose authority the signer exercises.
    pub fn delegated_by<I, R>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        self.delegated_by = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Overrides the configured commit-signing preference.
    pub fn sign_commit(mut self, sign_commit: bool) -> Self {
        self.sign_commit = Some(sign_commit);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn signer(&self) -> &dyn Signer {
        self.signer
    }

    pub fn key_id(&self) -> &str {
        self.signer.key_id()
    }
}

/// A commit on a policy ref together with the action it records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyCommit {
    pub id: ObjectId,
    pub message: String,
    /// `None` when the message was not written by this engine.
    pub action: Option<PolicyAction>,
}

/// Policy engine bound to one object store.
#[derive(Debug)]
pub struct Repository<S> {
    store: S,
    env: PolicyEnv,
}

impl<S: ObjectStore> Repository<S> {
    pub fn new(store: S, env: PolicyEnv) -> Self {
        Self { store, env }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn env(&self) -> &PolicyEnv {
        &self.env
    }

    /// Loads the current staging policy.
    pub fn load_staging(&self) -> Result<PolicyState> {
        PolicyState::load_current(&self.store, &self.env.staging_ref)
    }

    /// Creates the root of trust with the signer as sole root and targets key.
    pub fn initialize_root(&self, ctx: &MutationContext<'_>) -> Result<ObjectId> {
        self.run(ctx, "initialize_root", |state| {
            if state.is_some() {
                return Err(PolicyError::CannotReinitialize(RoleName::Root.to_string()));
            }
            let root = metadata::initialize_root(ctx.signer().public_key());
            tracing::debug!(key_id = ctx.key_id(), "signing initial root metadata");
            let envelope = sign_envelope(create_envelope(&root)?, ctx.signer())?;
            Ok((PolicyState::new(envelope), PolicyAction::InitializeRoot))
        })
    }

    pub fn add_root_key(&self, ctx: &MutationContext<'_>, key: &Key) -> Result<ObjectId> {
        self.mutate_root(ctx, "add_root_key", |root| {
            Ok((
                metadata::add_root_key(root, key)?,
                PolicyAction::AddRootKey {
                    key_id: key.key_id.clone(),
                },
            ))
        })
    }

    pub fn remove_root_key(&self, ctx: &MutationContext<'_>, key_id: &str) -> Result<ObjectId> {
        self.mutate_root(ctx, "remove_root_key", |root| {
            Ok((
                metadata::remove_root_key(root, key_id)?,
                PolicyAction::RemoveRootKey {
                    key_id: key_id.to_string(),
                },
            ))
        })
    }

    pub fn update_root_threshold(
        &self,
        ctx: &MutationContext<'_>,
        threshold: usize,
    ) -> Result<ObjectId> {
        self.mutate_root(ctx, "update_root_threshold", |root| {
            Ok((
                metadata::update_root_threshold(root, threshold)?,
                PolicyAction::UpdateRootThreshold { threshold },
            ))
        })
    }

    /// Authorizes `key` to sign the top-level rule file. Gated by root keys.
    pub fn add_top_level_targets_key(
        &self,
        ctx: &MutationContext<'_>,
        key: &Key,
    ) -> Result<ObjectId> {
        self.mutate_root(ctx, "add_top_level_targets_key", |root| {
            Ok((
                metadata::add_targets_key(root, key)?,
                PolicyAction::AddTargetsKey {
                    key_id: key.key_id.clone(),
                },
            ))
        })
    }

    /// Revokes a top-level targets key. Gated by root keys.
    pub fn remove_top_level_targets_key(
        &self,
        ctx: &MutationContext<'_>,
        key_id: &str,
    ) -> Result<ObjectId> {
        self.mutate_root(ctx, "remove_top_level_targets_key", |root| {
            Ok((
                metadata::remove_targets_key(root, key_id)?,
                PolicyAction::RemoveTargetsKey {
                    key_id: key_id.to_string(),
                },
            ))
        })
    }

    pub fn update_top_level_targets_threshold(
        &self,
        ctx: &MutationContext<'_>,
        threshold: usize,
    ) -> Result<ObjectId> {
        self.mutate_root(ctx, "update_top_level_targets_threshold", |root| {
            Ok((
                metadata::update_targets_threshold(root, threshold)?,
                PolicyAction::UpdateTargetsThreshold { threshold },
            ))
        })
    }

    /// Adds the signer's signature to the current root without changing it.
    pub fn sign_root(&self, ctx: &MutationContext<'_>) -> Result<ObjectId> {
        self.run(ctx, "sign_root", |state| {
            let mut state = require_state(state)?;
            let root = state.root_metadata()?;
            let previous = self.previous_root(&state, &root)?;
            authorize_root_signature(&root, previous.as_ref(), ctx.key_id())?;

            tracing::debug!(key_id = ctx.key_id(), version = root.version, "signing root metadata");
            let envelope = sign_envelope(state.root_envelope.clone(), ctx.signer())?;
            state.set_envelope(&RoleName::Root, envelope);
            Ok((
                state,
                PolicyAction::SignRoot {
                    key_id: ctx.key_id().to_string(),
                },
            ))
        })
    }

    /// Creates an empty rule file named `role_name`.
    pub fn initialize_targets(
        &self,
        ctx: &MutationContext<'_>,
        role_name: &str,
    ) -> Result<ObjectId> {
        reject_reserved(role_name)?;
        let role = RoleName::parse(role_name);
        self.run(ctx, "initialize_targets", |state| {
            let mut state = require_state(state)?;
            if state.has_targets_role(role_name) {
                return Err(PolicyError::CannotReinitialize(role_name.to_string()));
            }
            authorize_targets_mutation(&state, &role, ctx.key_id(), &ctx.delegated_by)?;

            tracing::debug!(role = role_name, key_id = ctx.key_id(), "signing initial rule file");
            let envelope =
                sign_envelope(create_envelope(&metadata::initialize_targets())?, ctx.signer())?;
            state.set_envelope(&role, envelope);
            Ok((
                state,
                PolicyAction::InitializeTargets {
                    role: role_name.to_string(),
                },
            ))
        })
    }

    /// Appends a rule to `role_name`. Rule names are unique across every rule file.
    pub fn add_delegation(
        &self,
        ctx: &MutationContext<'_>,
        role_name: &str,
        rule_name: &str,
        keys: &[Key],
        patterns: &[String],
        threshold: usize,
    ) -> Result<ObjectId> {
        reject_reserved(rule_name)?;
        self.mutate_rule_file(ctx, "add_delegation", role_name, |state| {
            tracing::debug!(rule = rule_name, "checking if rule with same name exists");
            if state.has_rule_name(rule_name)? {
                return Err(PolicyError::DuplicateRuleName(rule_name.to_string()));
            }
            let doc = self.authorized_rule_file(ctx, state, role_name)?;
            tracing::debug!(rule = rule_name, role = role_name, "adding rule to rule file");
            Ok((
                metadata::add_delegation(doc, rule_name, keys, patterns, threshold)?,
                PolicyAction::AddRule {
                    rule: rule_name.to_string(),
                    role: role_name.to_string(),
                },
            ))
        })
    }

    /// Replaces a rule in place, keeping its precedence.
    pub fn update_delegation(
        &self,
        ctx: &MutationContext<'_>,
        role_name: &str,
        rule_name: &str,
        keys: &[Key],
        patterns: &[String],
        threshold: usize,
    ) -> Result<ObjectId> {
        reject_reserved(rule_name)?;
        self.mutate_rule_file(ctx, "update_delegation", role_name, |state| {
            let doc = self.authorized_rule_file(ctx, state, role_name)?;
            tracing::debug!(rule = rule_name, role = role_name, "updating rule in rule file");
            Ok((
                metadata::update_delegation(doc, rule_name, keys, patterns, threshold)?,
                PolicyAction::UpdateRule {
                    rule: rule_name.to_string(),
                    role: role_name.to_string(),
                },
            ))
        })
    }

    pub fn remove_delegation(
        &self,
        ctx: &MutationContext<'_>,
        role_name: &str,
        rule_name: &str,
    ) -> Result<ObjectId> {
        reject_reserved(rule_name)?;
        self.mutate_rule_file(ctx, "remove_delegation", role_name, |state| {
            let doc = self.authorized_rule_file(ctx, state, role_name)?;
            tracing::debug!(rule = rule_name, role = role_name, "removing rule from rule file");
            Ok((
                metadata::remove_delegation(doc, rule_name)?,
                PolicyAction::RemoveRule {
                    rule: rule_name.to_string(),
                    role: role_name.to_string(),
                },
            ))
        })
    }

    /// Adds keys to the key pool of `role_name`.
    pub fn add_key_to_targets(
        &self,
        ctx: &MutationContext<'_>,
        role_name: &str,
        keys: &[Key],
    ) -> Result<ObjectId> {
        self.mutate_rule_file(ctx, "add_key_to_targets", role_name, |state| {
            let doc = self.authorized_rule_file(ctx, state, role_name)?;
            tracing::debug!(role = role_name, count = keys.len(), "adding keys to rule file");
            Ok((
                metadata::add_key(doc, keys)?,
                PolicyAction::AddKeys {
                    role: role_name.to_string(),
                    keys: keys
                        .iter()
                        .map(|key| (key.key_type.clone(), key.key_id.clone()))
                        .collect(),
                },
            ))
        })
    }

    /// Adds the signer's signature to a rule file without changing it.
    pub fn sign_targets(&self, ctx: &MutationContext<'_>, role_name: &str) -> Result<ObjectId> {
        let role = RoleName::parse(role_name);
        self.run(ctx, "sign_targets", |state| {
            let mut state = require_state(state)?;
            self.authorized_rule_file(ctx, &state, role_name)?;
            let Some(envelope) = state.envelope_for(&role).cloned() else {
                return Err(PolicyError::MetadataNotFound(role_name.to_string()));
            };
            tracing::debug!(role = role_name, key_id = ctx.key_id(), "signing rule file");
            state.set_envelope(&role, sign_envelope(envelope, ctx.signer())?);
            Ok((
                state,
                PolicyAction::SignTargets {
                    key_id: ctx.key_id().to_string(),
                    role: role_name.to_string(),
                },
            ))
        })
    }

    /// Verifies the full trust chain recorded on `ref_name` and returns the newest root.
    ///
    /// This is the check a promotion from staging to the active ref must pass:
    /// every root version along first-parent history must chain from its
    /// predecessor, and every rule file must meet the threshold of a role
    /// delegating to it.
    pub fn verify_policy(&self, ref_name: &str) -> Result<RootMetadata> {
        let span = tracing::debug_span!("verify_policy", policy_ref = ref_name);
        let _guard = span.enter();

        let Some(tip) = self.store.read_ref(ref_name).context("reading policy ref")? else {
            return Err(PolicyError::PolicyNotInitialized);
        };
        let current = PolicyState::load_commit(&self.store, &tip)?;

        // Keep the tip-most envelope of each root version so late co-signatures count.
        let mut roots: BTreeMap<u64, Envelope> = BTreeMap::new();
        let mut cursor = Some(tip);
        while let Some(id) = cursor {
            let snapshot = PolicyState::load_commit(&self.store, &id)?;
            let root = snapshot.root_metadata()?;
            roots.entry(root.version).or_insert(snapshot.root_envelope);
            cursor = self
                .store
                .read_commit(&id)
                .context("reading policy history")?
                .first_parent()
                .cloned();
        }
        tracing::debug!(versions = roots.len(), "collected root versions");

        let root = verify_root_chain(&roots.into_values().collect::<Vec<_>>())?;
        if root != current.root_metadata()? {
            return Err(PolicyError::VerificationFailed {
                role: RoleName::Root.to_string(),
                reason: "tip root is not the newest root version".to_string(),
            });
        }
        verify_rule_files(&current, &root)?;
        tracing::info!(policy_ref = ref_name, version = root.version, "policy verified");
        Ok(root)
    }

    /// Returns the first rule on `ref_name` whose pattern matches `target`.
    pub fn find_rule_for(&self, ref_name: &str, target: &str) -> Result<Option<RuleMatch>> {
        let state = PolicyState::load_current(&self.store, ref_name)?;
        crate::authorization::find_rule_for(&state, target)
    }

    /// Lists commits on `ref_name` from newest to oldest along first parents.
    pub fn history(&self, ref_name: &str) -> Result<Vec<PolicyCommit>> {
        let mut commits = Vec::new();
        let mut cursor = self.store.read_ref(ref_name).context("reading policy ref")?;
        while let Some(id) = cursor {
            let commit = self
                .store
                .read_commit(&id)
                .context("reading policy history")?;
            cursor = commit.first_parent().cloned();
            commits.push(PolicyCommit {
                action: PolicyAction::parse(&commit.message),
                message: commit.message,
                id,
            });
        }
        Ok(commits)
    }

    /// Runs a root mutation gated by the current root keys. The root version is bumped.
    fn mutate_root<F>(
        &self,
        ctx: &MutationContext<'_>,
        op: &'static str,
        mutate: F,
    ) -> Result<ObjectId>
    where
        F: Fn(RootMetadata) -> Result<(RootMetadata, PolicyAction)>,
    {
        self.run(ctx, op, |state| {
            let mut state = require_state(state)?;
            let root = state.root_metadata()?;
            authorize_root_mutation(&root, ctx.key_id())?;

            let (mut root, action) = mutate(root)?;
            root.bump_version()?;
            tracing::debug!(
                version = root.version,
                key_id = ctx.key_id(),
                "signing updated root metadata"
            );
            let envelope = sign_envelope(create_envelope(&root)?, ctx.signer())?;
            state.set_envelope(&RoleName::Root, envelope);
            Ok((state, action))
        })
    }

    /// Runs a rule file mutation. The document version is bumped and the signer
    /// produces a fresh envelope, dropping signatures over the old content.
    fn mutate_rule_file<F>(
        &self,
        ctx: &MutationContext<'_>,
        op: &'static str,
        role_name: &str,
        mutate: F,
    ) -> Result<ObjectId>
    where
        F: Fn(&PolicyState) -> Result<(TargetsMetadata, PolicyAction)>,
    {
        let role = RoleName::parse(role_name);
        self.run(ctx, op, |state| {
            let mut state = require_state(state)?;
            let (mut doc, action) = mutate(&state)?;
            doc.bump_version()?;
            tracing::debug!(
                role = role_name,
                version = doc.version,
                key_id = ctx.key_id(),
                "signing updated rule file"
            );
            let envelope = sign_envelope(create_envelope(&doc)?, ctx.signer())?;
            state.set_envelope(&role, envelope);
            Ok((state, action))
        })
    }

    /// Loads `role_name` after checking it exists and the signer may edit it.
    fn authorized_rule_file(
        &self,
        ctx: &MutationContext<'_>,
        state: &PolicyState,
        role_name: &str,
    ) -> Result<TargetsMetadata> {
        tracing::debug!(role = role_name, "loading current rule file");
        if !state.has_targets_role(role_name) {
            return Err(PolicyError::MetadataNotFound(role_name.to_string()));
        }
        authorize_targets_mutation(
            state,
            &RoleName::parse(role_name),
            ctx.key_id(),
            &ctx.delegated_by,
        )?;
        state.get_targets_metadata(role_name)
    }

    /// Finds the newest root on first-parent history older than `current`.
    fn previous_root(
        &self,
        state: &PolicyState,
        current: &RootMetadata,
    ) -> Result<Option<RootMetadata>> {
        let mut cursor = state.tip().cloned();
        while let Some(id) = cursor {
            let root = PolicyState::load_commit(&self.store, &id)?.root_metadata()?;
            if root.version < current.version {
                return Ok(Some(root));
            }
            cursor = self
                .store
                .read_commit(&id)
                .context("reading policy history")?
                .first_parent()
                .cloned();
        }
        Ok(None)
    }

    /// Load, transform and commit with optimistic retries on ref conflicts.
    fn run<F>(&self, ctx: &MutationContext<'_>, op: &'static str, transform: F) -> Result<ObjectId>
    where
        F: Fn(Option<PolicyState>) -> Result<(PolicyState, PolicyAction)>,
    {
        let span = tracing::debug_span!("mutation", op, key_id = ctx.key_id());
        let _guard = span.enter();

        let mut attempt = 1;
        loop {
            tracing::debug!("loading current policy");
            let state = self.try_load_staging()?;
            let (state, action) = transform(state)?;

            if ctx.cancellation.is_cancelled() {
                tracing::debug!("mutation cancelled before commit");
                return Err(PolicyError::Cancelled);
            }

            tracing::debug!("committing policy");
            let sign_commit = ctx.sign_commit.unwrap_or(self.env.sign_commits);
            let signer = sign_commit.then_some(ctx.signer());
            match state.commit(&self.store, &self.env.staging_ref, &action.to_string(), signer) {
                Err(err) if err.is_ref_conflict() && attempt < self.env.commit_attempts => {
                    tracing::warn!(
                        attempt,
                        max_attempts = self.env.commit_attempts,
                        "staging ref moved concurrently, retrying"
                    );
                    attempt += 1;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "policy commit failed");
                    return Err(err);
                }
                Ok(commit) => {
                    tracing::info!(commit = %commit, action = %action, "policy updated");
                    return Ok(commit);
                }
            }
        }
    }

    fn try_load_staging(&self) -> Result<Option<PolicyState>> {
        match self.load_staging() {
            Ok(state) => Ok(Some(state)),
            Err(PolicyError::PolicyNotInitialized) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

fn require_state(state: Option<PolicyState>) -> Result<PolicyState> {
    state.ok_or(PolicyError::PolicyNotInitialized)
}
