//! Signers and pre-populated repositories used across scenarios.
use trust_policy_core::store::SledObjectStore;
use trust_policy_core::{Ed25519Signer, Key, MutationContext, PolicyEnv, Repository, Signer};

/// Seed of the key that initializes the root of trust ("A").
pub const ROOT_SEED: u8 = 1;
/// Seed of the top-level targets key ("B").
pub const TARGETS_SEED: u8 = 2;
/// Seed of the key delegated `protect-main` ("C").
pub const RULE_SEED: u8 = 3;
/// Seed of a key nobody trusts.
pub const OUTSIDER_SEED: u8 = 99;

/// Rule created by [`repository_with_policy`].
pub const PROTECT_MAIN: &str = "protect-main";
/// Pattern guarded by [`PROTECT_MAIN`].
pub const MAIN_PATTERN: &str = "git:refs/heads/main";

/// Deterministic Ed25519 signer derived from a one-byte seed.
pub fn signer(seed: u8) -> Ed25519Signer {
    Ed25519Signer::from_seed(&[seed; 32]).expect("ed25519 signer")
}

pub fn key(seed: u8) -> Key {
    signer(seed).public_key().clone()
}

pub fn patterns(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

/// Empty repository over an in-memory store with default settings.
pub fn repository() -> Repository<SledObjectStore> {
    repository_with(PolicyEnv::default())
}

pub fn repository_with(env: PolicyEnv) -> Repository<SledObjectStore> {
    let store = SledObjectStore::open_ephemeral().expect("ephemeral store");
    Repository::new(store, env)
}

/// Root initialized by A.
pub fn repository_with_root() -> Repository<SledObjectStore> {
    let repo = repository();
    initialize_root(&repo);
    repo
}

pub fn initialize_root(repo: &Repository<SledObjectStore>) {
    let root_signer = signer(ROOT_SEED);
    repo.initialize_root(&MutationContext::new(&root_signer))
        .expect("initialize root");
}

/// Root by A, targets key B, top-level targets signed by B, and a
/// `protect-main` rule delegating [`MAIN_PATTERN`] to C.
pub fn repository_with_policy() -> Repository<SledObjectStore> {
    let repo = repository_with_root();
    populate_policy(&repo);
    repo
}

pub fn populate_policy<S: trust_policy_core::ObjectStore>(repo: &Repository<S>) {
    let root_signer = signer(ROOT_SEED);
    let targets_signer = signer(TARGETS_SEED);
    repo.add_top_level_targets_key(&MutationContext::new(&root_signer), &key(TARGETS_SEED))
        .expect("add targets key");
    repo.initialize_targets(&MutationContext::new(&targets_signer), "targets")
        .expect("initialize targets");
    repo.add_delegation(
        &MutationContext::new(&targets_signer),
        "targets",
        PROTECT_MAIN,
        &[key(RULE_SEED)],
        &patterns(&[MAIN_PATTERN]),
        1,
    )
    .expect("add delegation");
}

/// Current tip of the staging ref.
pub fn staging_tip<S: trust_policy_core::ObjectStore>(
    repo: &Repository<S>,
) -> Option<trust_policy_core::ObjectId> {
    repo.store()
        .read_ref(&repo.env().staging_ref)
        .expect("read staging ref")
}
