//! Error taxonomy shared by every layer of the policy engine.
//!
//! Each failure aborts the mutation before the commit step, so none of these
//! errors can leave a partially written policy behind. Store failures are
//! wrapped with the operation that triggered them to keep the audit trail
//! readable.

use thiserror::Error;

use crate::store::StoreError;

/// Errors raised while loading, mutating, or verifying policy metadata.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid rule or policy file name, cannot be 'root'")]
    InvalidPolicyName,
    #[error("rule '{0}' already exists in the policy")]
    DuplicateRuleName(String),
    #[error("rule '{0}' not found")]
    RuleNotFound(String),
    #[error("metadata for role '{0}' not found")]
    MetadataNotFound(String),
    #[error("key '{key_id}' is not authorized for this operation")]
    UnauthorizedKey { key_id: String },
    #[error("cannot reinitialize metadata for role '{0}'")]
    CannotReinitialize(String),
    #[error("cannot remove key: role would retain {remaining} key(s) for a threshold of {threshold}")]
    CannotRemoveLastKey { remaining: usize, threshold: usize },
    #[error("invalid threshold {threshold} for {keys} authorized key(s)")]
    InvalidThreshold { threshold: usize, keys: usize },
    #[error("policy is not initialized, root of trust is missing")]
    PolicyNotInitialized,
    #[error("key '{key_id}' not found")]
    KeyNotFound { key_id: String },
    #[error("key id '{key_id}' does not match the key material")]
    KeyIdMismatch { key_id: String },
    #[error("metadata version {version} cannot be incremented")]
    VersionOverflow { version: u64 },
    #[error("invalid rule pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("verification of role '{role}' failed: {reason}")]
    VerificationFailed { role: String, reason: String },
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("mutation was cancelled before commit")]
    Cancelled,
    #[error("{context}: {source}")]
    Store {
        context: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("metadata serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("envelope encoding error: {0}")]
    Encoding(#[from] data_encoding::DecodeError),
}

impl PolicyError {
    /// Returns `true` when the error stems from a concurrent update of the target ref.
    pub fn is_ref_conflict(&self) -> bool {
        matches!(
            self,
            PolicyError::Store {
                source: StoreError::RefConflict { .. },
                ..
            }
        )
    }
}

/// Convenience alias for results emitted by the policy engine.
pub type Result<T> = std::result::Result<T, PolicyError>;

/// Attaches operation context to store results.
pub trait StoreResultExt<T> {
    fn context(self, context: &'static str) -> Result<T>;
}

impl<T> StoreResultExt<T> for std::result::Result<T, StoreError> {
    fn context(self, context: &'static str) -> Result<T> {
        self.map_err(|source| PolicyError::Store { context, source })
    }
}
