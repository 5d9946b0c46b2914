//! Environment-driven settings for embedding the policy engine.
//!
//! Values are read once from the process environment (or any key/value
//! iterator in tests), trimmed, and fall back to defaults when absent or
//! unparsable. [`PolicyEnv::validate`] then rejects combinations the engine
//! cannot run with.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use thiserror::Error;

use crate::store::{SledObjectStore, StoreError};

/// Environment variable naming the staging ref mutations are committed to.
const ENV_STAGING_REF: &str = "TRUST_POLICY_STAGING_REF";
/// Environment variable naming the active (promoted) policy ref.
const ENV_POLICY_REF: &str = "TRUST_POLICY_REF";
/// Environment variable pointing at the on-disk object store.
const ENV_STORE_PATH: &str = "TRUST_POLICY_STORE_PATH";
/// Environment variable toggling detached commit signatures.
const ENV_SIGN_COMMITS: &str = "TRUST_POLICY_SIGN_COMMITS";
/// Environment variable bounding optimistic commit attempts per mutation.
const ENV_COMMIT_ATTEMPTS: &str = "TRUST_POLICY_COMMIT_ATTEMPTS";
/// Environment variable setting the log level used by [`crate::logging::init`].
const ENV_LOG_LEVEL: &str = "TRUST_POLICY_LOG_LEVEL";

/// Default staging ref.
pub const DEFAULT_STAGING_REF: &str = "refs/gittuf/policy-staging";
/// Default active policy ref.
pub const DEFAULT_POLICY_REF: &str = "refs/gittuf/policy";
/// Default log level.
const DEFAULT_LOG_LEVEL: &str = "info";
/// Log levels accepted by the subscriber.
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Errors raised by [`PolicyEnv::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    EmptyRef(&'static str),
    #[error("staging and active policy refs must differ (both are '{0}')")]
    IdenticalRefs(String),
    #[error("commit attempts must be at least 1")]
    ZeroCommitAttempts,
    #[error("unknown log level '{0}'")]
    InvalidLogLevel(String),
}

/// Captures environment-derived options for a policy repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyEnv {
    /// Ref holding in-progress policy edits.
    pub staging_ref: String,
    /// Ref holding the last verified, promoted policy.
    pub policy_ref: String,
    /// On-disk store location; `None` keeps everything in memory.
    pub store_path: Option<PathBuf>,
    /// When `true`, policy commits carry a detached signature from the mutator.
    pub sign_commits: bool,
    /// Number of load-transform-commit attempts before a ref conflict is surfaced.
    pub commit_attempts: u32,
    /// Lower-cased log level (`trace` through `error`).
    pub log_level: String,
}

impl Default for PolicyEnv {
    fn default() -> Self {
        Self::from_env_iter::<Vec<(String, String)>, _, _>(Vec::new())
    }
}

impl PolicyEnv {
    /// Builds settings from the current process environment.
    pub fn from_os_env() -> Self {
        Self::from_env_iter(env::vars())
    }

    /// Builds settings from an iterator of key/value pairs (typically for tests).
    pub fn from_env_iter<I, K, V>(iter: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let staging_ref = map
            .get(ENV_STAGING_REF)
            .and_then(|value| sanitize_non_empty(value))
            .unwrap_or_else(|| DEFAULT_STAGING_REF.to_string());
        let policy_ref = map
            .get(ENV_POLICY_REF)
            .and_then(|value| sanitize_non_empty(value))
            .unwrap_or_else(|| DEFAULT_POLICY_REF.to_string());
        let store_path = map
            .get(ENV_STORE_PATH)
            .and_then(|value| sanitize_non_empty(value))
            .map(PathBuf::from);
        let sign_commits = parse_bool(map.get(ENV_SIGN_COMMITS).map(String::as_str), false);
        let commit_attempts = map
            .get(ENV_COMMIT_ATTEMPTS)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(1);
        let log_level = map
            .get(ENV_LOG_LEVEL)
            .and_then(|value| sanitize_non_empty(value))
            .map(|value| value.to_ascii_lowercase())
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        Self {
            staging_ref,
            policy_ref,
            store_path,
            sign_commits,
            commit_attempts,
            log_level,
        }
    }

    /// Rejects settings the engine cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.staging_ref.trim().is_empty() {
            return Err(ConfigError::EmptyRef(ENV_STAGING_REF));
        }
        if self.policy_ref.trim().is_empty() {
            return Err(ConfigError::EmptyRef(ENV_POLICY_REF));
        }
        if self.staging_ref == self.policy_ref {
            return Err(ConfigError::IdenticalRefs(self.staging_ref.clone()));
        }
        if self.commit_attempts == 0 {
            return Err(ConfigError::ZeroCommitAttempts);
        }
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log_level.clone()));
        }
        Ok(())
    }

    /// Opens the configured store, in memory when no path is set.
    pub fn open_store(&self) -> Result<SledObjectStore, StoreError> {
        match &self.store_path {
            Some(path) => SledObjectStore::open(path),
            None => SledObjectStore::open_ephemeral(),
        }
    }
}

/// Helper trimming whitespace and discarding empty values.
fn sanitize_non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parses boolean values from strings, falling back to the provided default.
fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value.map(|s| s.trim().to_ascii_lowercase()) {
        Some(ref v) if ["1", "true", "t", "yes", "y"].contains(&v.as_str()) => true,
        Some(ref v) if ["0", "false", "f", "no", "n"].contains(&v.as_str()) => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Ensures defaults target the gittuf refs with an in-memory store.
    #[test]
    fn policy_env_defaults() {
        let env = PolicyEnv::default();
        assert_eq!(env.staging_ref, DEFAULT_STAGING_REF);
        assert_eq!(env.policy_ref, DEFAULT_POLICY_REF);
        assert!(env.store_path.is_none());
        assert!(!env.sign_commits);
        assert_eq!(env.commit_attempts, 1);
        assert_eq!(env.log_level, "info");
        assert_eq!(env.validate(), Ok(()));
    }

    /// Confirms environment-derived settings respect overrides.
    #[test]
    fn policy_env_honours_overrides() {
        let env = PolicyEnv::from_env_iter([
            (ENV_STAGING_REF, " refs/custom/staging "),
            (ENV_POLICY_REF, "refs/custom/policy"),
            (ENV_STORE_PATH, "/var/lib/policy.db"),
            (ENV_SIGN_COMMITS, "yes"),
            (ENV_COMMIT_ATTEMPTS, "3"),
            (ENV_LOG_LEVEL, "DEBUG"),
        ]);
        assert_eq!(env.staging_ref, "refs/custom/staging");
        assert_eq!(env.policy_ref, "refs/custom/policy");
        assert_eq!(env.store_path, Some(PathBuf::from("/var/lib/policy.db")));
        assert!(env.sign_commits);
        assert_eq!(env.commit_attempts, 3);
        assert_eq!(env.log_level, "debug");
        assert_eq!(env.validate(), Ok(()));
    }

    /// Unparsable values fall back to defaults instead of failing the load.
    #[test]
    fn policy_env_ignores_garbage() {
        let env = PolicyEnv::from_env_iter([
            (ENV_STAGING_REF, "   "),
            (ENV_SIGN_COMMITS, "maybe"),
            (ENV_COMMIT_ATTEMPTS, "many"),
        ]);
        assert_eq!(env.staging_ref, DEFAULT_STAGING_REF);
        assert!(!env.sign_commits);
        assert_eq!(env.commit_attempts, 1);
    }

    #[test]
    fn validate_rejects_unusable_settings() {
        let env = PolicyEnv::from_env_iter([(ENV_POLICY_REF, DEFAULT_STAGING_REF)]);
        assert_eq!(
            env.validate(),
            Err(ConfigError::IdenticalRefs(DEFAULT_STAGING_REF.to_string()))
        );

        let env = PolicyEnv::from_env_iter([(ENV_COMMIT_ATTEMPTS, "0")]);
        assert_eq!(env.validate(), Err(ConfigError::ZeroCommitAttempts));

        let env = PolicyEnv::from_env_iter([(ENV_LOG_LEVEL, "verbose")]);
        assert_eq!(
            env.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".into()))
        );

        let env = PolicyEnv {
            staging_ref: String::new(),
            ..PolicyEnv::default()
        };
        assert_eq!(env.validate(), Err(ConfigError::EmptyRef(ENV_STAGING_REF)));
    }

    /// The configured path decides between an on-disk and an in-memory store.
    #[test]
    fn open_store_follows_store_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("policy.db");
        let env = PolicyEnv::from_env_iter([(ENV_STORE_PATH, path.to_string_lossy().to_string())]);
        let store = env.open_store().unwrap();
        assert_eq!(store.path(), path.as_path());

        let store = PolicyEnv::default().open_store().unwrap();
        assert!(store.path().as_os_str().is_empty());
    }
}
