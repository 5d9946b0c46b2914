//! Public entry points for the trust policy engine.
//!
//! The crate keeps a signed, versioned hierarchy of policy documents (a root
//! of trust plus rule files delegating patterns to keys) in a
//! content-addressed object store. Hosts normally drive it through
//! [`Repository`]; the lower layers are exported for tooling that inspects
//! or verifies policy directly.

pub mod authorization;
pub mod config;
pub mod envelope;
pub mod error;
pub mod key;
pub mod logging;
pub mod message;
pub mod metadata;
pub mod repository;
pub mod role;
pub mod state;
pub mod store;

pub use config::{ConfigError, PolicyEnv};
pub use envelope::{create_envelope, sign_envelope, verify_envelope, Envelope};
pub use error::{PolicyError, Result};
pub use key::{Ed25519Signer, Key, Signer};
pub use message::PolicyAction;
pub use metadata::{Delegation, RootMetadata, TargetsMetadata};
pub use repository::{MutationContext, PolicyCommit, Repository};
pub use role::RoleName;
pub use state::{PolicyState, RuleMatch};
pub use store::{ObjectId, ObjectStore, SledObjectStore, StoreError};
