//! Role identity.
//!
//! The trust anchor is a variant of its own rather than a magic string, so a
//! rule or policy file can never shadow it by picking the name `"root"`.

use std::fmt;

/// Reserved name of the trust anchor.
pub const ROOT_ROLE_NAME: &str = "root";
/// Name of the top-level rule file authorized directly by the root.
pub const TARGETS_ROLE_NAME: &str = "targets";

/// Identifies a metadata document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoleName {
    /// The root of trust.
    Root,
    /// A rule file; `"targets"` is the top-level one, everything else is delegated.
    Targets(String),
}

impl RoleName {
    /// Classifies a user-provided name.
    pub fn parse(name: &str) -> Self {
        if name == ROOT_ROLE_NAME {
            RoleName::Root
        } else {
            RoleName::Targets(name.to_string())
        }
    }

    /// The top-level targets role.
    pub fn top_level_targets() -> Self {
        RoleName::Targets(TARGETS_ROLE_NAME.to_string())
    }

    pub fn is_root(&self) -> bool {
        matches!(self, RoleName::Root)
    }

    /// Returns `true` for the top-level targets role.
    pub fn is_top_level_targets(&self) -> bool {
        matches!(self, RoleName::Targets(name) if name == TARGETS_ROLE_NAME)
    }

    pub fn as_str(&self) -> &str {
        match self {
            RoleName::Root => ROOT_ROLE_NAME,
            RoleName::Targets(name) => name,
        }
    }

    /// File name of the role's envelope inside the policy tree.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.as_str())
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
