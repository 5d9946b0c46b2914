//! Content-addressed object store holding policy commits.
//!
//! The engine only talks to the store through [`ObjectStore`]: blobs, trees
//! and commits are immutable and addressed by the SHA-256 of their encoded
//! form, and refs move exclusively through compare-and-swap. The sled-backed
//! [`SledObjectStore`] keeps objects and refs in separate trees next to a
//! format record, much like a bare Git directory.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use data_encoding::BASE64;
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sled::{Config as SledConfig, Db, Tree};
use thiserror::Error;
use time::OffsetDateTime;

use crate::key::{Key, Signer};

/// Tree name dedicated to store metadata records.
const META_TREE: &str = "__meta";
/// Key for the JSON-encoded [`StoreMetadata`] record.
const META_KEY: &[u8] = b"meta.json";
/// Name of the tree storing encoded objects keyed by id.
const TREE_OBJECTS: &str = "objects";
/// Name of the tree storing ref names and the object ids they point at.
const TREE_REFS: &str = "refs";
/// On-disk layout version written by this crate.
pub const STORE_FORMAT_VERSION: u32 = 1;

/// Errors emitted by object stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("object '{0}' not found")]
    MissingObject(String),
    #[error("object '{id}' is corrupt: {reason}")]
    CorruptObject { id: String, reason: String },
    #[error("object '{id}' is a {actual}, expected a {expected}")]
    UnexpectedKind {
        id: String,
        expected: ObjectKind,
        actual: ObjectKind,
    },
    #[error("ref '{name}' moved concurrently")]
    RefConflict { name: String },
    #[error("store format {found} is not supported (expected {expected})")]
    IncompatibleFormat { found: u32, expected: u32 },
    #[error("metadata missing from object store")]
    MissingMetadata,
    #[error("commit signing failed: {0}")]
    Signing(String),
}

/// Hex-encoded SHA-256 identifier of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(value: &str) -> Self {
        ObjectId(value.to_string())
    }
}

/// Kinds of objects understood by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

impl ObjectKind {
    fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "blob" => Some(ObjectKind::Blob),
            "tree" => Some(ObjectKind::Tree),
            "commit" => Some(ObjectKind::Commit),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat mapping from entry names to object ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeObject {
    pub entries: BTreeMap<String, ObjectId>,
}

/// Detached signature attributing a commit object to a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSignature {
    pub key_id: String,
    /// Base64-encoded signature over the unsigned commit encoding.
    pub signature: String,
}

/// A snapshot of a tree plus its history and audit message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitObject {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<CommitSignature>,
}

impl CommitObject {
    /// Bytes covered by the commit signature (the commit without its signature).
    pub fn signing_payload(&self) -> Result<Vec<u8>, StoreError> {
        let unsigned = CommitObject {
            signature: None,
            ..self.clone()
        };
        Ok(serde_json::to_vec(&unsigned)?)
    }

    pub fn first_parent(&self) -> Option<&ObjectId> {
        self.parents.first()
    }
}

/// Returns `true` when the commit carries a valid signature from `key`.
pub fn verify_commit_signature(commit: &CommitObject, key: &Key) -> bool {
    let Some(signature) = commit.signature.as_ref() else {
        return false;
    };
    if signature.key_id != key.key_id {
        return false;
    }
    let Ok(payload) = commit.signing_payload() else {
        return false;
    };
    let Ok(bytes) = BASE64.decode(signature.signature.as_bytes()) else {
        return false;
    };
    key.verify(&payload, &bytes)
}

/// Versioned object store consumed by the policy engine.
pub trait ObjectStore: Send + Sync {
    /// Resolves a ref, returning `None` when it does not exist.
    fn read_ref(&self, name: &str) -> Result<Option<ObjectId>, StoreError>;

    /// Reads the raw content and kind of an object.
    fn read_object(&self, id: &ObjectId) -> Result<(ObjectKind, Vec<u8>), StoreError>;

    /// Stores an object, returning its content-derived id.
    fn write_object(&self, kind: ObjectKind, content: &[u8]) -> Result<ObjectId, StoreError>;

    /// Moves `name` from `expected` to `new` atomically.
    ///
    /// `expected = None` requires the ref to be absent. Any mismatch yields
    /// [`StoreError::RefConflict`] and leaves the ref untouched.
    fn update_ref(
        &self,
        name: &str,
        expected: Option<&ObjectId>,
        new: &ObjectId,
    ) -> Result<(), StoreError>;

    fn write_blob(&self, content: &[u8]) -> Result<ObjectId, StoreError> {
        self.write_object(ObjectKind::Blob, content)
    }

    fn read_blob(&self, id: &ObjectId) -> Result<Vec<u8>, StoreError> {
        read_kind(self, id, ObjectKind::Blob)
    }

    fn write_tree(&self, tree: &TreeObject) -> Result<ObjectId, StoreError> {
        self.write_object(ObjectKind::Tree, &serde_json::to_vec(tree)?)
    }

    fn read_tree(&self, id: &ObjectId) -> Result<TreeObject, StoreError> {
        Ok(serde_json::from_slice(&read_kind(self, id, ObjectKind::Tree)?)?)
    }

    /// Creates a commit, optionally carrying a detached signature from `signer`.
    fn write_commit(
        &self,
        parents: Vec<ObjectId>,
        tree: ObjectId,
        message: &str,
        signer: Option<&dyn Signer>,
    ) -> Result<ObjectId, StoreError> {
        let mut commit = CommitObject {
            tree,
            parents,
            message: message.to_string(),
            timestamp: OffsetDateTime::now_utc(),
            signature: None,
        };
        if let Some(signer) = signer {
            let payload = commit.signing_payload()?;
            let signature = signer
                .sign(&payload)
                .map_err(|err| StoreError::Signing(err.to_string()))?;
            commit.signature = Some(CommitSignature {
                key_id: signer.key_id().to_string(),
                signature: BASE64.encode(&signature),
            });
        }
        self.write_object(ObjectKind::Commit, &serde_json::to_vec(&commit)?)
    }

    fn read_commit(&self, id: &ObjectId) -> Result<CommitObject, StoreError> {
        Ok(serde_json::from_slice(&read_kind(
            self,
            id,
            ObjectKind::Commit,
        )?)?)
    }
}

fn read_kind<S: ObjectStore + ?Sized>(
    store: &S,
    id: &ObjectId,
    expected: ObjectKind,
) -> Result<Vec<u8>, StoreError> {
    let (actual, content) = store.read_object(id)?;
    if actual != expected {
        return Err(StoreError::UnexpectedKind {
            id: id.to_string(),
            expected,
            actual,
        });
    }
    Ok(content)
}

/// Encodes an object as `"<kind> <len>\0<content>"`.
fn encode_object(kind: ObjectKind, content: &[u8]) -> Vec<u8> {
    let header = format!("{} {}\0", kind.as_str(), content.len());
    let mut encoded = Vec::with_capacity(header.len() + content.len());
    encoded.extend_from_slice(header.as_bytes());
    encoded.extend_from_slice(content);
    encoded
}

fn decode_object(id: &ObjectId, encoded: &[u8]) -> Result<(ObjectKind, Vec<u8>), StoreError> {
    let corrupt = |reason: &str| StoreError::CorruptObject {
        id: id.to_string(),
        reason: reason.to_string(),
    };
    let split = encoded
        .iter()
        .position(|byte| *byte == 0)
        .ok_or_else(|| corrupt("missing header terminator"))?;
    let header = std::str::from_utf8(&encoded[..split]).map_err(|_| corrupt("non-utf8 header"))?;
    let (kind, length) = header
        .split_once(' ')
        .ok_or_else(|| corrupt("malformed header"))?;
    let kind = ObjectKind::parse(kind).ok_or_else(|| corrupt("unknown object kind"))?;
    let content = &encoded[split + 1..];
    if length.parse::<usize>().ok() != Some(content.len()) {
        return Err(corrupt("length mismatch"));
    }
    Ok((kind, content.to_vec()))
}

fn object_id(encoded: &[u8]) -> ObjectId {
    let mut hasher = Sha256::new();
    hasher.update(encoded);
    ObjectId(hex_encode(hasher.finalize()))
}

/// Metadata persisted alongside the embedded database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreMetadata {
    /// Layout version of the objects and refs trees.
    pub format_version: u32,
    /// RFC3339 timestamp when the store was created.
    #[serde(with = "time::serde::rfc3339")]
    pub creation_time: OffsetDateTime,
}

/// Sled-backed [`ObjectStore`].
#[derive(Debug, Clone)]
pub struct SledObjectStore {
    db: Db,
    objects: Tree,
    refs: Tree,
    path: PathBuf,
}

impl SledObjectStore {
    /// Opens (or creates) an object store at the provided path.
    ///
    /// A store written with a different layout is reported rather than wiped,
    /// since policy history must never be discarded implicitly.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                // sled does not create intermediate directories automatically.
                fs::create_dir_all(parent)?;
            }
        }
        let db = sled_config(&path).open()?;
        let store = Self::from_db(db, path)?;
        store.validate_or_write_metadata()?;
        Ok(store)
    }

    /// Opens an in-memory store (lost when dropped).
    pub fn open_ephemeral() -> Result<Self, StoreError> {
        let db = SledConfig::new().temporary(true).open()?;
        let store = Self::from_db(db, PathBuf::new())?;
        store.write_metadata()?;
        Ok(store)
    }

    fn from_db(db: Db, path: PathBuf) -> Result<Self, StoreError> {
        let objects = db.open_tree(TREE_OBJECTS)?;
        let refs = db.open_tree(TREE_REFS)?;
        Ok(Self {
            db,
            objects,
            refs,
            path,
        })
    }

    /// Returns the filesystem path backing the store.
    ///
    /// Ephemeral stores return an empty path because data resides in memory only.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> Result<StoreMetadata, StoreError> {
        let tree = self.db.open_tree(META_TREE)?;
        let Some(bytes) = tree.get(META_KEY)? else {
            return Err(StoreError::MissingMetadata);
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Flushes pending writes to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Lists every ref with the object it points at.
    pub fn refs(&self) -> Result<BTreeMap<String, ObjectId>, StoreError> {
        let mut refs = BTreeMap::new();
        for entry in self.refs.iter() {
            let (name, id) = entry?;
            refs.insert(
                String::from_utf8_lossy(&name).to_string(),
                ObjectId(String::from_utf8_lossy(&id).to_string()),
            );
        }
        Ok(refs)
    }

    fn validate_or_write_metadata(&self) -> Result<(), StoreError> {
        match self.metadata() {
            Ok(metadata) if metadata.format_version == STORE_FORMAT_VERSION => Ok(()),
            Ok(metadata) => Err(StoreError::IncompatibleFormat {
                found: metadata.format_version,
                expected: STORE_FORMAT_VERSION,
            }),
            Err(StoreError::MissingMetadata) => self.write_metadata(),
            Err(err) => Err(err),
        }
    }

    fn write_metadata(&self) -> Result<(), StoreError> {
        let metadata = StoreMetadata {
            format_version: STORE_FORMAT_VERSION,
            creation_time: OffsetDateTime::now_utc(),
        };
        let bytes = serde_json::to_vec(&metadata)?;
        let tree = self.db.open_tree(META_TREE)?;
        tree.insert(META_KEY, bytes)?;
        tree.flush()?;
        Ok(())
    }
}

impl ObjectStore for SledObjectStore {
    fn read_ref(&self, name: &str) -> Result<Option<ObjectId>, StoreError> {
        Ok(self
            .refs
            .get(name.as_bytes())?
            .map(|id| ObjectId(String::from_utf8_lossy(&id).to_string())))
    }

    fn read_object(&self, id: &ObjectId) -> Result<(ObjectKind, Vec<u8>), StoreError> {
        let Some(encoded) = self.objects.get(id.as_str().as_bytes())? else {
            return Err(StoreError::MissingObject(id.to_string()));
        };
        decode_object(id, &encoded)
    }

    fn write_object(&self, kind: ObjectKind, content: &[u8]) -> Result<ObjectId, StoreError> {
        let encoded = encode_object(kind, content);
        let id = object_id(&encoded);
        // Objects are immutable, so rewriting an existing id is a no-op.
        self.objects.insert(id.as_str().as_bytes(), encoded)?;
        Ok(id)
    }

    fn update_ref(
        &self,
        name: &str,
        expected: Option<&ObjectId>,
        new: &ObjectId,
    ) -> Result<(), StoreError> {
        let swapped = self.refs.compare_and_swap(
            name.as_bytes(),
            expected.map(|id| id.as_str().as_bytes()),
            Some(new.as_str().as_bytes()),
        )?;
        if swapped.is_err() {
            return Err(StoreError::RefConflict {
                name: name.to_string(),
            });
        }
        self.refs.flush()?;
        Ok(())
    }
}

/// Builds a sled configuration using the provided filesystem path.
fn sled_config(path: &Path) -> SledConfig {
    let mut config = SledConfig::new();
    config = config.path(path);
    config = config.cache_capacity(16 * 1024 * 1024); // 16MB cache
    config
}
