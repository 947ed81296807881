//! Storage seam consumed by the fetch engine.
//!
//! The content-addressed store lives outside this crate; the engine only
//! needs the narrow contract below. [`MemStore`] is an in-memory
//! implementation for tests and embedders without a database.

use crate::types::{BundleId, Manifest, PayloadHash};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store query failed: {0}")]
    Query(String),
    #[error("manifest signature verification failed")]
    BadSignature,
    #[error("malformed manifest: {0}")]
    BadManifest(String),
    #[error("bundle import failed: {0}")]
    Import(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Contract the engine holds against the local bundle store.
pub trait Store {
    /// Version of the stored manifest with this id, if any.
    fn lookup_version(&self, id: &BundleId) -> Result<Option<u64>, StoreError>;

    /// Whether a payload with this hash is already stored and valid.
    fn has_payload(&self, hash: &PayloadHash) -> Result<bool, StoreError>;

    /// Verify the manifest's signature chain.
    fn verify_manifest(&self, manifest: &Manifest) -> Result<(), StoreError>;

    /// Add a complete bundle (manifest plus any payload attached via
    /// `payload_path`) to the store, re-advertising with the given ttl.
    fn import_bundle(&self, manifest: &Manifest, ttl: u8) -> Result<(), StoreError>;

    /// Parse a manifest from a file fetched into the scratch directory.
    fn read_manifest_file(&self, path: &Path) -> Result<Manifest, StoreError>;
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

#[derive(Default)]
struct MemStoreInner {
    manifests: HashMap<BundleId, u64>,
    payloads: HashSet<PayloadHash>,
    /// Ids whose manifests fail verification.
    unverifiable: HashSet<BundleId>,
    imported: Vec<ImportRecord>,
}

/// One completed import, with the payload bytes captured at import time.
#[derive(Debug, Clone)]
pub struct ImportRecord {
    pub manifest: Manifest,
    pub ttl: u8,
    pub payload: Option<Vec<u8>>,
}

/// In-memory [`Store`] implementation.
///
/// Clones share state, so a test can hand one clone to the engine and keep
/// another for inspection. Payload bytes are captured at import time (the
/// engine unlinks scratch files as soon as the importer returns), so callers
/// can see exactly what was fetched.
#[derive(Default, Clone)]
pub struct MemStore {
    inner: Rc<RefCell<MemStoreInner>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a stored manifest version.
    pub fn insert_manifest(&self, id: BundleId, version: u64) {
        self.inner.borrow_mut().manifests.insert(id, version);
    }

    /// Pre-populate a stored payload.
    pub fn insert_payload(&self, hash: PayloadHash) {
        self.inner.borrow_mut().payloads.insert(hash);
    }

    /// Make verification fail (or succeed again) for this id.
    pub fn set_unverifiable(&self, id: BundleId, bad: bool) {
        let mut inner = self.inner.borrow_mut();
        if bad {
            inner.unverifiable.insert(id);
        } else {
            inner.unverifiable.remove(&id);
        }
    }

    /// Every import performed so far, in order.
    pub fn imports(&self) -> Vec<ImportRecord> {
        self.inner.borrow().imported.clone()
    }
}

impl Store for MemStore {
    fn lookup_version(&self, id: &BundleId) -> Result<Option<u64>, StoreError> {
        Ok(self.inner.borrow().manifests.get(id).copied())
    }

    fn has_payload(&self, hash: &PayloadHash) -> Result<bool, StoreError> {
        Ok(self.inner.borrow().payloads.contains(hash))
    }

    fn verify_manifest(&self, manifest: &Manifest) -> Result<(), StoreError> {
        if self.inner.borrow().unverifiable.contains(&manifest.id) {
            return Err(StoreError::BadSignature);
        }
        Ok(())
    }

    fn import_bundle(&self, manifest: &Manifest, ttl: u8) -> Result<(), StoreError> {
        let payload = match &manifest.payload_path {
            Some(path) => Some(fs::read(path)?),
            None => None,
        };
        let mut inner = self.inner.borrow_mut();
        inner.manifests.insert(manifest.id, manifest.version);
        inner.payloads.insert(manifest.payload_hash);
        inner.imported.push(ImportRecord { manifest: manifest.clone(), ttl, payload });
        Ok(())
    }

    fn read_manifest_file(&self, path: &Path) -> Result<Manifest, StoreError> {
        let text = fs::read_to_string(path)?;
        parse_manifest_text(&text)
    }
}

/// Parse the `key=value` manifest text format.
///
/// Required fields: `id`, `version`, `filesize`, `filehash`. Optional:
/// `ttl`, `selfsigned`.
pub fn parse_manifest_text(text: &str) -> Result<Manifest, StoreError> {
    let mut id = None;
    let mut version = None;
    let mut filesize = None;
    let mut filehash = None;
    let mut ttl = 1u8;
    let mut self_signed = false;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(StoreError::BadManifest(format!("bad line `{line}`")));
        };
        match key {
            "id" => id = Some(parse_hex_32(value, "id")?),
            "version" => {
                version = Some(
                    value
                        .parse()
                        .map_err(|_| StoreError::BadManifest("bad version".into()))?,
                )
            }
            "filesize" => {
                filesize = Some(
                    value
                        .parse()
                        .map_err(|_| StoreError::BadManifest("bad filesize".into()))?,
                )
            }
            "filehash" => filehash = Some(parse_hex_32(value, "filehash")?),
            "ttl" => {
                ttl = value
                    .parse()
                    .map_err(|_| StoreError::BadManifest("bad ttl".into()))?
            }
            "selfsigned" => self_signed = value == "1" || value == "true",
            _ => {} // unrecognised fields ride along unparsed
        }
    }
    let id = id.ok_or_else(|| StoreError::BadManifest("missing id".into()))?;
    let version = version.ok_or_else(|| StoreError::BadManifest("missing version".into()))?;
    let filesize = filesize.ok_or_else(|| StoreError::BadManifest("missing filesize".into()))?;
    let filehash = filehash.ok_or_else(|| StoreError::BadManifest("missing filehash".into()))?;
    let mut m = Manifest::new(BundleId(id), version, filesize, PayloadHash(filehash));
    m.ttl = ttl;
    m.self_signed = self_signed;
    Ok(m)
}

fn parse_hex_32(value: &str, field: &str) -> Result<[u8; 32], StoreError> {
    let bytes = hex::decode(value.trim())
        .map_err(|_| StoreError::BadManifest(format!("{field} is not hex")))?;
    bytes
        .try_into()
        .map_err(|_| StoreError::BadManifest(format!("{field} must be 64 hex digits")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest_text_roundtrip() {
        let id = "11".repeat(32);
        let hash = "22".repeat(32);
        let text = format!("id={id}\nversion=7\nfilesize=42\nfilehash={hash}\nttl=3\n");
        let m = parse_manifest_text(&text).unwrap();
        assert_eq!(m.id, BundleId([0x11; 32]));
        assert_eq!(m.version, 7);
        assert_eq!(m.payload_len, 42);
        assert_eq!(m.payload_hash, PayloadHash([0x22; 32]));
        assert_eq!(m.ttl, 3);
    }

    #[test]
    fn test_parse_manifest_text_missing_field() {
        let err = parse_manifest_text("version=1\n").unwrap_err();
        assert!(matches!(err, StoreError::BadManifest(_)));
    }

    #[test]
    fn test_mem_store_versions_and_payloads() {
        let store = MemStore::new();
        let id = BundleId([9; 32]);
        assert_eq!(store.lookup_version(&id).unwrap(), None);
        store.insert_manifest(id, 4);
        assert_eq!(store.lookup_version(&id).unwrap(), Some(4));
        let hash = PayloadHash([7; 32]);
        assert!(!store.has_payload(&hash).unwrap());
        store.insert_payload(hash);
        assert!(store.has_payload(&hash).unwrap());
    }
}
