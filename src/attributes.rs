//! Attribute storage attached to stored requests and certificates.
//!
//! The authority keeps submission metadata, tags, lease records and
//! machine-reported attributes as namespaced key/value pairs physically
//! attached to the storage entry: `request.*`, `xdg.tags`, `lease.*`,
//! `machine.*`. The canonical backend writes extended file attributes under
//! the `user.` root marker, exactly the layout tooling like `getfattr`
//! expects. A JSON sidecar backend covers filesystems without user xattrs.
//!
//! Absence of a key or namespace is a normal state and is reported as an
//! explicit not-found, never as an empty value.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{Map, Value};

use crate::error::{AuthorityError, Result};

/// Root marker for extended attributes in the user namespace.
pub const ROOT_MARKER: &str = "user.";

/// Attribute key holding the comma-joined tag list.
pub const TAGS_KEY: &str = "xdg.tags";

/// Key/value metadata on a storage entry. Keys are dot-separated and never
/// include the root marker; the backend owns that detail. There is no
/// multi-key transaction: concurrent writers to the same entry can interleave
/// at key granularity.
pub trait AttributeBackend: Send + Sync {
    /// All attribute keys present on the entry.
    fn list(&self, path: &Path) -> Result<Vec<String>>;

    /// A single attribute value, `None` when the key is absent.
    fn get(&self, path: &Path, key: &str) -> Result<Option<Vec<u8>>>;

    fn set(&self, path: &Path, key: &str, value: &[u8]) -> Result<()>;
}

/// Extended-file-attribute backend: keys like `user.lease.last_seen`
/// directly on the PEM file. Attributes travel with the file on rename.
pub struct XattrBackend;

impl AttributeBackend for XattrBackend {
    fn list(&self, path: &Path) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for name in xattr::list(path)? {
            if let Some(name) = name.to_str() {
                if let Some(stripped) = name.strip_prefix(ROOT_MARKER) {
                    keys.push(stripped.to_string());
                }
            }
        }
        Ok(keys)
    }

    fn get(&self, path: &Path, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(xattr::get(path, format!("{ROOT_MARKER}{key}"))?)
    }

    fn set(&self, path: &Path, key: &str, value: &[u8]) -> Result<()> {
        xattr::set(path, format!("{ROOT_MARKER}{key}"), value)?;
        Ok(())
    }
}

/// Sidecar backend: attributes for `<entry>` live in `<entry>.attrs` as a
/// JSON map of key to base64 value. Unlike xattrs these records do not
/// travel with a rename, so callers replay attributes explicitly when an
/// entry moves between stores.
pub struct SidecarBackend;

impl SidecarBackend {
    fn sidecar_path(path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".attrs");
        path.with_file_name(name)
    }

    fn read_map(path: &Path) -> Result<BTreeMap<String, String>> {
        match fs::read(Self::sidecar_path(path)) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| AuthorityError::Malformed(format!("attribute sidecar: {e}"))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_map(path: &Path, map: &BTreeMap<String, String>) -> Result<()> {
        let raw = serde_json::to_vec(map)
            .map_err(|e| AuthorityError::Malformed(format!("attribute sidecar: {e}")))?;
        fs::write(Self::sidecar_path(path), raw)?;
        Ok(())
    }
}

impl AttributeBackend for SidecarBackend {
    fn list(&self, path: &Path) -> Result<Vec<String>> {
        Ok(Self::read_map(path)?.into_keys().collect())
    }

    fn get(&self, path: &Path, key: &str) -> Result<Option<Vec<u8>>> {
        match Self::read_map(path)?.get(key) {
            Some(encoded) => {
                let value = BASE64
                    .decode(encoded)
                    .map_err(|e| AuthorityError::Malformed(format!("attribute sidecar: {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn set(&self, path: &Path, key: &str, value: &[u8]) -> Result<()> {
        // Match xattr semantics: attributes only exist on an existing entry.
        if !path.exists() {
            return Err(std::io::Error::new(
                ErrorKind::NotFound,
                format!("no such entry: {}", path.display()),
            )
            .into());
        }
        let mut map = Self::read_map(path)?;
        map.insert(key.to_string(), BASE64.encode(value));
        Self::write_map(path, &map)
    }
}

/// Reconstruct the nested attribute mapping from dot-separated keys.
///
/// With a namespace, only keys under `<namespace>.` are included and the
/// prefix is stripped, so `lease.last_seen` surfaces as `last_seen`. A
/// namespace with no keys at all is [`AuthorityError::AttributeNotFound`],
/// which keeps "never reported" distinguishable from "reported empty".
pub fn attribute_tree(
    backend: &dyn AttributeBackend,
    path: &Path,
    namespace: Option<&str>,
) -> Result<Map<String, Value>> {
    let mut tree = Map::new();
    let mut matched = false;
    for key in backend.list(path)? {
        let suffix = match namespace {
            Some(ns) => match key.strip_prefix(ns).and_then(|k| k.strip_prefix('.')) {
                Some(rest) => rest.to_string(),
                None => continue,
            },
            None => key.clone(),
        };
        let Some(value) = backend.get(path, &key)? else {
            continue;
        };
        matched = true;
        insert_leaf(&mut tree, &suffix, &value);
    }
    match namespace {
        Some(ns) if !matched => Err(AuthorityError::AttributeNotFound(ns.to_string())),
        _ => Ok(tree),
    }
}

fn insert_leaf(tree: &mut Map<String, Value>, dotted: &str, value: &[u8]) {
    let mut parts: Vec<&str> = dotted.split('.').collect();
    let leaf = parts.pop().unwrap_or(dotted);
    let mut current = tree;
    for part in parts {
        let slot = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = slot.as_object_mut().expect("slot was just made an object");
    }
    current.insert(
        leaf.to_string(),
        Value::String(String::from_utf8_lossy(value).into_owned()),
    );
}

/// A single tag, either a bare token or `key=value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: Option<String>,
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}", self.key, value),
            None => write!(f, "{}", self.key),
        }
    }
}

pub fn parse_tags(raw: &[u8]) -> Vec<Tag> {
    String::from_utf8_lossy(raw)
        .split(',')
        .filter(|token| !token.is_empty())
        .map(|token| match token.split_once('=') {
            Some((key, value)) => Tag {
                key: key.to_string(),
                value: Some(value.to_string()),
            },
            None => Tag {
                key: token.to_string(),
                value: None,
            },
        })
        .collect()
}

pub fn serialize_tags(tags: &[Tag]) -> String {
    tags.iter()
        .map(Tag::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
