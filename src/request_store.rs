//! Durable storage of pending certificate signing requests, one PEM file per
//! common name.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use openssl::x509::X509Req;
use tempfile::NamedTempFile;

use crate::error::{AuthorityError, Result};
use crate::naming;
use crate::pem;

/// A stored signing request awaiting operator action. Immutable once
/// written; it is deleted when signed or explicitly dropped.
pub struct StoredRequest {
    pub common_name: String,
    pub path: PathBuf,
    pub pem: Vec<u8>,
    pub csr: X509Req,
}

pub struct RequestStore {
    dir: PathBuf,
}

impl RequestStore {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self { dir: dir.to_path_buf() })
    }

    pub fn path_for(&self, common_name: &str) -> PathBuf {
        self.dir.join(format!("{common_name}.pem"))
    }

    /// Store a signing request for later processing. Accepts PEM or raw DER
    /// and always stores PEM.
    ///
    /// A byte-identical resubmission is [`AuthorityError::DuplicateRequest`];
    /// a differing request under the same common name is
    /// [`AuthorityError::ConflictingCommonName`]. `overwrite` bypasses both.
    /// The write goes to a temp file and is renamed into place, so a
    /// partially written request is never visible under its final name.
    pub fn submit(&self, raw: &[u8], overwrite: bool) -> Result<StoredRequest> {
        let (csr, pem_buf) = pem::decode_csr(raw)?;
        let common_name = pem::subject_common_name(csr.subject_name())?;
        naming::validate_common_name(&common_name)?;
        let path = self.path_for(&common_name);

        if !overwrite {
            match fs::read(&path) {
                Ok(existing) if existing == pem_buf => {
                    return Err(AuthorityError::DuplicateRequest(common_name));
                }
                Ok(_) => return Err(AuthorityError::ConflictingCommonName(common_name)),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&pem_buf)?;
        tmp.persist(&path).map_err(|e| e.error)?;

        Ok(StoredRequest {
            common_name,
            path,
            pem: pem_buf,
            csr,
        })
    }

    pub fn get(&self, common_name: &str) -> Result<StoredRequest> {
        naming::validate_common_name(common_name)?;
        let path = self.path_for(common_name);
        let buf = match fs::read(&path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(AuthorityError::RequestNotFound(common_name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let (csr, pem_buf) = pem::decode_csr(&buf)?;
        Ok(StoredRequest {
            common_name: common_name.to_string(),
            path,
            pem: pem_buf,
            csr,
        })
    }

    /// Lazily enumerate stored requests in filesystem order. The order is
    /// whatever the directory yields and is not guaranteed stable.
    pub fn list(&self) -> Result<impl Iterator<Item = Result<StoredRequest>> + '_> {
        let entries = fs::read_dir(&self.dir)?;
        Ok(entries.filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e.into())),
            };
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let common_name = name.strip_suffix(".pem")?;
            match self.get(common_name) {
                // Stray files that do not parse as common names are not
                // store entries.
                Err(AuthorityError::InvalidCommonName(_)) => None,
                other => Some(other),
            }
        }))
    }

    /// Remove a stored request, returning the removed entry.
    pub fn delete(&self, common_name: &str) -> Result<StoredRequest> {
        let request = self.get(common_name)?;
        fs::remove_file(&request.path)?;
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::hash::MessageDigest;
    use openssl::nid::Nid;
    use openssl::pkey::{PKey, Private};
    use openssl::x509::X509Name;

    fn keypair() -> PKey<Private> {
        PKey::from_rsa(openssl::rsa::Rsa::generate(2048).unwrap()).unwrap()
    }

    fn csr_pem(common_name: &str, key: &PKey<Private>) -> Vec<u8> {
        let mut name = X509Name::builder().unwrap();
        name.append_entry_by_nid(Nid::COMMONNAME, common_name).unwrap();
        let mut builder = X509Req::builder().unwrap();
        builder.set_subject_name(&name.build()).unwrap();
        builder.set_pubkey(key).unwrap();
        builder.sign(key, MessageDigest::sha256()).unwrap();
        builder.build().to_pem().unwrap()
    }

    fn store() -> (tempfile::TempDir, RequestStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RequestStore::open(&dir.path().join("requests")).unwrap();
        (dir, store)
    }

    #[test]
    fn submit_then_get_is_byte_identical() {
        let (_dir, store) = store();
        let buf = csr_pem("gw.example.com", &keypair());
        let stored = store.submit(&buf, false).unwrap();
        assert_eq!(stored.common_name, "gw.example.com");

        let fetched = store.get("gw.example.com").unwrap();
        assert_eq!(fetched.pem, buf);
    }

    #[test]
    fn duplicate_and_conflicting_submissions() {
        let (_dir, store) = store();
        let key = keypair();
        let buf = csr_pem("gw.example.com", &key);
        store.submit(&buf, false).unwrap();

        assert!(matches!(
            store.submit(&buf, false),
            Err(AuthorityError::DuplicateRequest(_))
        ));

        let other = csr_pem("gw.example.com", &keypair());
        assert!(matches!(
            store.submit(&other, false),
            Err(AuthorityError::ConflictingCommonName(_))
        ));

        // Overwrite resolves the conflict in favor of the new request.
        store.submit(&other, true).unwrap();
        assert_eq!(store.get("gw.example.com").unwrap().pem, other);
    }

    #[test]
    fn invalid_common_name_is_rejected() {
        let (_dir, store) = store();
        let buf = csr_pem("not valid", &keypair());
        assert!(matches!(
            store.submit(&buf, false),
            Err(AuthorityError::InvalidCommonName(_))
        ));
        assert!(matches!(
            store.get("no/such"),
            Err(AuthorityError::InvalidCommonName(_))
        ));
    }

    #[test]
    fn list_and_delete() {
        let (_dir, store) = store();
        store.submit(&csr_pem("a.example.com", &keypair()), false).unwrap();
        store.submit(&csr_pem("b.example.com", &keypair()), false).unwrap();

        let mut names: Vec<String> = store
            .list()
            .unwrap()
            .map(|r| r.unwrap().common_name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.example.com", "b.example.com"]);

        store.delete("a.example.com").unwrap();
        assert!(matches!(
            store.get("a.example.com"),
            Err(AuthorityError::RequestNotFound(_))
        ));
        assert!(matches!(
            store.delete("a.example.com"),
            Err(AuthorityError::RequestNotFound(_))
        ));
    }
}
