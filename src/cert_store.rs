//! Signed and revoked certificate stores.
//!
//! Layout: one PEM file per common name in the signed directory, a parallel
//! `by-serial` index directory holding one symlink per signed certificate,
//! and an append-only revoked directory named by lowercase hex serial. The
//! revoked store feeds the CRL and its entries are never deleted.

use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{symlink, MetadataExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use const_oid::db::rfc5280::{ID_CE_EXT_KEY_USAGE, ID_KP_SERVER_AUTH};
use der::Decode;
use openssl::x509::X509;
use tempfile::NamedTempFile;
use x509_cert::ext::pkix::ExtendedKeyUsage;

use crate::error::{AuthorityError, Result};
use crate::naming::{self, CertProfile};
use crate::pem;

/// A certificate in the signed store.
pub struct StoredCertificate {
    pub common_name: String,
    pub path: PathBuf,
    pub pem: Vec<u8>,
    pub certificate: X509,
    pub serial_hex: String,
    pub profile: CertProfile,
}

/// An entry in the revoked store. The revocation time is the store-entry
/// creation time rather than a field of its own.
pub struct RevokedCertificate {
    pub common_name: String,
    pub path: PathBuf,
    pub pem: Vec<u8>,
    pub certificate: X509,
    pub serial_hex: String,
    pub revoked_at: SystemTime,
}

pub struct CertificateStore {
    signed_dir: PathBuf,
    by_serial_dir: PathBuf,
    revoked_dir: PathBuf,
}

impl CertificateStore {
    pub fn open(signed_dir: &Path, by_serial_dir: &Path, revoked_dir: &Path) -> Result<Self> {
        fs::create_dir_all(signed_dir)?;
        fs::create_dir_all(by_serial_dir)?;
        fs::create_dir_all(revoked_dir)?;
        Ok(Self {
            signed_dir: signed_dir.to_path_buf(),
            by_serial_dir: by_serial_dir.to_path_buf(),
            revoked_dir: revoked_dir.to_path_buf(),
        })
    }

    pub fn signed_path(&self, common_name: &str) -> PathBuf {
        self.signed_dir.join(format!("{common_name}.pem"))
    }

    pub fn revoked_path(&self, serial_hex: &str) -> PathBuf {
        self.revoked_dir.join(format!("{serial_hex}.pem"))
    }

    pub fn serial_link_path(&self, serial_hex: &str) -> PathBuf {
        self.by_serial_dir.join(format!("{serial_hex}.pem"))
    }

    pub fn get_signed(&self, common_name: &str) -> Result<StoredCertificate> {
        naming::validate_common_name(common_name)?;
        let path = self.signed_path(common_name);
        let pem_buf = read_entry(&path, || {
            AuthorityError::CertificateNotFound(common_name.to_string())
        })?;
        load_certificate(common_name.to_string(), path, pem_buf)
    }

    /// Resolve a signed certificate through the by-serial index.
    pub fn get_by_serial(&self, serial_hex: &str) -> Result<StoredCertificate> {
        validate_serial_hex(serial_hex)?;
        let path = self.serial_link_path(serial_hex);
        let pem_buf = read_entry(&path, || {
            AuthorityError::CertificateNotFound(serial_hex.to_string())
        })?;
        let certificate = pem::decode_certificate(&pem_buf)?;
        let common_name = pem::subject_common_name(certificate.subject_name())?;
        load_certificate(common_name, path, pem_buf)
    }

    pub fn get_revoked(&self, serial_hex: &str) -> Result<RevokedCertificate> {
        validate_serial_hex(serial_hex)?;
        let path = self.revoked_path(serial_hex);
        let pem_buf = read_entry(&path, || {
            AuthorityError::CertificateNotFound(serial_hex.to_string())
        })?;
        let certificate = pem::decode_certificate(&pem_buf)?;
        let common_name = pem::subject_common_name(certificate.subject_name())?;
        let revoked_at = entry_creation_time(&path)?;
        Ok(RevokedCertificate {
            common_name,
            path,
            pem: pem_buf,
            certificate,
            serial_hex: serial_hex.to_string(),
            revoked_at,
        })
    }

    /// Lazily enumerate the signed store in filesystem order.
    pub fn list_signed(&self) -> Result<impl Iterator<Item = Result<StoredCertificate>> + '_> {
        let entries = fs::read_dir(&self.signed_dir)?;
        Ok(entries.filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e.into())),
            };
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let common_name = name.strip_suffix(".pem")?;
            match self.get_signed(common_name) {
                Err(AuthorityError::InvalidCommonName(_)) => None,
                other => Some(other),
            }
        }))
    }

    /// Lazily enumerate the revoked store in filesystem order.
    pub fn list_revoked(&self) -> Result<impl Iterator<Item = Result<RevokedCertificate>> + '_> {
        let entries = fs::read_dir(&self.revoked_dir)?;
        Ok(entries.filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e.into())),
            };
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let serial_hex = name.strip_suffix(".pem")?;
            Some(self.get_revoked(serial_hex))
        }))
    }

    /// Atomically publish a signed certificate under its common name.
    pub fn write_signed(&self, common_name: &str, pem_buf: &[u8]) -> Result<PathBuf> {
        let path = self.signed_path(common_name);
        let mut tmp = NamedTempFile::new_in(&self.signed_dir)?;
        tmp.write_all(pem_buf)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(path)
    }

    /// Create the by-serial index entry for a freshly signed certificate.
    /// An occupied slot means two certificates claimed one serial, which is
    /// state corruption and aborts the operation.
    pub fn link_serial(&self, serial_hex: &str, common_name: &str) -> Result<()> {
        let link = self.serial_link_path(serial_hex);
        if link.symlink_metadata().is_ok() {
            return Err(AuthorityError::SerialIndexOccupied(serial_hex.to_string()));
        }
        let target = if self.by_serial_dir.parent() == Some(self.signed_dir.as_path()) {
            Path::new("..").join(format!("{common_name}.pem"))
        } else {
            fs::canonicalize(self.signed_path(common_name))?
        };
        symlink(target, &link)?;
        Ok(())
    }

    /// Move a signed certificate into the revoked store and drop its index
    /// entry. The rename is the commit point; whatever ctime the revoked
    /// entry ends up with becomes the revocation time.
    pub fn move_to_revoked(&self, common_name: &str, serial_hex: &str) -> Result<PathBuf> {
        let from = self.signed_path(common_name);
        let to = self.revoked_path(serial_hex);
        fs::rename(&from, &to)?;
        fs::remove_file(self.serial_link_path(serial_hex))?;
        Ok(to)
    }
}

/// Serials are store keys joined into paths, so anything outside lowercase
/// hex is rejected before touching the filesystem.
fn validate_serial_hex(serial_hex: &str) -> Result<()> {
    if !serial_hex.is_empty()
        && serial_hex
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    {
        Ok(())
    } else {
        Err(AuthorityError::Malformed(format!(
            "serial number {serial_hex:?}"
        )))
    }
}

fn read_entry(path: &Path, missing: impl FnOnce() -> AuthorityError) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(buf) => Ok(buf),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(missing()),
        Err(e) => Err(e.into()),
    }
}

fn load_certificate(
    common_name: String,
    path: PathBuf,
    pem_buf: Vec<u8>,
) -> Result<StoredCertificate> {
    let certificate = pem::decode_certificate(&pem_buf)?;
    let serial_hex = pem::serial_hex(&certificate)?;
    let profile = profile_from_eku(&certificate)?;
    Ok(StoredCertificate {
        common_name,
        path,
        pem: pem_buf,
        certificate,
        serial_hex,
        profile,
    })
}

/// Store-entry creation time, which stands in for the revocation timestamp.
fn entry_creation_time(path: &Path) -> Result<SystemTime> {
    let meta = fs::metadata(path)?;
    Ok(UNIX_EPOCH + Duration::from_secs(meta.ctime().max(0) as u64))
}

/// Classify server vs client by looking for the server-auth capability in
/// the extended-key-usage extension. rust-openssl exposes no EKU accessor,
/// so the DER is inspected with the RustCrypto types.
fn profile_from_eku(certificate: &X509) -> Result<CertProfile> {
    let der_bytes = certificate.to_der()?;
    let parsed = x509_cert::Certificate::from_der(&der_bytes)?;
    if let Some(extensions) = &parsed.tbs_certificate.extensions {
        for ext in extensions {
            if ext.extn_id == ID_CE_EXT_KEY_USAGE {
                let eku = ExtendedKeyUsage::from_der(ext.extn_value.as_bytes())?;
                if eku.0.contains(&ID_KP_SERVER_AUTH) {
                    return Ok(CertProfile::Server);
                }
            }
        }
    }
    Ok(CertProfile::Client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SelfSignedIdentityBuilder;

    fn store() -> (tempfile::TempDir, CertificateStore) {
        let dir = tempfile::tempdir().unwrap();
        let signed = dir.path().join("signed");
        let store =
            CertificateStore::open(&signed, &signed.join("by-serial"), &dir.path().join("revoked"))
                .unwrap();
        (dir, store)
    }

    // Any certificate works for store plumbing; a throwaway self-signed one
    // keeps the test self-contained.
    fn sample_pem(common_name: &str) -> Vec<u8> {
        let identity = SelfSignedIdentityBuilder::new()
            .common_name(common_name)
            .key_bits(2048)
            .build()
            .unwrap();
        identity.certificate_pem().to_vec()
    }

    #[test]
    fn write_link_and_resolve_by_serial() {
        let (_dir, store) = store();
        let pem_buf = sample_pem("gw.example.com");
        store.write_signed("gw.example.com", &pem_buf).unwrap();

        let signed = store.get_signed("gw.example.com").unwrap();
        store.link_serial(&signed.serial_hex, "gw.example.com").unwrap();

        let via_index = store.get_by_serial(&signed.serial_hex).unwrap();
        assert_eq!(via_index.pem, signed.pem);
        assert_eq!(via_index.common_name, "gw.example.com");
    }

    #[test]
    fn occupied_serial_slot_is_fatal() {
        let (_dir, store) = store();
        let pem_buf = sample_pem("gw.example.com");
        store.write_signed("gw.example.com", &pem_buf).unwrap();
        let signed = store.get_signed("gw.example.com").unwrap();

        store.link_serial(&signed.serial_hex, "gw.example.com").unwrap();
        assert!(matches!(
            store.link_serial(&signed.serial_hex, "gw.example.com"),
            Err(AuthorityError::SerialIndexOccupied(_))
        ));
    }

    #[test]
    fn move_to_revoked_clears_signed_and_index() {
        let (_dir, store) = store();
        let pem_buf = sample_pem("gw.example.com");
        store.write_signed("gw.example.com", &pem_buf).unwrap();
        let signed = store.get_signed("gw.example.com").unwrap();
        store.link_serial(&signed.serial_hex, "gw.example.com").unwrap();

        store.move_to_revoked("gw.example.com", &signed.serial_hex).unwrap();

        assert!(matches!(
            store.get_signed("gw.example.com"),
            Err(AuthorityError::CertificateNotFound(_))
        ));
        assert!(matches!(
            store.get_by_serial(&signed.serial_hex),
            Err(AuthorityError::CertificateNotFound(_))
        ));
        let revoked = store.get_revoked(&signed.serial_hex).unwrap();
        assert_eq!(revoked.pem, pem_buf);
        assert_eq!(revoked.common_name, "gw.example.com");
        assert!(revoked.revoked_at <= SystemTime::now());

        let listed: Vec<String> = store
            .list_revoked()
            .unwrap()
            .map(|r| r.unwrap().serial_hex)
            .collect();
        assert_eq!(listed, vec![signed.serial_hex]);
    }

    #[test]
    fn serial_lookups_reject_non_hex_keys() {
        let (_dir, store) = store();
        let pem_buf = sample_pem("gw.example.com");
        store.write_signed("gw.example.com", &pem_buf).unwrap();
        let signed = store.get_signed("gw.example.com").unwrap();
        store.link_serial(&signed.serial_hex, "gw.example.com").unwrap();

        // A signed certificate must never surface through a crafted revoked
        // lookup key.
        for key in [
            "../signed/gw.example.com",
            "../../etc/passwd",
            "8F3A9C",
            "8f3a9c.pem",
            "",
        ] {
            assert!(
                matches!(store.get_revoked(key), Err(AuthorityError::Malformed(_))),
                "get_revoked accepted {key:?}"
            );
            assert!(
                matches!(store.get_by_serial(key), Err(AuthorityError::Malformed(_))),
                "get_by_serial accepted {key:?}"
            );
        }
    }

    #[test]
    fn listing_skips_the_index_directory() {
        let (_dir, store) = store();
        store
            .write_signed("gw.example.com", &sample_pem("gw.example.com"))
            .unwrap();
        let names: Vec<String> = store
            .list_signed()
            .unwrap()
            .map(|r| r.unwrap().common_name)
            .collect();
        assert_eq!(names, vec!["gw.example.com"]);
    }
}
