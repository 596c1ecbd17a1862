//! Authority identity: the CA certificate and signing key.

use std::fmt;
use std::fs;
use std::path::Path;

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Name, X509Ref, X509};

use crate::error::Result;
use crate::pem;

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const RSA_KEY_SIZE_DEFAULT: u32 = 4096;

/// The authority's own certificate and private key, loaded once at process
/// start and shared read-only for the process lifetime. Every end-entity
/// certificate and every CRL is issued by this identity.
pub struct AuthorityIdentity {
    certificate: X509,
    certificate_der: Vec<u8>,
    certificate_pem: Vec<u8>,
    private_key: PKey<Private>,
}

impl AuthorityIdentity {
    /// Load the identity from PEM files on disk.
    pub fn load(certificate_path: &Path, private_key_path: &Path) -> Result<Self> {
        let cert_pem = fs::read(certificate_path)?;
        let key_pem = fs::read(private_key_path)?;
        let certificate = pem::decode_certificate(&cert_pem)?;
        let private_key = PKey::private_key_from_pem(&key_pem)?;
        Self::from_parts(certificate, private_key)
    }

    pub fn from_parts(certificate: X509, private_key: PKey<Private>) -> Result<Self> {
        let certificate_der = certificate.to_der()?;
        let certificate_pem = certificate.to_pem()?;
        Ok(Self {
            certificate,
            certificate_der,
            certificate_pem,
            private_key,
        })
    }

    pub fn certificate(&self) -> &X509Ref {
        &self.certificate
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    pub fn certificate_pem(&self) -> &[u8] {
        &self.certificate_pem
    }

    pub(crate) fn private_key(&self) -> &PKeyRef<Private> {
        &self.private_key
    }

    /// Write the identity out as a PEM certificate/key pair.
    pub fn export(&self, certificate_path: &Path, private_key_path: &Path) -> Result<()> {
        if let Some(parent) = certificate_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(parent) = private_key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(certificate_path, &self.certificate_pem)?;
        fs::write(private_key_path, self.private_key.private_key_to_pem_pkcs8()?)?;
        Ok(())
    }
}

impl fmt::Debug for AuthorityIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorityIdentity")
            .field("subject", &self.certificate.subject_name())
            .field("private_key", &"<securely stored>")
            .finish()
    }
}

/// Builder for a self-signed authority certificate, used when bootstrapping
/// a fresh authority directory.
///
/// The resulting certificate carries `CA=true` with path length zero and the
/// certificate/CRL signing key usages; it cannot issue further CAs.
pub struct SelfSignedIdentityBuilder {
    common_name: String,
    organization: String,
    validity_days: u32,
    key_bits: u32,
}

impl SelfSignedIdentityBuilder {
    pub fn new() -> Self {
        Self {
            common_name: String::new(),
            organization: String::new(),
            validity_days: 3650, // Default 10 years
            key_bits: RSA_KEY_SIZE_DEFAULT,
        }
    }

    /// Set the common name (CN) for the authority certificate
    pub fn common_name(mut self, cn: impl Into<String>) -> Self {
        self.common_name = cn.into();
        self
    }

    /// Set the organization (O) for the authority certificate
    pub fn organization(mut self, org: impl Into<String>) -> Self {
        self.organization = org.into();
        self
    }

    /// Set validity period in days (default: 3650)
    pub fn validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    /// Set the RSA key size in bits (default: 4096)
    pub fn key_bits(mut self, bits: u32) -> Self {
        self.key_bits = bits;
        self
    }

    pub fn build(self) -> Result<AuthorityIdentity> {
        let rsa = openssl::rsa::Rsa::generate(self.key_bits)?;
        let private_key = PKey::from_rsa(rsa)?;

        let mut builder = X509::builder()?;
        builder.set_version(X509_VERSION_3)?;

        let mut serial = BigNum::new()?;
        // 159 bits keeps the DER integer within the 20-octet serial limit.
        serial.rand(159, MsbOption::ONE, false)?;
        let asn1_serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&asn1_serial)?;

        let mut name = X509Name::builder()?;
        name.append_entry_by_nid(Nid::COMMONNAME, &self.common_name)?;
        if !self.organization.is_empty() {
            name.append_entry_by_nid(Nid::ORGANIZATIONNAME, &self.organization)?;
        }
        let name = name.build();
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;

        builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
        builder.set_not_after(Asn1Time::days_from_now(self.validity_days)?.as_ref())?;

        builder.set_pubkey(&private_key)?;

        let mut bc = BasicConstraints::new();
        bc.critical().ca().pathlen(0);
        builder.append_extension(bc.build()?)?;

        let mut ku = KeyUsage::new();
        ku.critical().key_cert_sign().crl_sign().digital_signature();
        builder.append_extension(ku.build()?)?;

        builder.sign(&private_key, MessageDigest::sha256())?;
        AuthorityIdentity::from_parts(builder.build(), private_key)
    }
}

impl Default for SelfSignedIdentityBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_identity() -> AuthorityIdentity {
        SelfSignedIdentityBuilder::new()
            .common_name("Unit Test CA")
            .organization("Example")
            .validity_days(30)
            .key_bits(2048)
            .build()
            .unwrap()
    }

    #[test]
    fn self_signed_identity_verifies_itself() {
        let identity = test_identity();
        let public_key = identity.certificate.public_key().unwrap();
        assert!(identity.certificate.verify(&public_key).unwrap());
    }

    #[test]
    fn export_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("authority/ca_crt.pem");
        let key_path = dir.path().join("authority/ca_key.pem");

        let identity = test_identity();
        identity.export(&cert_path, &key_path).unwrap();

        let loaded = AuthorityIdentity::load(&cert_path, &key_path).unwrap();
        assert_eq!(loaded.certificate_der(), identity.certificate_der());
        assert!(loaded.private_key().public_eq(identity.private_key()));
    }

    #[test]
    fn debug_does_not_leak_key_material() {
        let identity = test_identity();
        let debug_str = format!("{identity:?}");
        // Ensure no key material appears in debug output
        assert!(debug_str.contains("securely stored"));
        assert!(!debug_str.contains("PRIVATE KEY"));
    }
}
