//! Certificate revocation list assembly.
//!
//! rust-openssl can parse CRLs but not build them, so the list is assembled
//! from the RustCrypto `x509-cert` types and the signature is produced with
//! the authority's RSA key through openssl.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use const_oid::db::rfc5280::{ID_CE_CRL_NUMBER, ID_CE_CRL_REASONS};
use const_oid::db::rfc5912::SHA_256_WITH_RSA_ENCRYPTION;
use der::asn1::{BitString, OctetString, Uint, UtcTime};
use der::{AnyRef, Decode, Document, Encode};
use openssl::hash::MessageDigest;
use openssl::sign::Signer;
use x509_cert::crl::{CertificateList, RevokedCert, TbsCertList};
use x509_cert::ext::pkix::CrlReason;
use x509_cert::ext::Extension;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_cert::time::Time;
use x509_cert::Version;

use crate::error::{AuthorityError, Result};
use crate::identity::AuthorityIdentity;

/// Every entry carries this reason; the revoked store keeps no per-entry
/// reason metadata.
const REVOCATION_REASON: CrlReason = CrlReason::KeyCompromise;

/// Placeholder list number. Monotonic numbering is a known gap.
const CRL_NUMBER: u8 = 1;

/// How long a published list is advertised as current.
const CRL_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);

/// One line item: lowercase hex serial plus the revocation time taken from
/// the revoked store entry.
pub struct CrlEntry {
    pub serial_hex: String,
    pub revoked_at: SystemTime,
}

/// Build the revocation list over `entries`, signed by the authority key,
/// as PEM or DER.
pub fn build_crl(identity: &AuthorityIdentity, entries: &[CrlEntry], pem: bool) -> Result<Vec<u8>> {
    let issuer = x509_cert::Certificate::from_der(identity.certificate_der())?
        .tbs_certificate
        .subject;

    let mut revoked = Vec::with_capacity(entries.len());
    for entry in entries {
        let reason = Extension {
            extn_id: ID_CE_CRL_REASONS,
            critical: false,
            extn_value: OctetString::new(REVOCATION_REASON.to_der()?)?,
        };
        revoked.push(RevokedCert {
            serial_number: serial_from_hex(&entry.serial_hex)?,
            revocation_date: utc_time(entry.revoked_at)?,
            crl_entry_extensions: Some(vec![reason]),
        });
    }

    let algorithm = AlgorithmIdentifierOwned {
        oid: SHA_256_WITH_RSA_ENCRYPTION,
        parameters: Some(AnyRef::NULL.into()),
    };

    let crl_number = Extension {
        extn_id: ID_CE_CRL_NUMBER,
        critical: false,
        extn_value: OctetString::new(Uint::new(&[CRL_NUMBER])?.to_der()?)?,
    };

    let now = SystemTime::now();
    let tbs = TbsCertList {
        version: Version::V2,
        signature: algorithm.clone(),
        issuer,
        this_update: utc_time(now)?,
        next_update: Some(utc_time(now + CRL_VALIDITY)?),
        revoked_certificates: if revoked.is_empty() {
            None
        } else {
            Some(revoked)
        },
        crl_extensions: Some(vec![crl_number]),
    };

    let mut signer = Signer::new(MessageDigest::sha256(), identity.private_key())?;
    let signature = signer.sign_oneshot_to_vec(&tbs.to_der()?)?;

    let list = CertificateList {
        tbs_cert_list: tbs,
        signature_algorithm: algorithm,
        signature: BitString::from_bytes(&signature)?,
    };

    // x509-cert carries no PEM label for CertificateList, so the armor is
    // applied to the DER document directly.
    if pem {
        let doc = Document::try_from(list.to_der()?)?;
        Ok(doc.to_pem("X509 CRL", der::pem::LineEnding::LF)?.into_bytes())
    } else {
        Ok(list.to_der()?)
    }
}

fn utc_time(at: SystemTime) -> Result<Time> {
    let unix = at.duration_since(UNIX_EPOCH).unwrap_or_default();
    Ok(Time::UtcTime(UtcTime::from_unix_duration(unix)?))
}

fn serial_from_hex(serial_hex: &str) -> Result<SerialNumber> {
    let mut padded = String::with_capacity(serial_hex.len() + 1);
    if serial_hex.len() % 2 == 1 {
        padded.push('0');
    }
    padded.push_str(serial_hex);
    let bytes = hex::decode(&padded)
        .map_err(|_| AuthorityError::Malformed(format!("serial number {serial_hex:?}")))?;
    Ok(SerialNumber::new(&bytes)?)
}
