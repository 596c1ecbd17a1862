//! PEM armor handling for signing requests and certificates.

use openssl::nid::Nid;
use openssl::x509::{X509NameRef, X509Ref, X509, X509Req};

use crate::error::{AuthorityError, Result};

/// Detect PEM armor; anything else is treated as raw DER.
pub fn is_pem(buf: &[u8]) -> bool {
    buf.starts_with(b"-----BEGIN ")
}

/// Parse a certificate signing request from PEM or raw DER, normalizing the
/// returned bytes to PEM. The stores only ever hold PEM.
pub fn decode_csr(buf: &[u8]) -> Result<(X509Req, Vec<u8>)> {
    if buf.is_empty() {
        return Err(AuthorityError::Malformed(
            "no signing request supplied".to_string(),
        ));
    }
    if is_pem(buf) {
        let csr = X509Req::from_pem(buf).map_err(|e| malformed("signing request", e))?;
        Ok((csr, buf.to_vec()))
    } else {
        let csr = X509Req::from_der(buf).map_err(|e| malformed("signing request", e))?;
        let pem = csr.to_pem()?;
        Ok((csr, pem))
    }
}

pub fn decode_certificate(buf: &[u8]) -> Result<X509> {
    X509::from_pem(buf).map_err(|e| malformed("certificate", e))
}

/// Common name entry of an X.509 subject.
pub fn subject_common_name(name: &X509NameRef) -> Result<String> {
    let entry = name
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .ok_or_else(|| AuthorityError::Malformed("subject has no common name".to_string()))?;
    String::from_utf8(entry.data().as_slice().to_vec())
        .map_err(|_| AuthorityError::Malformed("common name is not valid UTF-8".to_string()))
}

/// Lowercase hex serial number, the key revoked certificates are stored
/// under.
pub fn serial_hex(certificate: &X509Ref) -> Result<String> {
    let serial = certificate.serial_number().to_bn()?;
    Ok(serial.to_hex_str()?.to_ascii_lowercase())
}

fn malformed(what: &str, err: openssl::error::ErrorStack) -> AuthorityError {
    AuthorityError::Malformed(format!("{what}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::hash::MessageDigest;
    use openssl::pkey::PKey;
    use openssl::x509::X509Name;

    fn sample_csr(common_name: Option<&str>) -> X509Req {
        let key = PKey::from_rsa(openssl::rsa::Rsa::generate(2048).unwrap()).unwrap();
        let mut name = X509Name::builder().unwrap();
        if let Some(cn) = common_name {
            name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
        }
        let mut builder = X509Req::builder().unwrap();
        builder.set_subject_name(&name.build()).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        builder.build()
    }

    #[test]
    fn pem_detection() {
        assert!(is_pem(b"-----BEGIN CERTIFICATE REQUEST-----\n"));
        assert!(!is_pem(b"\x30\x82\x01\x00"));
        assert!(!is_pem(b""));
    }

    #[test]
    fn der_input_is_normalized_to_pem() {
        let csr = sample_csr(Some("gw.example.com"));
        let der = csr.to_der().unwrap();
        let (parsed, pem) = decode_csr(&der).unwrap();
        assert!(is_pem(&pem));
        assert_eq!(
            subject_common_name(parsed.subject_name()).unwrap(),
            "gw.example.com"
        );
    }

    #[test]
    fn pem_input_is_kept_byte_identical() {
        let pem = sample_csr(Some("gw.example.com")).to_pem().unwrap();
        let (_, stored) = decode_csr(&pem).unwrap();
        assert_eq!(stored, pem);
    }

    #[test]
    fn empty_and_garbage_payloads_are_malformed() {
        assert!(matches!(
            decode_csr(b""),
            Err(AuthorityError::Malformed(_))
        ));
        assert!(matches!(
            decode_csr(b"not a csr at all"),
            Err(AuthorityError::Malformed(_))
        ));
    }

    #[test]
    fn missing_common_name_is_malformed() {
        let csr = sample_csr(None);
        assert!(matches!(
            subject_common_name(csr.subject_name()),
            Err(AuthorityError::Malformed(_))
        ));
    }
}
