//! The certificate authority core: signing, revocation and the metadata
//! that rides along with stored entries.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::x509::extension::{ExtendedKeyUsage, KeyUsage, SubjectAlternativeName};
use openssl::x509::X509;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::attributes::{self, AttributeBackend, Tag, TAGS_KEY};
use crate::cert_store::{CertificateStore, RevokedCertificate, StoredCertificate};
use crate::config::AuthorityConfig;
use crate::crl::{self, CrlEntry};
use crate::error::{AuthorityError, Result};
use crate::identity::AuthorityIdentity;
use crate::naming::{self, CertProfile};
use crate::notify::{
    Attachment, LongPollPublisher, MailMessage, NotificationDispatcher, TEMPLATE_CERTIFICATE_RENEWED,
    TEMPLATE_CERTIFICATE_REVOKED, TEMPLATE_CERTIFICATE_SIGNED, TEMPLATE_REQUEST_STORED,
};
use crate::request_store::{RequestStore, StoredRequest};

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
/// 159 bits yields 40 lowercase hex digits while keeping the DER integer
/// within the 20-octet serial number limit.
const SERIAL_BITS: i32 = 159;
/// Backdate issued certificates to absorb clock skew between the authority
/// and the machines validating against it.
const NOT_BEFORE_SKEW_SECS: i64 = 5 * 60;
/// IKE intermediate, required by some IPsec responders on server
/// certificates.
const IKE_INTERMEDIATE_OID: &str = "1.3.6.1.5.5.8.2.2";

/// A VPN lease record reported for a client certificate.
#[derive(Debug, Clone, Serialize)]
pub struct Lease {
    pub last_seen: String,
    pub inner_address: Option<String>,
    pub outer_address: String,
}

/// One authority instance over one storage directory tree. Cheap to share
/// behind an `Arc`; all state lives on disk.
pub struct Authority {
    config: AuthorityConfig,
    identity: Arc<AuthorityIdentity>,
    requests: RequestStore,
    certificates: CertificateStore,
    attributes: Arc<dyn AttributeBackend>,
    notifier: NotificationDispatcher,
}

impl Authority {
    pub fn open(
        config: AuthorityConfig,
        identity: Arc<AuthorityIdentity>,
        attributes: Arc<dyn AttributeBackend>,
        notifier: NotificationDispatcher,
    ) -> Result<Self> {
        let requests = RequestStore::open(&config.storage.requests_dir)?;
        let certificates = CertificateStore::open(
            &config.storage.signed_dir,
            &config.storage.by_serial_dir(),
            &config.storage.revoked_dir,
        )?;
        Ok(Self {
            config,
            identity,
            requests,
            certificates,
            attributes,
            notifier,
        })
    }

    pub fn identity(&self) -> &AuthorityIdentity {
        &self.identity
    }

    pub fn requests(&self) -> &RequestStore {
        &self.requests
    }

    pub fn certificates(&self) -> &CertificateStore {
        &self.certificates
    }

    /// Accept a signing request for later operator action.
    ///
    /// The submitting address and authenticated username, when known, are
    /// recorded as `request.*` attributes on the stored entry.
    pub fn submit_request(
        &self,
        raw: &[u8],
        overwrite: bool,
        address: Option<&str>,
        user: Option<&str>,
    ) -> Result<StoredRequest> {
        let request = self.requests.submit(raw, overwrite)?;
        if let Some(address) = address {
            self.attributes
                .set(&request.path, "request.address", address.as_bytes())?;
        }
        if let Some(user) = user {
            self.attributes
                .set(&request.path, "request.user", user.as_bytes())?;
        }
        info!(common_name = request.common_name, "request stored");
        self.notifier.mail(MailMessage {
            template: TEMPLATE_REQUEST_STORED,
            common_name: request.common_name.clone(),
            serial_hex: None,
            attachments: vec![Attachment::pem(
                request.pem.clone(),
                format!("{}.csr", request.common_name),
            )],
        });
        Ok(request)
    }

    pub fn get_request(&self, common_name: &str) -> Result<StoredRequest> {
        self.requests.get(common_name)
    }

    pub fn list_requests(&self) -> Result<Vec<StoredRequest>> {
        self.requests.list()?.collect()
    }

    /// Drop a pending request without signing it and tear down any long-poll
    /// channel waiting on it.
    pub fn delete_request(&self, common_name: &str) -> Result<StoredRequest> {
        let request = self.requests.delete(common_name)?;
        info!(common_name, "request deleted");
        self.notifier.event("request-deleted", common_name);
        self.notifier.long_poll_retract(&content_token(&request.pem));
        Ok(request)
    }

    /// Sign the pending request stored under `common_name`.
    ///
    /// When a signed certificate already exists for the name, `overwrite`
    /// decides: without it the operation fails, with it the old certificate
    /// is revoked first and its attributes carry over to the new one. A
    /// re-signing for the same public key is reported as a renewal.
    pub fn sign(&self, common_name: &str, overwrite: bool) -> Result<StoredCertificate> {
        let request = self.requests.get(common_name)?;
        let profile = naming::profile_for(common_name, &self.config.policy);
        let request_key = request.csr.public_key()?;

        let mut renew = false;
        let mut displaced: Option<(Vec<u8>, BTreeMap<String, Vec<u8>>)> = None;
        match self.certificates.get_signed(common_name) {
            Ok(existing) => {
                if !overwrite {
                    return Err(AuthorityError::CertificateExists(common_name.to_string()));
                }
                renew = existing.certificate.public_key()?.public_eq(&request_key);
                // Sidecar attribute records do not follow a rename, so they
                // are captured before the move and replayed afterwards.
                let mut attrs = BTreeMap::new();
                for key in self.attributes.list(&existing.path)? {
                    if let Some(value) = self.attributes.get(&existing.path, &key)? {
                        attrs.insert(key, value);
                    }
                }
                self.certificates
                    .move_to_revoked(common_name, &existing.serial_hex)?;
                displaced = Some((existing.pem, attrs));
            }
            Err(AuthorityError::CertificateNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let (certificate, serial_hex) = self.build_certificate(&request, profile)?;
        let cert_pem = certificate.to_pem()?;
        let cert_path = self.certificates.write_signed(common_name, &cert_pem)?;
        self.certificates.link_serial(&serial_hex, common_name)?;

        if let Some((_, attrs)) = &displaced {
            for (key, value) in attrs {
                self.attributes.set(&cert_path, key, value)?;
            }
        }
        fs::remove_file(&request.path)?;

        info!(
            common_name,
            serial = %serial_hex,
            profile = ?profile,
            renew,
            "request signed"
        );

        let mut attachments = vec![Attachment::pem(
            request.pem.clone(),
            format!("{common_name}.csr"),
        )];
        if let Some((old_pem, _)) = displaced {
            let filename = if renew { "deprecated.crt" } else { "overwritten.crt" };
            attachments.push(Attachment::pem(old_pem, filename));
        }
        attachments.push(Attachment::pem(cert_pem.clone(), format!("{common_name}.crt")));
        self.notifier.mail(MailMessage {
            template: if renew {
                TEMPLATE_CERTIFICATE_RENEWED
            } else {
                TEMPLATE_CERTIFICATE_SIGNED
            },
            common_name: common_name.to_string(),
            serial_hex: Some(serial_hex),
            attachments,
        });
        self.notifier.long_poll_publish(
            &content_token(&request.pem),
            &cert_pem,
            "application/x-x509-user-cert",
        );
        self.notifier.event("request-signed", common_name);

        self.certificates.get_signed(common_name)
    }

    /// Revoke the signed certificate for `common_name` and publish a fresh
    /// revocation list.
    pub fn revoke(&self, common_name: &str) -> Result<RevokedCertificate> {
        let existing = self.certificates.get_signed(common_name)?;
        self.certificates
            .move_to_revoked(common_name, &existing.serial_hex)?;
        info!(common_name, serial = %existing.serial_hex, "certificate revoked");

        match self.export_crl(true) {
            Ok(crl_pem) => {
                self.notifier
                    .long_poll_publish("crl", &crl_pem, "application/x-pem-file");
            }
            Err(e) => {
                tracing::warn!(error = %e, "revocation list rebuild failed");
            }
        }
        self.notifier.mail(MailMessage {
            template: TEMPLATE_CERTIFICATE_REVOKED,
            common_name: common_name.to_string(),
            serial_hex: Some(existing.serial_hex.clone()),
            attachments: vec![Attachment::pem(
                existing.pem,
                format!("{common_name}.crt"),
            )],
        });
        self.notifier.event("certificate-revoked", common_name);

        self.certificates.get_revoked(&existing.serial_hex)
    }

    /// The current revocation list over every entry in the revoked store.
    pub fn export_crl(&self, pem: bool) -> Result<Vec<u8>> {
        let mut entries = Vec::new();
        for revoked in self.certificates.list_revoked()? {
            let revoked = revoked?;
            entries.push(CrlEntry {
                serial_hex: revoked.serial_hex,
                revoked_at: revoked.revoked_at,
            });
        }
        crl::build_crl(&self.identity, &entries, pem)
    }

    /// Nested attribute mapping of a signed certificate, optionally scoped
    /// to one namespace such as `lease` or `machine`.
    pub fn get_attributes(
        &self,
        common_name: &str,
        namespace: Option<&str>,
    ) -> Result<serde_json::Map<String, serde_json::Value>> {
        let certificate = self.certificates.get_signed(common_name)?;
        attributes::attribute_tree(self.attributes.as_ref(), &certificate.path, namespace)
    }

    /// Attach a machine-reported attribute to a signed certificate.
    pub fn set_attribute(&self, common_name: &str, key: &str, value: &[u8]) -> Result<()> {
        let certificate = self.certificates.get_signed(common_name)?;
        self.attributes.set(&certificate.path, key, value)
    }

    /// Record a connection lease against a client's signed certificate.
    pub fn update_lease(
        &self,
        common_name: &str,
        inner_address: Option<&str>,
        outer_address: &str,
    ) -> Result<()> {
        let certificate = self.certificates.get_signed(common_name)?;
        let last_seen = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        self.attributes
            .set(&certificate.path, "lease.last_seen", last_seen.as_bytes())?;
        self.attributes.set(
            &certificate.path,
            "lease.outer_address",
            outer_address.as_bytes(),
        )?;
        if let Some(inner) = inner_address {
            self.attributes
                .set(&certificate.path, "lease.inner_address", inner.as_bytes())?;
        }
        self.notifier.event("lease-update", common_name);
        Ok(())
    }

    /// The last reported lease for a certificate.
    /// [`AuthorityError::AttributeNotFound`] when none was ever reported.
    pub fn get_lease(&self, common_name: &str) -> Result<Lease> {
        let certificate = self.certificates.get_signed(common_name)?;
        let read = |key: &str| -> Result<Option<String>> {
            Ok(self
                .attributes
                .get(&certificate.path, key)?
                .map(|v| String::from_utf8_lossy(&v).into_owned()))
        };
        let last_seen = read("lease.last_seen")?
            .ok_or_else(|| AuthorityError::AttributeNotFound("lease.last_seen".to_string()))?;
        let outer_address = read("lease.outer_address")?
            .ok_or_else(|| AuthorityError::AttributeNotFound("lease.outer_address".to_string()))?;
        Ok(Lease {
            last_seen,
            inner_address: read("lease.inner_address")?,
            outer_address,
        })
    }

    pub fn tags(&self, common_name: &str) -> Result<Vec<Tag>> {
        let certificate = self.certificates.get_signed(common_name)?;
        let raw = self.attributes.get(&certificate.path, TAGS_KEY)?;
        Ok(raw.map(|v| attributes::parse_tags(&v)).unwrap_or_default())
    }

    pub fn set_tags(&self, common_name: &str, tags: &[Tag]) -> Result<()> {
        let certificate = self.certificates.get_signed(common_name)?;
        self.attributes.set(
            &certificate.path,
            TAGS_KEY,
            attributes::serialize_tags(tags).as_bytes(),
        )
    }

    /// Common names of every signed server certificate, for building gateway
    /// configuration.
    pub fn list_server_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for certificate in self.certificates.list_signed()? {
            let certificate = certificate?;
            if certificate.profile.is_server() {
                names.push(certificate.common_name);
            }
        }
        Ok(names)
    }

    fn lifetime_days(&self, profile: CertProfile) -> u32 {
        match profile {
            CertProfile::Server => self.config.lifetimes.server_days,
            CertProfile::Client => self.config.lifetimes.client_days,
        }
    }

    fn build_certificate(
        &self,
        request: &StoredRequest,
        profile: CertProfile,
    ) -> Result<(X509, String)> {
        let mut builder = X509::builder()?;
        builder.set_version(X509_VERSION_3)?;

        let mut serial = BigNum::new()?;
        serial.rand(SERIAL_BITS, MsbOption::ONE, false)?;
        let serial_hex = serial.to_hex_str()?.to_ascii_lowercase();
        let asn1_serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&asn1_serial)?;

        // Only the common name from the request subject survives; everything
        // else a submitter put there is dropped.
        builder.set_subject_name(request.csr.subject_name())?;
        builder.set_issuer_name(self.identity.certificate().subject_name())?;
        let public_key = request.csr.public_key()?;
        builder.set_pubkey(&public_key)?;

        let now = Utc::now().timestamp();
        let lifetime_secs = i64::from(self.lifetime_days(profile)) * 24 * 60 * 60;
        builder.set_not_before(Asn1Time::from_unix(now - NOT_BEFORE_SKEW_SECS)?.as_ref())?;
        builder.set_not_after(Asn1Time::from_unix(now + lifetime_secs)?.as_ref())?;

        let mut ku = KeyUsage::new();
        ku.critical().digital_signature().key_encipherment();
        builder.append_extension(ku.build()?)?;

        if profile.is_server() {
            let mut eku = ExtendedKeyUsage::new();
            eku.server_auth().other(IKE_INTERMEDIATE_OID).client_auth();
            builder.append_extension(eku.build()?)?;

            let san = {
                let ctx = builder.x509v3_context(Some(self.identity.certificate()), None);
                SubjectAlternativeName::new()
                    .dns(&request.common_name)
                    .build(&ctx)?
            };
            builder.append_extension(san)?;
        } else {
            let mut eku = ExtendedKeyUsage::new();
            eku.client_auth();
            builder.append_extension(eku.build()?)?;
        }

        builder.sign(self.identity.private_key(), MessageDigest::sha256())?;
        Ok((builder.build(), serial_hex))
    }
}

/// Long-poll channel token for a request: hex SHA-256 of the stored PEM.
pub fn content_token(buf: &[u8]) -> String {
    hex::encode(Sha256::digest(buf))
}

/// Convenience loader: configuration from `path`, identity from the paths it
/// names, extended-attribute metadata backend, and a long-poll sink when the
/// configuration carries a publish URL. Mail and pub/sub sinks are process
/// integrations and are attached through [`Authority::open`] instead.
pub fn open_from_config(path: &Path) -> Result<Authority> {
    let config = AuthorityConfig::from_file(path)?;
    let identity = AuthorityIdentity::load(
        &config.authority.certificate_path,
        &config.authority.private_key_path,
    )?;
    let mut notifier = NotificationDispatcher::new();
    if let Some(url) = &config.notifications.long_poll_publish {
        let publisher = LongPollPublisher::new(url.as_str())
            .map_err(|e| AuthorityError::Notification(e.to_string()))?;
        notifier = notifier.with_long_poll(publisher);
    }
    Authority::open(
        config,
        Arc::new(identity),
        Arc::new(attributes::XattrBackend),
        notifier,
    )
}
