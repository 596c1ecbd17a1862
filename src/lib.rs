//! certmill is the core of a private certificate authority: a filesystem
//! request store, a signing engine, a revocation engine with CRL export, and
//! the metadata plumbing (attributes, tags, leases) that rides along with
//! stored entries. HTTP and CLI front ends live elsewhere and drive this
//! crate through [`Authority`].
//!
//! Storage is plain PEM files in per-state directories, one entry per common
//! name, with a symlink index keyed by serial number. Everything is
//! inspectable with `openssl x509` and a text editor.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use certmill::{
//!     Authority, AuthorityConfig, AuthorityIdentity, NotificationDispatcher, XattrBackend,
//! };
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = AuthorityConfig::from_file("config.toml")?;
//!     let identity = AuthorityIdentity::load(
//!         &config.authority.certificate_path,
//!         &config.authority.private_key_path,
//!     )?;
//!     let authority = Authority::open(
//!         config,
//!         Arc::new(identity),
//!         Arc::new(XattrBackend),
//!         NotificationDispatcher::new(),
//!     )?;
//!
//!     let csr = std::fs::read("gw.example.com.csr")?;
//!     authority.submit_request(&csr, false, None, None)?;
//!     let signed = authority.sign("gw.example.com", false)?;
//!     println!("issued {}", signed.serial_hex);
//!     Ok(())
//! }
//! ```

pub mod attributes;
pub mod authority;
pub mod cert_store;
pub mod config;
pub mod crl;
pub mod error;
pub mod identity;
pub mod naming;
pub mod notify;
pub mod pem;
pub mod request_store;

pub use attributes::{AttributeBackend, SidecarBackend, Tag, XattrBackend};
pub use authority::{content_token, open_from_config, Authority, Lease};
pub use cert_store::{CertificateStore, RevokedCertificate, StoredCertificate};
pub use config::AuthorityConfig;
pub use crl::{build_crl, CrlEntry};
pub use error::{AuthorityError, Result};
pub use identity::{AuthorityIdentity, SelfSignedIdentityBuilder};
pub use naming::{profile_for, validate_common_name, CertProfile};
pub use notify::{
    Attachment, EventPublisher, LongPollPublisher, MailMessage, Mailer, NotificationDispatcher,
};
pub use request_store::{RequestStore, StoredRequest};
