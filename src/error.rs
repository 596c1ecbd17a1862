//! Error taxonomy for the authority core.
//!
//! Store mutations either succeed or surface one of these variants; there is
//! no exception-style control flow. Notification failures are deliberately
//! absent here: mail, long-poll and pub/sub delivery are best-effort side
//! channels and never become the overall result of an operation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthorityError {
    /// Common name failed the hostname / `user@hostname` grammar.
    #[error("invalid common name {0:?}")]
    InvalidCommonName(String),

    #[error("certificate signing request for {0:?} does not exist")]
    RequestNotFound(String),

    #[error("certificate for {0:?} does not exist")]
    CertificateNotFound(String),

    /// A byte-identical request is already stored under this common name.
    #[error("request for {0:?} already exists")]
    DuplicateRequest(String),

    /// A differing request is already stored under this common name;
    /// resolving it requires an explicit overwrite decision.
    #[error("another request with common name {0:?} already exists")]
    ConflictingCommonName(String),

    /// A signed certificate exists for this common name and overwrite was
    /// not requested.
    #[error("will not overwrite existing certificate for {0:?}")]
    CertificateExists(String),

    /// The by-serial index slot is already occupied. Serials are drawn from
    /// a 159-bit space, so an observed collision means store corruption
    /// rather than bad luck.
    #[error("certificate with serial {0} already present in the index")]
    SerialIndexOccupied(String),

    /// The requested attribute or namespace is not present on the entry.
    /// Distinct from an empty value.
    #[error("attribute {0:?} not present")]
    AttributeNotFound(String),

    /// Structurally invalid PEM or DER payload.
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    /// A configured notification sink could not be constructed.
    #[error("notification channel: {0}")]
    Notification(String),

    #[error(transparent)]
    Crypto(#[from] openssl::error::ErrorStack),

    #[error("DER encoding failed: {0}")]
    Der(#[from] der::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AuthorityError>;
