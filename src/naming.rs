//! Common-name validation and certificate profile classification.
//!
//! Common names double as storage keys, so they are held to a strict grammar:
//! a hostname (optionally fully qualified) or `user@hostname`. Labels are
//! alphanumeric with interior hyphens, which also keeps the names safe to use
//! as file names.

use std::sync::OnceLock;

use regex::Regex;

use crate::config::EnrollmentPolicy;
use crate::error::{AuthorityError, Result};

const COMMON_NAME_PATTERN: &str = r"^(([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]*[a-zA-Z0-9])\.)*([A-Za-z0-9]|[A-Za-z0-9][A-Za-z0-9\-]*[A-Za-z0-9])(@(([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]*[a-zA-Z0-9])\.)*([A-Za-z0-9]|[A-Za-z0-9][A-Za-z0-9\-]*[A-Za-z0-9]))?$";

fn common_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(COMMON_NAME_PATTERN).expect("common name pattern compiles"))
}

pub fn validate_common_name(common_name: &str) -> Result<()> {
    if common_name_re().is_match(common_name) {
        Ok(())
    } else {
        Err(AuthorityError::InvalidCommonName(common_name.to_string()))
    }
}

/// Server or client end-entity profile, deciding key-usage extensions and
/// subject-alternative-name presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertProfile {
    Server,
    Client,
}

impl CertProfile {
    pub fn is_server(self) -> bool {
        matches!(self, CertProfile::Server)
    }
}

/// Classify a common name under the enrollment policy.
///
/// When user self-enrollment is enabled and users are limited to a single
/// certificate, every common name is a username used for client validation
/// only. Otherwise `user@hostname` is always a client, a dotted name has to
/// be an FQDN and hence a server, and a bare name is a client.
pub fn profile_for(common_name: &str, policy: &EnrollmentPolicy) -> CertProfile {
    if policy.user_enrollment_allowed && !policy.user_multiple_certificates {
        return CertProfile::Client;
    }
    if common_name.contains('@') {
        return CertProfile::Client;
    }
    if common_name.contains('.') {
        return CertProfile::Server;
    }
    CertProfile::Client
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(enrollment: bool, multiple: bool) -> EnrollmentPolicy {
        EnrollmentPolicy {
            user_enrollment_allowed: enrollment,
            user_multiple_certificates: multiple,
        }
    }

    #[test]
    fn accepts_hostnames_and_user_names() {
        for name in [
            "router",
            "vpn.example.com",
            "a-b.example.com",
            "alice@example.com",
            "bob@gw",
            "x",
        ] {
            assert!(validate_common_name(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn rejects_malformed_names() {
        for name in [
            "",
            "under_score",
            "-leading.example.com",
            "trailing-.example.com",
            "sp ace",
            "two@@at",
            "semi;colon",
            "../escape",
        ] {
            assert!(
                matches!(
                    validate_common_name(name),
                    Err(AuthorityError::InvalidCommonName(_))
                ),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn dotted_names_are_servers_by_default() {
        let p = policy(false, false);
        assert_eq!(profile_for("vpn.example.com", &p), CertProfile::Server);
        assert_eq!(profile_for("alice@example.com", &p), CertProfile::Client);
        assert_eq!(profile_for("laptop", &p), CertProfile::Client);
    }

    #[test]
    fn single_certificate_enrollment_forces_client() {
        let p = policy(true, false);
        assert_eq!(profile_for("vpn.example.com", &p), CertProfile::Client);
        // Allowing multiple certificates per user restores the default rules.
        let p = policy(true, true);
        assert_eq!(profile_for("vpn.example.com", &p), CertProfile::Server);
    }
}
