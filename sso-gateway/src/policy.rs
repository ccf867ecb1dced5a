//! Email allowlist policy.

use std::collections::HashSet;

/// Decides whether an authenticated email may use the gateway.
///
/// An email is allowed when it is in the exact allowlist, or when a domain is
/// configured and the email ends with `@<domain>`. With neither configured the
/// policy denies everyone.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    emails: HashSet<String>,
    domain: Option<String>,
}

impl AccessPolicy {
    pub fn new<I, S>(emails: I, domain: Option<&str>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let emails = emails
            .into_iter()
            .map(|e| normalize(e.as_ref()))
            .filter(|e| !e.is_empty())
            .collect();
        let domain = domain.map(normalize).filter(|d| !d.is_empty());
        Self { emails, domain }
    }

    /// Builds the policy from the comma separated `ALLOWED_EMAILS` value and
    /// the `ALLOWED_DOMAIN` value.
    pub fn from_config(emails: &str, domain: &str) -> Self {
        Self::new(emails.split(','), Some(domain))
    }

    pub fn is_allowed(&self, email: &str) -> bool {
        let email = normalize(email);
        if email.is_empty() {
            return false;
        }
        if self.emails.contains(&email) {
            return true;
        }
        self.domain
            .as_deref()
            .and_then(|domain| email.strip_suffix(domain))
            .is_some_and(|local| local.ends_with('@'))
    }

    /// True when neither an allowlist nor a domain is configured.
    pub fn is_deny_all(&self) -> bool {
        self.emails.is_empty() && self.domain.is_none()
    }
}

/// Trims and lower-cases an email address.
pub fn normalize(email: &str) -> String {
    email.trim().to_lowercase()
}
