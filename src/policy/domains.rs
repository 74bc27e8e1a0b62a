//! Domain normalization and host matching for the egress allowlist.

use serde::{Deserialize, Serialize};

use super::PolicyError;

/// A normalized DNS name used in the allow or block list.
///
/// Stored lowercased with surrounding whitespace removed. A leading `.`
/// marks an explicit subdomains-only entry: `.example.com` matches
/// `api.example.com` but never the apex `example.com`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Domain(String);

impl Domain {
    /// Normalize a raw input string into a [`Domain`].
    ///
    /// Rules: trim whitespace, lowercase, reject empty results, reject
    /// scheme prefixes, ports, paths, and any character outside
    /// `[a-z0-9.-]` (a single leading `.` is permitted).
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidDomain`] naming the offending input
    /// and the reason it was rejected.
    pub fn parse(input: &str) -> Result<Self, PolicyError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(PolicyError::InvalidDomain {
                input: input.to_owned(),
                reason: "empty after trimming whitespace".to_owned(),
            });
        }

        let lowered = trimmed.to_lowercase();

        if lowered.contains("://") {
            return Err(PolicyError::InvalidDomain {
                input: input.to_owned(),
                reason: "must not contain a scheme".to_owned(),
            });
        }
        if lowered.contains(':') {
            return Err(PolicyError::InvalidDomain {
                input: input.to_owned(),
                reason: "must not contain a port".to_owned(),
            });
        }
        if lowered.contains('/') {
            return Err(PolicyError::InvalidDomain {
                input: input.to_owned(),
                reason: "must not contain a path".to_owned(),
            });
        }

        // A single leading dot marks a subdomains-only entry.
        let body = lowered.strip_prefix('.').unwrap_or(&lowered);
        if body.is_empty() || body.starts_with('.') {
            return Err(PolicyError::InvalidDomain {
                input: input.to_owned(),
                reason: "nothing follows the leading dot".to_owned(),
            });
        }

        if let Some(bad) = body
            .chars()
            .find(|c| !c.is_ascii_lowercase() && !c.is_ascii_digit() && *c != '.' && *c != '-')
        {
            return Err(PolicyError::InvalidDomain {
                input: input.to_owned(),
                reason: format!("character {bad:?} is not allowed"),
            });
        }

        Ok(Self(lowered))
    }

    /// Returns the normalized form, including any leading dot.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` when this entry only matches subdomains of its apex.
    pub fn subdomains_only(&self) -> bool {
        self.0.starts_with('.')
    }

    /// The apex name without any leading dot.
    pub fn apex(&self) -> &str {
        self.0.strip_prefix('.').unwrap_or(&self.0)
    }

    /// Returns `true` when `host` matches this entry.
    ///
    /// A bare entry `example.com` matches the exact host and every
    /// subdomain; a dotted entry `.example.com` matches subdomains only.
    pub fn matches(&self, host: &str) -> bool {
        let host = host.trim().to_lowercase();
        let apex = self.apex();
        if !self.subdomains_only() && host == apex {
            return true;
        }
        host.len() > apex.len()
            && host.ends_with(apex)
            && host.as_bytes()[host.len().saturating_sub(apex.len()).saturating_sub(1)] == b'.'
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Verdict for a single host against the compiled domain lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostVerdict {
    /// Host matched a blocked entry (blocked wins over allowed).
    Denied,
    /// Host matched an allowed entry and no blocked entry.
    Allowed,
    /// Host matched nothing; the proxy's default deny applies.
    NoMatch,
}

/// Evaluate a host against the allow and block lists.
///
/// Blocked entries take strict precedence: a host matching both lists is
/// denied.
pub fn evaluate_host(host: &str, allowed: &[Domain], blocked: &[Domain]) -> HostVerdict {
    if blocked.iter().any(|d| d.matches(host)) {
        return HostVerdict::Denied;
    }
    if allowed.iter().any(|d| d.matches(host)) {
        return HostVerdict::Allowed;
    }
    HostVerdict::NoMatch
}

/// Normalize a raw list, rejecting invalid entries and deduplicating while
/// preserving first-seen order.
///
/// # Errors
///
/// Propagates the first [`PolicyError::InvalidDomain`] encountered.
pub fn normalize_list(inputs: &[String]) -> Result<Vec<Domain>, PolicyError> {
    let mut out: Vec<Domain> = Vec::with_capacity(inputs.len());
    for raw in inputs {
        // Blank lines and comments are tolerated in file-sourced lists.
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let domain = Domain::parse(trimmed)?;
        if !out.contains(&domain) {
            out.push(domain);
        }
    }
    Ok(out)
}
