//! Parsing of extra HTTP-family destination ports for NAT redirection.

use serde::{Deserialize, Serialize};

use super::PolicyError;

/// Destination ports the command container's NAT always redirects to the
/// proxy, before any user-configured additions.
pub const DEFAULT_REDIRECT_PORTS: [u16; 2] = [80, 443];

/// A single port or inclusive port range to redirect to the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRule {
    /// Lower bound, inclusive.
    pub low: u16,
    /// Upper bound, inclusive. Equal to `low` for single-port rules.
    pub high: u16,
}

impl PortRule {
    /// Parse a single rule: `"8080"` or `"8000-8100"`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidPortRule`] for non-numeric input,
    /// port 0, or an inverted range.
    pub fn parse(input: &str) -> Result<Self, PolicyError> {
        let trimmed = input.trim();
        let invalid = || PolicyError::InvalidPortRule(input.to_owned());

        let (low_raw, high_raw) = match trimmed.split_once('-') {
            Some((l, h)) => (l.trim(), h.trim()),
            None => (trimmed, trimmed),
        };

        let low: u16 = low_raw.parse().map_err(|_| invalid())?;
        let high: u16 = high_raw.parse().map_err(|_| invalid())?;
        if low == 0 || high < low {
            return Err(invalid());
        }
        Ok(Self { low, high })
    }

    /// Iterate every port covered by the rule.
    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.low..=self.high
    }
}

/// Parse a comma-separated rule list (`"8080,9000-9010"`) into rules.
///
/// Empty segments are rejected rather than skipped so a typo like
/// `"80,,443"` surfaces instead of silently narrowing the redirect set.
///
/// # Errors
///
/// Returns [`PolicyError::InvalidPortRule`] for the first bad segment.
pub fn parse_rule_list(input: &str) -> Result<Vec<PortRule>, PolicyError> {
    input.split(',').map(PortRule::parse).collect()
}

/// Combine the default redirect ports with user rules into a sorted,
/// deduplicated port list.
pub fn redirect_ports(rules: &[PortRule]) -> Vec<u16> {
    let mut ports: Vec<u16> = DEFAULT_REDIRECT_PORTS.to_vec();
    for rule in rules {
        ports.extend(rule.ports());
    }
    ports.sort_unstable();
    ports.dedup();
    ports
}
