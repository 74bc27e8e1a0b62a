//! One-shot token bookkeeping, separate from the FFI edge so the whole
//! decision table is unit-testable without loading the shim.

use std::collections::HashMap;

/// Environment variable overriding the protected-name set. Comma-separated;
/// a value with no usable entries falls back to the compiled-in defaults
/// (protection is never silently disabled).
pub const OVERRIDE_VAR: &str = "AWF_PROTECTED_ENV_VARS";

/// Environment variable enabling observe-only mode when set to exactly `1`.
pub const DEBUG_VAR: &str = "AWF_PRELOAD_DEBUG";

/// XOR key for the compiled-in name table. Not a security boundary; it
/// only keeps the protected names out of `strings` output.
const XOR_KEY: u8 = 0x5a;

/// Default protected names, XOR-encoded byte-per-byte with [`XOR_KEY`].
const ENCODED_DEFAULT_NAMES: &[&[u8]] = &[
    // GITHUB_TOKEN
    &[0x1d, 0x13, 0x0e, 0x12, 0x0f, 0x18, 0x05, 0x0e, 0x15, 0x11, 0x1f, 0x14],
    // GH_TOKEN
    &[0x1d, 0x12, 0x05, 0x0e, 0x15, 0x11, 0x1f, 0x14],
    // GITHUB_PERSONAL_ACCESS_TOKEN
    &[
        0x1d, 0x13, 0x0e, 0x12, 0x0f, 0x18, 0x05, 0x0a, 0x1f, 0x08, 0x09, 0x15, 0x14, 0x1b, 0x16,
        0x05, 0x1b, 0x19, 0x19, 0x1f, 0x09, 0x09, 0x05, 0x0e, 0x15, 0x11, 0x1f, 0x14,
    ],
    // OPENAI_API_KEY
    &[0x15, 0x0a, 0x1f, 0x14, 0x1b, 0x13, 0x05, 0x1b, 0x0a, 0x13, 0x05, 0x11, 0x1f, 0x03],
    // ANTHROPIC_API_KEY
    &[
        0x1b, 0x14, 0x0e, 0x12, 0x08, 0x15, 0x0a, 0x13, 0x19, 0x05, 0x1b, 0x0a, 0x13, 0x05, 0x11,
        0x1f, 0x03,
    ],
    // AWS_ACCESS_KEY_ID
    &[
        0x1b, 0x0d, 0x09, 0x05, 0x1b, 0x19, 0x19, 0x1f, 0x09, 0x09, 0x05, 0x11, 0x1f, 0x03, 0x05,
        0x13, 0x1e,
    ],
    // AWS_SECRET_ACCESS_KEY
    &[
        0x1b, 0x0d, 0x09, 0x05, 0x09, 0x1f, 0x19, 0x08, 0x1f, 0x0e, 0x05, 0x1b, 0x19, 0x19, 0x1f,
        0x09, 0x09, 0x05, 0x11, 0x1f, 0x03,
    ],
    // AWS_SESSION_TOKEN
    &[
        0x1b, 0x0d, 0x09, 0x05, 0x09, 0x1f, 0x09, 0x09, 0x13, 0x15, 0x14, 0x05, 0x0e, 0x15, 0x11,
        0x1f, 0x14,
    ],
    // GOOGLE_API_KEY
    &[0x1d, 0x15, 0x15, 0x1d, 0x16, 0x1f, 0x05, 0x1b, 0x0a, 0x13, 0x05, 0x11, 0x1f, 0x03],
    // GEMINI_API_KEY
    &[0x1d, 0x1f, 0x17, 0x13, 0x14, 0x13, 0x05, 0x1b, 0x0a, 0x13, 0x05, 0x11, 0x1f, 0x03],
    // AZURE_OPENAI_API_KEY
    &[
        0x1b, 0x00, 0x0f, 0x08, 0x1f, 0x05, 0x15, 0x0a, 0x1f, 0x14, 0x1b, 0x13, 0x05, 0x1b, 0x0a,
        0x13, 0x05, 0x11, 0x1f, 0x03,
    ],
    // HF_TOKEN
    &[0x12, 0x1c, 0x05, 0x0e, 0x15, 0x11, 0x1f, 0x14],
    // NPM_TOKEN
    &[0x14, 0x0a, 0x17, 0x05, 0x0e, 0x15, 0x11, 0x1f, 0x14],
    // CARGO_REGISTRY_TOKEN
    &[
        0x19, 0x1b, 0x08, 0x1d, 0x15, 0x05, 0x08, 0x1f, 0x1d, 0x13, 0x09, 0x0e, 0x08, 0x03, 0x05,
        0x0e, 0x15, 0x11, 0x1f, 0x14,
    ],
    // PYPI_TOKEN
    &[0x0a, 0x03, 0x0a, 0x13, 0x05, 0x0e, 0x15, 0x11, 0x1f, 0x14],
    // SLACK_BOT_TOKEN
    &[0x09, 0x16, 0x1b, 0x19, 0x11, 0x05, 0x18, 0x15, 0x0e, 0x05, 0x0e, 0x15, 0x11, 0x1f, 0x14],
];

/// Decode the compiled-in protected-name list.
pub fn default_protected_names() -> Vec<String> {
    ENCODED_DEFAULT_NAMES
        .iter()
        .map(|bytes| bytes.iter().map(|b| char::from(b ^ XOR_KEY)).collect())
        .collect()
}

/// Parse an [`OVERRIDE_VAR`] value into a protected-name list.
///
/// Returns `None` when no usable entry remains after trimming, signalling
/// the caller to keep the defaults.
pub fn parse_override(raw: &str) -> Option<Vec<String>> {
    let names: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect();
    if names.is_empty() {
        None
    } else {
        Some(names)
    }
}

/// What the interposed `getenv` should do for one lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Name is not protected: delegate to the real implementation.
    Passthrough,
    /// Observe-only mode: log the access, then delegate unchanged.
    Observe,
    /// First read of a protected name: return `value`, then scrub the
    /// variable from the live environment while still holding the lock.
    ReturnAndClear(String),
    /// Subsequent read of a cleared name: return the cached copy.
    ReturnCached(String),
    /// Protected name with no value: behave as unset.
    ReturnNone,
}

/// Mutable shim state. Lives behind a single mutex in the FFI layer; the
/// critical section spans cache update and environment mutation so a
/// concurrent reader can never observe the value without the clear.
#[derive(Debug)]
pub struct Shield {
    protected: Vec<String>,
    cache: HashMap<String, String>,
    observe_only: bool,
}

impl Shield {
    /// Build the shield from a protected set and mode flag.
    pub fn new(protected: Vec<String>, observe_only: bool) -> Self {
        Self {
            protected,
            cache: HashMap::new(),
            observe_only,
        }
    }

    /// Returns `true` when the shim intercepts reads of `name`.
    pub fn is_protected(&self, name: &str) -> bool {
        self.protected.iter().any(|p| p == name)
    }

    /// Returns `true` in observe-only (diagnostic) mode.
    pub fn observe_only(&self) -> bool {
        self.observe_only
    }

    /// Decide the outcome of one lookup. `current` is the live value as
    /// seen by the real `getenv` at call time.
    pub fn decide(&mut self, name: &str, current: Option<&str>) -> Decision {
        if !self.is_protected(name) {
            return Decision::Passthrough;
        }
        if self.observe_only {
            return Decision::Observe;
        }
        if let Some(cached) = self.cache.get(name) {
            return Decision::ReturnCached(cached.clone());
        }
        match current {
            Some(value) => {
                self.cache.insert(name.to_owned(), value.to_owned());
                Decision::ReturnAndClear(value.to_owned())
            }
            // Unset stays unset; a value set later still gets the
            // one-shot treatment on its first read.
            None => Decision::ReturnNone,
        }
    }

    /// Borrow the cached copy for `name`, if the first read happened. The
    /// FFI layer hands out pointers into these entries; they are never
    /// removed once inserted.
    pub fn cached(&self, name: &str) -> Option<&str> {
        self.cache.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_decode_to_plaintext_names() {
        let names = default_protected_names();
        assert!(names.iter().any(|n| n == "GITHUB_TOKEN"));
        assert!(names.iter().any(|n| n == "ANTHROPIC_API_KEY"));
        assert!(names.iter().any(|n| n == "AWS_SECRET_ACCESS_KEY"));
        assert_eq!(names.len(), 16);
    }

    #[test]
    fn override_parsing_trims_and_rejects_empty() {
        assert_eq!(
            parse_override(" FOO , BAR "),
            Some(vec!["FOO".to_owned(), "BAR".to_owned()])
        );
        assert_eq!(parse_override(" , ,, "), None);
        assert_eq!(parse_override(""), None);
    }

    #[test]
    fn first_read_clears_second_read_hits_cache() {
        let mut shield = Shield::new(vec!["GITHUB_TOKEN".to_owned()], false);

        let first = shield.decide("GITHUB_TOKEN", Some("abc"));
        assert_eq!(first, Decision::ReturnAndClear("abc".to_owned()));

        // After the clear the live value is gone, but the cache answers.
        let second = shield.decide("GITHUB_TOKEN", None);
        assert_eq!(second, Decision::ReturnCached("abc".to_owned()));
    }

    #[test]
    fn unprotected_names_pass_through() {
        let mut shield = Shield::new(vec!["GITHUB_TOKEN".to_owned()], false);
        assert_eq!(shield.decide("PATH", Some("/usr/bin")), Decision::Passthrough);
    }

    #[test]
    fn unset_protected_name_is_not_marked_read() {
        let mut shield = Shield::new(vec!["GITHUB_TOKEN".to_owned()], false);
        assert_eq!(shield.decide("GITHUB_TOKEN", None), Decision::ReturnNone);

        // The variable appears later (e.g. setenv by the program): the
        // one-shot cycle starts on its first observed value.
        assert_eq!(
            shield.decide("GITHUB_TOKEN", Some("late")),
            Decision::ReturnAndClear("late".to_owned())
        );
    }

    #[test]
    fn observe_mode_never_clears() {
        let mut shield = Shield::new(vec!["GITHUB_TOKEN".to_owned()], true);
        assert_eq!(shield.decide("GITHUB_TOKEN", Some("abc")), Decision::Observe);
        assert_eq!(shield.decide("GITHUB_TOKEN", Some("abc")), Decision::Observe);
        assert!(shield.cached("GITHUB_TOKEN").is_none());
    }
}
