//! Host-matching semantics: subdomains, apex, block precedence.

use awf::policy::{evaluate_host, Domain, HostVerdict};

fn domains(entries: &[&str]) -> Vec<Domain> {
    entries
        .iter()
        .map(|e| Domain::parse(e).expect("valid test domain"))
        .collect()
}

#[test]
fn bare_entry_matches_apex_and_every_subdomain_depth() {
    let allowed = domains(&["example.com"]);
    for host in [
        "example.com",
        "api.example.com",
        "a.b.example.com",
        "deep.a.b.c.example.com",
    ] {
        assert_eq!(
            evaluate_host(host, &allowed, &[]),
            HostVerdict::Allowed,
            "{host} should match"
        );
    }
}

#[test]
fn suffix_confusion_does_not_match() {
    let allowed = domains(&["example.com"]);
    for host in ["notexample.com", "example.com.evil.net", "xexample.com"] {
        assert_eq!(
            evaluate_host(host, &allowed, &[]),
            HostVerdict::NoMatch,
            "{host} should not match"
        );
    }
}

#[test]
fn dotted_entry_never_matches_the_apex_alone() {
    let allowed = domains(&[".example.com"]);
    assert_eq!(
        evaluate_host("example.com", &allowed, &[]),
        HostVerdict::NoMatch
    );
    assert_eq!(
        evaluate_host("api.example.com", &allowed, &[]),
        HostVerdict::Allowed
    );
}

#[test]
fn blocked_wins_for_every_host_matching_both_lists() {
    let allowed = domains(&["github.com"]);
    let blocked = domains(&["gist.github.com"]);

    // gist.github.com matches both github.com (allow) and the block entry.
    assert_eq!(
        evaluate_host("gist.github.com", &allowed, &blocked),
        HostVerdict::Denied
    );
    // Subdomains of the blocked entry are denied too.
    assert_eq!(
        evaluate_host("raw.gist.github.com", &allowed, &blocked),
        HostVerdict::Denied
    );
    // Sibling subdomains stay allowed.
    assert_eq!(
        evaluate_host("api.github.com", &allowed, &blocked),
        HostVerdict::Allowed
    );
}

#[test]
fn host_matching_is_case_insensitive() {
    let allowed = domains(&["example.com"]);
    assert_eq!(
        evaluate_host("API.Example.COM", &allowed, &[]),
        HostVerdict::Allowed
    );
}
