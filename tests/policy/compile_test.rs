//! Tests for policy compilation: purity, validation, subnet selection.

use awf::policy::{compile, PolicyError, PolicyInputs};

fn inputs() -> PolicyInputs {
    PolicyInputs {
        allowed_domains: vec!["GitHub.com ".to_owned(), "crates.io".to_owned()],
        blocked_domains: vec!["gist.github.com".to_owned()],
        host_port_rules: vec!["8080".to_owned(), "9000-9005".to_owned()],
        dns_servers: vec![
            "1.1.1.1".parse().expect("ipv4"),
            "2606:4700:4700::1111".parse().expect("ipv6"),
        ],
        ..PolicyInputs::default()
    }
}

#[test]
fn compiling_twice_yields_byte_identical_artifacts_and_configs() {
    let a = compile(&inputs()).expect("valid inputs");
    let b = compile(&inputs()).expect("valid inputs");

    assert_eq!(a, b);
    assert_eq!(a.squid_conf(), b.squid_conf());
    assert_eq!(
        a.nat_plan().render_script(),
        b.nat_plan().render_script()
    );
    assert_eq!(a.host_chain().rules(), b.host_chain().rules());
}

#[test]
fn normalization_lowercases_and_trims() {
    let artifact = compile(&inputs()).expect("valid inputs");
    assert!(artifact.allowed.iter().any(|d| d.as_str() == "github.com"));
}

#[test]
fn scheme_port_and_path_entries_are_rejected_with_the_offending_token() {
    for bad in ["https://github.com", "github.com:443", "github.com/api"] {
        let result = compile(&PolicyInputs {
            allowed_domains: vec![bad.to_owned()],
            ..PolicyInputs::default()
        });
        let Err(PolicyError::InvalidDomain { input, .. }) = result else {
            panic!("{bad} should be rejected as InvalidDomain");
        };
        assert_eq!(input, bad);
    }
}

#[test]
fn port_rules_out_of_range_or_inverted_fail() {
    for bad in ["0", "65536", "9000-100", "abc"] {
        let result = compile(&PolicyInputs {
            allowed_domains: vec!["github.com".to_owned()],
            host_port_rules: vec![bad.to_owned()],
            ..PolicyInputs::default()
        });
        assert!(
            matches!(result, Err(PolicyError::InvalidPortRule(_))),
            "{bad} should be an invalid port rule"
        );
    }
}

#[test]
fn redirect_ports_always_contain_the_http_family_defaults() {
    let artifact = compile(&inputs()).expect("valid inputs");
    assert!(artifact.redirect_ports.contains(&80));
    assert!(artifact.redirect_ports.contains(&443));
    assert!(artifact.redirect_ports.contains(&8080));
    assert!(artifact.redirect_ports.contains(&9003));
    let mut sorted = artifact.redirect_ports.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted, artifact.redirect_ports, "ports are sorted and unique");
}

#[test]
fn pool_exhaustion_is_subnet_exhausted() {
    let pool: Vec<ipnet::Ipv4Net> = vec!["10.129.0.0/24".parse().expect("net")];
    let result = compile(&PolicyInputs {
        allowed_domains: vec!["github.com".to_owned()],
        subnet_pool: pool.clone(),
        subnets_in_use: pool,
        ..PolicyInputs::default()
    });
    assert!(matches!(result, Err(PolicyError::SubnetExhausted)));
}

#[test]
fn empty_allowlist_is_no_allowed_domains() {
    let result = compile(&PolicyInputs::default());
    assert!(matches!(result, Err(PolicyError::NoAllowedDomains)));
}
