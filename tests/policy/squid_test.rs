//! Proxy configuration output: exact ACL shape and rule ordering.

use awf::policy::{compile, PolicyInputs};

fn conf(allowed: &[&str], blocked: &[&str]) -> String {
    let inputs = PolicyInputs {
        allowed_domains: allowed.iter().map(|s| (*s).to_owned()).collect(),
        blocked_domains: blocked.iter().map(|s| (*s).to_owned()).collect(),
        ..PolicyInputs::default()
    };
    compile(&inputs).expect("valid inputs").squid_conf()
}

#[test]
fn allowed_acl_lists_exact_and_dotted_forms_per_domain() {
    let conf = conf(&["github.com"], &[]);
    assert!(conf.contains("acl allowed_domains dstdomain github.com\n"));
    assert!(conf.contains("acl allowed_domains dstdomain .github.com\n"));
}

#[test]
fn blocked_acl_is_symmetric_and_denied_first() {
    let conf = conf(&["github.com"], &["gist.github.com"]);
    assert!(conf.contains("acl blocked_domains dstdomain gist.github.com\n"));
    assert!(conf.contains("acl blocked_domains dstdomain .gist.github.com\n"));

    let deny_blocked = conf
        .find("http_access deny blocked_domains")
        .expect("blocked deny present");
    let allow = conf
        .find("http_access allow allowed_domains sandbox_net")
        .expect("allow present");
    let deny_all = conf.rfind("http_access deny all").expect("default deny present");
    assert!(deny_blocked < allow && allow < deny_all);
}

#[test]
fn no_blocked_acl_when_blocklist_is_empty() {
    let conf = conf(&["github.com"], &[]);
    assert!(!conf.contains("blocked_domains"));
}

#[test]
fn client_restriction_is_the_sandbox_subnet() {
    let conf = conf(&["github.com"], &[]);
    assert!(conf.contains("acl sandbox_net src 10.129.0.0/24"));
}

#[test]
fn caching_disabled_headers_stripped_logformat_fixed() {
    let conf = conf(&["github.com"], &[]);
    assert!(conf.contains("cache deny all"));
    assert!(conf.contains("forwarded_for delete"));
    assert!(conf.contains("via off"));
    assert!(conf.contains("logformat awf %ts.%03tu"));
    assert!(conf.contains("access_log stdio:/var/log/squid/access.log awf"));
}

#[test]
fn dns_servers_flow_into_the_proxy_resolver() {
    let inputs = PolicyInputs {
        allowed_domains: vec!["github.com".to_owned()],
        dns_servers: vec!["1.1.1.1".parse().expect("ip")],
        ..PolicyInputs::default()
    };
    let conf = compile(&inputs).expect("valid inputs").squid_conf();
    assert!(conf.contains("dns_nameservers 1.1.1.1"));
}

#[test]
fn ssl_bump_section_appears_only_when_enabled() {
    let plain = conf(&["github.com"], &[]);
    assert!(!plain.contains("ssl_bump"));

    let inputs = PolicyInputs {
        allowed_domains: vec!["github.com".to_owned()],
        ssl_bump: true,
        ..PolicyInputs::default()
    };
    let bumped = compile(&inputs).expect("valid inputs").squid_conf();
    assert!(bumped.contains("ssl_bump peek step1"));
    assert!(bumped.contains("generate-host-certificates=on"));
}
