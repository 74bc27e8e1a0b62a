//! Nested-launch interception: bypass-flag detection and rewriting.

use awf::enforce::{evaluate, InterceptContext, InterceptDecision};

fn ctx() -> InterceptContext {
    InterceptContext {
        network: "awf-net-ab12cd34".to_owned(),
        proxy_url: "http://10.129.0.10:3128".to_owned(),
        nat_script_b64: Some("aXB0YWJsZXM=".to_owned()),
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_owned()).collect()
}

fn expect_deny(parts: &[&str]) -> String {
    match evaluate(&ctx(), &argv(parts)) {
        InterceptDecision::Deny(reason) => reason,
        other => panic!("expected deny for {parts:?}, got {other:?}"),
    }
}

fn expect_allow(parts: &[&str]) -> Vec<String> {
    match evaluate(&ctx(), &argv(parts)) {
        InterceptDecision::Allow(rewritten) => rewritten,
        other => panic!("expected allow for {parts:?}, got {other:?}"),
    }
}

#[test]
fn privileged_run_is_blocked_with_reason() {
    let reason = expect_deny(&["run", "--privileged", "alpine", "true"]);
    assert!(reason.contains("privileged"));
}

#[test]
fn privileged_anywhere_in_the_run_arguments_is_caught() {
    expect_deny(&["run", "--rm", "-e", "A=b", "--privileged", "alpine"]);
}

#[test]
fn add_host_is_blocked_in_separate_and_equals_forms() {
    let reason = expect_deny(&["run", "--add-host", "api.github.com:6.6.6.6", "alpine"]);
    assert!(reason.contains("DNS poisoning"));
    expect_deny(&["run", "--add-host=api.github.com:6.6.6.6", "alpine"]);
}

#[test]
fn host_networking_is_blocked_in_all_four_spellings() {
    for parts in [
        ["run", "--network", "host", "alpine"],
        ["run", "--network=host", "alpine", ""],
        ["run", "--net", "host", "alpine"],
        ["run", "--net=host", "alpine", ""],
    ] {
        let filtered: Vec<&str> = parts.iter().copied().filter(|p| !p.is_empty()).collect();
        let reason = expect_deny(&filtered);
        assert!(reason.contains("bypasses sandbox"), "{reason}");
    }
}

#[test]
fn non_run_subcommands_are_untouched() {
    for parts in [vec!["ps"], vec!["images"], vec!["network", "ls"], vec![]] {
        let original = argv(&parts);
        assert_eq!(
            evaluate(&ctx(), &original),
            InterceptDecision::Passthrough(original.clone()),
            "{parts:?} should pass through"
        );
    }
}

#[test]
fn rewrite_prepends_network_and_proxy_environment() {
    let rewritten = expect_allow(&["run", "alpine", "true"]);
    let joined = rewritten.join(" ");
    assert!(joined.contains("--network awf-net-ab12cd34"));
    for var in ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"] {
        assert!(
            joined.contains(&format!("{var}=http://10.129.0.10:3128")),
            "{var} missing from rewrite"
        );
    }
}

#[test]
fn user_network_matching_the_sandbox_is_not_duplicated() {
    let rewritten = expect_allow(&["run", "--network", "awf-net-ab12cd34", "alpine", "true"]);
    let count = rewritten.iter().filter(|a| *a == "--network").count();
    assert_eq!(count, 1);
}

#[test]
fn nested_command_is_wrapped_with_the_nat_preamble() {
    let rewritten = expect_allow(&["run", "alpine", "wget", "-qO-", "http://example.com"]);
    let joined = rewritten.join(" ");
    assert!(joined.contains("AWF_NAT_SCRIPT_B64=aXB0YWJsZXM="));
    assert!(joined.contains("--cap-add NET_ADMIN"));
    assert!(joined.contains("exec \"$@\""));
    // The wrapped vector ends with the original command.
    assert_eq!(rewritten.last().map(String::as_str), Some("http://example.com"));
}

#[test]
fn image_without_command_skips_the_preamble() {
    let rewritten = expect_allow(&["run", "alpine"]);
    assert_eq!(rewritten.last().map(String::as_str), Some("alpine"));
    assert!(!rewritten.iter().any(|a| a.starts_with("AWF_NAT_SCRIPT_B64=")));
}

#[test]
fn run_flag_values_that_look_like_images_are_not_confused() {
    // `--entrypoint sh` consumes its value; `alpine` is the image.
    let rewritten = expect_allow(&["run", "--entrypoint", "sh", "alpine", "-c", "true"]);
    let image_pos = rewritten.iter().position(|a| a == "alpine").expect("image present");
    assert!(rewritten.iter().position(|a| a == "--entrypoint").expect("flag kept") < image_pos);
}
