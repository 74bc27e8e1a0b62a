//! Nested-launch interception: decide what happens to `docker ...`
//! invocations made from inside the command container.
//!
//! The `awf-docker-shim` binary shadows the real `docker` on the
//! container's PATH and calls [`evaluate`] on its argv. The parser is
//! declarative (explicit flag tables) because bypass-flag detection is
//! security-relevant; only the `run` subcommand is rewritten, everything
//! else passes through to the real binary untouched.

use chrono::{SecondsFormat, Utc};

/// Decision produced for one nested launch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptDecision {
    /// Launch permitted with a rewritten argument vector.
    Allow(Vec<String>),
    /// Launch refused; the reason is printed to stderr and logged.
    Deny(String),
    /// Not a `run` invocation; forward the original arguments.
    Passthrough(Vec<String>),
}

/// Everything the interceptor needs to know about the enclosing sandbox.
#[derive(Debug, Clone)]
pub struct InterceptContext {
    /// Name of the sandbox bridge network nested containers must join.
    pub network: String,
    /// Proxy URL injected as `HTTP_PROXY`/`HTTPS_PROXY`.
    pub proxy_url: String,
    /// Base64 of the NAT replay preamble, when available.
    pub nat_script_b64: Option<String>,
}

/// Global docker flags that consume the following argument.
const GLOBAL_FLAGS_WITH_VALUE: &[&str] =
    &["--config", "--context", "-c", "--host", "-H", "--log-level", "-l"];

/// `docker run` flags that consume the following argument. Unknown flags
/// without `=` are treated as boolean, which at worst misidentifies the
/// image token and produces a launch error rather than a policy bypass.
const RUN_FLAGS_WITH_VALUE: &[&str] = &[
    "-e", "--env", "--env-file", "-v", "--volume", "--mount", "-p", "--publish", "--name", "-w",
    "--workdir", "--entrypoint", "-u", "--user", "--network", "--net", "--add-host", "--label",
    "-l", "--memory", "-m", "--cpus", "--hostname", "-h", "--ip", "--dns", "--platform", "--pull",
    "--restart", "--cap-add", "--cap-drop", "--device", "--tmpfs", "--shm-size", "--pid", "--uts",
    "--ipc", "--security-opt", "--log-driver", "--log-opt", "--expose", "--gpus", "--stop-timeout",
];

/// Evaluate a nested `docker` invocation.
///
/// `argv` excludes the program name. Rules, in order:
/// 1. Anything that is not `run` is [`InterceptDecision::Passthrough`].
/// 2. `--privileged`, any form of `--add-host`, and `--network host` are
///    denied outright.
/// 3. Any other explicit network that is not the sandbox bridge is denied.
/// 4. Otherwise the argument list is rewritten: sandbox network forced,
///    proxy environment injected, and the nested command wrapped in the
///    NAT replay preamble (skipped with a warning when the user supplied
///    no command vector).
pub fn evaluate(ctx: &InterceptContext, argv: &[String]) -> InterceptDecision {
    let Some((globals, run_idx)) = find_subcommand(argv, "run") else {
        return InterceptDecision::Passthrough(argv.to_vec());
    };
    let run_args = &argv[run_idx.saturating_add(1)..];

    if run_args.iter().any(|a| a == "--privileged") {
        return InterceptDecision::Deny("privileged launches are not allowed".to_owned());
    }
    if run_args
        .iter()
        .any(|a| a == "--add-host" || a.starts_with("--add-host="))
    {
        return InterceptDecision::Deny(
            "custom /etc/hosts entries are not allowed: enables DNS poisoning".to_owned(),
        );
    }
    if let Some(network) = requested_network(run_args) {
        if network == "host" {
            return InterceptDecision::Deny(
                "host networking is not allowed: bypasses sandbox".to_owned(),
            );
        }
        if network != ctx.network {
            return InterceptDecision::Deny(format!(
                "network {network:?} is not allowed: nested containers must join the sandbox bridge"
            ));
        }
    }

    let (options, image_and_command) = split_run_section(run_args);
    let mut rewritten: Vec<String> = globals.to_vec();
    rewritten.push("run".to_owned());
    rewritten.push("--network".to_owned());
    rewritten.push(ctx.network.clone());
    for var in ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"] {
        rewritten.push("-e".to_owned());
        rewritten.push(format!("{var}={}", ctx.proxy_url));
    }
    rewritten.extend(options);

    match (image_and_command.split_first(), &ctx.nat_script_b64) {
        (Some((image, command)), Some(b64)) if !command.is_empty() => {
            rewritten.push("--cap-add".to_owned());
            rewritten.push("NET_ADMIN".to_owned());
            rewritten.push("-e".to_owned());
            rewritten.push(format!("AWF_NAT_SCRIPT_B64={b64}"));
            rewritten.push(image.clone());
            rewritten.push("/bin/sh".to_owned());
            rewritten.push("-c".to_owned());
            rewritten.push(nat_replay_preamble());
            rewritten.push("awf-nested".to_owned());
            rewritten.extend(command.iter().cloned());
        }
        (Some((image, command)), _) => {
            if command.is_empty() {
                eprintln!(
                    "awf: warning: no command given; skipping egress redirection for the image entrypoint"
                );
            }
            rewritten.push(image.clone());
            rewritten.extend(command.iter().cloned());
        }
        (None, _) => {}
    }

    InterceptDecision::Allow(rewritten)
}

/// The `sh -c` body that replays the in-sandbox NAT before exec-ing the
/// nested command. Redirection failure is reported but not fatal: the
/// host-bridge chain remains the security-critical layer.
fn nat_replay_preamble() -> String {
    concat!(
        "if command -v iptables >/dev/null 2>&1; then ",
        "printf '%s' \"$AWF_NAT_SCRIPT_B64\" | base64 -d | sh ",
        "|| echo 'awf: nested egress redirection failed' >&2; ",
        "else echo 'awf: iptables missing, egress redirection skipped' >&2; fi; ",
        "exec \"$@\""
    )
    .to_owned()
}

/// Locate a subcommand, skipping global flags. Returns the globals slice
/// and the subcommand index when it matches `wanted`.
fn find_subcommand<'a>(argv: &'a [String], wanted: &str) -> Option<(&'a [String], usize)> {
    let mut i = 0;
    while i < argv.len() {
        let arg = &argv[i];
        if let Some(stripped) = arg.strip_prefix('-') {
            let consumes_value = GLOBAL_FLAGS_WITH_VALUE.contains(&arg.as_str())
                && !stripped.contains('=');
            i = i.saturating_add(if consumes_value { 2 } else { 1 });
            continue;
        }
        return (arg == wanted).then_some((&argv[..i], i));
    }
    None
}

/// Extract the requested network value from run arguments, if any.
fn requested_network(run_args: &[String]) -> Option<String> {
    let mut i = 0;
    while i < run_args.len() {
        let arg = &run_args[i];
        if arg == "--network" || arg == "--net" {
            return run_args.get(i.saturating_add(1)).cloned();
        }
        for prefix in ["--network=", "--net="] {
            if let Some(value) = arg.strip_prefix(prefix) {
                return Some(value.to_owned());
            }
        }
        i = i.saturating_add(1);
    }
    None
}

/// Split run arguments into (options, image-and-command), dropping any
/// network options since the rewrite re-injects the sandbox bridge.
fn split_run_section(run_args: &[String]) -> (Vec<String>, Vec<String>) {
    let mut options = Vec::new();
    let mut i = 0;
    while i < run_args.len() {
        let arg = &run_args[i];
        if arg.starts_with('-') {
            if arg == "--network" || arg == "--net" {
                i = i.saturating_add(2);
                continue;
            }
            if arg.starts_with("--network=") || arg.starts_with("--net=") {
                i = i.saturating_add(1);
                continue;
            }
            let consumes_value =
                RUN_FLAGS_WITH_VALUE.contains(&arg.as_str()) && !arg.contains('=');
            options.push(arg.clone());
            if consumes_value {
                if let Some(value) = run_args.get(i.saturating_add(1)) {
                    options.push(value.clone());
                }
                i = i.saturating_add(2);
            } else {
                i = i.saturating_add(1);
            }
            continue;
        }
        return (options, run_args[i..].to_vec());
    }
    (options, Vec::new())
}

/// Render one append-only decision-log line:
/// `<iso-8601> <verdict> <original-argv>`.
pub fn log_line(decision: &InterceptDecision, original: &[String]) -> String {
    let verdict = match decision {
        InterceptDecision::Allow(_) => "INJECTING".to_owned(),
        InterceptDecision::Deny(reason) => format!("BLOCKED: {reason}"),
        InterceptDecision::Passthrough(_) => "PASSING THROUGH".to_owned(),
    };
    format!(
        "{} {} {}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        verdict,
        original.join(" ")
    )
}
