//! Nested-launch interceptor binary.
//!
//! Mounted inside the command container as the first `docker` on PATH,
//! shadowing the real client. Every invocation is judged by
//! [`awf::enforce::evaluate`], appended to the decision log, and then
//! either refused or exec-ed against the real binary with a rewritten
//! argument vector. The shim is a usability and diagnostic layer; the
//! host-bridge filter chain remains the security-critical one.

use std::io::Write as _;
use std::os::unix::process::CommandExt;
use std::process::Command;

use awf::enforce::{evaluate, InterceptContext, InterceptDecision};
use awf::enforce::intercept::log_line;
use awf::sandbox::SHIM_LOG_PATH;

/// Exit code for refused launches, following the `docker run` convention
/// for errors from the tooling rather than the contained command.
const EXIT_DENIED: i32 = 125;
/// Exit code when the real binary cannot be exec-ed.
const EXIT_EXEC_FAILED: i32 = 127;

fn main() {
    let argv: Vec<String> = std::env::args().skip(1).collect();

    let network = std::env::var("AWF_NETWORK").unwrap_or_default();
    let proxy_url = std::env::var("AWF_PROXY_URL").unwrap_or_default();
    if network.is_empty() || proxy_url.is_empty() {
        // Not inside an awf sandbox (e.g. copied out of the container);
        // behave as a transparent wrapper.
        eprintln!("awf: sandbox environment missing, passing through");
        exec_real(&argv);
    }

    let ctx = InterceptContext {
        network,
        proxy_url,
        nat_script_b64: std::env::var("AWF_NAT_SCRIPT_B64")
            .ok()
            .filter(|s| !s.is_empty()),
    };

    let decision = evaluate(&ctx, &argv);
    append_decision_log(&decision, &argv);

    match decision {
        InterceptDecision::Deny(reason) => {
            eprintln!("awf: refusing nested launch: {reason}");
            std::process::exit(EXIT_DENIED);
        }
        InterceptDecision::Allow(rewritten) => exec_real(&rewritten),
        InterceptDecision::Passthrough(original) => exec_real(&original),
    }
}

/// Append one line to the decision log. Best-effort: a read-only or
/// missing log directory must never block the launch path.
fn append_decision_log(decision: &InterceptDecision, original: &[String]) {
    let path = std::env::var("AWF_SHIM_LOG").unwrap_or_else(|_| SHIM_LOG_PATH.to_owned());
    let entry = log_line(decision, original);
    let opened = std::fs::OpenOptions::new().create(true).append(true).open(&path);
    match opened {
        Ok(mut file) => {
            if let Err(e) = writeln!(file, "{entry}") {
                eprintln!("awf: cannot write decision log {path}: {e}");
            }
        }
        Err(e) => eprintln!("awf: cannot open decision log {path}: {e}"),
    }
}

/// Replace this process with the real docker client.
fn exec_real(args: &[String]) -> ! {
    let real = std::env::var("AWF_REAL_DOCKER").unwrap_or_else(|_| "/usr/bin/docker".to_owned());
    let error = Command::new(&real).args(args).exec();
    eprintln!("awf: cannot exec {real}: {error}");
    std::process::exit(EXIT_EXEC_FAILED);
}
