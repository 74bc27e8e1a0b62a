//! Top-level run sequencer.
//!
//! One run walks `Compile → Materialize → InstallFilter → StartProxy →
//! StartSidecar? → StartCommand → Running → CaptureExit → Teardown`.
//! Every error path still passes through Teardown; teardown failures are
//! logged and never change the exit code once a more severe one is set.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{self, RunConfig};
use crate::enforce::SystemRunner;
use crate::policy::{self, PolicyArtifact};
use crate::sandbox::{
    self, LifecycleError, LifecycleManager, SandboxTopology, SupervisionOutcome, TopologyOptions,
    WorkDir,
};

/// Internal contract violation.
pub const EXIT_INTERNAL: i32 = 1;
/// Policy compilation failure.
pub const EXIT_POLICY: i32 = 2;
/// Lifecycle failure before the command started.
pub const EXIT_LIFECYCLE: i32 = 3;
/// The proxy died while the command was running.
pub const EXIT_PROXY_DIED: i32 = 4;
/// Interrupted (SIGINT).
pub const EXIT_SIGINT: i32 = 130;
/// Terminated (SIGTERM) or run timeout.
pub const EXIT_SIGTERM: i32 = 143;

/// Execute one sandboxed run and return the process exit code.
pub async fn run(config: RunConfig) -> i32 {
    let start = Instant::now();

    // Compile. Nothing on the host has been touched yet, so failures
    // here leave no residue.
    let docker = match LifecycleManager::connect().await {
        Ok(docker) => docker,
        Err(e) => {
            error!("{e}");
            return EXIT_LIFECYCLE;
        }
    };
    let in_use = match LifecycleManager::subnets_in_use(&docker).await {
        Ok(subnets) => subnets,
        Err(e) => {
            error!("{e}");
            return EXIT_LIFECYCLE;
        }
    };
    let inputs = match config.policy_inputs(in_use) {
        Ok(inputs) => inputs,
        Err(e) => {
            error!("{e}");
            return EXIT_POLICY;
        }
    };
    let artifact = match policy::compile(&inputs) {
        Ok(artifact) => artifact,
        Err(e) => {
            error!("{e}");
            return EXIT_POLICY;
        }
    };

    let run_id = short_run_id();
    let work_root = config.resolve_work_dir(&run_id);
    info!(%run_id, subnet = %artifact.subnet, work_dir = %work_root.display(), "starting run");

    // Materialize.
    let work = match WorkDir::create(work_root) {
        Ok(work) => work,
        Err(e) => {
            error!("{e}");
            return EXIT_LIFECYCLE;
        }
    };
    let topology = build_topology(&config, &artifact, &run_id, work.path().to_path_buf());
    if let Err(e) = work.materialize(&artifact, &topology) {
        error!("{e}");
        cleanup_work_dir(&work, &config, EXIT_LIFECYCLE);
        return EXIT_LIFECYCLE;
    }

    // Cancellation: signals and the optional run timeout share one token.
    let cancel = CancellationToken::new();
    let signal_code = Arc::new(AtomicI32::new(0));
    spawn_signal_listener(cancel.clone(), Arc::clone(&signal_code));
    if let Some(timeout) = config.timeout {
        let cancel = cancel.clone();
        let signal_code = Arc::clone(&signal_code);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if !cancel.is_cancelled() {
                warn!(?timeout, "run timeout expired, cancelling");
                let _ = signal_code.compare_exchange(
                    0,
                    EXIT_SIGTERM,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                cancel.cancel();
            }
        });
    }

    // Start, run, capture.
    let mut manager =
        LifecycleManager::new(docker, Arc::new(SystemRunner), &artifact, topology);
    let exit_code = match manager.start().await {
        Err(e) => {
            error!("{e}");
            lifecycle_exit_code(&e)
        }
        Ok(()) => {
            let log_task = manager.stream_command_logs(cancel.clone());
            let outcome = manager.supervise(&cancel).await;
            cancel.cancel();
            // Give the log stream a moment to drain buffered output.
            let _ = tokio::time::timeout(std::time::Duration::from_secs(2), log_task).await;

            match outcome {
                SupervisionOutcome::CommandExited(status) => command_exit_code(status),
                SupervisionOutcome::ProxyDied => EXIT_PROXY_DIED,
                SupervisionOutcome::Cancelled => match signal_code.load(Ordering::SeqCst) {
                    0 => EXIT_SIGTERM,
                    code => code,
                },
            }
        }
    };

    // Teardown always runs; its errors are logged inside and do not
    // change the exit code.
    manager.teardown().await;
    cleanup_work_dir(&work, &config, exit_code);

    info!(
        %run_id,
        exit_code,
        elapsed_secs = start.elapsed().as_secs(),
        "run finished"
    );
    exit_code
}

/// Eight-hex-char run identifier.
fn short_run_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id.chars().take(8).collect()
}

fn build_topology(
    config: &RunConfig,
    artifact: &PolicyArtifact,
    run_id: &str,
    work_dir: PathBuf,
) -> SandboxTopology {
    let protected = config
        .protected_env_override
        .as_deref()
        .and_then(awf_preload::parse_override)
        .unwrap_or_else(awf_preload::default_protected_names);

    // Protected values are scrubbed from the inherited environment before
    // the container ever exists; the preload library covers anything the
    // command re-introduces at runtime.
    let mut passthrough = sandbox::scrub_environment(std::env::vars(), &protected);
    if let Some(raw) = &config.protected_env_override {
        passthrough.push(format!("{}={raw}", awf_preload::OVERRIDE_VAR));
    }
    if config.preload_debug {
        passthrough.push(format!("{}=1", awf_preload::DEBUG_VAR));
    }

    let preload_library = config::discover_sibling("libawf_preload.so");
    if preload_library.is_none() {
        warn!("preload library not found next to the executable; one-shot token protection is off");
    }
    let shim_binary = config::discover_sibling("awf-docker-shim");
    if shim_binary.is_none() {
        warn!("docker shim not found next to the executable; nested launches are not intercepted");
    }

    let (uid, gid) = config::invoking_identity();
    let workspace = std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir());
    let mirror_home = config
        .mirror_home
        .then(|| std::env::var_os("HOME").map(PathBuf::from))
        .flatten();

    let opts = TopologyOptions {
        run_id: run_id.to_owned(),
        user_command: config.command.clone(),
        command_image: config.command_image.clone(),
        sidecar_image: config.sidecar_image.clone(),
        uid,
        gid,
        workspace,
        mirror_home,
        passthrough_env: passthrough,
        preload_library,
        shim_binary,
        work_dir,
    };
    SandboxTopology::build(artifact, &opts)
}

/// Map the user command's wait status onto our exit code, verbatim for
/// 0-255 and [`EXIT_INTERNAL`] for anything unrepresentable.
fn command_exit_code(status: i64) -> i32 {
    u8::try_from(status).map(i32::from).unwrap_or(EXIT_INTERNAL)
}

fn lifecycle_exit_code(error: &LifecycleError) -> i32 {
    match error {
        LifecycleError::Internal(_) => EXIT_INTERNAL,
        _ => EXIT_LIFECYCLE,
    }
}

/// Delete the work directory on a clean run unless artifacts are kept; on
/// failure or with `--keep-artifacts`, preserve it and print the path.
fn cleanup_work_dir(work: &WorkDir, config: &RunConfig, exit_code: i32) {
    if exit_code == 0 && !config.keep_artifacts {
        if let Err(e) = work.delete() {
            warn!(error = %e, "failed to remove work directory");
        }
        return;
    }
    eprintln!("awf: run artifacts kept in {}", work.path().display());
}

fn spawn_signal_listener(cancel: CancellationToken, code: Arc<AtomicI32>) {
    tokio::spawn(async move {
        let (Ok(mut interrupt), Ok(mut terminate)) = (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) else {
            warn!("cannot install signal handlers; ctrl-c will not tear down cleanly");
            return;
        };

        tokio::select! {
            _ = interrupt.recv() => code.store(EXIT_SIGINT, Ordering::SeqCst),
            _ = terminate.recv() => code.store(EXIT_SIGTERM, Ordering::SeqCst),
        }
        info!("signal received, requesting teardown");
        cancel.cancel();
    });
}
