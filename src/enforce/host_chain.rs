//! Installation and removal of the `AWF_EGRESS` host-bridge chain.
//!
//! The chain is a process-wide host resource: the orchestrator owns it
//! between InstallFilter and Teardown. Install is idempotent (an existing
//! chain is flushed and repopulated, the jump rule is never duplicated) so
//! concurrent runs with distinct subnets stay safe and a crashed run's
//! leftovers are replaced rather than appended to.
//!
//! Both address families are enforced: the IPv4 chain through `iptables`
//! and, when the policy carries a bridge ULA prefix, a matching chain
//! through `ip6tables`. A host without `ip6tables` skips the v6 chain
//! with a warning (the sandbox bridge only routes v6 when the run
//! enabled it); any other v6 failure is as fail-closed as the v4 path.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::EnforceError;
use crate::policy::firewall::{HostChainPlan, RuleArgs, HOST_CHAIN};

/// Captured result of one host command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit status (`-1` when terminated by signal).
    pub status: i32,
    /// Captured stderr, used in error reports.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` for a zero exit status.
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Seam for running privileged host commands, so the installer logic is
/// testable with a recording fake.
#[async_trait]
pub trait HostCommandRunner: Send + Sync {
    /// Run `program` with `args`, capturing output. A non-zero exit is not
    /// an error at this layer; callers decide.
    ///
    /// # Errors
    ///
    /// Returns [`EnforceError::Spawn`] when the program cannot start.
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, EnforceError>;
}

/// Production runner backed by `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

#[async_trait]
impl HostCommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, EnforceError> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|source| EnforceError::Spawn {
                program: program.to_owned(),
                source,
            })?;
        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Installs and removes the host-bridge chain for one run.
pub struct HostChainInstaller {
    runner: Arc<dyn HostCommandRunner>,
    plan: HostChainPlan,
}

impl HostChainInstaller {
    /// Create an installer over a runner and the compiled plan.
    pub fn new(runner: Arc<dyn HostCommandRunner>, plan: HostChainPlan) -> Self {
        Self { runner, plan }
    }

    /// Install the chain in both families: create-or-flush, append the
    /// ruleset, ensure the `DOCKER-USER` jump (falling back to `FORWARD`
    /// on hosts without it).
    ///
    /// # Errors
    ///
    /// Fail-closed: any step that cannot be completed returns
    /// [`EnforceError::InstallFailed`] and the caller must not start
    /// containers. The one tolerated gap is a missing `ip6tables`
    /// binary, logged and skipped.
    pub async fn install(&self) -> Result<(), EnforceError> {
        self.install_family("iptables", &self.plan.rules(), &self.plan.jump_rule())
            .await?;

        if let Some(jump_v6) = self.plan.jump_rule_v6() {
            match self
                .install_family("ip6tables", &self.plan.rules_v6(), &jump_v6)
                .await
            {
                Ok(()) => {}
                Err(EnforceError::Spawn { program, source }) => {
                    warn!(%program, error = %source, "ip6tables unavailable; IPv6 chain skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Remove the chain and its jump rules from both families.
    /// Best-effort: failures are logged and swallowed so teardown can
    /// continue.
    pub async fn remove(&self) {
        self.remove_family("iptables", &self.plan.jump_rule()).await;
        if let Some(jump_v6) = self.plan.jump_rule_v6() {
            self.remove_family("ip6tables", &jump_v6).await;
        }
    }

    async fn install_family(
        &self,
        tool: &'static str,
        rules: &[RuleArgs],
        jump: &RuleArgs,
    ) -> Result<(), EnforceError> {
        let created = self.filter_cmd(tool, &["-N", HOST_CHAIN]).await?;
        if !created.success() {
            // Chain already exists (e.g. a crashed earlier run): replace
            // its contents instead of appending.
            let flushed = self.filter_cmd(tool, &["-F", HOST_CHAIN]).await?;
            if !flushed.success() {
                return Err(EnforceError::InstallFailed {
                    step: format!("{tool} flush {HOST_CHAIN}"),
                    stderr: flushed.stderr,
                });
            }
            debug!(%tool, chain = HOST_CHAIN, "existing chain flushed for reinstall");
        }

        for rule in rules {
            let mut argv = vec!["-A".to_owned(), HOST_CHAIN.to_owned()];
            argv.extend(rule.iter().cloned());
            let appended = self.runner.run(tool, &argv).await?;
            if !appended.success() {
                return Err(EnforceError::InstallFailed {
                    step: format!("{tool} append rule `{}`", rule.join(" ")),
                    stderr: appended.stderr,
                });
            }
        }

        self.ensure_jump(tool, jump).await
    }

    async fn remove_family(&self, tool: &'static str, jump: &RuleArgs) {
        for hook in ["DOCKER-USER", "FORWARD"] {
            let mut argv = vec!["-D".to_owned(), hook.to_owned()];
            argv.extend(jump.iter().cloned());
            match self.runner.run(tool, &argv).await {
                Ok(_) => {}
                Err(e) => warn!(error = %e, %tool, hook, "failed to delete jump rule"),
            }
        }
        for argv in [["-F", HOST_CHAIN], ["-X", HOST_CHAIN]] {
            match self.filter_cmd(tool, &argv).await {
                Ok(out) if !out.success() => {
                    debug!(%tool, args = ?argv, stderr = %out.stderr.trim(), "chain cleanup step skipped");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, %tool, "failed to run chain cleanup"),
            }
        }
    }

    /// Insert the jump rule exactly once, preferring `DOCKER-USER`.
    async fn ensure_jump(&self, tool: &'static str, jump: &RuleArgs) -> Result<(), EnforceError> {
        let mut last_stderr = String::new();

        for hook in ["DOCKER-USER", "FORWARD"] {
            let mut check = vec!["-C".to_owned(), hook.to_owned()];
            check.extend(jump.iter().cloned());
            if self.runner.run(tool, &check).await?.success() {
                return Ok(());
            }

            let mut insert = vec!["-I".to_owned(), hook.to_owned(), "1".to_owned()];
            insert.extend(jump.iter().cloned());
            let inserted = self.runner.run(tool, &insert).await?;
            if inserted.success() {
                return Ok(());
            }
            last_stderr = inserted.stderr;
        }

        Err(EnforceError::InstallFailed {
            step: format!("{tool} insert jump rule"),
            stderr: last_stderr,
        })
    }

    async fn filter_cmd(
        &self,
        tool: &'static str,
        args: &[&str],
    ) -> Result<CommandOutput, EnforceError> {
        let owned: Vec<String> = args.iter().map(|s| (*s).to_owned()).collect();
        self.runner.run(tool, &owned).await
    }
}
