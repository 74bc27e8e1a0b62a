//! Run configuration: the bridge between CLI flags and the policy
//! compiler / lifecycle manager inputs.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use ipnet::Ipv4Net;

use crate::policy::{self, PolicyError, PolicyInputs};

/// Everything one run needs, assembled by the CLI layer.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Inline allowed-domain entries.
    pub allowed_domains: Vec<String>,
    /// Path to a file of allowed domains, one per line.
    pub allowed_domains_file: Option<PathBuf>,
    /// Inline blocked-domain entries.
    pub blocked_domains: Vec<String>,
    /// Path to a file of blocked domains.
    pub blocked_domains_file: Option<PathBuf>,
    /// Extra redirect port rules (`"8080,9000-9100"` segments).
    pub host_ports: Vec<String>,
    /// DNS servers the sandbox may query directly.
    pub dns_servers: Vec<IpAddr>,
    /// Override for the bridge subnet pool.
    pub subnet_pool: Option<Vec<Ipv4Net>>,
    /// Append well-known package registries to the allowlist.
    pub allow_registries: bool,
    /// Start the credential sidecar.
    pub credential_isolation: bool,
    /// Enable TLS interception in the proxy.
    pub ssl_bump: bool,
    /// Skip IPv6 rules even where `ip6tables` exists.
    pub no_ipv6: bool,
    /// The user command to execute.
    pub command: Vec<String>,
    /// Image for the command container.
    pub command_image: String,
    /// Image for the credential sidecar.
    pub sidecar_image: Option<String>,
    /// Explicit work directory; a per-run default is derived otherwise.
    pub work_dir: Option<PathBuf>,
    /// Preserve the work directory after the run.
    pub keep_artifacts: bool,
    /// Whole-run timeout; expiry is treated as cancellation.
    pub timeout: Option<Duration>,
    /// Mirror `$HOME` into the command container.
    pub mirror_home: bool,
    /// User override of the protected-variable set, passed through to the
    /// preload library.
    pub protected_env_override: Option<String>,
    /// Preload diagnostic mode (observe-only).
    pub preload_debug: bool,
}

impl RunConfig {
    /// Assemble [`PolicyInputs`], merging inline and file-based domain
    /// lists. This is the single place the compiler's file read happens.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::DomainsFileUnreadable`] when a configured
    /// file cannot be read.
    pub fn policy_inputs(&self, subnets_in_use: Vec<Ipv4Net>) -> Result<PolicyInputs, PolicyError> {
        let mut allowed = self.allowed_domains.clone();
        if let Some(path) = &self.allowed_domains_file {
            allowed.extend(policy::read_domains_file(path)?);
        }
        let mut blocked = self.blocked_domains.clone();
        if let Some(path) = &self.blocked_domains_file {
            blocked.extend(policy::read_domains_file(path)?);
        }

        let defaults = PolicyInputs::default();
        Ok(PolicyInputs {
            allowed_domains: allowed,
            blocked_domains: blocked,
            host_port_rules: self.host_ports.clone(),
            dns_servers: self.dns_servers.clone(),
            subnet_pool: self.subnet_pool.clone().unwrap_or(defaults.subnet_pool),
            subnets_in_use,
            allow_registries: self.allow_registries,
            credential_isolation: self.credential_isolation,
            ssl_bump: self.ssl_bump,
            ipv6_rules: !self.no_ipv6,
        })
    }

    /// Resolve the work directory for a run id.
    pub fn resolve_work_dir(&self, run_id: &str) -> PathBuf {
        if let Some(dir) = &self.work_dir {
            return dir.clone();
        }
        ProjectDirs::from("", "", "awf")
            .map(|dirs| dirs.data_local_dir().join("runs").join(run_id))
            .unwrap_or_else(|| std::env::temp_dir().join(format!("awf-{run_id}")))
    }
}

/// UID/GID of the invoking user: `SUDO_UID`/`SUDO_GID` when the
/// orchestrator runs under sudo, otherwise the owner of `/proc/self`.
pub fn invoking_identity() -> (u32, u32) {
    let from_env = |name: &str| {
        std::env::var(name)
            .ok()
            .and_then(|v| v.trim().parse::<u32>().ok())
    };
    if let (Some(uid), Some(gid)) = (from_env("SUDO_UID"), from_env("SUDO_GID")) {
        return (uid, gid);
    }

    #[cfg(target_os = "linux")]
    {
        use std::os::unix::fs::MetadataExt;
        if let Ok(meta) = std::fs::metadata("/proc/self") {
            return (meta.uid(), meta.gid());
        }
    }
    (0, 0)
}

/// Locate a deployable artifact (preload library, shim binary) next to the
/// running executable. Returns `None` when absent, which downgrades the
/// corresponding protection with a logged warning.
pub fn discover_sibling(name: &str) -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let candidate = exe.parent()?.join(name);
    candidate.is_file().then_some(candidate)
}
