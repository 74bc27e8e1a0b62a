//! Work-directory materialization: generated configs and entrypoints.
//!
//! Layout per run:
//!
//! ```text
//! <work-dir>/
//!   proxy.conf             generated Squid ACL
//!   topology.desc          container-topology descriptor (JSON)
//!   command-entrypoint.sh  NAT install + capability drop + user exec
//!   proxy-entrypoint.sh    permissions fixup + squid foreground
//!   proxy-logs/            Squid access log (bind-mounted)
//!   command-logs/          interceptor decision log and agent logs
//! ```

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::lifecycle::LifecycleError;
use super::{SandboxTopology, PRELOAD_MOUNT_PATH};
use crate::policy::PolicyArtifact;

/// Generated Squid configuration file name.
pub const PROXY_CONF: &str = "proxy.conf";
/// Topology descriptor file name.
pub const TOPOLOGY_DESC: &str = "topology.desc";
/// Command-container entrypoint file name.
pub const COMMAND_ENTRYPOINT: &str = "command-entrypoint.sh";
/// Proxy-container entrypoint file name.
pub const PROXY_ENTRYPOINT: &str = "proxy-entrypoint.sh";
/// Proxy log directory name.
pub const PROXY_LOGS_DIR: &str = "proxy-logs";
/// Command log directory name.
pub const COMMAND_LOGS_DIR: &str = "command-logs";

/// A per-run work directory. Never shared between runs.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    /// Create the directory tree, including both log directories.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Materialize`] when creation fails.
    pub fn create(root: PathBuf) -> Result<Self, LifecycleError> {
        for dir in [
            root.clone(),
            root.join(PROXY_LOGS_DIR),
            root.join(COMMAND_LOGS_DIR),
        ] {
            std::fs::create_dir_all(&dir).map_err(|source| LifecycleError::Materialize {
                path: dir.display().to_string(),
                source,
            })?;
        }
        Ok(Self { root })
    }

    /// Root path of the work directory.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Write every generated artifact for the run.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Materialize`] on the first write failure.
    pub fn materialize(
        &self,
        artifact: &PolicyArtifact,
        topology: &SandboxTopology,
    ) -> Result<(), LifecycleError> {
        self.write(PROXY_CONF, &artifact.squid_conf(), false)?;

        let descriptor = serde_json::to_string_pretty(topology)
            .map_err(|e| LifecycleError::Internal(format!("topology serialization: {e}")))?;
        self.write(TOPOLOGY_DESC, &descriptor, false)?;

        self.write(
            COMMAND_ENTRYPOINT,
            &render_command_entrypoint(artifact),
            true,
        )?;
        self.write(PROXY_ENTRYPOINT, &render_proxy_entrypoint(artifact), true)?;

        debug!(work_dir = %self.root.display(), "run artifacts materialized");
        Ok(())
    }

    /// Remove the directory tree. Best-effort; the caller logs failures.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when removal fails.
    pub fn delete(&self) -> std::io::Result<()> {
        std::fs::remove_dir_all(&self.root)
    }

    fn write(&self, name: &str, contents: &str, executable: bool) -> Result<(), LifecycleError> {
        let path = self.root.join(name);
        std::fs::write(&path, contents).map_err(|source| LifecycleError::Materialize {
            path: path.display().to_string(),
            source,
        })?;
        if executable {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).map_err(
                    |source| LifecycleError::Materialize {
                        path: path.display().to_string(),
                        source,
                    },
                )?;
            }
        }
        Ok(())
    }
}

/// Render the command-container entrypoint.
///
/// The script runs as root with `NET_ADMIN` available, installs the
/// in-sandbox redirection, then hands off to the user command in a single
/// `exec`: capability drop, identity switch, and preload activation happen
/// in one `setpriv` invocation with no suspension point in between, so a
/// re-elevated process inside the container can never regain `NET_ADMIN`.
pub fn render_command_entrypoint(artifact: &PolicyArtifact) -> String {
    let nat = artifact.nat_plan().render_script();
    // Inline the NAT body, dropping its shebang.
    let nat_body = nat.strip_prefix("#!/bin/sh\n").unwrap_or(&nat);

    let mut s = String::new();
    s.push_str("#!/bin/sh\n");
    s.push_str("# awf command container entrypoint (generated)\n");
    s.push_str("set -eu\n\n");

    s.push_str("# Mirror the invoking user so workspace files keep sane ownership.\n");
    s.push_str("if command -v groupadd >/dev/null 2>&1; then\n");
    s.push_str("  groupadd -g \"$AWF_GID\" awf 2>/dev/null || true\n");
    s.push_str("  useradd -m -u \"$AWF_UID\" -g \"$AWF_GID\" awf 2>/dev/null || true\n");
    s.push_str("else\n");
    s.push_str("  addgroup -g \"$AWF_GID\" awf 2>/dev/null || true\n");
    s.push_str("  adduser -D -u \"$AWF_UID\" -G awf awf 2>/dev/null || true\n");
    s.push_str("fi\n");
    s.push_str("mkdir -p /home/awf && chown \"$AWF_UID:$AWF_GID\" /home/awf\n\n");

    s.push_str(nat_body);
    s.push('\n');

    let _ = writeln!(
        s,
        "if [ -f {PRELOAD_MOUNT_PATH} ]; then AWF_PRELOAD={PRELOAD_MOUNT_PATH}; else AWF_PRELOAD=; fi"
    );
    s.push_str("\n# Drop NET_ADMIN from the bounding set, become the unprivileged\n");
    s.push_str("# user, and exec the command. One handoff, no window to tamper\n");
    s.push_str("# with the rules above.\n");
    s.push_str("exec setpriv --reuid \"$AWF_UID\" --regid \"$AWF_GID\" --init-groups \\\n");
    s.push_str("  --bounding-set -net_admin --inh-caps -net_admin \\\n");
    s.push_str("  env LD_PRELOAD=\"$AWF_PRELOAD\" \"$@\"\n");

    s
}

/// Render the proxy-container entrypoint: fix log ownership, optionally
/// initialize the on-tmpfs certificate database, start Squid in the
/// foreground.
pub fn render_proxy_entrypoint(artifact: &PolicyArtifact) -> String {
    let mut s = String::new();
    s.push_str("#!/bin/sh\n");
    s.push_str("# awf proxy container entrypoint (generated)\n");
    s.push_str("set -eu\n\n");
    s.push_str("chown -R proxy:proxy /var/log/squid 2>/dev/null || true\n");

    if artifact.ssl_bump {
        s.push_str("\nif [ ! -d /var/spool/squid/ssl_db ]; then\n");
        s.push_str(
            "  /usr/lib/squid/security_file_certgen -c -s /var/spool/squid/ssl_db -M 4MB\n",
        );
        s.push_str("fi\n");
    }

    s.push_str("\nexec squid -f /etc/squid/squid.conf -NYC\n");
    s
}
