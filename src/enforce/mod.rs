//! Egress enforcement: the host-bridge filter chain and the nested-launch
//! interceptor. The third ring (in-sandbox NAT) is generated by
//! [`crate::policy::firewall`] and installed by the command container's
//! entrypoint.

pub mod host_chain;
pub mod intercept;

pub use host_chain::{HostChainInstaller, HostCommandRunner, SystemRunner};
pub use intercept::{evaluate, InterceptContext, InterceptDecision};

/// Errors produced while manipulating the host packet filter.
#[derive(Debug, thiserror::Error)]
pub enum EnforceError {
    /// The filter tool could not be spawned at all.
    #[error("cannot spawn {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A filter command exited non-zero during installation. Installation
    /// is fail-closed: the orchestrator aborts without starting containers.
    #[error("filter install failed at {step}: {stderr}")]
    InstallFailed {
        /// Which installation step failed.
        step: String,
        /// Captured stderr of the failing command.
        stderr: String,
    },
}
