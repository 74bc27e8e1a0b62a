//! Sandbox topology model, materialization, and lifecycle.
//!
//! A sandbox is one bridge network plus up to three containers: the Squid
//! egress proxy, the user-command container, and (under credential
//! isolation) the credential sidecar. The topology is derived from a
//! [`PolicyArtifact`](crate::policy::PolicyArtifact) and never mutated
//! after construction.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use crate::policy::PolicyArtifact;

pub mod health;
pub mod lifecycle;
pub mod materialize;

pub use lifecycle::{LifecycleError, LifecycleManager, SupervisionOutcome};
pub use materialize::WorkDir;

/// Image used for the proxy container.
pub const PROXY_IMAGE: &str = "ubuntu/squid:latest";
/// Default image for the command container when the user picks none.
pub const DEFAULT_COMMAND_IMAGE: &str = "ubuntu:24.04";
/// Where the preload library is mounted inside the command container.
pub const PRELOAD_MOUNT_PATH: &str = "/awf/libawf_preload.so";
/// Where the nested-launch shim is mounted; shadows the real binary on PATH.
pub const SHIM_MOUNT_PATH: &str = "/usr/local/bin/docker";
/// Interceptor decision log inside the command container.
pub const SHIM_LOG_PATH: &str = "/var/log/awf/docker-shim.log";

/// The sandbox bridge network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeSpec {
    /// Docker network name, unique per run.
    pub name: String,
    /// Exclusive /24 chosen during policy compilation.
    pub subnet: Ipv4Net,
    /// ULA /64 when IPv6 rules are on; the bridge is created
    /// IPv6-enabled with this prefix so the host chain can match it.
    pub subnet_v6: Option<Ipv6Net>,
}

/// One bind mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Absolute path on the host.
    pub host_path: PathBuf,
    /// Absolute path inside the container.
    pub container_path: String,
    /// Mounted read-only when `true`.
    pub read_only: bool,
}

impl MountSpec {
    /// Render in Docker `host:container[:ro]` bind syntax.
    pub fn render(&self) -> String {
        let mode = if self.read_only { ":ro" } else { "" };
        format!("{}:{}{}", self.host_path.display(), self.container_path, mode)
    }
}

/// One container in the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name, unique per run.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Command vector (entrypoint script plus arguments).
    pub command: Vec<String>,
    /// Environment as `KEY=VALUE` pairs.
    pub env: Vec<String>,
    /// Bind mounts.
    pub mounts: Vec<MountSpec>,
    /// Tmpfs mounts as `(path, options)` pairs.
    pub tmpfs: Vec<(String, String)>,
    /// Capabilities granted on top of a dropped-ALL baseline.
    pub cap_add: Vec<String>,
    /// User the container starts as; `None` keeps the image default.
    pub user: Option<String>,
    /// Fixed address on the sandbox bridge.
    pub fixed_ip: Ipv4Addr,
    /// Initial working directory.
    pub working_dir: Option<String>,
}

/// Inputs to topology construction beyond the policy artifact.
#[derive(Debug, Clone)]
pub struct TopologyOptions {
    /// Eight-hex-char run identifier suffixing every Docker object name.
    pub run_id: String,
    /// The user command to execute.
    pub user_command: Vec<String>,
    /// Image for the command container.
    pub command_image: String,
    /// Image for the credential sidecar, when isolation is enabled.
    pub sidecar_image: Option<String>,
    /// UID of the invoking user, adopted inside the command container.
    pub uid: u32,
    /// GID of the invoking user.
    pub gid: u32,
    /// Host directory mounted at `/workspace`.
    pub workspace: PathBuf,
    /// Host home directory mirrored to `/home/awf` when set.
    pub mirror_home: Option<PathBuf>,
    /// Inherited environment, already scrubbed of protected names.
    pub passthrough_env: Vec<String>,
    /// Host path of the built preload library, when deployed.
    pub preload_library: Option<PathBuf>,
    /// Host path of the `awf-docker-shim` binary, when deployed.
    pub shim_binary: Option<PathBuf>,
    /// Work directory holding generated configs and entrypoints.
    pub work_dir: PathBuf,
}

/// The full three-container topology for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxTopology {
    /// Run identifier.
    pub run_id: String,
    /// Bridge network.
    pub bridge: BridgeSpec,
    /// Egress proxy container.
    pub proxy: ContainerSpec,
    /// User-command container.
    pub command: ContainerSpec,
    /// Credential sidecar, present under credential isolation.
    pub sidecar: Option<ContainerSpec>,
}

impl SandboxTopology {
    /// Derive the topology from a compiled artifact.
    ///
    /// Invariants upheld here and checked by tests: only the command
    /// container carries `NET_ADMIN`; the proxy and sidecar run as
    /// non-root users; all three sit on the one bridge at their fixed
    /// addresses.
    pub fn build(artifact: &PolicyArtifact, opts: &TopologyOptions) -> Self {
        let run_id = opts.run_id.clone();
        let bridge = BridgeSpec {
            name: format!("awf-net-{run_id}"),
            subnet: artifact.subnet,
            subnet_v6: artifact.subnet_v6,
        };

        let proxy = ContainerSpec {
            name: format!("awf-proxy-{run_id}"),
            image: PROXY_IMAGE.to_owned(),
            command: vec!["/awf/proxy-entrypoint.sh".to_owned()],
            env: Vec::new(),
            mounts: vec![
                MountSpec {
                    host_path: opts.work_dir.join(materialize::PROXY_CONF),
                    container_path: "/etc/squid/squid.conf".to_owned(),
                    read_only: true,
                },
                MountSpec {
                    host_path: opts.work_dir.join(materialize::PROXY_ENTRYPOINT),
                    container_path: "/awf/proxy-entrypoint.sh".to_owned(),
                    read_only: true,
                },
                MountSpec {
                    host_path: opts.work_dir.join(materialize::PROXY_LOGS_DIR),
                    container_path: "/var/log/squid".to_owned(),
                    read_only: false,
                },
            ],
            // The certificate database under SSL bump lives on tmpfs so
            // generated keys never touch disk.
            tmpfs: artifact
                .ssl_bump
                .then(|| ("/var/spool/squid".to_owned(), "rw,size=64m".to_owned()))
                .into_iter()
                .collect(),
            cap_add: Vec::new(),
            user: Some("proxy".to_owned()),
            fixed_ip: artifact.proxy_ip,
            working_dir: None,
        };

        let mut command_env = opts.passthrough_env.clone();
        let proxy_url = artifact.proxy_url();
        for var in ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"] {
            command_env.push(format!("{var}={proxy_url}"));
        }
        command_env.push(format!("AWF_UID={}", opts.uid));
        command_env.push(format!("AWF_GID={}", opts.gid));
        command_env.push(format!("AWF_NETWORK={}", bridge.name));
        command_env.push(format!("AWF_PROXY_URL={proxy_url}"));
        // The shim replays this NAT preamble inside nested containers.
        command_env.push(format!(
            "AWF_NAT_SCRIPT_B64={}",
            BASE64_STANDARD.encode(artifact.nat_plan().render_script())
        ));
        command_env.push("HOME=/home/awf".to_owned());

        let mut command_mounts = vec![
            MountSpec {
                host_path: opts.work_dir.join(materialize::COMMAND_ENTRYPOINT),
                container_path: "/awf/command-entrypoint.sh".to_owned(),
                read_only: true,
            },
            MountSpec {
                host_path: opts.work_dir.join(materialize::COMMAND_LOGS_DIR),
                container_path: "/var/log/awf".to_owned(),
                read_only: false,
            },
            MountSpec {
                host_path: opts.workspace.clone(),
                container_path: "/workspace".to_owned(),
                read_only: false,
            },
        ];
        if let Some(lib) = &opts.preload_library {
            command_mounts.push(MountSpec {
                host_path: lib.clone(),
                container_path: PRELOAD_MOUNT_PATH.to_owned(),
                read_only: true,
            });
        }
        if let Some(shim) = &opts.shim_binary {
            command_mounts.push(MountSpec {
                host_path: shim.clone(),
                container_path: SHIM_MOUNT_PATH.to_owned(),
                read_only: true,
            });
        }
        if let Some(home) = &opts.mirror_home {
            command_mounts.push(MountSpec {
                host_path: home.clone(),
                container_path: "/home/awf".to_owned(),
                read_only: false,
            });
        }

        let mut command_vector = vec!["/awf/command-entrypoint.sh".to_owned()];
        command_vector.extend(opts.user_command.iter().cloned());

        let command = ContainerSpec {
            name: format!("awf-command-{run_id}"),
            image: opts.command_image.clone(),
            command: command_vector,
            env: command_env,
            mounts: command_mounts,
            tmpfs: vec![("/tmp".to_owned(), "rw,size=512m".to_owned())],
            cap_add: vec!["NET_ADMIN".to_owned()],
            // The entrypoint starts as root to install NAT, then drops the
            // capability and switches to the invoking user's UID/GID.
            user: Some("0:0".to_owned()),
            fixed_ip: artifact.command_ip,
            working_dir: Some("/workspace".to_owned()),
        };

        let sidecar = artifact.credential_isolation.then(|| ContainerSpec {
            name: format!("awf-agent-{run_id}"),
            image: opts
                .sidecar_image
                .clone()
                .unwrap_or_else(|| "awf-credential-sidecar:latest".to_owned()),
            command: Vec::new(),
            env: vec![format!("AWF_PROXY_URL={proxy_url}")],
            mounts: Vec::new(),
            tmpfs: Vec::new(),
            cap_add: Vec::new(),
            user: Some("nobody".to_owned()),
            fixed_ip: artifact.sidecar_ip,
            working_dir: None,
        });

        Self {
            run_id,
            bridge,
            proxy,
            command,
            sidecar,
        }
    }
}

/// Drop every protected variable from an inherited environment.
///
/// The preload library is the second line of defense; this scrub makes
/// sure protected values never even reach the container unless the user
/// command is meant to read them through the one-shot path, in which case
/// the caller re-adds them explicitly.
pub fn scrub_environment<I>(vars: I, protected: &[String]) -> Vec<String>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter(|(name, _)| !protected.iter().any(|p| p == name))
        .map(|(name, value)| format!("{name}={value}"))
        .collect()
}
