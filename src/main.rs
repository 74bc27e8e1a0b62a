//! AWF CLI entry point.
//!
//! Parses the run flags, initialises logging, and hands off to the
//! orchestrator. The process exit code is the user command's own exit
//! code on success, or one of the documented failure codes (2 policy,
//! 3 lifecycle, 4 proxy death, 130/143 signals, 1 internal).

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use directories::ProjectDirs;
use ipnet::Ipv4Net;

use awf::config::RunConfig;
use awf::{logging, orchestrator, sandbox};

/// Run a command inside an egress-filtered Docker sandbox.
#[derive(Parser)]
#[command(name = "awf", version, about)]
struct Cli {
    /// Allowed domains (comma-separated; repeatable).
    #[arg(long = "allow-domains", value_delimiter = ',')]
    allow_domains: Vec<String>,

    /// File of allowed domains, one per line (`#` comments allowed).
    #[arg(long = "allow-domains-file")]
    allow_domains_file: Option<PathBuf>,

    /// Blocked domains; matches here win over the allowlist.
    #[arg(long = "block-domains", value_delimiter = ',')]
    block_domains: Vec<String>,

    /// File of blocked domains.
    #[arg(long = "block-domains-file")]
    block_domains_file: Option<PathBuf>,

    /// Extra TCP destination ports redirected to the proxy, as a port or
    /// LOW-HIGH range list (e.g. `8080,9000-9100`). Defaults: 80, 443.
    #[arg(long = "allow-host-ports")]
    allow_host_ports: Vec<String>,

    /// DNS servers the sandbox may query directly (IPv4 or IPv6).
    #[arg(long = "dns")]
    dns: Vec<IpAddr>,

    /// Override the /24 pool probed for the sandbox bridge subnet.
    #[arg(long = "subnet-pool", value_delimiter = ',')]
    subnet_pool: Vec<Ipv4Net>,

    /// Also allow the well-known package registries (pypi, npm, crates.io,
    /// Debian/Ubuntu mirrors).
    #[arg(long)]
    allow_registries: bool,

    /// Start the credential sidecar and keep provider credentials out of
    /// the command container entirely.
    #[arg(long)]
    credential_isolation: bool,

    /// Enable TLS interception in the proxy (on-tmpfs certificate db).
    #[arg(long)]
    ssl_bump: bool,

    /// Do not install IPv6 rules even where ip6tables is available.
    #[arg(long)]
    no_ipv6: bool,

    /// Image for the command container.
    #[arg(long, default_value = sandbox::DEFAULT_COMMAND_IMAGE)]
    image: String,

    /// Image for the credential sidecar.
    #[arg(long)]
    sidecar_image: Option<String>,

    /// Work directory for generated configs and logs (per-run default
    /// under the awf data directory otherwise).
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Keep the work directory after the run and print its path.
    #[arg(long)]
    keep_artifacts: bool,

    /// Whole-run timeout in seconds; expiry tears the sandbox down as if
    /// terminated.
    #[arg(long)]
    timeout: Option<u64>,

    /// Mirror $HOME into the command container at /home/awf.
    #[arg(long)]
    mount_home: bool,

    /// Comma-separated override of the protected credential variables.
    #[arg(long = "protected-env")]
    protected_env: Option<String>,

    /// Preload diagnostic mode: log token reads without scrubbing.
    #[arg(long)]
    preload_debug: bool,

    /// Default log filter (RUST_LOG overrides).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// The command to execute inside the sandbox.
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

impl Cli {
    fn into_run_config(self) -> RunConfig {
        RunConfig {
            allowed_domains: self.allow_domains,
            allowed_domains_file: self.allow_domains_file,
            blocked_domains: self.block_domains,
            blocked_domains_file: self.block_domains_file,
            host_ports: self.allow_host_ports,
            dns_servers: self.dns,
            subnet_pool: (!self.subnet_pool.is_empty()).then_some(self.subnet_pool),
            allow_registries: self.allow_registries,
            credential_isolation: self.credential_isolation,
            ssl_bump: self.ssl_bump,
            no_ipv6: self.no_ipv6,
            command: self.command,
            command_image: self.image,
            sidecar_image: self.sidecar_image,
            work_dir: self.work_dir,
            keep_artifacts: self.keep_artifacts,
            timeout: self.timeout.map(Duration::from_secs),
            mirror_home: self.mount_home,
            protected_env_override: self.protected_env,
            preload_debug: self.preload_debug,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_level = cli.log_level.clone();

    let exit_code = {
        // Keep the guard alive for the whole run so file logs flush.
        let logs_dir = ProjectDirs::from("", "", "awf").map(|d| d.data_local_dir().join("logs"));
        let _logging = logging::init(&log_level, logs_dir.as_deref())
            .or_else(|e| {
                eprintln!("awf: {e}; logging to stderr only");
                logging::init(&log_level, None)
            })
            .ok();

        orchestrator::run(cli.into_run_config()).await
    };

    std::process::exit(exit_code);
}
