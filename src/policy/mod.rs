//! Policy compilation: from raw user inputs to an immutable [`PolicyArtifact`].
//!
//! Compilation is total and pure: identical [`PolicyInputs`] always produce
//! an identical artifact, and every derived config (squid.conf, firewall
//! plans, topology descriptor) is a pure function of the artifact. The only
//! filesystem touch in this subsystem is [`read_domains_file`], invoked by
//! the CLI layer before compilation when a file-based list is chosen.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod domains;
pub mod firewall;
pub mod ports;
pub mod squid;
pub mod subnet;

pub use domains::{evaluate_host, Domain, HostVerdict};
pub use firewall::{HostChainPlan, NatPlan};
pub use ports::PortRule;

/// Port the proxy listens on inside the sandbox network.
pub const PROXY_PORT: u16 = 3128;

/// Package registries appended to the allowlist by `--allow-registries`.
///
/// Never applied implicitly: an empty user allowlist is still an error.
pub const REGISTRY_DOMAINS: &[&str] = &[
    // Python
    "pypi.org",
    "files.pythonhosted.org",
    // Node
    "registry.npmjs.org",
    // Rust
    "crates.io",
    "static.crates.io",
    // System packages
    "deb.debian.org",
    "security.debian.org",
    "archive.ubuntu.com",
    "security.ubuntu.com",
];

/// Errors produced by policy compilation. All are terminal: the
/// orchestrator aborts before touching the host.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A domain entry failed normalization.
    #[error("invalid domain {input:?}: {reason}")]
    InvalidDomain {
        /// The raw entry as supplied.
        input: String,
        /// Why it was rejected.
        reason: String,
    },
    /// A port rule was malformed, out of range, or inverted.
    #[error("invalid port rule {0:?}: expected PORT or LOW-HIGH within 1-65535")]
    InvalidPortRule(String),
    /// Every subnet in the pool is already in use.
    #[error("no free /24 left in the bridge subnet pool")]
    SubnetExhausted,
    /// A pool entry is not a /24.
    #[error("subnet pool entry {0} is not a /24")]
    InvalidSubnetPool(String),
    /// The allowlist is empty after normalization.
    #[error("allowed-domains list is empty: the command could not reach anything")]
    NoAllowedDomains,
    /// A domains file could not be read.
    #[error("cannot read domains file {path}: {source}")]
    DomainsFileUnreadable {
        /// The path as supplied.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Raw inputs to policy compilation, assembled by the CLI layer.
#[derive(Debug, Clone)]
pub struct PolicyInputs {
    /// Allowed domain entries (inline flags plus file contents, merged).
    pub allowed_domains: Vec<String>,
    /// Blocked domain entries.
    pub blocked_domains: Vec<String>,
    /// Extra redirect port rules, already split on commas.
    pub host_port_rules: Vec<String>,
    /// DNS servers the sandbox may query directly.
    pub dns_servers: Vec<IpAddr>,
    /// /24 candidates for the bridge subnet.
    pub subnet_pool: Vec<Ipv4Net>,
    /// Subnets already claimed by existing networks on this host.
    pub subnets_in_use: Vec<Ipv4Net>,
    /// Append the well-known package registries to the allowlist.
    pub allow_registries: bool,
    /// Start the credential sidecar and route agent API traffic through it.
    pub credential_isolation: bool,
    /// Enable TLS interception in the proxy.
    pub ssl_bump: bool,
    /// Install IPv6 rules where `ip6tables` is available.
    pub ipv6_rules: bool,
}

impl Default for PolicyInputs {
    fn default() -> Self {
        Self {
            allowed_domains: Vec::new(),
            blocked_domains: Vec::new(),
            host_port_rules: Vec::new(),
            dns_servers: Vec::new(),
            subnet_pool: subnet::default_pool(),
            subnets_in_use: Vec::new(),
            allow_registries: false,
            credential_isolation: false,
            ssl_bump: false,
            ipv6_rules: true,
        }
    }
}

/// The compiled, immutable network policy for one run.
///
/// Two equal artifacts render byte-identical proxy configs and firewall
/// plans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyArtifact {
    /// Normalized allowlist, first-seen order.
    pub allowed: Vec<Domain>,
    /// Normalized blocklist, first-seen order. Blocked wins on overlap.
    pub blocked: Vec<Domain>,
    /// TCP ports the in-sandbox NAT redirects to the proxy.
    pub redirect_ports: Vec<u16>,
    /// IPv4 DNS servers.
    pub dns_v4: Vec<Ipv4Addr>,
    /// IPv6 DNS servers.
    pub dns_v6: Vec<Ipv6Addr>,
    /// Chosen bridge subnet.
    pub subnet: Ipv4Net,
    /// ULA /64 paired with the bridge when IPv6 rules are on; the host
    /// chain's v6 source match and the bridge's v6 IPAM both use it.
    pub subnet_v6: Option<Ipv6Net>,
    /// Fixed proxy address (`.10`).
    pub proxy_ip: Ipv4Addr,
    /// Fixed command-container address (`.20`).
    pub command_ip: Ipv4Addr,
    /// Fixed sidecar address (`.30`), used only under credential isolation.
    pub sidecar_ip: Ipv4Addr,
    /// Proxy listen port.
    pub proxy_port: u16,
    /// Credential-isolation mode.
    pub credential_isolation: bool,
    /// TLS interception mode.
    pub ssl_bump: bool,
    /// IPv6 ruleset toggle.
    pub ipv6_rules: bool,
}

impl PolicyArtifact {
    /// Render the proxy configuration text.
    pub fn squid_conf(&self) -> String {
        squid::render(self)
    }

    /// Build the host-bridge chain plan.
    pub fn host_chain(&self) -> HostChainPlan {
        firewall::host_chain_plan(self)
    }

    /// Build the in-sandbox redirection plan.
    pub fn nat_plan(&self) -> NatPlan {
        firewall::nat_plan(self)
    }

    /// Proxy URL as exported to the command container.
    pub fn proxy_url(&self) -> String {
        format!("http://{}:{}", self.proxy_ip, self.proxy_port)
    }
}

/// Compile raw inputs into a [`PolicyArtifact`].
///
/// # Errors
///
/// Returns the first [`PolicyError`] encountered: invalid domain, invalid
/// port rule, exhausted subnet pool, or an empty allowlist.
pub fn compile(inputs: &PolicyInputs) -> Result<PolicyArtifact, PolicyError> {
    let mut allowed_raw = inputs.allowed_domains.clone();
    if inputs.allow_registries {
        allowed_raw.extend(REGISTRY_DOMAINS.iter().map(|d| (*d).to_owned()));
    }

    let allowed = domains::normalize_list(&allowed_raw)?;
    if allowed.is_empty() {
        return Err(PolicyError::NoAllowedDomains);
    }
    let blocked = domains::normalize_list(&inputs.blocked_domains)?;

    let mut rules = Vec::with_capacity(inputs.host_port_rules.len());
    for raw in &inputs.host_port_rules {
        rules.extend(ports::parse_rule_list(raw)?);
    }
    let redirect_ports = ports::redirect_ports(&rules);

    let mut dns_v4 = Vec::new();
    let mut dns_v6 = Vec::new();
    for server in &inputs.dns_servers {
        match server {
            IpAddr::V4(a) => dns_v4.push(*a),
            IpAddr::V6(a) => dns_v6.push(*a),
        }
    }

    let chosen = subnet::select_subnet(&inputs.subnet_pool, &inputs.subnets_in_use)?;

    Ok(PolicyArtifact {
        allowed,
        blocked,
        redirect_ports,
        dns_v4,
        dns_v6,
        subnet: chosen,
        subnet_v6: inputs.ipv6_rules.then(|| subnet::ula_subnet(chosen)),
        proxy_ip: subnet::host_ip(chosen, subnet::PROXY_HOST_OCTET),
        command_ip: subnet::host_ip(chosen, subnet::COMMAND_HOST_OCTET),
        sidecar_ip: subnet::host_ip(chosen, subnet::SIDECAR_HOST_OCTET),
        proxy_port: PROXY_PORT,
        credential_isolation: inputs.credential_isolation,
        ssl_bump: inputs.ssl_bump,
        ipv6_rules: inputs.ipv6_rules,
    })
}

/// Read a domains file into raw entries, one per line.
///
/// Blank lines and `#` comments survive here and are dropped during
/// normalization, so line numbers in user files stay meaningful in error
/// messages from their editors.
///
/// # Errors
///
/// Returns [`PolicyError::DomainsFileUnreadable`] when the file cannot be
/// read.
pub fn read_domains_file(path: &Path) -> Result<Vec<String>, PolicyError> {
    let text = std::fs::read_to_string(path).map_err(|source| PolicyError::DomainsFileUnreadable {
        path: path.display().to_string(),
        source,
    })?;
    Ok(text.lines().map(str::to_owned).collect())
}
