//! Typed packet-filter plans and their formatters.
//!
//! Two rings share one policy source: the host-bridge chain (`AWF_EGRESS`,
//! installed on the host and jumped to from `DOCKER-USER`) and the
//! in-sandbox redirection rules (`AWF_NAT` in the nat table plus
//! `AWF_OUTPUT` in the filter table, installed by the command container's
//! entrypoint before the user command starts). Both are pure functions of
//! the [`PolicyArtifact`].

use std::fmt::Write as _;
use std::net::{Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};

use super::PolicyArtifact;

/// Name of the host-bridge egress chain.
pub const HOST_CHAIN: &str = "AWF_EGRESS";
/// Name of the in-sandbox nat-table redirection chain.
pub const NAT_CHAIN: &str = "AWF_NAT";
/// Name of the in-sandbox filter-table default-deny chain.
pub const OUTPUT_CHAIN: &str = "AWF_OUTPUT";
/// Kernel-log prefix for blocked non-DNS UDP.
pub const LOG_PREFIX_UDP: &str = "[FW_BLOCKED_UDP] ";
/// Kernel-log prefix for every other blocked packet.
pub const LOG_PREFIX_OTHER: &str = "[FW_BLOCKED_OTHER] ";

/// One iptables invocation, as the argument vector after the binary name.
pub type RuleArgs = Vec<String>;

fn args(parts: &[&str]) -> RuleArgs {
    parts.iter().map(|s| (*s).to_owned()).collect()
}

/// The host-side plan: every rule appended to [`HOST_CHAIN`], in order.
/// Both address families are covered so the trustworthy ring never lags
/// behind the in-sandbox one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostChainPlan {
    /// Sandbox bridge subnet; the `DOCKER-USER` jump matches this source.
    pub subnet: Ipv4Net,
    /// ULA prefix of the bridge's IPv6 side; `None` disables the
    /// `ip6tables` chain entirely.
    pub subnet_v6: Option<Ipv6Net>,
    /// Fixed address of the proxy container.
    pub proxy_ip: Ipv4Addr,
    /// Proxy listen port.
    pub proxy_port: u16,
    /// IPv4 DNS servers the sandbox may reach directly.
    pub dns_v4: Vec<Ipv4Addr>,
    /// IPv6 DNS servers the sandbox may reach directly.
    pub dns_v6: Vec<Ipv6Addr>,
}

impl HostChainPlan {
    /// The rule that routes sandbox traffic into the chain, expressed as
    /// arguments for `iptables -I DOCKER-USER 1 ...` / `-D DOCKER-USER ...`.
    pub fn jump_rule(&self) -> RuleArgs {
        vec![
            "-s".to_owned(),
            self.subnet.to_string(),
            "-j".to_owned(),
            HOST_CHAIN.to_owned(),
        ]
    }

    /// The `ip6tables` jump, matching the bridge's ULA prefix. `None`
    /// when IPv6 rules are disabled.
    pub fn jump_rule_v6(&self) -> Option<RuleArgs> {
        self.subnet_v6.map(|subnet| {
            vec![
                "-s".to_owned(),
                subnet.to_string(),
                "-j".to_owned(),
                HOST_CHAIN.to_owned(),
            ]
        })
    }

    /// Chain contents in install order. Semantics: the proxy has
    /// unrestricted egress, replies and DNS and proxy traffic pass,
    /// multicast and link-local are rejected, and everything else is
    /// logged then rejected.
    pub fn rules(&self) -> Vec<RuleArgs> {
        let proxy = self.proxy_ip.to_string();
        let proxy_port = self.proxy_port.to_string();

        let mut rules = vec![
            args(&["-s", &proxy, "-j", "ACCEPT"]),
            args(&["-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED", "-j", "ACCEPT"]),
            args(&["-d", "127.0.0.0/8", "-j", "ACCEPT"]),
        ];

        for dns in &self.dns_v4 {
            let dns = dns.to_string();
            rules.push(args(&["-d", &dns, "-p", "udp", "--dport", "53", "-j", "ACCEPT"]));
            rules.push(args(&["-d", &dns, "-p", "tcp", "--dport", "53", "-j", "ACCEPT"]));
        }

        rules.push(args(&[
            "-d", &proxy, "-p", "tcp", "--dport", &proxy_port, "-j", "ACCEPT",
        ]));
        rules.push(args(&["-d", "224.0.0.0/4", "-j", "REJECT"]));
        rules.push(args(&["-d", "169.254.0.0/16", "-j", "REJECT"]));

        rules.push(args(&[
            "-p", "udp", "!", "--dport", "53", "-j", "LOG", "--log-prefix", LOG_PREFIX_UDP,
            "--log-level", "4",
        ]));
        rules.push(args(&["-p", "udp", "!", "--dport", "53", "-j", "REJECT"]));

        rules.push(args(&[
            "-j", "LOG", "--log-prefix", LOG_PREFIX_OTHER, "--log-level", "4",
        ]));
        rules.push(args(&["-j", "REJECT", "--reject-with", "icmp-port-unreachable"]));

        rules
    }

    /// `ip6tables` chain contents. The proxy has no IPv6 listener, so the
    /// only traffic that survives is replies, loopback, and configured v6
    /// DNS; everything else is logged under the same prefixes and
    /// rejected.
    pub fn rules_v6(&self) -> Vec<RuleArgs> {
        let mut rules = vec![
            args(&["-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED", "-j", "ACCEPT"]),
            args(&["-d", "::1/128", "-j", "ACCEPT"]),
        ];

        for dns in &self.dns_v6 {
            let dns = dns.to_string();
            rules.push(args(&["-d", &dns, "-p", "udp", "--dport", "53", "-j", "ACCEPT"]));
            rules.push(args(&["-d", &dns, "-p", "tcp", "--dport", "53", "-j", "ACCEPT"]));
        }

        rules.push(args(&["-d", "ff00::/8", "-j", "REJECT"]));
        rules.push(args(&["-d", "fe80::/10", "-j", "REJECT"]));

        rules.push(args(&[
            "-p", "udp", "!", "--dport", "53", "-j", "LOG", "--log-prefix", LOG_PREFIX_UDP,
            "--log-level", "4",
        ]));
        rules.push(args(&["-p", "udp", "!", "--dport", "53", "-j", "REJECT"]));

        rules.push(args(&[
            "-j", "LOG", "--log-prefix", LOG_PREFIX_OTHER, "--log-level", "4",
        ]));
        rules.push(args(&["-j", "REJECT", "--reject-with", "icmp6-port-unreachable"]));

        rules
    }
}

/// The in-sandbox plan rendered into the entrypoint NAT preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatPlan {
    /// Fixed address of the proxy container.
    pub proxy_ip: Ipv4Addr,
    /// Proxy listen port.
    pub proxy_port: u16,
    /// IPv4 DNS servers that bypass redirection.
    pub dns_v4: Vec<Ipv4Addr>,
    /// IPv6 DNS servers that bypass redirection (v6 ruleset only).
    pub dns_v6: Vec<Ipv6Addr>,
    /// TCP destination ports DNAT-ed to the proxy (sorted, unique).
    pub redirect_ports: Vec<u16>,
    /// Install the IPv6 ruleset when `ip6tables` is present.
    pub ipv6: bool,
}

impl NatPlan {
    /// Render the POSIX-shell preamble that installs both chains.
    ///
    /// The script runs with `NET_ADMIN` still in the bounding set and
    /// `set -e`: any rule failure aborts the entrypoint before the user
    /// command starts.
    pub fn render_script(&self) -> String {
        let mut s = String::new();
        let proxy = self.proxy_ip;
        let port = self.proxy_port;

        s.push_str("#!/bin/sh\n");
        s.push_str("# awf in-sandbox egress redirection (generated)\n");
        s.push_str("set -eu\n\n");

        let _ = writeln!(s, "iptables -t nat -N {NAT_CHAIN}");
        let _ = writeln!(s, "iptables -t nat -A {NAT_CHAIN} -o lo -j RETURN");
        let _ = writeln!(s, "iptables -t nat -A {NAT_CHAIN} -d 127.0.0.0/8 -j RETURN");
        for dns in &self.dns_v4 {
            let _ = writeln!(s, "iptables -t nat -A {NAT_CHAIN} -d {dns}/32 -p udp --dport 53 -j RETURN");
            let _ = writeln!(s, "iptables -t nat -A {NAT_CHAIN} -d {dns}/32 -p tcp --dport 53 -j RETURN");
        }
        let _ = writeln!(s, "iptables -t nat -A {NAT_CHAIN} -d {proxy}/32 -j RETURN");
        for p in &self.redirect_ports {
            let _ = writeln!(
                s,
                "iptables -t nat -A {NAT_CHAIN} -p tcp --dport {p} -j DNAT --to-destination {proxy}:{port}"
            );
        }
        let _ = writeln!(s, "iptables -t nat -A OUTPUT -j {NAT_CHAIN}");
        s.push('\n');

        // Default deny lives in the filter table; DROP is not a valid
        // nat-table target.
        let _ = writeln!(s, "iptables -N {OUTPUT_CHAIN}");
        let _ = writeln!(s, "iptables -A {OUTPUT_CHAIN} -o lo -j ACCEPT");
        let _ = writeln!(s, "iptables -A {OUTPUT_CHAIN} -d 127.0.0.0/8 -j ACCEPT");
        let _ = writeln!(
            s,
            "iptables -A {OUTPUT_CHAIN} -m conntrack --ctstate ESTABLISHED,RELATED -j ACCEPT"
        );
        for dns in &self.dns_v4 {
            let _ = writeln!(s, "iptables -A {OUTPUT_CHAIN} -d {dns}/32 -p udp --dport 53 -j ACCEPT");
            let _ = writeln!(s, "iptables -A {OUTPUT_CHAIN} -d {dns}/32 -p tcp --dport 53 -j ACCEPT");
        }
        let _ = writeln!(s, "iptables -A {OUTPUT_CHAIN} -p udp --dport 53 -j ACCEPT");
        let _ = writeln!(
            s,
            "iptables -A {OUTPUT_CHAIN} -d {proxy}/32 -p tcp --dport {port} -j ACCEPT"
        );
        let _ = writeln!(s, "iptables -A {OUTPUT_CHAIN} -p tcp -j DROP");
        let _ = writeln!(s, "iptables -A OUTPUT -j {OUTPUT_CHAIN}");

        if self.ipv6 {
            s.push('\n');
            s.push_str("if command -v ip6tables >/dev/null 2>&1; then\n");
            let _ = writeln!(s, "  ip6tables -t nat -N {NAT_CHAIN} 2>/dev/null || true");
            let _ = writeln!(s, "  ip6tables -t nat -A {NAT_CHAIN} -d ::1/128 -j RETURN");
            for dns in &self.dns_v6 {
                let _ = writeln!(s, "  ip6tables -t nat -A {NAT_CHAIN} -d {dns}/128 -p udp --dport 53 -j RETURN");
                let _ = writeln!(s, "  ip6tables -t nat -A {NAT_CHAIN} -d {dns}/128 -p tcp --dport 53 -j RETURN");
            }
            let _ = writeln!(s, "  ip6tables -t nat -A OUTPUT -j {NAT_CHAIN}");
            let _ = writeln!(s, "  ip6tables -N {OUTPUT_CHAIN} 2>/dev/null || true");
            let _ = writeln!(s, "  ip6tables -A {OUTPUT_CHAIN} -o lo -j ACCEPT");
            for dns in &self.dns_v6 {
                let _ = writeln!(s, "  ip6tables -A {OUTPUT_CHAIN} -d {dns}/128 -p udp --dport 53 -j ACCEPT");
                let _ = writeln!(s, "  ip6tables -A {OUTPUT_CHAIN} -d {dns}/128 -p tcp --dport 53 -j ACCEPT");
            }
            // No proxy on v6: everything else TCP is dropped outright.
            let _ = writeln!(s, "  ip6tables -A {OUTPUT_CHAIN} -p tcp -j DROP");
            let _ = writeln!(s, "  ip6tables -A OUTPUT -j {OUTPUT_CHAIN}");
            s.push_str("fi\n");
        }

        s
    }
}

/// Build the host-side plan from an artifact.
pub fn host_chain_plan(artifact: &PolicyArtifact) -> HostChainPlan {
    HostChainPlan {
        subnet: artifact.subnet,
        subnet_v6: artifact.subnet_v6,
        proxy_ip: artifact.proxy_ip,
        proxy_port: artifact.proxy_port,
        dns_v4: artifact.dns_v4.clone(),
        dns_v6: artifact.dns_v6.clone(),
    }
}

/// Build the in-sandbox plan from an artifact.
pub fn nat_plan(artifact: &PolicyArtifact) -> NatPlan {
    NatPlan {
        proxy_ip: artifact.proxy_ip,
        proxy_port: artifact.proxy_port,
        dns_v4: artifact.dns_v4.clone(),
        dns_v6: artifact.dns_v6.clone(),
        redirect_ports: artifact.redirect_ports.clone(),
        ipv6: artifact.ipv6_rules,
    }
}
