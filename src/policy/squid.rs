//! Squid configuration formatter for the egress proxy container.
//!
//! The emitted text is a pure function of the [`PolicyArtifact`]: two
//! artifacts that compare equal produce byte-identical configs. All
//! caching is disabled, forwarding headers are stripped, and every
//! request is logged in the fixed `awf` format consumed by diagnostics.

use std::fmt::Write as _;

use super::PolicyArtifact;

/// Path of the access log inside the proxy container. The lifecycle
/// manager bind-mounts `<work-dir>/proxy-logs` over its parent directory.
pub const ACCESS_LOG_PATH: &str = "/var/log/squid/access.log";

/// Squid `logformat` definition matching the documented access-log schema:
/// `<unix-ts.ms> <client> <host> <dest> <http-version> <method> <status>
/// <decision>:<hierarchy> <url> "<user-agent>"`.
///
/// The host column is `%>rd` (request domain): populated for plain HTTP
/// from the URL authority and for CONNECT tunnels from the tunnel target,
/// with no dependency on SSL bump being active.
const LOG_FORMAT: &str =
    r#"logformat awf %ts.%03tu %>a:%>p %>rd %<a:%<p HTTP/%rv %rm %>Hs %Ss:%Sh %ru "%{User-Agent}>h""#;

/// Render the complete `squid.conf` for an artifact.
pub fn render(artifact: &PolicyArtifact) -> String {
    let mut conf = String::new();
    let proxy = artifact.proxy_ip;
    let port = artifact.proxy_port;

    let _ = writeln!(conf, "# awf egress proxy configuration (generated)");
    let _ = writeln!(conf, "http_port {proxy}:{port}");
    conf.push('\n');

    if !artifact.dns_v4.is_empty() || !artifact.dns_v6.is_empty() {
        let mut servers: Vec<String> = artifact.dns_v4.iter().map(|a| a.to_string()).collect();
        servers.extend(artifact.dns_v6.iter().map(|a| a.to_string()));
        let _ = writeln!(conf, "dns_nameservers {}", servers.join(" "));
        conf.push('\n');
    }

    // Both the exact form and the dotted subdomain form are listed so a
    // bare entry covers its whole subtree. Explicit `.domain` entries
    // stay subdomain-only.
    for domain in &artifact.allowed {
        if !domain.subdomains_only() {
            let _ = writeln!(conf, "acl allowed_domains dstdomain {}", domain.apex());
        }
        let _ = writeln!(conf, "acl allowed_domains dstdomain .{}", domain.apex());
    }
    conf.push('\n');

    for domain in &artifact.blocked {
        if !domain.subdomains_only() {
            let _ = writeln!(conf, "acl blocked_domains dstdomain {}", domain.apex());
        }
        let _ = writeln!(conf, "acl blocked_domains dstdomain .{}", domain.apex());
    }
    if !artifact.blocked.is_empty() {
        conf.push('\n');
    }

    let _ = writeln!(conf, "acl sandbox_net src {}", artifact.subnet);
    conf.push('\n');

    // Order is load-bearing: block precedence, then allow from the
    // sandbox subnet only, then default deny.
    if !artifact.blocked.is_empty() {
        let _ = writeln!(conf, "http_access deny blocked_domains");
    }
    let _ = writeln!(conf, "http_access allow allowed_domains sandbox_net");
    let _ = writeln!(conf, "http_access deny all");
    conf.push('\n');

    if artifact.ssl_bump {
        let _ = writeln!(
            conf,
            "https_port {proxy}:{ssl_port} ssl-bump cert=/etc/squid/certs/awf-ca.pem generate-host-certificates=on",
            ssl_port = port.saturating_add(1)
        );
        let _ = writeln!(
            conf,
            "sslcrtd_program /usr/lib/squid/security_file_certgen -s /var/spool/squid/ssl_db -M 4MB"
        );
        let _ = writeln!(conf, "ssl_bump peek step1");
        let _ = writeln!(conf, "ssl_bump bump all");
        conf.push('\n');
    }

    let _ = writeln!(conf, "cache deny all");
    let _ = writeln!(conf, "forwarded_for delete");
    let _ = writeln!(conf, "via off");
    let _ = writeln!(conf, "request_header_access X-Forwarded-For deny all");
    conf.push('\n');

    let _ = writeln!(conf, "{LOG_FORMAT}");
    let _ = writeln!(conf, "access_log stdio:{ACCESS_LOG_PATH} awf");
    let _ = writeln!(conf, "cache_log /dev/stderr");
    let _ = writeln!(conf, "pid_filename none");

    conf
}
