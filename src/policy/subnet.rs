//! Bridge subnet selection from a configurable /24 pool.

use std::net::{Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};

use super::PolicyError;

/// Host octet of the proxy container inside the chosen /24.
pub const PROXY_HOST_OCTET: u8 = 10;
/// Host octet of the command container.
pub const COMMAND_HOST_OCTET: u8 = 20;
/// Host octet of the optional credential sidecar.
pub const SIDECAR_HOST_OCTET: u8 = 30;

/// The default pool probed when the user does not supply one.
pub fn default_pool() -> Vec<Ipv4Net> {
    (0u8..10)
        .map(|i| {
            Ipv4Net::new(Ipv4Addr::new(10, 129, i, 0), 24)
                .expect("10.129.x.0/24 is a valid network")
        })
        .collect()
}

/// Pick the first pool subnet not present in `in_use`.
///
/// The caller gathers `in_use` from the container runtime's existing
/// networks before compilation so selection stays a pure function of its
/// inputs.
///
/// # Errors
///
/// Returns [`PolicyError::InvalidSubnetPool`] when a pool entry is not a
/// /24, or [`PolicyError::SubnetExhausted`] when every entry is taken.
pub fn select_subnet(pool: &[Ipv4Net], in_use: &[Ipv4Net]) -> Result<Ipv4Net, PolicyError> {
    for candidate in pool {
        if candidate.prefix_len() != 24 {
            return Err(PolicyError::InvalidSubnetPool(candidate.to_string()));
        }
        let taken = in_use
            .iter()
            .any(|used| used.contains(&candidate.network()) || candidate.contains(&used.network()));
        if !taken {
            return Ok(*candidate);
        }
    }
    Err(PolicyError::SubnetExhausted)
}

/// Fixed address of a sandbox role inside the chosen /24.
pub fn host_ip(subnet: Ipv4Net, host_octet: u8) -> Ipv4Addr {
    let octets = subnet.network().octets();
    Ipv4Addr::new(octets[0], octets[1], octets[2], host_octet)
}

/// ULA /64 paired with a chosen /24 for the bridge's IPv6 side.
///
/// The middle groups embed the v4 subnet's second and third octets, so
/// two runs that hold distinct /24s also hold distinct v6 prefixes and
/// the host chain's source match stays exclusive per run.
pub fn ula_subnet(subnet: Ipv4Net) -> Ipv6Net {
    let octets = subnet.network().octets();
    let net = Ipv6Addr::new(
        0xfd42,
        0x0a81,
        u16::from(octets[1]),
        u16::from(octets[2]),
        0,
        0,
        0,
        0,
    );
    Ipv6Net::new(net, 64).expect("/64 is a valid IPv6 prefix length")
}
