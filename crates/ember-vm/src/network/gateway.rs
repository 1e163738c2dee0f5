//! Gateway derivation for per-VM subnets.

use crate::error::{Result, VmError};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Derive the host-side gateway for a VM address.
///
/// IPv4 assumes a /24: the last octet becomes `1`. IPv6 replaces the last
/// segment with `1`.
pub fn derive_gateway(ip: &str) -> Result<IpAddr> {
    let addr: IpAddr = ip
        .trim()
        .parse()
        .map_err(|_| VmError::Network(format!("invalid IP address format: {ip}")))?;

    Ok(match addr {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            IpAddr::V4(Ipv4Addr::new(a, b, c, 1))
        }
        IpAddr::V6(v6) => {
            let mut segments = v6.segments();
            segments[7] = 1;
            IpAddr::V6(Ipv6Addr::from(segments))
        }
    })
}
