use dns_lookup::lookup_addr;
use dns_lookup::lookup_host;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use tracing::debug;
use tracing::warn;

use crate::error::TraceError;

/// Queries the IP addresses of a domain name.
pub fn dns_query(hostname: &str) -> Result<Vec<IpAddr>, TraceError> {
    match lookup_host(hostname) {
        Ok(ips) => Ok(ips),
        Err(e) => {
            warn!("lookup {} failed: {}", hostname, e);
            Err(TraceError::Resolution {
                target: hostname.to_string(),
            })
        }
    }
}

/// Turn the command line target into the ipv4 address to trace.
/// Literal addresses skip the resolver.
pub fn resolve_target(target: &str) -> Result<Ipv4Addr, TraceError> {
    if let Ok(addr) = target.parse::<IpAddr>() {
        return match addr {
            IpAddr::V4(ipv4) => Ok(ipv4),
            IpAddr::V6(_) => Err(TraceError::UnsupportedAddress { addr }),
        };
    }
    let ips = dns_query(target)?;
    debug!("{} resolved to {:?}", target, ips);
    match ips.iter().find_map(|ip| match ip {
        IpAddr::V4(ipv4) => Some(*ipv4),
        IpAddr::V6(_) => None,
    }) {
        Some(ipv4) => Ok(ipv4),
        None => match ips.first() {
            Some(addr) => Err(TraceError::UnsupportedAddress { addr: *addr }),
            None => Err(TraceError::Resolution {
                target: target.to_string(),
            }),
        },
    }
}

/// Reverse lookup, `None` when the address has no name.
pub fn dns_reverse(addr: IpAddr) -> Option<String> {
    match lookup_addr(&addr) {
        Ok(name) if name != addr.to_string() => Some(name),
        Ok(_) => None,
        Err(e) => {
            debug!("reverse lookup {} failed: {}", addr, e);
            None
        }
    }
}
