//! Endpoint URL auto-egress
//!
//! A literal endpoint on a spec becomes an egress rule: IP hosts map to a
//! host-length CIDR, hostnames to a DNS peer. Missing ports fall back to the
//! scheme default.

use std::net::IpAddr;

use url::{Host, Url};

use langop_common::crd::{NetworkPeer, NetworkPort, NetworkRule};
use langop_common::Error;

use crate::dns::host_cidr;

/// Reason recorded when an endpoint cannot be parsed
pub const REASON_INVALID_ENDPOINT: &str = "InvalidEndpoint";

/// Egress rule allowing traffic to `endpoint`
pub fn endpoint_egress_rule(endpoint: &str) -> Result<NetworkRule, Error> {
    let url = Url::parse(endpoint.trim()).map_err(|e| {
        Error::configuration(
            REASON_INVALID_ENDPOINT,
            format!("endpoint '{}' is not a valid URL: {}", endpoint, e),
        )
    })?;

    let port = url.port_or_known_default().ok_or_else(|| {
        Error::configuration(
            REASON_INVALID_ENDPOINT,
            format!("endpoint '{}' has no port and scheme '{}' has no default", endpoint, url.scheme()),
        )
    })?;

    let peer = match url.host() {
        Some(Host::Ipv4(ip)) => NetworkPeer::cidr(host_cidr(IpAddr::V4(ip))),
        Some(Host::Ipv6(ip)) => NetworkPeer::cidr(host_cidr(IpAddr::V6(ip))),
        Some(Host::Domain(domain)) => NetworkPeer::dns([domain.to_string()]),
        None => {
            return Err(Error::configuration(
                REASON_INVALID_ENDPOINT,
                format!("endpoint '{}' has no host", endpoint),
            ))
        }
    };

    Ok(NetworkRule::egress(peer, vec![NetworkPort::tcp(port)]).described("model endpoint"))
}
