//! Guest interface address discovery.
//!
//! The host peer dials forwarded ports on the guest's own addresses, so
//! every announcement carries the addresses currently bound to the
//! forwarding interface.

use std::net::IpAddr;

use nix::ifaddrs::getifaddrs;
use nix::sys::socket::SockaddrStorage;

use dockside_portmap::ConnectAddr;

use crate::error::AgentError;

/// Collect the addresses bound to a network interface, in kernel order.
///
/// An interface with no usable addresses yields an empty list; a missing
/// interface is an error.
pub fn interface_addrs(name: &str) -> Result<Vec<ConnectAddr>, AgentError> {
    let entries = getifaddrs().map_err(|source| AgentError::AddressEnumeration {
        name: name.to_string(),
        source,
    })?;

    let mut found = false;
    let mut addrs = Vec::new();

    for entry in entries {
        if entry.interface_name != name {
            continue;
        }
        found = true;

        // Entries without an IP sockaddr (link-layer) carry nothing to dial.
        let Some(ip) = entry.address.as_ref().and_then(sockaddr_ip) else {
            continue;
        };

        match entry.netmask.as_ref().and_then(prefix_len) {
            Some(prefix) => addrs.push(ConnectAddr {
                network: "ip+net".to_string(),
                addr: format!("{ip}/{prefix}"),
            }),
            None => addrs.push(ConnectAddr {
                network: "ip".to_string(),
                addr: ip.to_string(),
            }),
        }
    }

    if !found {
        return Err(AgentError::InterfaceNotFound {
            name: name.to_string(),
        });
    }

    Ok(addrs)
}

fn sockaddr_ip(addr: &SockaddrStorage) -> Option<IpAddr> {
    if let Some(v4) = addr.as_sockaddr_in() {
        return Some(IpAddr::V4(v4.ip()));
    }
    if let Some(v6) = addr.as_sockaddr_in6() {
        return Some(IpAddr::V6(v6.ip()));
    }
    None
}

fn prefix_len(mask: &SockaddrStorage) -> Option<u8> {
    if let Some(v4) = mask.as_sockaddr_in() {
        return Some(u32::from(v4.ip()).count_ones() as u8);
    }
    if let Some(v6) = mask.as_sockaddr_in6() {
        return Some(u128::from_be_bytes(v6.ip().octets()).count_ones() as u8);
    }
    None
}
