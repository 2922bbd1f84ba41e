//! Node id derivation for hosts that do not configure datacenter/machine ids.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use tracing::{debug, warn};

pub const DEFAULT_NODE_ID: i64 = 1;

/// `(datacenter, machine)` from the low five bits of the last and third octets.
#[must_use]
pub fn node_ids_from_ipv4(ip: Ipv4Addr) -> (i64, i64) {
    let octets = ip.octets();
    (i64::from(octets[3] & 0x1F), i64::from(octets[2] & 0x1F))
}

/// Best-effort lookup of the site-local IPv4 address used for outbound traffic.
///
/// Connecting a UDP socket only selects a route; no packet is sent.
#[must_use]
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("10.255.255.255:1").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if ip.is_private() => Some(ip),
        IpAddr::V4(ip) => {
            debug!("local address {ip} is not site-local");
            None
        }
        IpAddr::V6(_) => None,
    }
}

/// Resolve node ids, filling whatever is unset from the local address.
#[must_use]
pub fn resolve(datacenter_id: Option<i64>, machine_id: Option<i64>) -> (i64, i64) {
    if let (Some(dc), Some(machine)) = (datacenter_id, machine_id) {
        return (dc, machine);
    }

    let (derived_dc, derived_machine) = local_ipv4().map_or_else(
        || {
            warn!("could not derive node ids from a site-local address, using defaults");
            (DEFAULT_NODE_ID, DEFAULT_NODE_ID)
        },
        |ip| {
            let ids = node_ids_from_ipv4(ip);
            debug!(%ip, datacenter_id = ids.0, machine_id = ids.1, "derived node ids");
            ids
        },
    );

    (
        datacenter_id.unwrap_or(derived_dc),
        machine_id.unwrap_or(derived_machine),
    )
}
