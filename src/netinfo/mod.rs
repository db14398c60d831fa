use std::net::{Ipv4Addr, SocketAddr, UdpSocket};

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::config::NetworkConfig;

/// Route flag: route is usable.
const RTF_UP: u32 = 0x0001;
/// Route flag: destination is reached through a gateway.
const RTF_GATEWAY: u32 = 0x0002;

/// Public address used only to pick the outbound interface; no packet is sent.
const PROBE_ADDR: &str = "8.8.8.8:80";

/// Network context of this host, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkContext {
    pub interface: String,
    pub gateway_ip: Ipv4Addr,
    pub host_ip: Ipv4Addr,
    pub host_mac: String,
}

/// Default IPv4 route as read from the kernel routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoute {
    pub interface: String,
    pub gateway: Ipv4Addr,
    pub metric: u32,
}

/// Resolve gateway, host address and MAC, preferring configured overrides.
pub fn resolve(cfg: &NetworkConfig) -> Result<NetworkContext> {
    let route = if cfg.interface.is_some() && cfg.gateway_ip.is_some() {
        None
    } else {
        Some(read_default_route().context("discovering default route")?)
    };

    let interface = match (&cfg.interface, &route) {
        (Some(iface), _) => iface.clone(),
        (None, Some(route)) => route.interface.clone(),
        (None, None) => bail!("network.interface could not be determined"),
    };

    let gateway_ip = match (cfg.gateway_ip, &route) {
        (Some(ip), _) => ip,
        (None, Some(route)) => route.gateway,
        (None, None) => bail!("network.gateway_ip could not be determined"),
    };

    let host_ip = match cfg.host_ip {
        Some(ip) => ip,
        None => outbound_ipv4().context("discovering host address")?,
    };

    let host_mac = match &cfg.host_mac {
        Some(mac) => normalize_mac(mac)?,
        None => read_interface_mac(&interface)?,
    };

    debug!(
        interface = %interface,
        gateway = %gateway_ip,
        host = %host_ip,
        mac = %host_mac,
        "resolved network context",
    );

    Ok(NetworkContext {
        interface,
        gateway_ip,
        host_ip,
        host_mac,
    })
}

#[cfg(target_os = "linux")]
fn read_default_route() -> Result<DefaultRoute> {
    let table = std::fs::read_to_string("/proc/net/route").context("reading /proc/net/route")?;
    parse_default_route(&table).context("no default IPv4 route")
}

#[cfg(not(target_os = "linux"))]
fn read_default_route() -> Result<DefaultRoute> {
    bail!(
        "default route discovery is only supported on Linux; \
         set network.interface and network.gateway_ip"
    )
}

/// Pick the lowest-metric default gateway route from a `/proc/net/route` table.
pub fn parse_default_route(table: &str) -> Option<DefaultRoute> {
    table
        .lines()
        .skip(1)
        .filter_map(parse_route_line)
        .filter(|(dest, flags, _)| {
            *dest == 0 && (flags & (RTF_UP | RTF_GATEWAY)) == (RTF_UP | RTF_GATEWAY)
        })
        .map(|(_, _, route)| route)
        .min_by_key(|route| route.metric)
}

fn parse_route_line(line: &str) -> Option<(u32, u32, DefaultRoute)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 8 {
        return None;
    }

    let destination = u32::from_str_radix(fields[1], 16).ok()?;
    let gateway = u32::from_str_radix(fields[2], 16).ok()?;
    let flags = u32::from_str_radix(fields[3], 16).ok()?;
    let metric = fields[6].parse().ok()?;

    Some((
        destination,
        flags,
        DefaultRoute {
            interface: fields[0].to_string(),
            // The kernel prints addresses in host byte order.
            gateway: Ipv4Addr::from(gateway.to_ne_bytes()),
            metric,
        },
    ))
}

/// Local address the kernel would use to reach the public internet.
fn outbound_ipv4() -> Result<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").context("binding UDP probe socket")?;
    socket
        .connect(PROBE_ADDR)
        .context("no route to the public internet")?;

    match socket.local_addr().context("reading probe socket address")? {
        SocketAddr::V4(addr) => Ok(*addr.ip()),
        SocketAddr::V6(addr) => bail!("unexpected IPv6 local address {addr}"),
    }
}

fn read_interface_mac(interface: &str) -> Result<String> {
    let path = format!("/sys/class/net/{interface}/address");
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    normalize_mac(&raw)
}

/// Lowercase, colon-separated MAC; rejects anything that is not six octets.
pub fn normalize_mac(raw: &str) -> Result<String> {
    let mac = raw.trim().to_lowercase().replace('-', ":");
    let octets: Vec<&str> = mac.split(':').collect();

    if octets.len() != 6
        || octets
            .iter()
            .any(|o| o.len() != 2 || !o.chars().all(|c| c.is_ascii_hexdigit()))
    {
        bail!("invalid MAC address {raw:?}");
    }

    Ok(mac)
}
