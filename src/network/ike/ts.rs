use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Traffic selector types on the wire.
pub const TS_IPV4_ADDR_RANGE: u8 = 7;
pub const TS_IPV6_ADDR_RANGE: u8 = 8;
pub const TS_SECLABEL: u8 = 10;

/// A traffic selector: address range, IP protocol and port range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSelector {
    pub protocol: u8,
    pub start_port: u16,
    pub end_port: u16,
    pub start_addr: IpAddr,
    pub end_addr: IpAddr,
}

impl TrafficSelector {
    pub fn new(
        protocol: u8,
        start_port: u16,
        end_port: u16,
        start_addr: IpAddr,
        end_addr: IpAddr,
    ) -> Self {
        TrafficSelector {
            protocol,
            start_port,
            end_port,
            start_addr,
            end_addr,
        }
    }

    pub fn from_subnet(net: IpNet, protocol: u8, start_port: u16, end_port: u16) -> Self {
        TrafficSelector {
            protocol,
            start_port,
            end_port,
            start_addr: net.network(),
            end_addr: net.broadcast(),
        }
    }

    /// Selector covering a single host address, all ports.
    pub fn from_host(addr: IpAddr, protocol: u8) -> Self {
        TrafficSelector {
            protocol,
            start_port: 0,
            end_port: 65535,
            start_addr: addr,
            end_addr: addr,
        }
    }

    /// The full address range of a family, all ports.
    pub fn any(ipv6: bool) -> Self {
        if ipv6 {
            TrafficSelector {
                protocol: 0,
                start_port: 0,
                end_port: 65535,
                start_addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                end_addr: IpAddr::V6(Ipv6Addr::new(
                    0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff,
                )),
            }
        } else {
            TrafficSelector {
                protocol: 0,
                start_port: 0,
                end_port: 65535,
                start_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                end_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            }
        }
    }

    pub fn ts_type(&self) -> u8 {
        match self.start_addr {
            IpAddr::V4(_) => TS_IPV4_ADDR_RANGE,
            IpAddr::V6(_) => TS_IPV6_ADDR_RANGE,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        self.start_addr.is_ipv6()
    }

    /// Check whether the selector covers exactly one host. With `host` given,
    /// that host must be the covered address; without, any single address
    /// qualifies.
    pub fn is_host(&self, host: Option<IpAddr>) -> bool {
        if self.start_addr != self.end_addr {
            return false;
        }
        match host {
            Some(addr) => self.start_addr == addr,
            None => true,
        }
    }

    /// Replace the address part with a single host, keeping protocol/ports.
    pub fn set_address(&mut self, addr: IpAddr) {
        self.start_addr = addr;
        self.end_addr = addr;
    }

    /// Intersect two selectors; `None` if the intersection is empty.
    pub fn intersect(&self, other: &TrafficSelector) -> Option<TrafficSelector> {
        if self.is_ipv6() != other.is_ipv6() {
            return None;
        }
        let protocol = match (self.protocol, other.protocol) {
            (0, p) | (p, 0) => p,
            (a, b) if a == b => a,
            _ => return None,
        };
        let start_addr = addr_max(self.start_addr, other.start_addr);
        let end_addr = addr_min(self.end_addr, other.end_addr);
        if addr_to_u128(start_addr) > addr_to_u128(end_addr) {
            return None;
        }
        let start_port = self.start_port.max(other.start_port);
        let end_port = self.end_port.min(other.end_port);
        if start_port > end_port {
            return None;
        }
        Some(TrafficSelector {
            protocol,
            start_port,
            end_port,
            start_addr,
            end_addr,
        })
    }
}

impl std::fmt::Display for TrafficSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}..{}[{}/{}-{}]",
            self.start_addr, self.end_addr, self.protocol, self.start_port, self.end_port
        )
    }
}

fn addr_to_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn addr_max(a: IpAddr, b: IpAddr) -> IpAddr {
    if addr_to_u128(a) >= addr_to_u128(b) {
        a
    } else {
        b
    }
}

fn addr_min(a: IpAddr, b: IpAddr) -> IpAddr {
    if addr_to_u128(a) <= addr_to_u128(b) {
        a
    } else {
        b
    }
}

/// Check whether every selector in the list is host-shaped for `host`
/// (`None` accepts any single-address selector).
pub fn ts_list_is_host(list: &[TrafficSelector], host: Option<IpAddr>) -> bool {
    list.iter().all(|ts| ts.is_host(host))
}

/// Substitute the IKE endpoint address into every selector that is
/// host-shaped relative to the first host selector of the list. Used in
/// transport mode behind NAT, where the proposed selectors carry the
/// pre-NAT address.
pub fn transport_nat_ts(list: &[TrafficSelector], endpoint: IpAddr) -> Vec<TrafficSelector> {
    let mut out = Vec::new();
    let mut first: Option<IpAddr> = None;

    for ts in list {
        if ts.is_host(first) {
            if first.is_none() {
                first = Some(ts.start_addr);
            }
            let mut substituted = ts.clone();
            substituted.set_address(endpoint);
            out.push(substituted);
        }
    }
    out
}

/// Intersect two selector lists, keeping `ours` order. Duplicates collapse.
pub fn narrow(ours: &[TrafficSelector], supplied: &[TrafficSelector]) -> Vec<TrafficSelector> {
    let mut out: Vec<TrafficSelector> = Vec::new();
    for mine in ours {
        for theirs in supplied {
            if let Some(ts) = mine.intersect(theirs) {
                if !out.contains(&ts) {
                    out.push(ts);
                }
            }
        }
    }
    out
}

/// An opaque security label carried inside TS payloads
/// (draft-ietf-ipsecme-labeled-ipsec).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecLabel(pub Vec<u8>);

impl SecLabel {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for SecLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SecLabelMode {
    /// Propose the configured label, no per-flow labels.
    #[default]
    Simple,
    /// SELinux mode: specific labels arrive via acquires; the configured
    /// label is only a generic fallback.
    Selinux,
}
