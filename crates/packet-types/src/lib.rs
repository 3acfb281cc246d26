#![forbid(unsafe_code)]

use std::net::IpAddr;

/// Address family tag carried by headers and filter rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrFamily {
    V4,
    V6,
}

/// Identifies the payload protocol for IP packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpProtocol {
    Icmpv4,
    Tcp,
    Udp,
    Icmpv6,
    Other(u8),
}

impl IpProtocol {
    pub fn from_number(value: u8) -> Self {
        match value {
            1 => IpProtocol::Icmpv4,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            58 => IpProtocol::Icmpv6,
            other => IpProtocol::Other(other),
        }
    }

    pub fn number(&self) -> u8 {
        match *self {
            IpProtocol::Icmpv4 => 1,
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
            IpProtocol::Icmpv6 => 58,
            IpProtocol::Other(v) => v,
        }
    }
}

/// TCP flag bits, kept 16 bits wide so bits without an assigned letter can
/// still be carried in rule literals.
pub mod tcp_flags {
    pub const FIN: u16 = 0x0001;
    pub const SYN: u16 = 0x0002;
    pub const RST: u16 = 0x0004;
    pub const PSH: u16 = 0x0008;
    pub const ACK: u16 = 0x0010;
    pub const URG: u16 = 0x0020;
    pub const ECE: u16 = 0x0040;
    pub const CWR: u16 = 0x0080;

    /// Every flag with an assigned letter.
    pub const STANDARD: u16 = FIN | SYN | RST | PSH | ACK | URG | ECE | CWR;
}

/// A fully parsed, validated packet header. Produced by an upstream parser;
/// the filter engine never touches raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub protocol: IpProtocol,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub tcp_flags: Option<u16>,
}

impl PacketHeader {
    pub fn family(&self) -> AddrFamily {
        match self.src_addr {
            IpAddr::V4(_) => AddrFamily::V4,
            IpAddr::V6(_) => AddrFamily::V6,
        }
    }
}

/// Header fields of one IP fragment, as seen by the fragment cache. `len`
/// is the fragment's total length and feeds the per-datagram byte counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentHeader {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub protocol: IpProtocol,
    pub ip_id: u16,
    pub is_first_fragment: bool,
    pub ttl: u8,
    pub len: u16,
}

impl FragmentHeader {
    pub fn family(&self) -> AddrFamily {
        match self.src_addr {
            IpAddr::V4(_) => AddrFamily::V4,
            IpAddr::V6(_) => AddrFamily::V6,
        }
    }
}
