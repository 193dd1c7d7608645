//! Edge-network IPv4 classification.
//!
//! Masks are stored as negative widths: `-(1 << (32 - prefix))`, which is the
//! two's-complement form of the prefix mask (`-1024` is a /22).

use std::net::Ipv4Addr;

/// An IPv4 network and its mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrRange {
    pub network: u32,
    pub mask: i32,
}

impl CidrRange {
    pub const fn new(a: u8, b: u8, c: u8, d: u8, prefix: u32) -> Self {
        Self {
            network: u32::from_be_bytes([a, b, c, d]),
            mask: -(1i32 << (32 - prefix)),
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        (u32::from(ip) & self.mask as u32) == self.network
    }
}

/// Published edge-network ranges. Destinations resolving here are rerouted.
pub static EDGE_RANGES: &[CidrRange] = &[
    CidrRange::new(103, 21, 244, 0, 22),
    CidrRange::new(103, 22, 200, 0, 22),
    CidrRange::new(103, 31, 4, 0, 22),
    CidrRange::new(104, 16, 0, 0, 13),
    CidrRange::new(104, 24, 0, 0, 14),
    CidrRange::new(108, 162, 192, 0, 18),
    CidrRange::new(131, 0, 72, 0, 22),
    CidrRange::new(141, 101, 64, 0, 18),
    CidrRange::new(162, 158, 0, 0, 15),
    CidrRange::new(172, 64, 0, 0, 13),
    CidrRange::new(173, 245, 48, 0, 20),
    CidrRange::new(188, 114, 96, 0, 20),
    CidrRange::new(190, 93, 240, 0, 20),
    CidrRange::new(197, 234, 240, 0, 22),
    CidrRange::new(198, 41, 128, 0, 17),
];

pub fn is_edge_ipv4(ip: Ipv4Addr) -> bool {
    EDGE_RANGES.iter().any(|range| range.contains(ip))
}

/// Classify a dotted-decimal address. Anything unparseable is not an edge address.
pub fn is_edge_address(ip: &str) -> bool {
    ip.parse::<Ipv4Addr>().map(is_edge_ipv4).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_addresses() {
        assert!(is_edge_address("103.21.244.0"));
        assert!(is_edge_address("104.16.132.229"));
        assert!(!is_edge_address("8.8.8.8"));
        assert!(!is_edge_address("93.184.216.34"));
    }

    #[test]
    fn garbage_is_not_edge() {
        assert!(!is_edge_address(""));
        assert!(!is_edge_address("example.com"));
        assert!(!is_edge_address("2606:4700::1"));
        assert!(!is_edge_address("104.16.0"));
    }

    #[test]
    fn raw_table_values() {
        // Signed pairs as published alongside the range list.
        assert_eq!(EDGE_RANGES[0].network as i32, 1729491968);
        assert_eq!(EDGE_RANGES[0].mask, -1024);
        assert_eq!(EDGE_RANGES[3].mask, -524288);
        assert_eq!(EDGE_RANGES[6].network as i32, -2097133568);
        assert_eq!(EDGE_RANGES[14].network as i32, -970358784);
        assert_eq!(EDGE_RANGES[14].mask, -32768);
    }

    #[test]
    fn boundaries_match_manual_bitwise() {
        for range in EDGE_RANGES {
            let size = range.mask.unsigned_abs();
            let first = range.network;
            let last = range.network + size - 1;

            for (addr, inside) in [
                (first, true),
                (last, true),
                (first.wrapping_sub(1), false),
                (last.wrapping_add(1), false),
            ] {
                let ip = Ipv4Addr::from(addr);
                let manual = (addr & range.mask as u32) == range.network;
                assert_eq!(manual, inside, "manual check for {ip} in {range:?}");
                assert_eq!(range.contains(ip), inside, "{ip} in {range:?}");
                // 104.16.0.0/13 and 104.24.0.0/14 are adjacent, so only the inside
                // addresses are checked against the whole table.
                if inside {
                    assert!(is_edge_address(&ip.to_string()), "{ip}");
                }
            }
        }
    }
}
