#![cfg_attr(not(test), no_std)]

use core::fmt;
use core::net::{Ipv4Addr, Ipv6Addr};

/// Address family of a single address or a comma-joined dual-stack pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    IPv4,
    IPv6,
    DualStack,
    Unclassifiable,
}

impl AddressFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressFamily::IPv4 => "IPv4",
            AddressFamily::IPv6 => "IPv6",
            AddressFamily::DualStack => "Dual",
            AddressFamily::Unclassifiable => "",
        }
    }

    /// Whether a target of this family can be probed from an instance whose
    /// own addresses classify as `local`.
    ///
    /// A dual-stack target needs both families locally. Unclassifiable
    /// targets are never probed.
    pub fn is_supported_by(self, local: &[AddressFamily]) -> bool {
        let has = |family: AddressFamily| {
            local.contains(&family) || local.contains(&AddressFamily::DualStack)
        };
        match self {
            AddressFamily::IPv4 | AddressFamily::IPv6 => has(self),
            AddressFamily::DualStack => has(AddressFamily::IPv4) && has(AddressFamily::IPv6),
            AddressFamily::Unclassifiable => false,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Unclassifiable => f.write_str("unclassifiable"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Classify `address` as IPv4, IPv6, a dual-stack `v4,v6` pair, or neither.
///
/// A trailing `/prefix` on any part is ignored. Total: malformed input maps
/// to [`AddressFamily::Unclassifiable`].
pub fn classify(address: &str) -> AddressFamily {
    let mut parts = address.split(',');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(single), None, _) => classify_single(single),
        (Some(first), Some(second), None) => {
            match (classify_single(first), classify_single(second)) {
                (AddressFamily::IPv4, AddressFamily::IPv6)
                | (AddressFamily::IPv6, AddressFamily::IPv4) => AddressFamily::DualStack,
                _ => AddressFamily::Unclassifiable,
            }
        }
        _ => AddressFamily::Unclassifiable,
    }
}

fn classify_single(address: &str) -> AddressFamily {
    let ip = address.split('/').next().unwrap_or(address);
    if ip.parse::<Ipv4Addr>().is_ok() {
        AddressFamily::IPv4
    } else if ip.parse::<Ipv6Addr>().is_ok() {
        AddressFamily::IPv6
    } else {
        AddressFamily::Unclassifiable
    }
}
