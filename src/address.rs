//! Node addresses. A single sum type covers both IP versions so the rest
//! of the engine never duplicates logic per family.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::{AodvError, AodvErrorKind};

/// Address family of a control channel. A packet never mixes families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

/// A node address, IPv4 or IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Address {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl Address {
    pub fn family(&self) -> AddressFamily {
        match self {
            Address::V4(_) => AddressFamily::V4,
            Address::V6(_) => AddressFamily::V6,
        }
    }

    /// The zero address of the given family. Used as the source marker in
    /// hello messages.
    pub fn zero(family: AddressFamily) -> Address {
        match family {
            AddressFamily::V4 => Address::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::V6 => Address::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Address::V4(a) => a.is_unspecified(),
            Address::V6(a) => a.is_unspecified(),
        }
    }

    /// The 32 bits used for table ordering and bucket hashing: the whole
    /// address for IPv4, only the low 32 bits (the host part) for IPv6.
    /// Two IPv6 addresses differing only above the low word compare equal
    /// here; insertion and lookup both go through this accessor so the
    /// table stays self-consistent.
    pub fn host_bits(&self) -> u32 {
        match self {
            Address::V4(a) => u32::from(*a),
            Address::V6(a) => {
                let o = a.octets();
                u32::from_be_bytes([o[12], o[13], o[14], o[15]])
            }
        }
    }

    /// Table ordering over [host_bits](#method.host_bits).
    pub fn is_smaller_than(&self, other: &Address) -> bool {
        debug_assert_eq!(
            self.family(),
            other.family(),
            "address comparison across families"
        );
        self.host_bits() < other.host_bits()
    }

    /// Wire encoding: 4 bytes for v4, 16 for v6, network order.
    pub fn wire_bytes(&self) -> Vec<u8> {
        match self {
            Address::V4(a) => a.octets().to_vec(),
            Address::V6(a) => a.octets().to_vec(),
        }
    }

    pub fn wire_len(family: AddressFamily) -> usize {
        match family {
            AddressFamily::V4 => 4,
            AddressFamily::V6 => 16,
        }
    }

    pub fn from_wire(bytes: &[u8], family: AddressFamily) -> Result<Address, AodvError> {
        match family {
            AddressFamily::V4 => {
                if bytes.len() < 4 {
                    return Err(AodvErrorKind::Serialization(
                        "truncated IPv4 address".into(),
                    )
                    .into());
                }
                let mut o = [0u8; 4];
                o.copy_from_slice(&bytes[..4]);
                Ok(Address::V4(Ipv4Addr::from(o)))
            }
            AddressFamily::V6 => {
                if bytes.len() < 16 {
                    return Err(AodvErrorKind::Serialization(
                        "truncated IPv6 address".into(),
                    )
                    .into());
                }
                let mut o = [0u8; 16];
                o.copy_from_slice(&bytes[..16]);
                Ok(Address::V6(Ipv6Addr::from(o)))
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::V4(a) => write!(f, "{}", a),
            Address::V6(a) => write!(f, "{}", a),
        }
    }
}

impl FromStr for Address {
    type Err = AodvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(a) = s.parse::<Ipv4Addr>() {
            return Ok(Address::V4(a));
        }
        s.parse::<Ipv6Addr>()
            .map(Address::V6)
            .map_err(|e| AodvError {
                cause: Some(Box::new(e)),
                kind: AodvErrorKind::Configuration(format!("invalid address: {}", s)),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ordering_v4_uses_full_value() {
        let a: Address = "10.0.0.1".parse().unwrap();
        let b: Address = "10.0.0.2".parse().unwrap();
        assert!(a.is_smaller_than(&b));
        assert!(!b.is_smaller_than(&a));
    }

    #[test]
    fn ordering_v6_only_sees_host_bits() {
        // Known quirk: only the low 32 bits of a v6 address take part in
        // ordering and hashing, so these two distinct addresses collide.
        let a: Address = "fe80::1:2".parse().unwrap();
        let b: Address = "fec0::1:2".parse().unwrap();
        assert_eq!(a.host_bits(), b.host_bits());
        assert!(!a.is_smaller_than(&b));
        assert!(!b.is_smaller_than(&a));
    }

    #[test]
    fn wire_roundtrip() {
        let a: Address = "192.168.1.7".parse().unwrap();
        let bytes = a.wire_bytes();
        assert_eq!(a, Address::from_wire(&bytes, AddressFamily::V4).unwrap());

        let a: Address = "fe80::beef".parse().unwrap();
        let bytes = a.wire_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(a, Address::from_wire(&bytes, AddressFamily::V6).unwrap());
    }

    #[test]
    fn zero_marks_hello() {
        assert!(Address::zero(AddressFamily::V4).is_zero());
        assert!(Address::zero(AddressFamily::V6).is_zero());
        let a: Address = "10.0.0.1".parse().unwrap();
        assert!(!a.is_zero());
    }
}
