//! # IP Prefix Module
//!
//! Address + prefix length types backing the `ipv4net` / `ipv6net` elements.
//! The stored address is always masked to the prefix length, so two prefixes
//! covering the same range compare equal.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while building a prefix from its string form
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetParseError {
    #[error("Missing prefix length in '{0}'")]
    MissingPrefixLen(String),

    #[error("Invalid address in '{0}'")]
    InvalidAddress(String),

    #[error("Invalid prefix length in '{0}'")]
    InvalidPrefixLen(String),
}

macro_rules! ip_net {
    ($(#[$doc:meta])* $name:ident, $addr:ty, $bits:ty, $max:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name {
            addr: $addr,
            prefix_len: u8,
        }

        impl $name {
            /// Longest prefix length for this address family
            pub const MAX_PREFIX_LEN: u8 = $max;

            /// Creates a prefix, masking host bits out of `addr`.
            pub fn new(addr: $addr, prefix_len: u8) -> Result<Self, NetParseError> {
                if prefix_len > $max {
                    return Err(NetParseError::InvalidPrefixLen(format!("{}/{}", addr, prefix_len)));
                }
                let masked = <$bits>::from(addr) & Self::mask(prefix_len);
                Ok(Self {
                    addr: <$addr>::from(masked),
                    prefix_len,
                })
            }

            fn mask(prefix_len: u8) -> $bits {
                if prefix_len == 0 {
                    0
                } else {
                    <$bits>::MAX << ($max - prefix_len)
                }
            }

            /// Network address (host bits cleared)
            pub fn addr(&self) -> $addr {
                self.addr
            }

            pub fn prefix_len(&self) -> u8 {
                self.prefix_len
            }

            /// True if `addr` falls inside this prefix
            pub fn contains(&self, addr: &$addr) -> bool {
                (<$bits>::from(*addr) & Self::mask(self.prefix_len)) == <$bits>::from(self.addr)
            }

            /// True if `other` is equal to or more specific than this prefix
            pub fn contains_net(&self, other: &$name) -> bool {
                other.prefix_len >= self.prefix_len && self.contains(&other.addr)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}/{}", self.addr, self.prefix_len)
            }
        }

        impl FromStr for $name {
            type Err = NetParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let (addr, len) = s
                    .trim()
                    .split_once('/')
                    .ok_or_else(|| NetParseError::MissingPrefixLen(s.to_string()))?;
                let addr: $addr = addr
                    .parse()
                    .map_err(|_| NetParseError::InvalidAddress(s.to_string()))?;
                let len: u8 = len
                    .parse()
                    .map_err(|_| NetParseError::InvalidPrefixLen(s.to_string()))?;
                Self::new(addr, len)
            }
        }

        // Wire form is the string representation, so deserialized values are masked too.
        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

ip_net!(
    /// IPv4 prefix, e.g. `10.0.0.0/8`
    Ipv4Net, Ipv4Addr, u32, 32
);

ip_net!(
    /// IPv6 prefix, e.g. `2001:db8::/32`
    Ipv6Net, Ipv6Addr, u128, 128
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_bits_are_masked() {
        let net: Ipv4Net = "10.1.2.3/8".parse().unwrap();
        assert_eq!(net.addr(), Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(net.to_string(), "10.0.0.0/8");
        assert_eq!(net, "10.0.0.0/8".parse().unwrap());
    }

    #[test]
    fn containment() {
        let wide: Ipv4Net = "10.0.0.0/8".parse().unwrap();
        let narrow: Ipv4Net = "10.20.0.0/16".parse().unwrap();
        assert!(wide.contains(&Ipv4Addr::new(10, 20, 1, 1)));
        assert!(!wide.contains(&Ipv4Addr::new(11, 0, 0, 1)));
        assert!(wide.contains_net(&narrow));
        assert!(!narrow.contains_net(&wide));
        assert!(wide.contains_net(&wide));

        let default: Ipv4Net = "0.0.0.0/0".parse().unwrap();
        assert!(default.contains(&Ipv4Addr::new(192, 0, 2, 1)));
    }

    #[test]
    fn ipv6_prefixes() {
        let net: Ipv6Net = "2001:db8::1/32".parse().unwrap();
        assert_eq!(net.to_string(), "2001:db8::/32");
        assert!(net.contains(&"2001:db8:ffff::1".parse().unwrap()));
        assert!(!net.contains(&"2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(matches!(
            "10.0.0.0".parse::<Ipv4Net>(),
            Err(NetParseError::MissingPrefixLen(_))
        ));
        assert!(matches!(
            "10.0.0.0/33".parse::<Ipv4Net>(),
            Err(NetParseError::InvalidPrefixLen(_))
        ));
        assert!(matches!(
            "not-an-ip/8".parse::<Ipv4Net>(),
            Err(NetParseError::InvalidAddress(_))
        ));
    }
}
