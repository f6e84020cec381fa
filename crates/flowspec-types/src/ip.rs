//! IP prefix type with CIDR parsing.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// An IP prefix in CIDR notation (e.g., 10.0.0.0/24 or 2001:db8::/32).
///
/// The stored address is always the network address: host bits are cleared
/// on construction, so `10.1.2.3/8` and `10.0.0.0/8` compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpPrefix {
    network: IpAddr,
    prefix_len: u8,
}

impl IpPrefix {
    /// Creates a new IP prefix, masking off host bits.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix length is invalid for the address type
    /// (>32 for IPv4, >128 for IPv6).
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, ParseError> {
        let max_len = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };

        if prefix_len > max_len {
            return Err(ParseError::InvalidIpPrefix(format!(
                "prefix length {} exceeds maximum {} for address type",
                prefix_len, max_len
            )));
        }

        let network = match address {
            IpAddr::V4(addr) => {
                let mask = v4_mask(prefix_len);
                IpAddr::V4(Ipv4Addr::from(u32::from(addr) & mask))
            }
            IpAddr::V6(addr) => {
                let mask = v6_mask(prefix_len);
                IpAddr::V6(Ipv6Addr::from(u128::from(addr) & mask))
            }
        };

        Ok(IpPrefix {
            network,
            prefix_len,
        })
    }

    /// Returns the network address of this prefix.
    pub const fn network(&self) -> &IpAddr {
        &self.network
    }

    /// Returns the prefix length in bits.
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub const fn is_ipv4(&self) -> bool {
        self.network.is_ipv4()
    }

    pub const fn is_ipv6(&self) -> bool {
        self.network.is_ipv6()
    }

    /// Address length in bytes: 4 for IPv4, 16 for IPv6.
    pub const fn byte_len(&self) -> usize {
        match self.network {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 16,
        }
    }

    /// Network address bytes in network byte order.
    pub fn network_bytes(&self) -> Vec<u8> {
        match self.network {
            IpAddr::V4(addr) => addr.octets().to_vec(),
            IpAddr::V6(addr) => addr.octets().to_vec(),
        }
    }

    /// Netmask bytes in network byte order (`/20` on IPv4 is `ff ff f0 00`).
    pub fn mask_bytes(&self) -> Vec<u8> {
        match self.network {
            IpAddr::V4(_) => v4_mask(self.prefix_len).to_be_bytes().to_vec(),
            IpAddr::V6(_) => v6_mask(self.prefix_len).to_be_bytes().to_vec(),
        }
    }
}

fn v4_mask(prefix_len: u8) -> u32 {
    u32::MAX.checked_shl(32 - u32::from(prefix_len)).unwrap_or(0)
}

fn v6_mask(prefix_len: u8) -> u128 {
    u128::MAX.checked_shl(128 - u32::from(prefix_len)).unwrap_or(0)
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, len_str) = s
            .rsplit_once('/')
            .ok_or_else(|| ParseError::InvalidIpPrefix(s.to_string()))?;

        let address: IpAddr = addr_str
            .parse()
            .map_err(|_| ParseError::InvalidIpAddress(addr_str.to_string()))?;
        let prefix_len: u8 = len_str
            .parse()
            .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;

        IpPrefix::new(address, prefix_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ip_prefix_parse() {
        let prefix: IpPrefix = "10.0.0.0/24".parse().unwrap();
        assert!(prefix.is_ipv4());
        assert_eq!(prefix.prefix_len(), 24);
        assert_eq!(prefix.byte_len(), 4);

        let v6_prefix: IpPrefix = "2001:db8::/32".parse().unwrap();
        assert!(v6_prefix.is_ipv6());
        assert_eq!(v6_prefix.prefix_len(), 32);
        assert_eq!(v6_prefix.byte_len(), 16);
    }

    #[test]
    fn test_host_bits_are_masked() {
        let prefix: IpPrefix = "192.0.2.77/24".parse().unwrap();
        assert_eq!(prefix.to_string(), "192.0.2.0/24");
        assert_eq!(prefix.network_bytes(), vec![192, 0, 2, 0]);

        let v6: IpPrefix = "2001:db8:1:2::1/48".parse().unwrap();
        assert_eq!(v6.to_string(), "2001:db8:1::/48");
    }

    #[test]
    fn test_mask_bytes() {
        let prefix: IpPrefix = "10.16.0.0/12".parse().unwrap();
        assert_eq!(prefix.mask_bytes(), vec![0xff, 0xf0, 0x00, 0x00]);

        let all: IpPrefix = "0.0.0.0/0".parse().unwrap();
        assert_eq!(all.mask_bytes(), vec![0, 0, 0, 0]);

        let host: IpPrefix = "2001:db8::1/128".parse().unwrap();
        assert_eq!(host.mask_bytes(), vec![0xff; 16]);

        let v6: IpPrefix = "2001:db8::/33".parse().unwrap();
        let mut expected = vec![0xff, 0xff, 0xff, 0xff, 0x80];
        expected.extend(vec![0u8; 11]);
        assert_eq!(v6.mask_bytes(), expected);
    }

    #[test]
    fn test_invalid_prefix() {
        assert!("10.0.0.0/33".parse::<IpPrefix>().is_err());
        assert!("2001:db8::/129".parse::<IpPrefix>().is_err());
        assert!("10.0.0.0".parse::<IpPrefix>().is_err());
        assert!("not-an-ip/8".parse::<IpPrefix>().is_err());
    }
}
