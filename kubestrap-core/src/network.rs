//! IPv4 CIDR arithmetic used to keep node addresses out of the pod and service ranges.

use kubestrap_common::Error;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An IPv4 network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Cidr {
    pub fn new(network: Ipv4Addr, prefix_len: u8) -> Result<Self, Error> {
        if prefix_len > 32 {
            return Err(Error::Validation(
                "CIDR prefix must be between 0 and 32".to_string(),
            ));
        }

        Ok(Self {
            network,
            prefix_len,
        })
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    fn mask(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            !0u32 << (32 - self.prefix_len)
        }
    }

    /// First address of the range (host bits cleared)
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) & self.mask())
    }

    /// Last address of the range
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !self.mask())
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        (u32::from(ip) & self.mask()) == (u32::from(self.network) & self.mask())
    }

    /// Two ranges overlap iff one contains the other's network address
    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        self.contains(other.network()) || other.contains(self.network())
    }
}

impl FromStr for Ipv4Cidr {
    type Err = Error;

    fn from_str(cidr: &str) -> Result<Self, Error> {
        let (addr, prefix) = cidr.split_once('/').ok_or_else(|| {
            Error::Validation(format!(
                "Invalid CIDR notation '{}' (expected: IP/PREFIX)",
                cidr
            ))
        })?;

        let network: Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::Validation(format!("Invalid CIDR address '{}'", addr)))?;
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|_| Error::Validation(format!("Invalid CIDR prefix '{}'", prefix)))?;

        Self::new(network, prefix_len)
    }
}

impl std::fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

/// Join a three-octet prefix ("172.16.0") and a host octet into an address
pub fn address_in_prefix(prefix: &str, host: u32) -> Result<Ipv4Addr, Error> {
    if host == 0 || host > 254 {
        return Err(Error::Validation(format!(
            "Host octet {} is outside the usable range 1-254 for prefix {}",
            host, prefix
        )));
    }

    format!("{}.{}", prefix, host)
        .parse()
        .map_err(|_| Error::Validation(format!("Invalid network prefix '{}'", prefix)))
}

/// First three octets of an address ("192.168.1.100" -> "192.168.1")
pub fn prefix_of(ip: Ipv4Addr) -> String {
    let [a, b, c, _] = ip.octets();
    format!("{}.{}.{}", a, b, c)
}
