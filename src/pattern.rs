//! Resolution of raw `ListUsersForIP` input into a numeric store predicate.
//!
//! Accepted inputs are:
//!  - complete IPv4 or IPv6 addresses which resolve into an _exact_ match
//!  - CIDR blocks such as `10.0.0.0/8` or `2001:db8::/32` (prefix length is clamped to the family
//!    width)
//!  - partial IPv4 addresses such as `192.168` or `192.168.` whose prefix length is 8 bits per
//!    given octet
//!  - partial IPv6 addresses such as `2001:0db8:85a3` whose prefix length is 16 bits per given
//!    group
//!
//! A prefix made of decimal digits only is read as IPv4 octets, unless it has no dot and more
//! than three digits (e.g. `2001`), which can only be an IPv6 group.
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::Error;
use crate::ip::{IpNumeric, PrefixMask, IPV4_BITS, IPV6_BITS};

/// Address family of a resolved query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    #[inline]
    fn width(self) -> u8 {
        match self {
            Self::V4 => IPV4_BITS,
            Self::V6 => IPV6_BITS,
        }
    }
}

/// Resolved form of an IP pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpQuery {
    /// Pattern address with all bits beyond `mask_bits` set to zero
    pub pattern: IpNumeric,
    pub mask_bits: u8,
    pub exact: bool,
    pub family: Family,
}

impl IpQuery {
    fn exact(ip: IpAddr) -> Self {
        let family = family_of(ip);
        Self {
            pattern: ip.into(),
            mask_bits: family.width(),
            exact: true,
            family,
        }
    }

    fn prefix(ip: IpAddr, mask_bits: u8) -> Self {
        let family = family_of(ip);
        let mask_bits = mask_bits.min(family.width());
        let mut query = Self {
            pattern: ip.into(),
            mask_bits,
            exact: false,
            family,
        };
        query.pattern = query.mask().apply(query.pattern);
        query
    }

    /// Bit masks of this query applied to `(ip_numeric_high, ip_numeric_low)`
    pub fn mask(&self) -> PrefixMask {
        match (self.exact, self.family) {
            (true, _) => PrefixMask::EXACT,
            (false, Family::V4) => PrefixMask::ipv4(self.mask_bits),
            (false, Family::V6) => PrefixMask::ipv6(self.mask_bits),
        }
    }

    /// Test whether a stored address is selected by this query
    #[inline]
    pub fn matches(&self, target: IpNumeric) -> bool {
        self.mask().apply(target) == self.pattern
    }
}

impl fmt::Display for IpQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", IpAddr::from(self.pattern), self.mask_bits)
    }
}

impl FromStr for IpQuery {
    type Err = Error;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        resolve(s)
    }
}

#[inline]
fn family_of(ip: IpAddr) -> Family {
    match ip {
        IpAddr::V4(_) => Family::V4,
        IpAddr::V6(_) => Family::V6,
    }
}

/// Resolve raw pattern text into an [`IpQuery`].
pub fn resolve(raw: &str) -> Result<IpQuery, Error> {
    let raw = raw.trim();
    let invalid = || Error::InvalidPattern(raw.to_owned());

    if raw.is_empty() {
        return Err(invalid());
    }

    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Ok(IpQuery::exact(ip));
    }

    let (prefix, prefix_len) = match raw.split_once('/') {
        Some((prefix, len)) => (prefix, Some(len.parse::<u8>().map_err(|_| invalid())?)),
        None => (raw, None),
    };

    if prefix.is_empty()
        || !prefix
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == '.' || c == ':')
    {
        return Err(invalid());
    }

    // CIDR notation with a complete address
    if let Ok(ip) = prefix.parse::<IpAddr>() {
        let bits = prefix_len.unwrap_or_else(|| family_of(ip).width());
        return Ok(IpQuery::prefix(ip, bits));
    }

    let (ip, given_bits) = if looks_ipv4(prefix) {
        partial_ipv4(prefix).ok_or_else(invalid)?
    } else {
        partial_ipv6(prefix).ok_or_else(invalid)?
    };

    Ok(IpQuery::prefix(ip, prefix_len.unwrap_or(given_bits)))
}

/// Whether a partial address should be read as IPv4 octets
fn looks_ipv4(prefix: &str) -> bool {
    prefix.chars().all(|c| c.is_ascii_digit() || c == '.')
        && (prefix.contains('.') || prefix.len() <= 3)
}

/// Parse leading octets of an IPv4 address, a single trailing dot is allowed.
fn partial_ipv4(prefix: &str) -> Option<(IpAddr, u8)> {
    let prefix = prefix.strip_suffix('.').unwrap_or(prefix);

    let mut octets = [0u8; 4];
    let mut given = 0;

    for segment in prefix.split('.') {
        if given == octets.len() || segment.is_empty() || segment.len() > 3 {
            return None;
        }
        octets[given] = segment.parse().ok()?;
        given += 1;
    }

    let bits = (given as u8 * 8).min(IPV4_BITS);
    Some((IpAddr::V4(Ipv4Addr::from(octets)), bits))
}

/// Parse leading groups of an IPv6 address, a single trailing colon is allowed.
fn partial_ipv6(prefix: &str) -> Option<(IpAddr, u8)> {
    if prefix.contains('.') || prefix.contains("::") {
        return None;
    }

    let prefix = prefix.strip_suffix(':').unwrap_or(prefix);

    let mut groups = [0u16; 8];
    let mut given = 0;

    for group in prefix.split(':') {
        if given == groups.len() || group.is_empty() || group.len() > 4 {
            return None;
        }
        groups[given] = u16::from_str_radix(group, 16).ok()?;
        given += 1;
    }

    let bits = (given as u8 * 16).min(IPV6_BITS);
    Some((IpAddr::V6(Ipv6Addr::from(groups)), bits))
}
