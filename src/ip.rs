//! Fixed-width numeric codec for IP addresses.
//!
//! Each address is mapped to a single 128-bit value which is stored as two signed 64-bit halves
//! next to the textual form of the address, so that range and prefix queries can be answered by
//! an index over `(ip_numeric_high, ip_numeric_low)`:
//!  - IPv4 addresses occupy the lower 32 bits of the low half and have `high == 0`
//!  - IPv6 addresses are split into the big-endian upper and lower 64 bits
//!
//! Note that the encoding is ambiguous for IPv6 addresses whose upper 96 bits are all zero (e.g.
//! `::1`), these decode as IPv4 (`0.0.0.1`). Such addresses do not appear in login traffic.
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::Error;

/// Bit width of an IPv4 address
pub const IPV4_BITS: u8 = 32;

/// Bit width of an IPv6 address
pub const IPV6_BITS: u8 = 128;

/// Bits of the low half which are always zero for IPv4 addresses
const IPV4_UNUSED: u64 = 0xFFFF_FFFF_0000_0000;

/// Numeric form of an IP address, two halves reinterpreted as signed 64-bit integers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpNumeric {
    pub high: i64,
    pub low: i64,
}

impl IpNumeric {
    #[inline]
    pub const fn new(high: i64, low: i64) -> Self {
        Self { high, low }
    }

    /// Whether this value is in the IPv4 range (upper 96 bits are zero)
    #[inline]
    pub fn is_ipv4(&self) -> bool {
        self.high == 0 && (self.low as u64 & IPV4_UNUSED) == 0
    }

    /// Both halves reinterpreted as unsigned integers
    #[inline]
    pub fn unsigned(&self) -> (u64, u64) {
        (self.high as u64, self.low as u64)
    }
}

impl From<IpAddr> for IpNumeric {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(ip) => Self::new(0, i64::from(u32::from(ip))),
            IpAddr::V6(ip) => {
                let value = u128::from(ip);
                Self::new((value >> 64) as u64 as i64, value as u64 as i64)
            }
        }
    }
}

impl From<IpNumeric> for IpAddr {
    fn from(ip: IpNumeric) -> Self {
        if ip.is_ipv4() {
            IpAddr::V4(Ipv4Addr::from(ip.low as u64 as u32))
        } else {
            let (high, low) = ip.unsigned();
            IpAddr::V6(Ipv6Addr::from((u128::from(high) << 64) | u128::from(low)))
        }
    }
}

/// Parse textual IPv4 or IPv6 address, surrounding whitespace is ignored.
#[inline]
pub fn parse(ip: &str) -> Result<IpAddr, Error> {
    ip.trim()
        .parse()
        .map_err(|_| Error::InvalidAddress(ip.to_owned()))
}

/// Encode textual IP address into its numeric form.
#[inline]
pub fn encode(ip: &str) -> Result<IpNumeric, Error> {
    parse(ip).map(IpNumeric::from)
}

/// Decode numeric form back into canonical textual representation of the address.
#[inline]
pub fn decode(ip: IpNumeric) -> String {
    IpAddr::from(ip).to_string()
}

/// Pair of bit masks selecting an address prefix in both halves of an [`IpNumeric`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixMask {
    pub high: u64,
    pub low: u64,
}

impl PrefixMask {
    /// Mask matching whole address exactly
    pub const EXACT: Self = Self {
        high: u64::MAX,
        low: u64::MAX,
    };

    /// Mask of the first `bits` of an IPv4 address (clamped to 32).
    ///
    /// All 96 bits above the address are masked too so that IPv4 prefixes never match IPv6
    /// addresses.
    pub fn ipv4(bits: u8) -> Self {
        let bits = bits.min(IPV4_BITS);
        Self {
            high: u64::MAX,
            low: IPV4_UNUSED | leading_ones(bits) >> 32,
        }
    }

    /// Mask of the first `bits` of the 128-bit value (clamped to 128).
    pub fn ipv6(bits: u8) -> Self {
        let bits = bits.min(IPV6_BITS);
        if bits <= 64 {
            Self {
                high: leading_ones(bits),
                low: 0,
            }
        } else {
            Self {
                high: u64::MAX,
                low: leading_ones(bits - 64),
            }
        }
    }

    /// Zero all bits of `ip` outside of this mask.
    #[inline]
    pub fn apply(&self, ip: IpNumeric) -> IpNumeric {
        let (high, low) = ip.unsigned();
        IpNumeric::new((high & self.high) as i64, (low & self.low) as i64)
    }

    /// Both masks reinterpreted as signed integers (e.g. for binding as `BIGINT`)
    #[inline]
    pub fn signed(&self) -> (i64, i64) {
        (self.high as i64, self.low as i64)
    }
}

/// `u64` with the `bits` most significant bits set, `bits` must be at most 64
#[inline]
fn leading_ones(bits: u8) -> u64 {
    match bits {
        0 => 0,
        bits => u64::MAX << (64 - u32::from(bits.min(64))),
    }
}

/// Test whether the first `mask_bits` of `target` equal those of `pattern`.
///
/// When the pattern is in the IPv4 range the mask is applied to the 32-bit address (and clamped
/// to 32) and the target must be in the IPv4 range as well, otherwise the mask is interpreted
/// over the full 128-bit value.
pub fn matches(pattern: IpNumeric, target: IpNumeric, mask_bits: u8) -> bool {
    let mask = if pattern.is_ipv4() {
        PrefixMask::ipv4(mask_bits)
    } else {
        PrefixMask::ipv6(mask_bits)
    };
    mask.apply(pattern) == mask.apply(target)
}
