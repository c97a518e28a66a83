//! Message Unique IDentifiers.
//!
//! A MUID is the 16-byte tag carried by every Gnutella message. The servent
//! brands its own MUIDs so same-vendor peers can be recognised: bytes 2..4
//! hold an entangled version mark and byte 0 a checksum over the remaining
//! fifteen bytes. Two further interpretations overlap the same bytes and are
//! resolved by message context:
//!
//! - handshaking pings set byte 8 to `0xff` and carry capability flags in
//!   byte 15;
//! - queries use bit 0 of byte 15 as a requery marker, and queries asking
//!   for out-of-band delivery store the reply endpoint in bytes 0..4
//!   (IPv4, network order) and 13..15 (port, little endian), which destroys
//!   the vendor tag.

use std::fmt;
use std::net::Ipv4Addr;

use rand::Rng;

mod hec;

use hec::hec;

/// Capability flag: the servent performs pong caching.
pub const FLAG_PONG_CACHING: u8 = 0x01;
/// Capability flag: the servent keeps persistent connections.
pub const FLAG_PERSISTENT: u8 = 0x02;
/// Query flag: cleared on an initial query, set on a retry.
pub const FLAG_REQUERY: u8 = 0x01;

/// Marker stored in byte 8 of handshaking-ping MUIDs.
const MODERN_PING_MARKER: u8 = 0xff;

/// Vendor version mark: `(major, minor, stable)` packed into two bytes.
///
/// The low byte is the minor number, with the top bit set for unstable
/// builds. The high quartet of the high byte entangles major and minor so
/// that random bytes are extremely unlikely to decode to a self-consistent
/// mark.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionMark {
    major: u8,
    minor: u8,
    stable: bool,
}

impl VersionMark {
    /// `major` must be below 16 and `minor` below 128.
    pub fn new(major: u8, minor: u8, stable: bool) -> Option<Self> {
        if major < 0x10 && minor < 0x80 {
            Some(Self { major, minor, stable })
        } else {
            None
        }
    }

    pub fn major(&self) -> u8 {
        self.major
    }

    pub fn minor(&self) -> u8 {
        self.minor
    }

    pub fn stable(&self) -> bool {
        self.stable
    }

    /// Pack into `[high, low]` wire order.
    pub fn encode(self) -> [u8; 2] {
        let mut low = self.minor;
        if !self.stable {
            low |= 0x80;
        }
        let high =
            (self.major & 0x0f) | (0xf0 & ((self.minor << 4) ^ (self.minor & 0xf0) ^ (self.major << 4)));
        [high, low]
    }
}

/// A 16-byte message identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Muid([u8; 16]);

/// The all-zero identifier.
pub const BLANK_MUID: Muid = Muid([0; 16]);

impl Muid {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// A fresh random identifier branded with `mark`.
    pub fn random<R: Rng + ?Sized>(rng: &mut R, mark: VersionMark) -> Self {
        let mut muid = Self(rng.gen());
        muid.tag(mark);
        muid
    }

    /// A fresh identifier for a handshaking ping: flagged modern, then
    /// branded.
    pub fn ping<R: Rng + ?Sized>(rng: &mut R, mark: VersionMark) -> Self {
        let mut muid = Self(rng.gen());
        muid.flag_modern(mark);
        muid
    }

    /// A fresh identifier for a query; `requery` marks a retry.
    pub fn query<R: Rng + ?Sized>(rng: &mut R, mark: VersionMark, requery: bool) -> Self {
        let mut muid = Self(rng.gen());
        muid.set_requery(requery, mark);
        muid
    }

    /// Brand the identifier: bytes 2..4 become the version mark and byte 0
    /// the checksum of the remaining fifteen bytes.
    pub fn tag(&mut self, mark: VersionMark) {
        let enc = mark.encode();
        self.0[2] = enc[0];
        self.0[3] = enc[1];
        self.0[0] = hec(&self.0[1..]);
    }

    /// Decode the vendor mark, provided both the checksum and the version
    /// encoding are self-consistent.
    pub fn vendor_mark(&self) -> Option<VersionMark> {
        if self.0[0] != hec(&self.0[1..]) {
            return None;
        }
        let mark = VersionMark {
            major: self.0[2] & 0x0f,
            minor: self.0[3] & 0x7f,
            stable: self.0[3] & 0x80 == 0,
        };
        let enc = mark.encode();
        if enc[0] == self.0[2] && enc[1] == self.0[3] {
            Some(mark)
        } else {
            None
        }
    }

    pub fn is_vendor(&self) -> bool {
        self.vendor_mark().is_some()
    }

    /// Vendor check for a query MUID. A query requesting out-of-band hit
    /// delivery stores its reply endpoint over the tag bytes, so the vendor
    /// interpretation is unavailable.
    pub fn vendor_mark_query(&self, oob: bool) -> Option<VersionMark> {
        if oob {
            return None;
        }
        self.vendor_mark()
    }

    /// Mark the identifier as belonging to a modern node and re-brand it:
    /// byte 8 becomes `0xff`, byte 15 the capability flags.
    pub fn flag_modern(&mut self, mark: VersionMark) {
        self.0[8] = MODERN_PING_MARKER;
        self.0[15] = FLAG_PONG_CACHING | FLAG_PERSISTENT;
        self.tag(mark);
    }

    /// Set or clear the requery bit, then re-brand.
    pub fn set_requery(&mut self, requery: bool, mark: VersionMark) {
        if requery {
            self.0[15] |= FLAG_REQUERY;
        } else {
            self.0[15] &= !FLAG_REQUERY;
        }
        self.tag(mark);
    }

    pub fn is_requery(&self) -> bool {
        self.0[15] & FLAG_REQUERY != 0
    }

    /// Store an out-of-band reply endpoint: the address over bytes 0..4 in
    /// network order, the port over bytes 13..15 little endian. This
    /// overwrites the checksum byte, so the identifier no longer validates
    /// as vendor-tagged.
    pub fn set_oob_endpoint(&mut self, addr: Ipv4Addr, port: u16) {
        self.0[0..4].copy_from_slice(&addr.octets());
        self.0[13..15].copy_from_slice(&port.to_le_bytes());
    }

    /// Extract the out-of-band reply endpoint.
    pub fn oob_endpoint(&self) -> (Ipv4Addr, u16) {
        let addr = Ipv4Addr::new(self.0[0], self.0[1], self.0[2], self.0[3]);
        let port = u16::from_le_bytes([self.0[13], self.0[14]]);
        (addr, port)
    }
}

impl AsRef<[u8]> for Muid {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 16]> for Muid {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Muid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Muid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Muid({self})")
    }
}
