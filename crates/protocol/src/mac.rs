//! IEEE-802 hardware addressing.
//!
//! Members are identified by their 6-byte hardware address. Addresses are
//! canonicalized to lowercase colon-separated hex so that map lookups and
//! wire comparisons agree regardless of how the operator wrote them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ProtocolError;

/// Length of a hardware address in bytes.
pub const MAC_LENGTH: usize = 6;

/// A 6-byte IEEE-802 hardware address.
///
/// The `Display` form is the canonical representation: lowercase hex octets
/// separated by colons, e.g. `02:00:00:00:00:0a`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr([u8; MAC_LENGTH]);

/// The Ethernet broadcast address `ff:ff:ff:ff:ff:ff`.
///
/// Never identifies a member; it is only ever a fan-out destination.
pub const BROADCAST: MacAddr = MacAddr([0xff; MAC_LENGTH]);

impl MacAddr {
    /// Creates an address from raw bytes.
    pub fn from_bytes(bytes: [u8; MAC_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of this address.
    pub fn as_bytes(&self) -> &[u8; MAC_LENGTH] {
        &self.0
    }

    /// Returns true if this is the broadcast address.
    pub fn is_broadcast(&self) -> bool {
        *self == BROADCAST
    }
}

impl FromStr for MacAddr {
    type Err = ProtocolError;

    /// Parses colon- or hyphen-separated hex octets.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let separator = if s.contains('-') { '-' } else { ':' };
        let mut bytes = [0u8; MAC_LENGTH];
        let mut count = 0;

        for part in s.split(separator) {
            if count == MAC_LENGTH || part.len() != 2 {
                return Err(ProtocolError::InvalidMac(s.to_string()));
            }
            bytes[count] = u8::from_str_radix(part, 16)
                .map_err(|_| ProtocolError::InvalidMac(s.to_string()))?;
            count += 1;
        }

        if count != MAC_LENGTH {
            return Err(ProtocolError::InvalidMac(s.to_string()));
        }

        Ok(Self(bytes))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for MacAddr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
