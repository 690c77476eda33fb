use std::fmt;
use std::net::Ipv6Addr;

/// An 128-bit identifier used to route packets to a port across subnets.
///
/// The two halves are kept exactly as the device reports them: each one is
/// the in-memory value of the corresponding 8-byte half of the raw GID,
/// read without byte swapping. This is the representation peers put on the
/// wire, so a GID survives `raw -> Gid -> wire -> Gid -> raw` bit-for-bit.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Gid {
    /// Subnet prefix (first 8 bytes of the raw GID).
    pub subnet_prefix: u64,
    /// Interface identifier (last 8 bytes of the raw GID).
    pub interface_id: u64,
}

impl Gid {
    pub const fn new(subnet_prefix: u64, interface_id: u64) -> Self {
        Self {
            subnet_prefix,
            interface_id,
        }
    }

    /// Return the raw 16-byte form.
    pub fn raw(&self) -> [u8; 16] {
        let mut raw = [0; 16];
        raw[..8].copy_from_slice(&self.subnet_prefix.to_ne_bytes());
        raw[8..].copy_from_slice(&self.interface_id.to_ne_bytes());
        raw
    }
}

impl From<[u8; 16]> for Gid {
    fn from(raw: [u8; 16]) -> Self {
        let mut prefix = [0; 8];
        let mut iid = [0; 8];
        prefix.copy_from_slice(&raw[..8]);
        iid.copy_from_slice(&raw[8..]);
        Self {
            subnet_prefix: u64::from_ne_bytes(prefix),
            interface_id: u64::from_ne_bytes(iid),
        }
    }
}

impl From<Gid> for [u8; 16] {
    fn from(gid: Gid) -> Self {
        gid.raw()
    }
}

impl From<Gid> for Ipv6Addr {
    fn from(gid: Gid) -> Self {
        Ipv6Addr::from(gid.raw())
    }
}

impl fmt::Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Gid")
            .field(&Ipv6Addr::from(*self).to_string())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_bytes_survive_conversion() {
        let raw = [
            0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0x02, 0x1b, 0x0d, 0xff, 0xfe, 0x8f, 0x11, 0x22,
        ];
        let gid = Gid::from(raw);
        assert_eq!(<[u8; 16]>::from(gid), raw);
        assert_eq!(
            Ipv6Addr::from(gid),
            "fe80::21b:dff:fe8f:1122".parse::<Ipv6Addr>().unwrap()
        );
    }
}
