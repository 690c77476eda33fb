use std::fmt;

use super::gid::Gid;
use super::types::*;

/// How a peer addresses this endpoint: everything the remote side needs to
/// bring its QP to RTR and write into our buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ConnectionInfo {
    /// Local identifier of the port.
    pub lid: Lid,
    /// QP number (24 bits).
    pub qpn: Qpn,
    /// Initial packet sequence number (24 bits).
    pub psn: Psn,
    /// Remote key of the advertised memory region.
    pub rkey: RKey,
    /// Address a peer may write to.
    pub vaddr: u64,
    pub gid: Gid,
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LID {:#06x}, QPN {:#08x}, PSN {:#08x}, RKey {:#010x}, VAddr {:#018x}, GID {:016x}:{:016x}",
            self.lid,
            self.qpn,
            self.psn,
            self.rkey,
            self.vaddr,
            self.gid.interface_id,
            self.gid.subnet_prefix,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_record_print() {
        let info = ConnectionInfo {
            lid: 3,
            qpn: 0x4a,
            psn: 0x1234,
            rkey: 0xabcd,
            vaddr: 0x10000,
            gid: Gid::new(0x2222222222222222, 0x1111111111111111),
        };
        assert_eq!(
            info.to_string(),
            "LID 0x0003, QPN 0x00004a, PSN 0x001234, RKey 0x0000abcd, \
             VAddr 0x0000000000010000, GID 1111111111111111:2222222222222222"
        );
    }
}
