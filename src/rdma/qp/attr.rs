use std::ops::{BitOr, BitOrAssign};

use super::QpState;
use crate::rdma::gid::Gid;
use crate::rdma::info::ConnectionInfo;
use crate::rdma::perm::Permission;
use crate::rdma::types::*;

/// Path MTU. Discriminants follow `enum ibv_mtu`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mtu {
    Mtu256 = 1,
    Mtu512 = 2,
    #[default]
    Mtu1024 = 3,
    Mtu2048 = 4,
    Mtu4096 = 5,
}

impl Mtu {
    pub const fn bytes(self) -> u32 {
        128 << (self as u32)
    }
}

/// Global routing header settings of an address vector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GlobalRoute {
    pub dgid: Gid,
    pub flow_label: u32,
    pub sgid_index: GidIndex,
    pub hop_limit: u8,
    pub traffic_class: u8,
}

/// Address vector describing the path to the remote port.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AhAttr {
    pub dlid: Lid,
    pub sl: u8,
    pub src_path_bits: u8,
    pub port_num: PortNum,
    pub is_global: bool,
    pub grh: GlobalRoute,
}

/// QP attributes. Only the fields selected by the accompanying
/// [`QpAttrMask`] are meaningful.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QpAttr {
    pub qp_state: QpState,
    pub access: Permission,
    pub pkey_index: u16,
    pub port_num: PortNum,
    pub path_mtu: Mtu,
    pub dest_qpn: Qpn,
    pub rq_psn: Psn,
    pub sq_psn: Psn,
    pub max_dest_rd_atomic: u8,
    pub max_rd_atomic: u8,
    pub min_rnr_timer: u8,
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
    pub ah: AhAttr,
}

/// Selects which [`QpAttr`] fields a modify applies.
///
/// Bit values follow `enum ibv_qp_attr_mask`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct QpAttrMask(u32);

impl QpAttrMask {
    pub const STATE: Self = Self(1 << 0);
    pub const ACCESS_FLAGS: Self = Self(1 << 3);
    pub const PKEY_INDEX: Self = Self(1 << 4);
    pub const PORT: Self = Self(1 << 5);
    pub const AV: Self = Self(1 << 7);
    pub const PATH_MTU: Self = Self(1 << 8);
    pub const TIMEOUT: Self = Self(1 << 9);
    pub const RETRY_CNT: Self = Self(1 << 10);
    pub const RNR_RETRY: Self = Self(1 << 11);
    pub const RQ_PSN: Self = Self(1 << 12);
    pub const MAX_QP_RD_ATOMIC: Self = Self(1 << 13);
    pub const MIN_RNR_TIMER: Self = Self(1 << 15);
    pub const SQ_PSN: Self = Self(1 << 16);
    pub const MAX_DEST_RD_ATOMIC: Self = Self(1 << 17);
    pub const DEST_QPN: Self = Self(1 << 20);

    /// Attributes a `RESET -> INIT` modify must carry.
    pub const RESET_TO_INIT: Self =
        Self(Self::STATE.0 | Self::PKEY_INDEX.0 | Self::PORT.0 | Self::ACCESS_FLAGS.0);

    /// Attributes an `INIT -> RTR` modify must carry.
    pub const INIT_TO_RTR: Self = Self(
        Self::STATE.0
            | Self::AV.0
            | Self::PATH_MTU.0
            | Self::DEST_QPN.0
            | Self::RQ_PSN.0
            | Self::MAX_DEST_RD_ATOMIC.0
            | Self::MIN_RNR_TIMER.0,
    );

    /// Attributes an `RTR -> RTS` modify must carry.
    pub const RTR_TO_RTS: Self = Self(
        Self::STATE.0
            | Self::SQ_PSN.0
            | Self::TIMEOUT.0
            | Self::RETRY_CNT.0
            | Self::RNR_RETRY.0
            | Self::MAX_QP_RD_ATOMIC.0,
    );

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for QpAttrMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for QpAttrMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Fixed connection policy.
pub mod policy {
    use super::Mtu;
    use crate::rdma::perm::Permission;

    /// Partition key index used in `INIT`.
    pub const PKEY_INDEX: u16 = 0;
    /// Remote operations the QP admits.
    pub const QP_ACCESS: Permission = Permission::REMOTE_WRITE;

    pub const PATH_MTU: Mtu = Mtu::Mtu1024;
    pub const MAX_DEST_RD_ATOMIC: u8 = 0;
    pub const MIN_RNR_TIMER: u8 = 2;
    pub const HOP_LIMIT: u8 = 1;

    /// Local ACK timeout exponent: 4.096us * 2^14, about 67ms.
    pub const TIMEOUT: u8 = 14;
    pub const RETRY_CNT: u8 = 7;
    /// 7 means retry forever on RNR NAKs.
    pub const RNR_RETRY: u8 = 7;
    pub const MAX_RD_ATOMIC: u8 = 1;
}

/// Local path parameters for the `INIT -> RTR` transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathParams {
    pub port_num: PortNum,
    pub service_level: u8,
    pub sgid_index: GidIndex,
}

impl QpAttr {
    /// Attributes for `RESET -> INIT` on `port_num`.
    pub fn reset_to_init(port_num: PortNum) -> (Self, QpAttrMask) {
        let attr = Self {
            qp_state: QpState::Init,
            pkey_index: policy::PKEY_INDEX,
            port_num,
            access: policy::QP_ACCESS,
            ..Default::default()
        };
        (attr, QpAttrMask::RESET_TO_INIT)
    }

    /// Attributes for `INIT -> RTR` towards `remote`.
    pub fn init_to_rtr(remote: &ConnectionInfo, path: &PathParams) -> (Self, QpAttrMask) {
        let attr = Self {
            qp_state: QpState::Rtr,
            path_mtu: policy::PATH_MTU,
            dest_qpn: remote.qpn,
            rq_psn: remote.psn,
            max_dest_rd_atomic: policy::MAX_DEST_RD_ATOMIC,
            min_rnr_timer: policy::MIN_RNR_TIMER,
            ah: AhAttr {
                dlid: remote.lid,
                sl: path.service_level,
                src_path_bits: 0,
                port_num: path.port_num,
                is_global: true,
                grh: GlobalRoute {
                    dgid: remote.gid,
                    flow_label: 0,
                    sgid_index: path.sgid_index,
                    hop_limit: policy::HOP_LIMIT,
                    traffic_class: 0,
                },
            },
            ..Default::default()
        };
        (attr, QpAttrMask::INIT_TO_RTR)
    }

    /// Attributes for `RTR -> RTS`, sending from `local_psn`.
    pub fn rtr_to_rts(local_psn: Psn) -> (Self, QpAttrMask) {
        let attr = Self {
            qp_state: QpState::Rts,
            sq_psn: local_psn,
            timeout: policy::TIMEOUT,
            retry_cnt: policy::RETRY_CNT,
            rnr_retry: policy::RNR_RETRY,
            max_rd_atomic: policy::MAX_RD_ATOMIC,
            ..Default::default()
        };
        (attr, QpAttrMask::RTR_TO_RTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtr_attr_routes_to_remote() {
        let remote = ConnectionInfo {
            lid: 3,
            qpn: 0x4a,
            psn: 0x1234,
            rkey: 0xabcd,
            vaddr: 0x10000,
            gid: Gid::new(0x2222, 0x1111),
        };
        let path = PathParams {
            port_num: 1,
            service_level: 1,
            sgid_index: 0,
        };
        let (attr, mask) = QpAttr::init_to_rtr(&remote, &path);
        assert_eq!(mask, QpAttrMask::INIT_TO_RTR);
        assert_eq!(attr.qp_state, QpState::Rtr);
        assert_eq!(attr.dest_qpn, 0x4a);
        assert_eq!(attr.rq_psn, 0x1234);
        assert_eq!(attr.ah.dlid, 3);
        assert_eq!(attr.ah.sl, 1);
        assert!(attr.ah.is_global);
        assert_eq!(attr.ah.grh.dgid, remote.gid);
        assert_eq!(attr.ah.grh.hop_limit, 1);
        assert_eq!(attr.min_rnr_timer, 2);
        assert_eq!(attr.path_mtu.bytes(), 1024);
    }

    #[test]
    fn rts_attr_uses_local_psn() {
        let (attr, mask) = QpAttr::rtr_to_rts(0xbeef);
        assert_eq!(mask, QpAttrMask::RTR_TO_RTS);
        assert_eq!(attr.sq_psn, 0xbeef);
        assert_eq!((attr.timeout, attr.retry_cnt, attr.rnr_retry), (14, 7, 7));
        assert_eq!(attr.max_rd_atomic, 1);
        assert!(!mask.contains(QpAttrMask::DEST_QPN));
    }
}
