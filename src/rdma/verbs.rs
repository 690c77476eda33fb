//! The capability layer: the narrow set of verbs the connection needs,
//! expressed as a trait so that the hardware binding and the in-process
//! software fabric are interchangeable.

use std::io;

use super::gid::Gid;
use super::perm::Permission;
use super::qp::{QpAttr, QpAttrMask};
use super::types::*;
use super::wc::Wc;
use crate::rdma::endpoint::SetupError;

/// Queue pair capability attributes.
///
/// This type corresponds to `struct ibv_qp_cap` in the `ibverbs` C driver.
/// The documentation is borrowed from [RDMAmojo](https://www.rdmamojo.com/2012/12/21/ibv_create_qp/).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QpCaps {
    /// The maximum number of outstanding Work Requests that can be posted to
    /// the Send Queue in that Queue Pair.
    pub max_send_wr: u32,

    /// The maximum number of outstanding Work Requests that can be posted to
    /// the Receive Queue in that Queue Pair.
    pub max_recv_wr: u32,

    /// The maximum number of scatter/gather elements in any Work Request that
    /// can be posted to the Send Queue in that Queue Pair.
    pub max_send_sge: u32,

    /// The maximum number of scatter/gather elements in any Work Request that
    /// can be posted to the Receive Queue in that Queue Pair.
    pub max_recv_sge: u32,

    /// The maximum message size (in bytes) that can be posted inline to the
    /// Send Queue. If no inline message is requested, the value can be 0.
    pub max_inline_data: u32,
}

impl QpCaps {
    /// Capabilities of the echo QP: `tx_depth` outstanding sends, a single
    /// outstanding receive, one SGE each way and no inline data.
    pub const fn for_tx_depth(tx_depth: u32) -> Self {
        Self {
            max_send_wr: tx_depth,
            max_recv_wr: 1,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 0,
        }
    }
}

/// Port attributes relevant to connection setup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortAttr {
    /// Local identifier of the port.
    pub lid: Lid,
    /// Whether the port is in the `ACTIVE` state.
    pub active: bool,
}

/// Scatter/gather element.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: LKey,
}

/// Remote side of a one-sided operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteTarget {
    pub addr: u64,
    pub rkey: RKey,
}

/// Send work request. Only RDMA writes are expressible.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendWr {
    pub wr_id: WrId,
    pub sge: Sge,
    pub remote: RemoteTarget,
    /// Immediate data. `Some` turns the write into a write-with-immediate,
    /// which consumes a receive at the peer.
    pub imm: Option<ImmData>,
    /// Request a completion for this work request.
    pub signaled: bool,
}

impl SendWr {
    /// A signaled RDMA write of `sge` into `remote`.
    pub fn rdma_write(wr_id: WrId, sge: Sge, remote: RemoteTarget) -> Self {
        Self {
            wr_id,
            sge,
            remote,
            imm: None,
            signaled: true,
        }
    }

    pub fn with_imm(mut self, imm: Option<ImmData>) -> Self {
        self.imm = imm;
        self
    }
}

/// Receive work request. A receive consumed by a write-with-immediate needs
/// no scatter/gather element.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecvWr {
    pub wr_id: WrId,
    pub sge: Option<Sge>,
}

/// RDMA verbs provider.
///
/// Every resource type releases its underlying object on drop. A provider
/// never hands out a resource that is not yet fully created, so dropping a
/// partially built set of resources releases exactly what exists.
pub trait Verbs {
    type Context;
    type Pd;
    type Mr;
    type Cq;
    type Qp;

    /// Open the device called `name`, or the first one found if `None`.
    fn open_device(&self, name: Option<&str>) -> Result<Self::Context, SetupError>;

    /// Name of the device behind an opened context.
    fn device_name(&self, ctx: &Self::Context) -> String;

    fn alloc_pd(&self, ctx: &Self::Context) -> io::Result<Self::Pd>;

    /// Register `len` bytes at `addr` under `pd`.
    ///
    /// # Safety
    ///
    /// The memory range must stay valid until the returned region is dropped.
    unsafe fn reg_mr(
        &self,
        pd: &Self::Pd,
        addr: *mut u8,
        len: usize,
        perm: Permission,
    ) -> io::Result<Self::Mr>;

    fn lkey(&self, mr: &Self::Mr) -> LKey;

    fn rkey(&self, mr: &Self::Mr) -> RKey;

    /// Create a completion queue with at least `depth` entries.
    fn create_cq(&self, ctx: &Self::Context, depth: u32) -> io::Result<Self::Cq>;

    /// Create a reliable-connected QP in the `RESET` state.
    fn create_qp(
        &self,
        pd: &Self::Pd,
        send_cq: &Self::Cq,
        recv_cq: &Self::Cq,
        caps: &QpCaps,
    ) -> io::Result<Self::Qp>;

    fn qp_num(&self, qp: &Self::Qp) -> Qpn;

    fn query_port(&self, ctx: &Self::Context, port: PortNum) -> io::Result<PortAttr>;

    fn query_gid(&self, ctx: &Self::Context, port: PortNum, index: GidIndex) -> io::Result<Gid>;

    /// Apply the attributes selected by `mask` to the QP.
    fn modify_qp(&self, qp: &Self::Qp, attr: &QpAttr, mask: QpAttrMask) -> io::Result<()>;

    /// Post one send work request.
    ///
    /// # Safety
    ///
    /// The local buffer described by the SGE must stay valid until the
    /// request completes.
    unsafe fn post_send(&self, qp: &Self::Qp, wr: &SendWr) -> io::Result<()>;

    /// Post one receive work request.
    ///
    /// # Safety
    ///
    /// The buffer described by the SGE, if any, must stay valid until the
    /// request completes.
    unsafe fn post_recv(&self, qp: &Self::Qp, wr: &RecvWr) -> io::Result<()>;

    /// Non-blocking poll. Returns the number of completions written to `wc`.
    fn poll_cq(&self, cq: &Self::Cq, wc: &mut [Wc]) -> io::Result<usize>;
}
