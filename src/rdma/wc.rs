use thiserror::Error;

use super::types::*;

/// Opcode of a completion queue entry.
///
/// Discriminants follow `enum ibv_wc_opcode`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum WcOpcode {
    /// Send request.
    #[default]
    Send = 0,
    /// RDMA write request.
    RdmaWrite = 1,
    /// RDMA read request.
    RdmaRead = 2,
    /// Receive request.
    Recv = 128,
    /// Receive consumed by an RDMA write with immediate.
    RecvRdmaImm = 129,
}

impl From<u32> for WcOpcode {
    fn from(opcode: u32) -> Self {
        match opcode {
            1 => WcOpcode::RdmaWrite,
            2 => WcOpcode::RdmaRead,
            128 => WcOpcode::Recv,
            129 => WcOpcode::RecvRdmaImm,
            _ => WcOpcode::Send,
        }
    }
}

/// Status of a completion queue entry.
///
/// Discriminants follow `enum ibv_wc_status`. Messages are borrowed from
/// [RDMAmojo](https://www.rdmamojo.com/2013/02/15/ibv_poll_cq/).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Error)]
#[repr(u32)]
pub enum WcStatus {
    #[default]
    #[error("success")]
    Success = 0,

    #[error("local length error")]
    LocLenErr = 1,

    #[error("local QP operation error")]
    LocQpOpErr = 2,

    /// The locally posted scatter/gather list does not reference a memory
    /// region that is valid for the requested operation.
    #[error("local protection error")]
    LocProtErr = 4,

    /// The work request was outstanding when the QP moved to the error state.
    #[error("WR flush error")]
    WrFlushErr = 5,

    #[error("bad response error")]
    BadRespErr = 7,

    #[error("local access error")]
    LocAccessErr = 8,

    /// The responder rejected the request, e.g. its QP does not permit
    /// remote writes.
    #[error("remote invalid request error")]
    RemInvReqErr = 9,

    /// Protection error on the remote buffer: bad rkey, missing permission,
    /// or an address range outside the remote memory region.
    #[error("remote access error")]
    RemAccessErr = 10,

    #[error("remote operation error")]
    RemOpErr = 11,

    /// The remote side never acknowledged. On the first message this usually
    /// means wrong connection attributes or a peer QP not yet in RTR.
    #[error("transport retry counter exceeded")]
    RetryExcErr = 12,

    /// The remote side had no receive posted for a message that consumes one.
    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr = 13,

    #[error("fatal error")]
    FatalErr = 19,

    #[error("response timeout error")]
    RespTimeoutErr = 20,

    #[error("general error")]
    GeneralErr = 21,
}

impl From<u32> for WcStatus {
    fn from(status: u32) -> Self {
        match status {
            0 => WcStatus::Success,
            1 => WcStatus::LocLenErr,
            2 => WcStatus::LocQpOpErr,
            4 => WcStatus::LocProtErr,
            5 => WcStatus::WrFlushErr,
            7 => WcStatus::BadRespErr,
            8 => WcStatus::LocAccessErr,
            9 => WcStatus::RemInvReqErr,
            10 => WcStatus::RemAccessErr,
            11 => WcStatus::RemOpErr,
            12 => WcStatus::RetryExcErr,
            13 => WcStatus::RnrRetryExcErr,
            19 => WcStatus::FatalErr,
            20 => WcStatus::RespTimeoutErr,
            _ => WcStatus::GeneralErr,
        }
    }
}

/// Work completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Wc {
    /// Identifier of the work request this completion belongs to.
    pub wr_id: WrId,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    /// Bytes transferred; meaningful for receive-side completions.
    pub byte_len: u32,
    /// Immediate data, if the completed operation carried any.
    pub imm: Option<ImmData>,
    /// Local QP number the completion was generated on.
    pub qp_num: Qpn,
    pub vendor_err: u32,
}

impl Wc {
    /// Return `Ok(self)` on success, or the status as an error.
    #[inline]
    pub fn ok(self) -> Result<Self, WcStatus> {
        match self.status {
            WcStatus::Success => Ok(self),
            status => Err(status),
        }
    }
}
