use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::rdma::gid::Gid;
use crate::rdma::perm::Permission;
use crate::rdma::qp::{QpAttr, QpAttrMask, QpState};
use crate::rdma::types::*;
use crate::rdma::verbs::{QpCaps, RecvWr, SendWr};
use crate::rdma::wc::{Wc, WcOpcode, WcStatus};

use super::FaultStep;

/// The only port of every soft device.
pub(super) const SOFT_PORT: PortNum = 1;

pub(super) const MAX_QP_WR: u32 = 16384;
pub(super) const MAX_SGE: u32 = 30;
pub(super) const MAX_CQE: u32 = 65536;

const LKEY_TAG: u32 = 0x11;
const RKEY_TAG: u32 = 0x22;

pub(super) fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

#[derive(Debug, Clone)]
pub(super) struct DeviceEntry {
    pub name: String,
    pub lid: Lid,
    pub gid: Gid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Kind {
    Context,
    Pd,
    Mr,
    Cq,
    Qp,
}

#[derive(Debug)]
pub(super) struct MrEntry {
    pub pd: u32,
    pub addr: usize,
    pub len: usize,
    pub perm: Permission,
}

impl MrEntry {
    fn covers(&self, addr: u64, len: u32) -> bool {
        let (start, end) = (self.addr as u64, self.addr as u64 + self.len as u64);
        addr >= start && addr.checked_add(len as u64).is_some_and(|e| e <= end)
    }
}

#[derive(Debug)]
pub(super) struct CqEntry {
    pub ctx: u32,
    pub depth: u32,
    pub entries: VecDeque<Wc>,
}

#[derive(Debug)]
pub(super) struct QpEntry {
    pub device: usize,
    pub pd: u32,
    pub send_cq: u32,
    pub recv_cq: u32,
    pub caps: QpCaps,
    pub state: QpState,
    pub attr: QpAttr,
    pub recvs: VecDeque<RecvWr>,
}

/// Shared state of the software fabric: every device and every live
/// resource, across all users of a [`SoftVerbs`](super::SoftVerbs).
#[derive(Debug, Default)]
pub(super) struct Fabric {
    pub devices: Vec<DeviceEntry>,
    next_id: u32,
    next_qpn: Qpn,
    /// Context id to device index.
    pub contexts: HashMap<u32, usize>,
    /// PD id to context id.
    pub pds: HashMap<u32, u32>,
    pub mrs: HashMap<u32, MrEntry>,
    pub cqs: HashMap<u32, CqEntry>,
    pub qps: HashMap<Qpn, QpEntry>,
    /// Writes whose responder has not reached RTR yet, in posting order.
    /// The requester keeps retrying them, as an RC transport would.
    pending: Vec<(Qpn, SendWr)>,
    faults: Vec<(FaultStep, usize)>,
}

impl Fabric {
    pub fn new(devices: Vec<DeviceEntry>) -> Self {
        Self {
            devices,
            next_id: 1,
            next_qpn: 0x11,
            ..Default::default()
        }
    }

    pub fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn next_qpn(&mut self) -> Qpn {
        let qpn = self.next_qpn;
        self.next_qpn = (self.next_qpn + 1) & MASK_24;
        qpn
    }

    pub fn lkey_of(id: u32) -> LKey {
        (id << 8) | LKEY_TAG
    }

    pub fn rkey_of(id: u32) -> RKey {
        (id << 8) | RKEY_TAG
    }

    pub fn add_fault(&mut self, step: FaultStep, skip: usize) {
        self.faults.push((step, skip));
    }

    /// Fail this call of `step` if a fault is armed for it.
    pub fn inject(&mut self, step: FaultStep) -> io::Result<()> {
        let Some(i) = self.faults.iter().position(|(s, _)| *s == step) else {
            return Ok(());
        };
        match &mut self.faults[i].1 {
            0 => {
                self.faults.remove(i);
                log::debug!("injected failure at {:?}", step);
                Err(errno(step.errno()))
            }
            skip => {
                *skip -= 1;
                Ok(())
            }
        }
    }

    /// Remove a resource. Resources still referenced by children stay in
    /// place, as a failed destroy leaves them in a real device.
    pub fn destroy(&mut self, kind: Kind, id: u32) -> Result<(), &'static str> {
        let busy = match kind {
            Kind::Context => {
                self.pds.values().any(|ctx| *ctx == id) || self.cqs.values().any(|c| c.ctx == id)
            }
            Kind::Pd => {
                self.mrs.values().any(|m| m.pd == id) || self.qps.values().any(|q| q.pd == id)
            }
            Kind::Cq => self.qps.values().any(|q| q.send_cq == id || q.recv_cq == id),
            Kind::Mr | Kind::Qp => false,
        };
        if busy {
            return Err("resource still in use");
        }

        let removed = match kind {
            Kind::Context => self.contexts.remove(&id).is_some(),
            Kind::Pd => self.pds.remove(&id).is_some(),
            Kind::Mr => self.mrs.remove(&id).is_some(),
            Kind::Cq => self.cqs.remove(&id).is_some(),
            Kind::Qp => {
                self.pending.retain(|(qpn, _)| *qpn != id);
                self.qps.remove(&id).is_some()
            }
        };
        removed.then_some(()).ok_or("resource already destroyed")
    }

    fn push_cqe(&mut self, cq: u32, wc: Wc) {
        let Some(cq) = self.cqs.get_mut(&cq) else {
            return;
        };
        if cq.entries.len() >= cq.depth as usize {
            log::warn!("soft CQ overrun (depth {})", cq.depth);
        }
        cq.entries.push_back(wc);
    }

    /// Move a QP to the error state, flushing its posted receives.
    fn fail_qp(&mut self, qpn: Qpn) {
        let Some(qp) = self.qps.get_mut(&qpn) else {
            return;
        };
        qp.state = QpState::Error;
        let (send_cq, recv_cq) = (qp.send_cq, qp.recv_cq);
        let flushed = qp.recvs.drain(..).collect::<Vec<_>>();

        let mut unsent = Vec::new();
        self.pending.retain(|(src, wr)| {
            if *src == qpn {
                unsent.push(*wr);
            }
            *src != qpn
        });
        for wr in unsent {
            self.push_cqe(
                send_cq,
                Wc {
                    wr_id: wr.wr_id,
                    status: WcStatus::WrFlushErr,
                    opcode: WcOpcode::RdmaWrite,
                    qp_num: qpn,
                    ..Default::default()
                },
            );
        }
        for wr in flushed {
            self.push_cqe(
                recv_cq,
                Wc {
                    wr_id: wr.wr_id,
                    status: WcStatus::WrFlushErr,
                    opcode: WcOpcode::Recv,
                    qp_num: qpn,
                    ..Default::default()
                },
            );
        }
    }

    /// Apply a QP modify following the verbs state table.
    pub fn modify_qp(&mut self, qpn: Qpn, attr: &QpAttr, mask: QpAttrMask) -> io::Result<()> {
        let qp = self.qps.get_mut(&qpn).ok_or_else(|| errno(libc::EINVAL))?;
        if !mask.contains(QpAttrMask::STATE) {
            return Err(errno(libc::EINVAL));
        }

        use QpState::*;
        let (cur, next) = (qp.state, attr.qp_state);
        let required = match (cur, next) {
            (_, Reset) | (_, Error) => QpAttrMask::STATE,
            (Reset, Init) => QpAttrMask::RESET_TO_INIT,
            (Init, Init) | (Rts, Rts) => QpAttrMask::STATE,
            (Init, Rtr) => QpAttrMask::INIT_TO_RTR,
            (Rtr, Rts) => QpAttrMask::RTR_TO_RTS,
            _ => return Err(errno(libc::EINVAL)),
        };
        if !mask.contains(required) {
            return Err(errno(libc::EINVAL));
        }
        if mask.contains(QpAttrMask::PORT) && attr.port_num != SOFT_PORT {
            return Err(errno(libc::EINVAL));
        }
        if mask.contains(QpAttrMask::AV) {
            let ah = &attr.ah;
            if ah.port_num != SOFT_PORT || (ah.is_global && ah.grh.sgid_index != 0) {
                return Err(errno(libc::EINVAL));
            }
        }

        let dst = &mut qp.attr;
        if mask.contains(QpAttrMask::ACCESS_FLAGS) {
            dst.access = attr.access;
        }
        if mask.contains(QpAttrMask::PKEY_INDEX) {
            dst.pkey_index = attr.pkey_index;
        }
        if mask.contains(QpAttrMask::PORT) {
            dst.port_num = attr.port_num;
        }
        if mask.contains(QpAttrMask::AV) {
            dst.ah = attr.ah;
        }
        if mask.contains(QpAttrMask::PATH_MTU) {
            dst.path_mtu = attr.path_mtu;
        }
        if mask.contains(QpAttrMask::DEST_QPN) {
            dst.dest_qpn = attr.dest_qpn;
        }
        if mask.contains(QpAttrMask::RQ_PSN) {
            dst.rq_psn = attr.rq_psn & MASK_24;
        }
        if mask.contains(QpAttrMask::SQ_PSN) {
            dst.sq_psn = attr.sq_psn & MASK_24;
        }
        if mask.contains(QpAttrMask::MAX_DEST_RD_ATOMIC) {
            dst.max_dest_rd_atomic = attr.max_dest_rd_atomic;
        }
        if mask.contains(QpAttrMask::MIN_RNR_TIMER) {
            dst.min_rnr_timer = attr.min_rnr_timer;
        }
        if mask.contains(QpAttrMask::TIMEOUT) {
            dst.timeout = attr.timeout;
        }
        if mask.contains(QpAttrMask::RETRY_CNT) {
            dst.retry_cnt = attr.retry_cnt;
        }
        if mask.contains(QpAttrMask::RNR_RETRY) {
            dst.rnr_retry = attr.rnr_retry;
        }
        if mask.contains(QpAttrMask::MAX_QP_RD_ATOMIC) {
            dst.max_rd_atomic = attr.max_rd_atomic;
        }
        dst.qp_state = next;

        match next {
            Reset => {
                qp.state = Reset;
                qp.attr = QpAttr::default();
                qp.recvs.clear();
            }
            Error => self.fail_qp(qpn),
            Rtr => {
                qp.state = Rtr;
                // SAFETY: posters keep their buffers valid until completion.
                unsafe { self.retry_pending() };
            }
            _ => qp.state = next,
        }
        Ok(())
    }

    pub fn post_recv(&mut self, qpn: Qpn, wr: &RecvWr) -> io::Result<()> {
        let qp = self.qps.get_mut(&qpn).ok_or_else(|| errno(libc::EINVAL))?;
        if qp.state == QpState::Reset {
            return Err(errno(libc::EINVAL));
        }
        if qp.recvs.len() >= qp.caps.max_recv_wr as usize {
            return Err(errno(libc::ENOMEM));
        }
        qp.recvs.push_back(*wr);
        Ok(())
    }

    /// Execute an RDMA write from `qpn`, generating completions the way an
    /// RC requester and responder would.
    ///
    /// # Safety
    ///
    /// The local SGE must describe readable memory, as promised by the
    /// caller of `post_send`.
    pub unsafe fn post_send(&mut self, qpn: Qpn, wr: &SendWr) -> io::Result<()> {
        let qp = self.qps.get(&qpn).ok_or_else(|| errno(libc::EINVAL))?;
        if qp.state != QpState::Rts {
            return Err(errno(libc::EINVAL));
        }
        if self.pending.iter().any(|(src, _)| *src == qpn) {
            // Keep the send queue in order behind the writes being retried.
            self.pending.push((qpn, *wr));
            return Ok(());
        }
        self.complete_write(qpn, wr);
        Ok(())
    }

    /// Run every pending write whose responder became ready.
    ///
    /// # Safety
    ///
    /// Same as [`post_send`](Self::post_send), for every pending request.
    unsafe fn retry_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for (qpn, wr) in pending {
            if self.pending.iter().any(|(src, _)| *src == qpn) {
                self.pending.push((qpn, wr));
            } else {
                self.complete_write(qpn, &wr);
            }
        }
    }

    /// Execute a write and report its outcome on the send CQ, or park it if
    /// the responder is not ready.
    unsafe fn complete_write(&mut self, qpn: Qpn, wr: &SendWr) {
        let Some(send_cq) = self.qps.get(&qpn).map(|qp| qp.send_cq) else {
            return;
        };
        let Some(status) = self.execute_write(qpn, wr) else {
            log::debug!("soft write from QP {:#x} waits for its responder", qpn);
            self.pending.push((qpn, *wr));
            return;
        };
        if status != WcStatus::Success {
            log::debug!("soft write from QP {:#x} failed: {}", qpn, status);
            self.fail_qp(qpn);
        }
        if wr.signaled || status != WcStatus::Success {
            self.push_cqe(
                send_cq,
                Wc {
                    wr_id: wr.wr_id,
                    status,
                    opcode: WcOpcode::RdmaWrite,
                    byte_len: wr.sge.length,
                    qp_num: qpn,
                    ..Default::default()
                },
            );
        }
    }

    /// Perform the write. `None` means the responder exists but has not
    /// reached RTR yet, so the request must be retried later.
    unsafe fn execute_write(&mut self, qpn: Qpn, wr: &SendWr) -> Option<WcStatus> {
        let Some(src) = self.qps.get(&qpn) else {
            return Some(WcStatus::GeneralErr);
        };
        let (src_pd, src_attr) = (src.pd, src.attr);

        // Local protection.
        let local_ok = self.mrs.get(&(wr.sge.lkey >> 8)).is_some_and(|mr| {
            wr.sge.lkey == Self::lkey_of(wr.sge.lkey >> 8)
                && mr.pd == src_pd
                && mr.covers(wr.sge.addr, wr.sge.length)
        });
        if !local_ok {
            return Some(WcStatus::LocProtErr);
        }

        // Routing: the address vector must lead to a QP connected back to us.
        let dest_qpn = src_attr.dest_qpn;
        let Some(dst) = self.qps.get(&dest_qpn) else {
            return Some(WcStatus::RetryExcErr);
        };
        let device = &self.devices[dst.device];
        if device.lid != src_attr.ah.dlid
            || (src_attr.ah.is_global && device.gid != src_attr.ah.grh.dgid)
        {
            return Some(WcStatus::RetryExcErr);
        }
        if matches!(dst.state, QpState::Reset | QpState::Init) {
            return None;
        }
        let accepted = matches!(dst.state, QpState::Rtr | QpState::Rts)
            && dst.attr.dest_qpn == qpn
            && dst.attr.rq_psn == src_attr.sq_psn;
        if !accepted {
            return Some(WcStatus::RetryExcErr);
        }

        if !dst.attr.access.contains(Permission::REMOTE_WRITE) {
            return Some(WcStatus::RemInvReqErr);
        }
        let dst_pd = dst.pd;
        let remote_ok = self.mrs.get(&(wr.remote.rkey >> 8)).is_some_and(|mr| {
            wr.remote.rkey == Self::rkey_of(wr.remote.rkey >> 8)
                && mr.pd == dst_pd
                && mr.perm.contains(Permission::REMOTE_WRITE)
                && mr.covers(wr.remote.addr, wr.sge.length)
        });
        if !remote_ok {
            return Some(WcStatus::RemAccessErr);
        }
        if wr.imm.is_some() && dst.recvs.is_empty() {
            return Some(WcStatus::RnrRetryExcErr);
        }

        copy_bytes(wr.sge.addr as usize, wr.remote.addr as usize, wr.sge.length as usize);

        let Some(dst) = self.qps.get_mut(&dest_qpn) else {
            return Some(WcStatus::GeneralErr);
        };
        dst.attr.rq_psn = (dst.attr.rq_psn + 1) & MASK_24;
        let consumed = match wr.imm {
            Some(_) => dst.recvs.pop_front().map(|recv| (dst.recv_cq, recv)),
            None => None,
        };
        if let Some(src) = self.qps.get_mut(&qpn) {
            src.attr.sq_psn = (src.attr.sq_psn + 1) & MASK_24;
        }
        if let Some((recv_cq, recv)) = consumed {
            self.push_cqe(
                recv_cq,
                Wc {
                    wr_id: recv.wr_id,
                    status: WcStatus::Success,
                    opcode: WcOpcode::RecvRdmaImm,
                    byte_len: wr.sge.length,
                    imm: wr.imm,
                    qp_num: dest_qpn,
                    vendor_err: 0,
                },
            );
        }
        Some(WcStatus::Success)
    }

    pub fn poll_cq(&mut self, cq: u32, wc: &mut [Wc]) -> io::Result<usize> {
        let cq = self.cqs.get_mut(&cq).ok_or_else(|| errno(libc::EINVAL))?;
        let n = wc.len().min(cq.entries.len());
        for (slot, entry) in wc.iter_mut().zip(cq.entries.drain(..n)) {
            *slot = entry;
        }
        Ok(n)
    }
}

/// Copy `len` bytes between registered buffers that other threads may be
/// polling. The first destination byte is stored last, so a reader that
/// sees it non-zero sees the whole write.
///
/// # Safety
///
/// Both ranges must be valid for `len` bytes.
unsafe fn copy_bytes(src: usize, dst: usize, len: usize) {
    if len == 0 {
        return;
    }
    let src = std::slice::from_raw_parts(src as *const AtomicU8, len);
    let dst = std::slice::from_raw_parts(dst as *const AtomicU8, len);
    for i in 1..len {
        dst[i].store(src[i].load(Ordering::Relaxed), Ordering::Relaxed);
    }
    dst[0].store(src[0].load(Ordering::Relaxed), Ordering::Release);
}
