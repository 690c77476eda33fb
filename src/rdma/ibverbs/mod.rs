//! The hardware provider, calling into libibverbs.
//!
//! Resource handles keep their parents alive through `Arc`s, so a child is
//! always destroyed before the parent it was created from regardless of the
//! order the handles are dropped in.

use std::ffi::c_void;
use std::io;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use self::device::DeviceList;
use crate::bindings::*;
use crate::rdma::endpoint::SetupError;
use crate::rdma::gid::Gid;
use crate::rdma::perm::Permission;
use crate::rdma::qp::{QpAttr, QpAttrMask};
use crate::rdma::types::*;
use crate::rdma::verbs::*;
use crate::rdma::wc::{Wc, WcOpcode, WcStatus};
use crate::utils::interop::{from_c_ptr, from_c_ret};

mod device;

struct RawContext(NonNull<ibv_context>);
impl_ibv_wrapper_traits!(ibv_context, RawContext);

struct RawPd(NonNull<ibv_pd>);
impl_ibv_wrapper_traits!(ibv_pd, RawPd);

struct RawMr(NonNull<ibv_mr>);
impl_ibv_wrapper_traits!(ibv_mr, RawMr);

struct RawCq(NonNull<ibv_cq>);
impl_ibv_wrapper_traits!(ibv_cq, RawCq);

struct RawQp(NonNull<ibv_qp>);
impl_ibv_wrapper_traits!(ibv_qp, RawQp);

struct ContextInner {
    ctx: RawContext,
    name: String,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        // SAFETY: FFI.
        let ret = unsafe { ibv_close_device(self.ctx.as_ptr()) };
        if let Err(e) = from_c_ret(ret) {
            log::error!("failed to close device {}: {}", self.name, e);
        }
    }
}

/// Opened device context.
pub struct IbvContext(Arc<ContextInner>);

struct PdInner {
    pd: RawPd,
    _ctx: Arc<ContextInner>,
}

impl Drop for PdInner {
    fn drop(&mut self) {
        // SAFETY: FFI.
        let ret = unsafe { ibv_dealloc_pd(self.pd.as_ptr()) };
        if let Err(e) = from_c_ret(ret) {
            log::error!("failed to deallocate PD: {}", e);
        }
    }
}

/// Protection domain.
pub struct IbvPd(Arc<PdInner>);

/// Registered memory region.
pub struct IbvMr {
    mr: RawMr,
    _pd: Arc<PdInner>,
}

impl Drop for IbvMr {
    fn drop(&mut self) {
        // SAFETY: FFI.
        let ret = unsafe { ibv_dereg_mr(self.mr.as_ptr()) };
        if let Err(e) = from_c_ret(ret) {
            log::error!("failed to deregister MR: {}", e);
        }
    }
}

struct CqInner {
    cq: RawCq,
    _ctx: Arc<ContextInner>,
}

impl Drop for CqInner {
    fn drop(&mut self) {
        // SAFETY: FFI.
        let ret = unsafe { ibv_destroy_cq(self.cq.as_ptr()) };
        if let Err(e) = from_c_ret(ret) {
            log::error!("failed to destroy CQ: {}", e);
        }
    }
}

/// Completion queue.
pub struct IbvCq(Arc<CqInner>);

/// Reliable-connected queue pair.
pub struct IbvQp {
    qp: RawQp,
    _pd: Arc<PdInner>,
    _send_cq: Arc<CqInner>,
    _recv_cq: Arc<CqInner>,
}

impl Drop for IbvQp {
    fn drop(&mut self) {
        // SAFETY: FFI.
        let ret = unsafe { ibv_destroy_qp(self.qp.as_ptr()) };
        if let Err(e) = from_c_ret(ret) {
            log::error!("failed to destroy QP: {}", e);
        }
    }
}

/// Verbs provider backed by libibverbs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ibverbs;

fn to_ibv_qp_attr(attr: &QpAttr) -> ibv_qp_attr {
    // SAFETY: all-zero is a valid `ibv_qp_attr`.
    let mut raw: ibv_qp_attr = unsafe { mem::zeroed() };
    raw.qp_state = attr.qp_state as u32;
    raw.qp_access_flags = attr.access.bits();
    raw.pkey_index = attr.pkey_index;
    raw.port_num = attr.port_num;
    raw.path_mtu = attr.path_mtu as u32;
    raw.dest_qp_num = attr.dest_qpn;
    raw.rq_psn = attr.rq_psn;
    raw.sq_psn = attr.sq_psn;
    raw.max_dest_rd_atomic = attr.max_dest_rd_atomic;
    raw.max_rd_atomic = attr.max_rd_atomic;
    raw.min_rnr_timer = attr.min_rnr_timer;
    raw.timeout = attr.timeout;
    raw.retry_cnt = attr.retry_cnt;
    raw.rnr_retry = attr.rnr_retry;

    let ah = &attr.ah;
    raw.ah_attr.dlid = ah.dlid;
    raw.ah_attr.sl = ah.sl;
    raw.ah_attr.src_path_bits = ah.src_path_bits;
    raw.ah_attr.port_num = ah.port_num;
    raw.ah_attr.is_global = ah.is_global as u8;
    raw.ah_attr.grh.dgid.raw = ah.grh.dgid.raw();
    raw.ah_attr.grh.flow_label = ah.grh.flow_label;
    raw.ah_attr.grh.sgid_index = ah.grh.sgid_index;
    raw.ah_attr.grh.hop_limit = ah.grh.hop_limit;
    raw.ah_attr.grh.traffic_class = ah.grh.traffic_class;
    raw
}

fn from_ibv_wc(wc: &ibv_wc) -> Wc {
    let imm = if wc.wc_flags & ibv_wc_flags::IBV_WC_WITH_IMM.0 != 0 {
        // SAFETY: the flag says the union holds immediate data.
        Some(u32::from_be(unsafe { wc.__bindgen_anon_1.imm_data }))
    } else {
        None
    };
    Wc {
        wr_id: wc.wr_id,
        status: WcStatus::from(wc.status),
        opcode: WcOpcode::from(wc.opcode),
        byte_len: wc.byte_len,
        imm,
        qp_num: wc.qp_num,
        vendor_err: wc.vendor_err,
    }
}

fn to_ibv_sge(sge: &Sge) -> ibv_sge {
    ibv_sge {
        addr: sge.addr,
        length: sge.length,
        lkey: sge.lkey,
    }
}

impl Verbs for Ibverbs {
    type Context = IbvContext;
    type Pd = IbvPd;
    type Mr = IbvMr;
    type Cq = IbvCq;
    type Qp = IbvQp;

    fn open_device(&self, name: Option<&str>) -> Result<IbvContext, SetupError> {
        let list = DeviceList::new().map_err(|source| SetupError::OpenDevice {
            name: name.unwrap_or("(any)").to_owned(),
            source,
        })?;
        let devices = list.as_slice();
        let dev = match name {
            None => devices.first().ok_or(SetupError::NoDevice)?,
            Some(name) => devices
                .iter()
                .find(|dev| dev.name() == name)
                .ok_or_else(|| SetupError::DeviceNotFound(name.to_owned()))?,
        };
        let dev_name = dev.name();

        // SAFETY: FFI; the device list is still alive.
        let ctx = from_c_ptr(unsafe { ibv_open_device(dev.as_raw()) }).map_err(|source| {
            SetupError::OpenDevice {
                name: dev_name.clone(),
                source,
            }
        })?;
        Ok(IbvContext(Arc::new(ContextInner {
            ctx: RawContext::from(ctx),
            name: dev_name,
        })))
    }

    fn device_name(&self, ctx: &IbvContext) -> String {
        ctx.0.name.clone()
    }

    fn alloc_pd(&self, ctx: &IbvContext) -> io::Result<IbvPd> {
        // SAFETY: FFI.
        let pd = from_c_ptr(unsafe { ibv_alloc_pd(ctx.0.ctx.as_ptr()) })?;
        Ok(IbvPd(Arc::new(PdInner {
            pd: RawPd::from(pd),
            _ctx: ctx.0.clone(),
        })))
    }

    unsafe fn reg_mr(
        &self,
        pd: &IbvPd,
        addr: *mut u8,
        len: usize,
        perm: Permission,
    ) -> io::Result<IbvMr> {
        let mr = from_c_ptr(ibv_reg_mr(
            pd.0.pd.as_ptr(),
            addr.cast::<c_void>(),
            len,
            perm.into(),
        ))?;
        Ok(IbvMr {
            mr: RawMr::from(mr),
            _pd: pd.0.clone(),
        })
    }

    fn lkey(&self, mr: &IbvMr) -> LKey {
        // SAFETY: the MR is alive.
        unsafe { (*mr.mr.as_ptr()).lkey }
    }

    fn rkey(&self, mr: &IbvMr) -> RKey {
        // SAFETY: the MR is alive.
        unsafe { (*mr.mr.as_ptr()).rkey }
    }

    fn create_cq(&self, ctx: &IbvContext, depth: u32) -> io::Result<IbvCq> {
        let cqe = i32::try_from(depth).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        // SAFETY: FFI.
        let cq = from_c_ptr(unsafe {
            ibv_create_cq(
                ctx.0.ctx.as_ptr(),
                cqe,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            )
        })?;
        Ok(IbvCq(Arc::new(CqInner {
            cq: RawCq::from(cq),
            _ctx: ctx.0.clone(),
        })))
    }

    fn create_qp(
        &self,
        pd: &IbvPd,
        send_cq: &IbvCq,
        recv_cq: &IbvCq,
        caps: &QpCaps,
    ) -> io::Result<IbvQp> {
        // SAFETY: all-zero is a valid `ibv_qp_init_attr`.
        let mut init_attr: ibv_qp_init_attr = unsafe { mem::zeroed() };
        init_attr.send_cq = send_cq.0.cq.as_ptr();
        init_attr.recv_cq = recv_cq.0.cq.as_ptr();
        init_attr.cap = ibv_qp_cap {
            max_send_wr: caps.max_send_wr,
            max_recv_wr: caps.max_recv_wr,
            max_send_sge: caps.max_send_sge,
            max_recv_sge: caps.max_recv_sge,
            max_inline_data: caps.max_inline_data,
        };
        init_attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        init_attr.sq_sig_all = 0;

        // SAFETY: FFI.
        let qp = from_c_ptr(unsafe { ibv_create_qp(pd.0.pd.as_ptr(), &mut init_attr) })?;
        Ok(IbvQp {
            qp: RawQp::from(qp),
            _pd: pd.0.clone(),
            _send_cq: send_cq.0.clone(),
            _recv_cq: recv_cq.0.clone(),
        })
    }

    fn qp_num(&self, qp: &IbvQp) -> Qpn {
        // SAFETY: the QP is alive.
        unsafe { (*qp.qp.as_ptr()).qp_num }
    }

    fn query_port(&self, ctx: &IbvContext, port: PortNum) -> io::Result<PortAttr> {
        // SAFETY: all-zero is a valid `ibv_port_attr`.
        let mut attr: ibv_port_attr = unsafe { mem::zeroed() };
        // SAFETY: FFI.
        from_c_ret(unsafe { ___ibv_query_port(ctx.0.ctx.as_ptr(), port, &mut attr) })?;
        Ok(PortAttr {
            lid: attr.lid,
            active: attr.state == ibv_port_state::IBV_PORT_ACTIVE,
        })
    }

    fn query_gid(&self, ctx: &IbvContext, port: PortNum, index: GidIndex) -> io::Result<Gid> {
        // SAFETY: all-zero is a valid `ibv_gid`.
        let mut gid: ibv_gid = unsafe { mem::zeroed() };
        // SAFETY: FFI.
        let ret = unsafe { ibv_query_gid(ctx.0.ctx.as_ptr(), port, index as i32, &mut gid) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: every bit pattern is a valid raw GID.
        Ok(Gid::from(unsafe { gid.raw }))
    }

    fn modify_qp(&self, qp: &IbvQp, attr: &QpAttr, mask: QpAttrMask) -> io::Result<()> {
        let mut raw = to_ibv_qp_attr(attr);
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_modify_qp(qp.qp.as_ptr(), &mut raw, mask.bits() as i32) })
    }

    unsafe fn post_send(&self, qp: &IbvQp, wr: &SendWr) -> io::Result<()> {
        let mut sge = to_ibv_sge(&wr.sge);
        let mut raw: ibv_send_wr = mem::zeroed();
        raw.wr_id = wr.wr_id;
        raw.sg_list = &mut sge;
        raw.num_sge = 1;
        raw.wr.rdma.remote_addr = wr.remote.addr;
        raw.wr.rdma.rkey = wr.remote.rkey;
        raw.opcode = match wr.imm {
            Some(imm) => {
                raw.__bindgen_anon_1.imm_data = imm.to_be();
                ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM
            }
            None => ibv_wr_opcode::IBV_WR_RDMA_WRITE,
        };
        if wr.signaled {
            raw.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        }

        let mut bad_wr = ptr::null_mut();
        from_c_ret(ibv_post_send(qp.qp.as_ptr(), &mut raw, &mut bad_wr))
    }

    unsafe fn post_recv(&self, qp: &IbvQp, wr: &RecvWr) -> io::Result<()> {
        let mut sge = wr.sge.as_ref().map(to_ibv_sge);
        let mut raw: ibv_recv_wr = mem::zeroed();
        raw.wr_id = wr.wr_id;
        if let Some(sge) = sge.as_mut() {
            raw.sg_list = sge;
            raw.num_sge = 1;
        }

        let mut bad_wr = ptr::null_mut();
        from_c_ret(ibv_post_recv(qp.qp.as_ptr(), &mut raw, &mut bad_wr))
    }

    fn poll_cq(&self, cq: &IbvCq, wc: &mut [Wc]) -> io::Result<usize> {
        const BATCH: usize = 16;

        // SAFETY: all-zero is a valid `ibv_wc`.
        let mut raw: [ibv_wc; BATCH] = unsafe { mem::zeroed() };
        let n = wc.len().min(BATCH);
        // SAFETY: FFI; `raw` holds at least `n` entries.
        let ret = unsafe { ibv_poll_cq(cq.0.cq.as_ptr(), n as i32, raw.as_mut_ptr()) };
        if ret < 0 {
            return Err(io::Error::other(format!("ibv_poll_cq returned {}", ret)));
        }
        let polled = ret as usize;
        for (dst, src) in wc.iter_mut().zip(&raw[..polled]) {
            *dst = from_ibv_wc(src);
        }
        Ok(polled)
    }
}
