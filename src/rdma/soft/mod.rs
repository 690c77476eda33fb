//! An in-process software RDMA fabric.
//!
//! [`SoftVerbs`] implements [`Verbs`] without any hardware. All clones of
//! one `SoftVerbs` share a fabric, so endpoints created from clones (even on
//! different threads) can connect to each other and perform real RDMA writes
//! into each other's registered memory.
//!
//! The fabric enforces what a device would: the QP state table with the
//! attribute masks each transition requires, memory-region bounds and
//! permissions, protection-domain matching, PSN agreement between the two
//! ends, and receive consumption by writes with immediate. Failed operations
//! surface as error completions and move the QP to the error state.
//!
//! Two testing aids come on top: [`SoftVerbs::fail_nth`] arms a failure at a
//! chosen step, and [`SoftVerbs::live`] counts resources not yet released.

use std::fmt;
use std::io;
use std::net::Ipv6Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use self::fabric::*;
use crate::rdma::endpoint::SetupError;
use crate::rdma::gid::Gid;
use crate::rdma::perm::Permission;
use crate::rdma::qp::{QpAttr, QpAttrMask, QpState};
use crate::rdma::types::*;
use crate::rdma::verbs::*;
use crate::rdma::wc::Wc;

mod fabric;

/// A step of the verbs interface at which a failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultStep {
    OpenDevice,
    AllocPd,
    RegMr,
    CreateCq,
    CreateQp,
    ModifyQp,
    QueryPort,
    QueryGid,
    PostSend,
    PostRecv,
}

impl FaultStep {
    fn errno(self) -> i32 {
        match self {
            FaultStep::OpenDevice => libc::ENODEV,
            FaultStep::AllocPd | FaultStep::RegMr | FaultStep::CreateCq | FaultStep::CreateQp => {
                libc::ENOMEM
            }
            FaultStep::ModifyQp | FaultStep::PostSend | FaultStep::PostRecv => libc::EINVAL,
            FaultStep::QueryPort | FaultStep::QueryGid => libc::EIO,
        }
    }
}

/// Number of live resources of each kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveResources {
    pub contexts: usize,
    pub pds: usize,
    pub mrs: usize,
    pub cqs: usize,
    pub qps: usize,
}

impl LiveResources {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Software verbs provider. Cheap to clone; clones share one fabric.
#[derive(Clone)]
pub struct SoftVerbs {
    fabric: Arc<Mutex<Fabric>>,
}

impl fmt::Debug for SoftVerbs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftVerbs")
            .field("live", &self.live())
            .finish()
    }
}

impl Default for SoftVerbs {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftVerbs {
    /// A fabric with a single device, `soft0`.
    pub fn new() -> Self {
        Self::with_devices(1)
    }

    /// A fabric with `n` devices named `soft0`, `soft1`, ..., each with one
    /// active port. Device `i` has LID `i + 1` and a link-local GID.
    pub fn with_devices(n: usize) -> Self {
        let devices = (0..n)
            .map(|i| DeviceEntry {
                name: format!("soft{}", i),
                lid: (i + 1) as Lid,
                gid: Gid::from(
                    Ipv6Addr::new(0xfe80, 0, 0, 0, 0x0200, 0x5eff, 0xfe00, i as u16 + 1).octets(),
                ),
            })
            .collect();
        Self {
            fabric: Arc::new(Mutex::new(Fabric::new(devices))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Fabric> {
        self.fabric.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the `n`-th upcoming call (0-based) of `step` fail.
    pub fn fail_nth(&self, step: FaultStep, n: usize) {
        self.lock().add_fault(step, n);
    }

    /// Make the next call of `step` fail.
    pub fn fail_next(&self, step: FaultStep) {
        self.fail_nth(step, 0);
    }

    /// Count the resources that have not been released.
    pub fn live(&self) -> LiveResources {
        let f = self.lock();
        LiveResources {
            contexts: f.contexts.len(),
            pds: f.pds.len(),
            mrs: f.mrs.len(),
            cqs: f.cqs.len(),
            qps: f.qps.len(),
        }
    }

    /// State of the QP numbered `qpn` as the fabric sees it.
    pub fn qp_state(&self, qpn: Qpn) -> Option<QpState> {
        self.lock().qps.get(&qpn).map(|qp| qp.state)
    }

    fn slot(&self, kind: Kind, id: u32) -> Slot {
        Slot {
            fabric: self.fabric.clone(),
            kind,
            id,
        }
    }
}

/// Ownership of one fabric resource. Destroys it on drop.
struct Slot {
    fabric: Arc<Mutex<Fabric>>,
    kind: Kind,
    id: u32,
}

impl Drop for Slot {
    fn drop(&mut self) {
        let mut f = self.fabric.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = f.destroy(self.kind, self.id) {
            log::error!("cannot destroy soft {:?} {:#x}: {}", self.kind, self.id, e);
        }
    }
}

/// Opened soft device.
pub struct SoftContext {
    slot: Slot,
    device: usize,
}

/// Soft protection domain.
pub struct SoftPd {
    slot: Slot,
    ctx: u32,
}

/// Soft memory region.
pub struct SoftMr {
    slot: Slot,
}

/// Soft completion queue.
pub struct SoftCq {
    slot: Slot,
    ctx: u32,
}

/// Soft reliable-connected queue pair.
pub struct SoftQp {
    slot: Slot,
}

impl Verbs for SoftVerbs {
    type Context = SoftContext;
    type Pd = SoftPd;
    type Mr = SoftMr;
    type Cq = SoftCq;
    type Qp = SoftQp;

    fn open_device(&self, name: Option<&str>) -> Result<SoftContext, SetupError> {
        let mut f = self.lock();
        let device = match name {
            None if f.devices.is_empty() => return Err(SetupError::NoDevice),
            None => 0,
            Some(name) => f
                .devices
                .iter()
                .position(|d| d.name == name)
                .ok_or_else(|| SetupError::DeviceNotFound(name.to_owned()))?,
        };
        if let Err(source) = f.inject(FaultStep::OpenDevice) {
            return Err(SetupError::OpenDevice {
                name: f.devices[device].name.clone(),
                source,
            });
        }

        let id = f.next_id();
        f.contexts.insert(id, device);
        drop(f);
        Ok(SoftContext {
            slot: self.slot(Kind::Context, id),
            device,
        })
    }

    fn device_name(&self, ctx: &SoftContext) -> String {
        self.lock().devices[ctx.device].name.clone()
    }

    fn alloc_pd(&self, ctx: &SoftContext) -> io::Result<SoftPd> {
        let mut f = self.lock();
        f.inject(FaultStep::AllocPd)?;
        let id = f.next_id();
        f.pds.insert(id, ctx.slot.id);
        drop(f);
        Ok(SoftPd {
            slot: self.slot(Kind::Pd, id),
            ctx: ctx.slot.id,
        })
    }

    unsafe fn reg_mr(
        &self,
        pd: &SoftPd,
        addr: *mut u8,
        len: usize,
        perm: Permission,
    ) -> io::Result<SoftMr> {
        // Remote write without local write is rejected by real devices too.
        if addr.is_null()
            || len == 0
            || (perm.contains(Permission::REMOTE_WRITE) && !perm.contains(Permission::LOCAL_WRITE))
        {
            return Err(errno(libc::EINVAL));
        }

        let mut f = self.lock();
        f.inject(FaultStep::RegMr)?;
        let id = f.next_id();
        f.mrs.insert(
            id,
            MrEntry {
                pd: pd.slot.id,
                addr: addr as usize,
                len,
                perm,
            },
        );
        drop(f);
        Ok(SoftMr {
            slot: self.slot(Kind::Mr, id),
        })
    }

    fn lkey(&self, mr: &SoftMr) -> LKey {
        Fabric::lkey_of(mr.slot.id)
    }

    fn rkey(&self, mr: &SoftMr) -> RKey {
        Fabric::rkey_of(mr.slot.id)
    }

    fn create_cq(&self, ctx: &SoftContext, depth: u32) -> io::Result<SoftCq> {
        if depth == 0 || depth > MAX_CQE {
            return Err(errno(libc::EINVAL));
        }
        let mut f = self.lock();
        f.inject(FaultStep::CreateCq)?;
        let id = f.next_id();
        f.cqs.insert(
            id,
            CqEntry {
                ctx: ctx.slot.id,
                depth,
                entries: Default::default(),
            },
        );
        drop(f);
        Ok(SoftCq {
            slot: self.slot(Kind::Cq, id),
            ctx: ctx.slot.id,
        })
    }

    fn create_qp(
        &self,
        pd: &SoftPd,
        send_cq: &SoftCq,
        recv_cq: &SoftCq,
        caps: &QpCaps,
    ) -> io::Result<SoftQp> {
        if caps.max_send_wr > MAX_QP_WR
            || caps.max_recv_wr > MAX_QP_WR
            || caps.max_send_sge > MAX_SGE
            || caps.max_recv_sge > MAX_SGE
            || send_cq.ctx != pd.ctx
            || recv_cq.ctx != pd.ctx
        {
            return Err(errno(libc::EINVAL));
        }

        let mut f = self.lock();
        f.inject(FaultStep::CreateQp)?;
        let device = f.contexts.get(&pd.ctx).copied().ok_or_else(|| errno(libc::EINVAL))?;
        let qpn = f.next_qpn();
        f.qps.insert(
            qpn,
            QpEntry {
                device,
                pd: pd.slot.id,
                send_cq: send_cq.slot.id,
                recv_cq: recv_cq.slot.id,
                caps: *caps,
                state: QpState::Reset,
                attr: QpAttr::default(),
                recvs: Default::default(),
            },
        );
        drop(f);
        Ok(SoftQp {
            slot: self.slot(Kind::Qp, qpn),
        })
    }

    fn qp_num(&self, qp: &SoftQp) -> Qpn {
        qp.slot.id
    }

    fn query_port(&self, ctx: &SoftContext, port: PortNum) -> io::Result<PortAttr> {
        let mut f = self.lock();
        f.inject(FaultStep::QueryPort)?;
        if port != SOFT_PORT {
            return Err(errno(libc::EINVAL));
        }
        Ok(PortAttr {
            lid: f.devices[ctx.device].lid,
            active: true,
        })
    }

    fn query_gid(&self, ctx: &SoftContext, port: PortNum, index: GidIndex) -> io::Result<Gid> {
        let mut f = self.lock();
        f.inject(FaultStep::QueryGid)?;
        if port != SOFT_PORT || index != 0 {
            return Err(errno(libc::EINVAL));
        }
        Ok(f.devices[ctx.device].gid)
    }

    fn modify_qp(&self, qp: &SoftQp, attr: &QpAttr, mask: QpAttrMask) -> io::Result<()> {
        let mut f = self.lock();
        f.inject(FaultStep::ModifyQp)?;
        f.modify_qp(qp.slot.id, attr, mask)
    }

    unsafe fn post_send(&self, qp: &SoftQp, wr: &SendWr) -> io::Result<()> {
        let mut f = self.lock();
        f.inject(FaultStep::PostSend)?;
        f.post_send(qp.slot.id, wr)
    }

    unsafe fn post_recv(&self, qp: &SoftQp, wr: &RecvWr) -> io::Result<()> {
        let mut f = self.lock();
        f.inject(FaultStep::PostRecv)?;
        f.post_recv(qp.slot.id, wr)
    }

    fn poll_cq(&self, cq: &SoftCq, wc: &mut [Wc]) -> io::Result<usize> {
        self.lock().poll_cq(cq.slot.id, wc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::info::ConnectionInfo;
    use crate::rdma::qp::PathParams;
    use crate::rdma::wc::{WcOpcode, WcStatus};
    use crate::utils::aligned_mem::AlignedMem;

    const PATH: PathParams = PathParams {
        port_num: 1,
        service_level: 1,
        sgid_index: 0,
    };

    /// One side of a soft connection, built by hand.
    struct Side {
        qp: SoftQp,
        cq: SoftCq,
        mr: SoftMr,
        _pd: SoftPd,
        ctx: SoftContext,
        mem: AlignedMem,
    }

    impl Side {
        fn new(v: &SoftVerbs, device: &str) -> Side {
            let mem = AlignedMem::zeroed(4096).unwrap();
            let ctx = v.open_device(Some(device)).unwrap();
            let pd = v.alloc_pd(&ctx).unwrap();
            let mr = unsafe {
                v.reg_mr(
                    &pd,
                    mem.addr(),
                    mem.len(),
                    Permission::LOCAL_WRITE | Permission::REMOTE_WRITE,
                )
            }
            .unwrap();
            let cq = v.create_cq(&ctx, 16).unwrap();
            let qp = v.create_qp(&pd, &cq, &cq, &QpCaps::for_tx_depth(16)).unwrap();
            Side {
                qp,
                cq,
                mr,
                _pd: pd,
                ctx,
                mem,
            }
        }

        fn info(&self, v: &SoftVerbs, psn: Psn) -> ConnectionInfo {
            ConnectionInfo {
                lid: v.query_port(&self.ctx, 1).unwrap().lid,
                qpn: v.qp_num(&self.qp),
                psn,
                rkey: v.rkey(&self.mr),
                vaddr: self.mem.addr() as u64 + 2048,
                gid: v.query_gid(&self.ctx, 1, 0).unwrap(),
            }
        }

        fn modify(&self, v: &SoftVerbs, (attr, mask): (QpAttr, QpAttrMask)) -> io::Result<()> {
            v.modify_qp(&self.qp, &attr, mask)
        }

        fn sge(&self, v: &SoftVerbs, len: u32) -> Sge {
            Sge {
                addr: self.mem.addr() as u64,
                length: len,
                lkey: v.lkey(&self.mr),
            }
        }

        fn poll(&self, v: &SoftVerbs) -> Option<Wc> {
            let mut wc = [Wc::default()];
            (v.poll_cq(&self.cq, &mut wc).unwrap() == 1).then_some(wc[0])
        }
    }

    /// Two sides on two devices, `a` in RTS and `b` in RTR.
    fn connected(v: &SoftVerbs) -> (Side, Side) {
        let (a, b) = (Side::new(v, "soft0"), Side::new(v, "soft1"));
        let (ia, ib) = (a.info(v, 100), b.info(v, 200));
        for side in [&a, &b] {
            side.modify(v, QpAttr::reset_to_init(1)).unwrap();
        }
        a.modify(v, QpAttr::init_to_rtr(&ib, &PATH)).unwrap();
        b.modify(v, QpAttr::init_to_rtr(&ia, &PATH)).unwrap();
        a.modify(v, QpAttr::rtr_to_rts(ia.psn)).unwrap();
        (a, b)
    }

    #[test]
    fn state_table_requires_masks() {
        let v = SoftVerbs::new();
        let a = Side::new(&v, "soft0");
        let info = a.info(&v, 1);

        // Skipping INIT.
        let err = a.modify(&v, QpAttr::init_to_rtr(&info, &PATH)).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));

        // Missing PORT in the mask.
        let (attr, _) = QpAttr::reset_to_init(1);
        let mask = QpAttrMask::STATE | QpAttrMask::ACCESS_FLAGS | QpAttrMask::PKEY_INDEX;
        assert!(v.modify_qp(&a.qp, &attr, mask).is_err());

        // Nonexistent port.
        assert!(a.modify(&v, QpAttr::reset_to_init(2)).is_err());

        a.modify(&v, QpAttr::reset_to_init(1)).unwrap();
        assert_eq!(v.qp_state(v.qp_num(&a.qp)), Some(QpState::Init));
        assert!(a.modify(&v, QpAttr::rtr_to_rts(1)).is_err());
    }

    #[test]
    fn write_lands_in_peer_memory() {
        let v = SoftVerbs::with_devices(2);
        let (a, b) = connected(&v);
        a.mem.store(0, b"hello\0");

        let ib = b.info(&v, 200);
        let wr = SendWr::rdma_write(
            7,
            a.sge(&v, 6),
            RemoteTarget {
                addr: ib.vaddr,
                rkey: ib.rkey,
            },
        );
        unsafe { v.post_send(&a.qp, &wr) }.unwrap();

        let wc = a.poll(&v).unwrap();
        assert_eq!(
            (wc.wr_id, wc.status, wc.opcode),
            (7, WcStatus::Success, WcOpcode::RdmaWrite)
        );
        assert_eq!(b.mem.load_until_nul(2048..4096), b"hello");
        assert!(b.poll(&v).is_none());
    }

    #[test]
    fn bad_rkey_is_a_remote_access_error() {
        let v = SoftVerbs::with_devices(2);
        let (a, b) = connected(&v);
        let ib = b.info(&v, 200);

        // The lkey is not a valid rkey.
        let wr = SendWr::rdma_write(
            1,
            a.sge(&v, 8),
            RemoteTarget {
                addr: ib.vaddr,
                rkey: v.lkey(&b.mr),
            },
        );
        unsafe { v.post_send(&a.qp, &wr) }.unwrap();
        assert_eq!(a.poll(&v).unwrap().status, WcStatus::RemAccessErr);
        assert_eq!(v.qp_state(v.qp_num(&a.qp)), Some(QpState::Error));
    }

    #[test]
    fn write_past_region_end_rejected() {
        let v = SoftVerbs::with_devices(2);
        let (a, b) = connected(&v);
        let ib = b.info(&v, 200);
        let wr = SendWr::rdma_write(
            1,
            a.sge(&v, 4096),
            RemoteTarget {
                addr: ib.vaddr,
                rkey: ib.rkey,
            },
        );
        unsafe { v.post_send(&a.qp, &wr) }.unwrap();
        assert_eq!(a.poll(&v).unwrap().status, WcStatus::RemAccessErr);
    }

    #[test]
    fn psn_mismatch_never_acknowledged() {
        let v = SoftVerbs::with_devices(2);
        let (a, b) = (Side::new(&v, "soft0"), Side::new(&v, "soft1"));
        let (ia, ib) = (a.info(&v, 100), b.info(&v, 200));
        a.modify(&v, QpAttr::reset_to_init(1)).unwrap();
        b.modify(&v, QpAttr::reset_to_init(1)).unwrap();
        a.modify(&v, QpAttr::init_to_rtr(&ib, &PATH)).unwrap();
        b.modify(&v, QpAttr::init_to_rtr(&ia, &PATH)).unwrap();
        // Sends from a PSN other than the one advertised.
        a.modify(&v, QpAttr::rtr_to_rts(ia.psn + 1)).unwrap();

        let wr = SendWr::rdma_write(
            1,
            a.sge(&v, 8),
            RemoteTarget {
                addr: ib.vaddr,
                rkey: ib.rkey,
            },
        );
        unsafe { v.post_send(&a.qp, &wr) }.unwrap();
        assert_eq!(a.poll(&v).unwrap().status, WcStatus::RetryExcErr);
    }

    #[test]
    fn write_waits_for_responder_rtr() {
        let v = SoftVerbs::with_devices(2);
        let (a, b) = (Side::new(&v, "soft0"), Side::new(&v, "soft1"));
        let (ia, ib) = (a.info(&v, 100), b.info(&v, 200));
        a.modify(&v, QpAttr::reset_to_init(1)).unwrap();
        b.modify(&v, QpAttr::reset_to_init(1)).unwrap();
        a.modify(&v, QpAttr::init_to_rtr(&ib, &PATH)).unwrap();
        a.modify(&v, QpAttr::rtr_to_rts(ia.psn)).unwrap();

        a.mem.store(0, b"early");
        let wr = SendWr::rdma_write(
            1,
            a.sge(&v, 5),
            RemoteTarget {
                addr: ib.vaddr,
                rkey: ib.rkey,
            },
        );
        unsafe { v.post_send(&a.qp, &wr) }.unwrap();
        assert!(a.poll(&v).is_none());
        assert_eq!(b.mem.load_byte(2048), 0);

        b.modify(&v, QpAttr::init_to_rtr(&ia, &PATH)).unwrap();
        assert!(a.poll(&v).unwrap().ok().is_ok());
        assert_eq!(b.mem.load_until_nul(2048..4096), b"early");
    }

    #[test]
    fn write_with_imm_consumes_receive() {
        let v = SoftVerbs::with_devices(2);
        let (a, b) = connected(&v);
        let ib = b.info(&v, 200);
        let wr = SendWr::rdma_write(
            1,
            a.sge(&v, 8),
            RemoteTarget {
                addr: ib.vaddr,
                rkey: ib.rkey,
            },
        )
        .with_imm(Some(0xfeed));

        // No receive posted yet.
        unsafe { v.post_send(&a.qp, &wr) }.unwrap();
        assert_eq!(a.poll(&v).unwrap().status, WcStatus::RnrRetryExcErr);

        let v = SoftVerbs::with_devices(2);
        let (a, b) = connected(&v);
        let ib = b.info(&v, 200);
        let wr = SendWr {
            sge: a.sge(&v, 8),
            remote: RemoteTarget {
                addr: ib.vaddr,
                rkey: ib.rkey,
            },
            ..wr
        };
        unsafe { v.post_recv(&b.qp, &RecvWr { wr_id: 9, sge: None }) }.unwrap();
        unsafe { v.post_send(&a.qp, &wr) }.unwrap();
        assert!(a.poll(&v).unwrap().ok().is_ok());
        let wc = b.poll(&v).unwrap();
        assert_eq!(wc.wr_id, 9);
        assert_eq!(wc.opcode, WcOpcode::RecvRdmaImm);
        assert_eq!(wc.imm, Some(0xfeed));
        assert_eq!(wc.byte_len, 8);
    }

    #[test]
    fn post_send_requires_rts() {
        let v = SoftVerbs::with_devices(2);
        let (a, b) = connected(&v);
        let target = RemoteTarget {
            addr: a.mem.addr() as u64,
            rkey: v.rkey(&a.mr),
        };
        let wr = SendWr::rdma_write(1, b.sge(&v, 8), target);
        let err = unsafe { v.post_send(&b.qp, &wr) }.unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn busy_parent_is_not_destroyed() {
        let v = SoftVerbs::new();
        let ctx = v.open_device(None).unwrap();
        let pd = v.alloc_pd(&ctx).unwrap();
        let cq = v.create_cq(&ctx, 1).unwrap();
        assert_eq!(v.live().pds, 1);

        // Dropping the context first fails and leaves it in place.
        drop(ctx);
        assert_eq!(v.live().contexts, 1);
        drop(cq);
        drop(pd);
        assert_eq!(v.live().contexts, 1);
    }

    #[test]
    fn faults_fire_once_at_the_chosen_call() {
        let v = SoftVerbs::new();
        v.fail_nth(FaultStep::CreateCq, 1);
        let ctx = v.open_device(None).unwrap();
        let first = v.create_cq(&ctx, 1);
        let second = v.create_cq(&ctx, 1);
        let third = v.create_cq(&ctx, 1);
        assert!(first.is_ok());
        assert_eq!(second.err().and_then(|e| e.raw_os_error()), Some(libc::ENOMEM));
        assert!(third.is_ok());

        assert!(matches!(
            v.open_device(Some("mlx5_0")),
            Err(SetupError::DeviceNotFound(_))
        ));
        assert!(matches!(
            SoftVerbs::with_devices(0).open_device(None),
            Err(SetupError::NoDevice)
        ));
    }
}
