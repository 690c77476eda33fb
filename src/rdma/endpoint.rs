//! All local RDMA resources of one connection.

use std::{fmt, io};

use rand::Rng;
use thiserror::Error;

use super::info::ConnectionInfo;
use super::perm::Permission;
use super::qp::*;
use super::types::*;
use super::verbs::{QpCaps, Verbs};
use crate::utils::aligned_mem::AlignedMem;

/// Which completion queue of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqRole {
    Send,
    Recv,
}

impl fmt::Display for CqRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CqRole::Send => "send",
            CqRole::Recv => "receive",
        })
    }
}

/// Resource setup error. Each variant names the step that failed.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("cannot allocate a {0}-byte buffer")]
    OutOfMemory(usize),

    #[error("no RDMA device found")]
    NoDevice,

    #[error("RDMA device `{0}` not found")]
    DeviceNotFound(String),

    #[error("failed to open device `{name}`")]
    OpenDevice {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to allocate protection domain")]
    AllocPd(#[source] io::Error),

    #[error("failed to register memory region")]
    RegMr(#[source] io::Error),

    #[error("failed to create {which} completion queue")]
    CreateCq {
        which: CqRole,
        #[source]
        source: io::Error,
    },

    #[error("failed to create queue pair")]
    CreateQp(#[source] io::Error),

    #[error("failed to query port {port}")]
    QueryPort {
        port: PortNum,
        #[source]
        source: io::Error,
    },

    #[error("failed to query GID index {index} of port {port}")]
    QueryGid {
        port: PortNum,
        index: GidIndex,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl SetupError {
    /// Distinct code of the failing step, usable as a process exit code.
    pub fn code(&self) -> i32 {
        match self {
            SetupError::OutOfMemory(_) => 10,
            SetupError::NoDevice => 11,
            SetupError::DeviceNotFound(_) => 12,
            SetupError::OpenDevice { .. } => 13,
            SetupError::AllocPd(_) => 14,
            SetupError::RegMr(_) => 15,
            SetupError::CreateCq {
                which: CqRole::Recv,
                ..
            } => 16,
            SetupError::CreateCq {
                which: CqRole::Send,
                ..
            } => 17,
            SetupError::CreateQp(_) => 18,
            SetupError::QueryPort { .. } => 19,
            SetupError::QueryGid { .. } => 20,
            SetupError::Transition(_) => 21,
        }
    }
}

/// Endpoint construction parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointParams {
    /// Device to open; the first one found if `None`.
    pub device: Option<String>,
    pub ib_port: PortNum,
    pub gid_index: GidIndex,
    /// Size of each buffer half. The registered buffer is twice as large.
    pub half_size: u32,
    /// Maximum outstanding sends; also the send CQ depth.
    pub tx_depth: u32,
    /// Service level used in the address vector.
    pub service_level: u8,
}

impl Default for EndpointParams {
    fn default() -> Self {
        Self {
            device: None,
            ib_port: 1,
            gid_index: 0,
            half_size: 65536,
            tx_depth: 100,
            service_level: 1,
        }
    }
}

/// Owns every local resource of a connection: device context, protection
/// domain, one registered buffer, receive and send completion queues, and
/// one RC queue pair.
///
/// The buffer is split in two halves. The first half is the local half that
/// outgoing writes are sourced from; the second half is the only part ever
/// advertised to the peer for remote writes.
///
/// Resources are released in reverse order of creation when the endpoint is
/// dropped, and construction failures release whatever was already created.
pub struct ConnectionEndpoint<V: Verbs> {
    // Field order is drop order: children before parents, buffer last.
    pub(crate) qp: QueuePair<V>,
    pub(crate) send_cq: V::Cq,
    pub(crate) recv_cq: V::Cq,
    pub(crate) mr: V::Mr,
    _pd: V::Pd,
    ctx: V::Context,
    pub(crate) buf: AlignedMem,
    pub(crate) verbs: V,
    params: EndpointParams,
}

impl<V: Verbs> fmt::Debug for ConnectionEndpoint<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEndpoint")
            .field("device", &self.verbs.device_name(&self.ctx))
            .field("qp", &self.qp)
            .field("buf", &self.buf)
            .finish()
    }
}

impl<V: Verbs> ConnectionEndpoint<V> {
    /// Allocate every resource and bring the QP to `INIT`.
    pub fn new(verbs: V, params: EndpointParams) -> Result<Self, SetupError> {
        let len = 2 * params.half_size as usize;
        let buf = AlignedMem::zeroed(len).ok_or(SetupError::OutOfMemory(len))?;

        let ctx = verbs.open_device(params.device.as_deref())?;
        log::debug!("opened device {}", verbs.device_name(&ctx));

        let pd = verbs.alloc_pd(&ctx).map_err(SetupError::AllocPd)?;

        // SAFETY: `buf` outlives `mr`, both here and as struct fields.
        let mr = unsafe {
            verbs.reg_mr(
                &pd,
                buf.addr(),
                buf.len(),
                Permission::LOCAL_WRITE | Permission::REMOTE_WRITE,
            )
        }
        .map_err(SetupError::RegMr)?;
        log::debug!(
            "registered {:?}, lkey {:#x}, rkey {:#x}",
            buf,
            verbs.lkey(&mr),
            verbs.rkey(&mr)
        );

        let recv_cq = verbs
            .create_cq(&ctx, 1)
            .map_err(|source| SetupError::CreateCq {
                which: CqRole::Recv,
                source,
            })?;
        let send_cq = verbs
            .create_cq(&ctx, params.tx_depth)
            .map_err(|source| SetupError::CreateCq {
                which: CqRole::Send,
                source,
            })?;

        let caps = QpCaps::for_tx_depth(params.tx_depth);
        let qp = verbs
            .create_qp(&pd, &send_cq, &recv_cq, &caps)
            .map_err(SetupError::CreateQp)?;
        let mut qp = QueuePair::new(&verbs, qp);
        qp.modify_reset2init(&verbs, params.ib_port)?;

        Ok(Self {
            qp,
            send_cq,
            recv_cq,
            mr,
            _pd: pd,
            ctx,
            buf,
            verbs,
            params,
        })
    }

    #[inline]
    pub fn params(&self) -> &EndpointParams {
        &self.params
    }

    #[inline]
    pub fn state(&self) -> QpState {
        self.qp.state()
    }

    #[inline]
    pub fn qp_num(&self) -> Qpn {
        self.qp.qp_num()
    }

    #[inline]
    pub fn verbs(&self) -> &V {
        &self.verbs
    }

    /// Size of one buffer half.
    #[inline]
    pub fn half_size(&self) -> usize {
        self.params.half_size as usize
    }

    /// Address of the half a peer may write to: buffer base plus one half.
    #[inline]
    pub fn remote_half_addr(&self) -> u64 {
        self.buf.addr() as u64 + self.params.half_size as u64
    }

    /// Describe how a peer reaches this endpoint, with a fresh random PSN.
    pub fn local_info(&self) -> Result<ConnectionInfo, SetupError> {
        let psn = rand::thread_rng().gen::<u32>() & MASK_24;
        self.local_info_with_psn(psn)
    }

    /// Describe how a peer reaches this endpoint, starting at `psn`.
    pub fn local_info_with_psn(&self, psn: Psn) -> Result<ConnectionInfo, SetupError> {
        let port = self.params.ib_port;
        let attr = self
            .verbs
            .query_port(&self.ctx, port)
            .map_err(|source| SetupError::QueryPort { port, source })?;
        if !attr.active {
            log::warn!("port {} is not active", port);
        }

        let index = self.params.gid_index;
        let gid = self
            .verbs
            .query_gid(&self.ctx, port, index)
            .map_err(|source| SetupError::QueryGid {
                port,
                index,
                source,
            })?;

        Ok(ConnectionInfo {
            lid: attr.lid,
            qpn: self.qp.qp_num(),
            psn: psn & MASK_24,
            rkey: self.verbs.rkey(&self.mr),
            vaddr: self.remote_half_addr(),
            gid,
        })
    }

    /// `INIT -> RTR` towards `remote`.
    pub fn connect(&mut self, remote: &ConnectionInfo) -> Result<(), TransitionError> {
        let path = PathParams {
            port_num: self.params.ib_port,
            service_level: self.params.service_level,
            sgid_index: self.params.gid_index,
        };
        self.qp.modify_init2rtr(&self.verbs, remote, &path)
    }

    /// `RTR -> RTS`, sending from `local_psn`.
    pub fn ready_to_send(&mut self, local_psn: Psn) -> Result<(), TransitionError> {
        self.qp.modify_rtr2rts(&self.verbs, local_psn)
    }

    /// Copy `data` to the start of the local half.
    /// Return `false` without writing anything if it does not fit.
    pub fn fill_local(&self, data: &[u8]) -> bool {
        data.len() <= self.half_size() && self.buf.store(0, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::soft::{FaultStep, SoftVerbs};

    #[test]
    fn every_failing_step_releases_what_was_built() {
        let cases = [
            (FaultStep::OpenDevice, 13),
            (FaultStep::AllocPd, 14),
            (FaultStep::RegMr, 15),
            (FaultStep::CreateQp, 18),
            (FaultStep::ModifyQp, 21),
        ];
        for (step, code) in cases {
            let v = SoftVerbs::new();
            v.fail_next(step);
            let err = ConnectionEndpoint::new(v.clone(), EndpointParams::default()).unwrap_err();
            assert_eq!(err.code(), code, "{:?}: {}", step, err);
            assert!(v.live().is_empty(), "{:?} leaked {:?}", step, v.live());
        }

        // The receive CQ is created first, the send CQ second.
        for (nth, code) in [(0, 16), (1, 17)] {
            let v = SoftVerbs::new();
            v.fail_nth(FaultStep::CreateCq, nth);
            let err = ConnectionEndpoint::new(v.clone(), EndpointParams::default()).unwrap_err();
            assert_eq!(err.code(), code);
            assert!(v.live().is_empty());
        }
    }

    #[test]
    fn peers_only_see_the_second_half() {
        let v = SoftVerbs::new();
        let ep = ConnectionEndpoint::new(v.clone(), EndpointParams::default()).unwrap();
        assert_eq!(ep.state(), QpState::Init);

        let info = ep.local_info().unwrap();
        assert_eq!(info.vaddr, ep.buf.addr() as u64 + 65536);
        assert_eq!(info.vaddr, ep.remote_half_addr());
        assert_eq!(info.qpn, ep.qp_num());
        assert_eq!(info.lid, 1);
        assert!(info.psn <= MASK_24);

        let fixed = ep.local_info_with_psn(0x0123_4567).unwrap();
        assert_eq!(fixed.psn, 0x23_4567);

        assert!(ep.fill_local(b"abc\0"));
        assert!(!ep.fill_local(&vec![1u8; 65537]));
        assert_eq!(ep.buf.load_until_nul(0..65536), b"abc");
        assert_eq!(ep.buf.load_byte(65536), 0);

        drop(ep);
        assert!(v.live().is_empty());
    }

    #[test]
    fn unknown_device_is_reported_by_name() {
        let params = EndpointParams {
            device: Some("mlx5_9".into()),
            ..Default::default()
        };
        let err = ConnectionEndpoint::new(SoftVerbs::new(), params).unwrap_err();
        assert!(matches!(&err, SetupError::DeviceNotFound(name) if name == "mlx5_9"));
        assert_eq!(err.code(), 12);
    }
}
