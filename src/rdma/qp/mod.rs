//! Queue pair and its connection state machine.

use std::fmt;

use thiserror::Error;

use crate::rdma::info::ConnectionInfo;
use crate::rdma::types::*;
use crate::rdma::verbs::Verbs;
use crate::utils::interop::errno_of;

pub use self::attr::*;
pub use self::state::*;

mod attr;
mod state;

/// QP state transition error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// The requested transition is not a forward bring-up step. Raised
    /// before the device is touched.
    #[error("illegal QP transition {from:?} -> {to:?}")]
    Illegal { from: QpState, to: QpState },

    /// The device rejected the modify. `code` is the errno it reported.
    #[error("failed to modify QP {from:?} -> {to:?} (errno {code})")]
    Modify { from: QpState, to: QpState, code: i32 },
}

impl TransitionError {
    /// The state the QP was asked to enter.
    pub fn target(&self) -> QpState {
        match self {
            TransitionError::Illegal { to, .. } | TransitionError::Modify { to, .. } => *to,
        }
    }
}

/// A reliable-connected queue pair together with the state it was last
/// driven to.
///
/// The tracked state only advances when the device accepts a modify, so
/// after a failed transition it still names the state the QP is in.
pub struct QueuePair<V: Verbs> {
    qp: V::Qp,
    qpn: Qpn,
    state: QpState,
}

impl<V: Verbs> fmt::Debug for QueuePair<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuePair")
            .field("qpn", &format_args!("{:#08x}", self.qpn))
            .field("state", &self.state)
            .finish()
    }
}

impl<V: Verbs> QueuePair<V> {
    /// Wrap a freshly created QP, which is in `RESET`.
    pub fn new(verbs: &V, qp: V::Qp) -> Self {
        let qpn = verbs.qp_num(&qp);
        Self {
            qp,
            qpn,
            state: QpState::Reset,
        }
    }

    #[inline]
    pub fn qp_num(&self) -> Qpn {
        self.qpn
    }

    #[inline]
    pub fn state(&self) -> QpState {
        self.state
    }

    /// Record that the device moved the QP to `ERROR`, as it does on any
    /// error completion.
    pub(crate) fn mark_error(&mut self) {
        if self.state != QpState::Error {
            log::debug!("QP {:#08x}: {:?} -> {:?}", self.qpn, self.state, QpState::Error);
            self.state = QpState::Error;
        }
    }

    #[inline]
    pub fn as_raw(&self) -> &V::Qp {
        &self.qp
    }

    /// `RESET -> INIT`, bound to `port_num` and admitting remote writes.
    pub fn modify_reset2init(&mut self, verbs: &V, port_num: PortNum) -> Result<(), TransitionError> {
        self.transit(verbs, QpAttr::reset_to_init(port_num))
    }

    /// `INIT -> RTR`, connecting to `remote` over `path`.
    pub fn modify_init2rtr(
        &mut self,
        verbs: &V,
        remote: &ConnectionInfo,
        path: &PathParams,
    ) -> Result<(), TransitionError> {
        self.transit(verbs, QpAttr::init_to_rtr(remote, path))
    }

    /// `RTR -> RTS`, with the send queue starting at `local_psn`.
    pub fn modify_rtr2rts(&mut self, verbs: &V, local_psn: Psn) -> Result<(), TransitionError> {
        self.transit(verbs, QpAttr::rtr_to_rts(local_psn))
    }

    fn transit(
        &mut self,
        verbs: &V,
        (attr, mask): (QpAttr, QpAttrMask),
    ) -> Result<(), TransitionError> {
        let (from, to) = (self.state, attr.qp_state);
        if !from.can_transit_to(to) {
            return Err(TransitionError::Illegal { from, to });
        }

        verbs
            .modify_qp(&self.qp, &attr, mask)
            .map_err(|e| TransitionError::Modify {
                from,
                to,
                code: errno_of(&e),
            })?;
        log::debug!("QP {:#08x}: {:?} -> {:?}", self.qpn, from, to);
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::soft::SoftVerbs;
    use crate::rdma::verbs::QpCaps;

    #[test]
    fn illegal_transitions_never_reach_the_device() {
        let v = SoftVerbs::new();
        let ctx = v.open_device(None).unwrap();
        let pd = v.alloc_pd(&ctx).unwrap();
        let cq = v.create_cq(&ctx, 4).unwrap();
        let raw = v.create_qp(&pd, &cq, &cq, &QpCaps::for_tx_depth(4)).unwrap();
        let mut qp = QueuePair::new(&v, raw);

        let remote = ConnectionInfo::default();
        let path = PathParams {
            port_num: 1,
            service_level: 1,
            sgid_index: 0,
        };

        // RTR and RTS before INIT.
        let err = qp.modify_init2rtr(&v, &remote, &path).unwrap_err();
        assert_eq!(
            err,
            TransitionError::Illegal {
                from: QpState::Reset,
                to: QpState::Rtr
            }
        );
        assert!(qp.modify_rtr2rts(&v, 0).is_err());
        assert_eq!(v.qp_state(qp.qp_num()), Some(QpState::Reset));

        qp.modify_reset2init(&v, 1).unwrap();
        assert_eq!(qp.state(), QpState::Init);

        // INIT is not revisited.
        let err = qp.modify_reset2init(&v, 1).unwrap_err();
        assert_eq!(err.target(), QpState::Init);
        assert!(matches!(err, TransitionError::Illegal { .. }));

        // A device rejection carries its errno and leaves the state alone.
        let mut bad_path = path;
        bad_path.port_num = 2;
        let err = qp.modify_init2rtr(&v, &remote, &bad_path).unwrap_err();
        assert_eq!(
            err,
            TransitionError::Modify {
                from: QpState::Init,
                to: QpState::Rtr,
                code: libc::EINVAL
            }
        );
        assert_eq!(qp.state(), QpState::Init);
    }
}
