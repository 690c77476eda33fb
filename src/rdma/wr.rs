//! One-shot RDMA write and the receiving side's bounded wait for it.

use std::io;
use std::time::Duration;

use quanta::Instant;
use thiserror::Error;

use super::endpoint::ConnectionEndpoint;
use super::info::ConnectionInfo;
use super::qp::QpState;
use super::types::*;
use super::verbs::{RecvWr, RemoteTarget, SendWr, Sge, Verbs};
use super::wc::{Wc, WcOpcode, WcStatus};
use crate::utils::interop::errno_of;

/// Work request id of the data-plane write.
pub const WRITE_WR_ID: WrId = 3;

/// Work request id of the receive that a write-with-immediate consumes.
pub const NOTIFY_WR_ID: WrId = 4;

/// Data-plane error: anything that goes wrong once the connection is up.
#[derive(Debug, Error)]
pub enum DataPlaneError {
    #[error("QP is in {0:?}, not RTS")]
    NotReady(QpState),

    #[error("failed to post work request (errno {code})")]
    Post { code: i32 },

    #[error("failed to poll completion queue")]
    Poll(#[source] io::Error),

    #[error("work request {wr_id} completed with error")]
    Completion {
        wr_id: WrId,
        #[source]
        status: WcStatus,
    },

    #[error("no completion for work request {wr_id} within {timeout:?}")]
    CompletionTimeout { wr_id: WrId, timeout: Duration },
}

/// Failure while waiting for the peer's write to land.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("nothing arrived within {0:?}")]
    Timeout(Duration),

    #[error("receive completed with error")]
    Completion(#[source] WcStatus),

    #[error("failed to poll completion queue")]
    Poll(#[source] io::Error),

    #[error("failed to post receive (errno {code})")]
    Post { code: i32 },
}

/// Poll `cq` one entry at a time until the completion for `wr_id` shows up
/// or `deadline` passes. Completions of other requests are logged and
/// skipped.
fn poll_for<V: Verbs>(
    verbs: &V,
    cq: &V::Cq,
    wr_id: WrId,
    deadline: Instant,
) -> io::Result<Option<Wc>> {
    let mut wc = [Wc::default()];
    loop {
        if verbs.poll_cq(cq, &mut wc)? > 0 {
            if wc[0].wr_id == wr_id {
                return Ok(Some(wc[0]));
            }
            log::warn!("unexpected completion {:?}", wc[0]);
            continue;
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::yield_now();
    }
}

impl<V: Verbs> ConnectionEndpoint<V> {
    /// Write the whole local half into `remote`'s advertised buffer and wait
    /// until the write completes.
    ///
    /// With `imm`, the write carries immediate data and consumes a receive
    /// at the peer, which lets the peer wait on its receive CQ instead of
    /// polling memory.
    ///
    /// An error completion leaves the QP in `ERROR`, so later writes fail
    /// with [`DataPlaneError::NotReady`].
    pub fn write_remote(
        &mut self,
        remote: &ConnectionInfo,
        imm: Option<ImmData>,
        timeout: Duration,
    ) -> Result<Wc, DataPlaneError> {
        let state = self.qp.state();
        if state != QpState::Rts {
            return Err(DataPlaneError::NotReady(state));
        }

        let sge = Sge {
            addr: self.buf.addr() as u64,
            length: self.params().half_size,
            lkey: self.verbs.lkey(&self.mr),
        };
        let target = RemoteTarget {
            addr: remote.vaddr,
            rkey: remote.rkey,
        };
        let wr = SendWr::rdma_write(WRITE_WR_ID, sge, target).with_imm(imm);

        // SAFETY: the SGE covers the registered local half, which lives as
        // long as `self`, and we wait for the completion below.
        unsafe { self.verbs.post_send(self.qp.as_raw(), &wr) }
            .map_err(|e| DataPlaneError::Post { code: errno_of(&e) })?;
        log::debug!(
            "posted write of {} bytes to {:#x} (rkey {:#x})",
            sge.length,
            target.addr,
            target.rkey
        );

        let deadline = Instant::now() + timeout;
        let wc = poll_for(&self.verbs, &self.send_cq, WRITE_WR_ID, deadline)
            .map_err(DataPlaneError::Poll)?
            .ok_or(DataPlaneError::CompletionTimeout {
                wr_id: WRITE_WR_ID,
                timeout,
            })?;
        wc.ok().map_err(|status| {
            self.qp.mark_error();
            DataPlaneError::Completion {
                wr_id: wc.wr_id,
                status,
            }
        })
    }

    /// Post the receive a peer's write-with-immediate will consume.
    /// Legal from `INIT` on, so it can precede the metadata exchange.
    pub fn post_notify_recv(&self) -> Result<(), WaitError> {
        let wr = RecvWr {
            wr_id: NOTIFY_WR_ID,
            sge: None,
        };
        // SAFETY: no buffer is attached.
        unsafe { self.verbs.post_recv(self.qp.as_raw(), &wr) }
            .map_err(|e| WaitError::Post { code: errno_of(&e) })
    }

    /// Wait until the peer's write lands in the remote-writable half, then
    /// return its content up to the first NUL.
    ///
    /// Without `notify`, the first byte of the half is polled until it turns
    /// non-zero. With `notify`, the receive CQ is polled for the completion
    /// of the receive posted by [`post_notify_recv`](Self::post_notify_recv).
    /// A write that lands without immediate data is still accepted, with a
    /// warning.
    pub fn wait_remote_write(&self, timeout: Duration, notify: bool) -> Result<Vec<u8>, WaitError> {
        let deadline = Instant::now() + timeout;
        let half = self.half_size();

        if notify {
            // A peer that writes without immediate never completes the
            // receive, so the half is watched as well.
            let wc = loop {
                let landed = self.buf.load_byte(half) != 0;
                // A past deadline makes this a single poll.
                let polled = poll_for(&self.verbs, &self.recv_cq, NOTIFY_WR_ID, Instant::now());
                if let Some(wc) = polled.map_err(WaitError::Poll)? {
                    break Some(wc);
                }
                if landed {
                    break None;
                }
                if Instant::now() >= deadline {
                    return Err(WaitError::Timeout(timeout));
                }
                std::thread::yield_now();
            };
            match wc {
                Some(wc) => {
                    let wc = wc.ok().map_err(WaitError::Completion)?;
                    if wc.opcode != WcOpcode::RecvRdmaImm {
                        log::warn!("notify receive completed with {:?}", wc.opcode);
                    }
                    log::debug!("write notified: {} bytes, imm {:?}", wc.byte_len, wc.imm);
                }
                None => log::warn!("write landed without immediate data, is the peer using notify?"),
            }
        } else {
            while self.buf.load_byte(half) == 0 {
                if Instant::now() >= deadline {
                    return Err(WaitError::Timeout(timeout));
                }
                std::thread::yield_now();
            }
        }
        Ok(self.buf.load_until_nul(half..2 * half))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::endpoint::EndpointParams;
    use crate::rdma::soft::{FaultStep, SoftVerbs};

    fn endpoint(v: &SoftVerbs) -> ConnectionEndpoint<SoftVerbs> {
        let params = EndpointParams {
            half_size: 4096,
            ..Default::default()
        };
        ConnectionEndpoint::new(v.clone(), params).unwrap()
    }

    #[test]
    fn write_requires_rts() {
        let v = SoftVerbs::new();
        let mut ep = endpoint(&v);
        let remote = ep.local_info().unwrap();
        let err = ep
            .write_remote(&remote, None, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, DataPlaneError::NotReady(QpState::Init)));
    }

    #[test]
    fn failed_write_leaves_qp_in_error() {
        let v = SoftVerbs::with_devices(2);
        let on = |device: &str| {
            let params = EndpointParams {
                device: Some(device.into()),
                half_size: 4096,
                ..Default::default()
            };
            ConnectionEndpoint::new(v.clone(), params).unwrap()
        };
        let (mut a, mut b) = (on("soft0"), on("soft1"));
        let (ia, ib) = (a.local_info().unwrap(), b.local_info().unwrap());
        a.connect(&ib).unwrap();
        b.connect(&ia).unwrap();
        a.ready_to_send(ia.psn).unwrap();

        // Write with immediate, but `b` posted no receive.
        let timeout = Duration::from_secs(1);
        let err = a.write_remote(&ib, Some(1), timeout).unwrap_err();
        assert!(matches!(
            err,
            DataPlaneError::Completion {
                wr_id: WRITE_WR_ID,
                status: WcStatus::RnrRetryExcErr
            }
        ));
        assert_eq!(a.state(), QpState::Error);
        assert_eq!(v.qp_state(a.qp_num()), Some(QpState::Error));

        let err = a.write_remote(&ib, None, timeout).unwrap_err();
        assert!(matches!(err, DataPlaneError::NotReady(QpState::Error)));
    }

    #[test]
    fn wait_is_bounded() {
        let v = SoftVerbs::new();
        let ep = endpoint(&v);
        let timeout = Duration::from_millis(20);

        let err = ep.wait_remote_write(timeout, false).unwrap_err();
        assert!(matches!(err, WaitError::Timeout(t) if t == timeout));

        ep.post_notify_recv().unwrap();
        let err = ep.wait_remote_write(timeout, true).unwrap_err();
        assert!(matches!(err, WaitError::Timeout(_)));
    }

    #[test]
    fn notify_receive_posting_errors_carry_errno() {
        let v = SoftVerbs::new();
        let ep = endpoint(&v);
        v.fail_next(FaultStep::PostRecv);
        assert!(matches!(
            ep.post_notify_recv(),
            Err(WaitError::Post { code: libc::EINVAL })
        ));

        // Only one receive fits.
        ep.post_notify_recv().unwrap();
        assert!(matches!(ep.post_notify_recv(), Err(WaitError::Post { .. })));
    }
}
