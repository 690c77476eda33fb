/// Queue pair state. Discriminants follow `enum ibv_qp_state`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum QpState {
    /// Reset.
    #[default]
    Reset = 0,

    /// Initialized.
    Init = 1,

    /// Ready To Receive.
    Rtr = 2,

    /// Ready To Send.
    Rts = 3,

    /// Send Queue Drain.
    Sqd = 4,

    /// Send Queue Error.
    Sqe = 5,

    /// Error.
    Error = 6,
}

impl QpState {
    /// The state a connection bring-up moves to next, if any.
    pub const fn next(self) -> Option<QpState> {
        match self {
            QpState::Reset => Some(QpState::Init),
            QpState::Init => Some(QpState::Rtr),
            QpState::Rtr => Some(QpState::Rts),
            _ => None,
        }
    }

    /// Whether bring-up may move from `self` to `to`. Only the forward
    /// `RESET -> INIT -> RTR -> RTS` steps are admitted.
    #[inline]
    pub fn can_transit_to(self, to: QpState) -> bool {
        self.next() == Some(to)
    }
}

impl TryFrom<u32> for QpState {
    type Error = u32;

    fn try_from(qp_state: u32) -> Result<Self, u32> {
        Ok(match qp_state {
            0 => QpState::Reset,
            1 => QpState::Init,
            2 => QpState::Rtr,
            3 => QpState::Rts,
            4 => QpState::Sqd,
            5 => QpState::Sqe,
            6 => QpState::Error,
            other => return Err(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_forward_steps_are_legal() {
        use QpState::*;
        let all = [Reset, Init, Rtr, Rts, Sqd, Sqe, Error];
        for from in all {
            for to in all {
                let legal = matches!((from, to), (Reset, Init) | (Init, Rtr) | (Rtr, Rts));
                assert_eq!(from.can_transit_to(to), legal, "{:?} -> {:?}", from, to);
            }
        }
        assert_eq!(QpState::try_from(3u32), Ok(Rts));
        assert_eq!(QpState::try_from(7u32), Err(7));
    }
}
