//! The prelude.
//!
//! Brings the types of a typical run into scope with one import.

pub use crate::config::EchoConfig;
pub use crate::ctrl::{ConnectOptions, MetadataChannel, MetadataListener};
pub use crate::echo::{EchoError, Outcome, Phase, Role, Session};
pub use crate::rdma::endpoint::{ConnectionEndpoint, EndpointParams, SetupError};
pub use crate::rdma::gid::Gid;
pub use crate::rdma::info::ConnectionInfo;
#[cfg(feature = "verbs")]
pub use crate::rdma::ibverbs::Ibverbs;
pub use crate::rdma::qp::{QpState, TransitionError};
pub use crate::rdma::soft::SoftVerbs;
pub use crate::rdma::verbs::Verbs;
pub use crate::rdma::wc::{Wc, WcStatus};
pub use crate::rdma::wr::{DataPlaneError, WaitError};
