//! RDMA connection bring-up over a TCP rendezvous, followed by a one-shot
//! RDMA write.
//!
//! A [`ConnectionEndpoint`] owns every local resource of one connection
//! (device context, protection domain, one registered buffer, two completion
//! queues and an RC queue pair) and releases them on drop. Its queue pair
//! only moves forward through `RESET -> INIT -> RTR -> RTS`. Peers learn how
//! to reach each other by exchanging a fixed-width [`ConnectionInfo`] record
//! over TCP (see [`ctrl`]), after which the server writes a message straight
//! into the client's buffer.
//!
//! Verbs are reached through the [`Verbs`] trait. [`SoftVerbs`] is an
//! in-process fabric that is always available; the libibverbs provider
//! `rdma::ibverbs::Ibverbs` is built with the `verbs` feature.
//!
//! # Example
//!
//! ```rust
//! use ibecho::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let verbs = SoftVerbs::new();
//!     let ep = ConnectionEndpoint::new(verbs, EndpointParams::default())?;
//!     assert_eq!(ep.state(), QpState::Init);
//!
//!     let local = ep.local_info()?;
//!     assert_eq!(local.vaddr, ep.remote_half_addr());
//!     Ok(())
//! }
//! ```

#[cfg(feature = "verbs")]
mod bindings;
#[macro_use]
mod utils;

pub mod config;
pub mod echo;
pub mod prelude;
pub mod rdma;
pub mod timing;

/// Connection management utilities.
pub mod ctrl;

pub use config::EchoConfig;
pub use echo::{EchoError, Outcome, Phase, Role, Session};
pub use rdma::endpoint::{ConnectionEndpoint, EndpointParams, SetupError};
pub use rdma::info::ConnectionInfo;
pub use rdma::soft::SoftVerbs;
pub use rdma::verbs::Verbs;
pub use utils::aligned_mem::AlignedMem;
