//! RDMA functionalities.

pub mod endpoint;
pub mod gid;
pub mod info;
pub mod perm;
pub mod qp;
pub mod soft;
pub mod types;
pub mod verbs;
pub mod wc;
pub mod wr;

#[cfg(feature = "verbs")]
pub mod ibverbs;
