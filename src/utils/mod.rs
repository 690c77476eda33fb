#[cfg(feature = "verbs")]
#[macro_use]
mod boilerplate;

pub mod aligned_mem;
pub(crate) mod interop;
