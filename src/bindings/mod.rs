//! Bindings of the libibverbs C interfaces the hardware provider calls.
//!
//! Everything is generated by `bindgen` at build time except the inline
//! helpers of `verbs.h`, which are re-implemented in [`common`].

#![allow(non_snake_case)]
#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]
#![allow(deref_nullptr)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::too_many_arguments)]
#![allow(unused)]

#[macro_use]
mod common;

mod private {
    use libc::*;
    include!(concat!(env!("OUT_DIR"), "/verbs_bindings.rs"));
}

pub(crate) use self::common::*;
pub(crate) use self::private::*;
