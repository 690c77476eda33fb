#![macro_use]

use std::os::raw::c_int;

use super::private::*;

macro_rules! container_of {
    ($ptr:expr, $container:path, $field:ident) => {{
        ($ptr as *const _ as *const u8 as *mut u8).sub(memoffset::offset_of!($container, $field))
            as *mut $container
    }};
}

/// `ctx->abi_compat` of contexts that are embedded in a `verbs_context`.
const VERBS_ABI_IS_EXTENDED: usize = usize::MAX;

/// Get the extended context of `ctx`, or null if the provider is too old
/// to have one.
#[inline]
pub unsafe fn verbs_get_ctx(ctx: *mut ibv_context) -> *mut verbs_context {
    if (*ctx).abi_compat as usize != VERBS_ABI_IS_EXTENDED {
        std::ptr::null_mut()
    } else {
        container_of!(ctx, verbs_context, context)
    }
}

/// Get the extended context of `ctx` if it implements `$op`, or null.
macro_rules! verbs_get_ctx_op {
    ($ctx:expr, $op:ident) => {{
        let vctx = verbs_get_ctx($ctx);
        if vctx.is_null()
            || (*vctx).sz
                < ::std::mem::size_of::<verbs_context>() - memoffset::offset_of!(verbs_context, $op)
            || (*vctx).$op.is_none()
        {
            std::ptr::null_mut()
        } else {
            vctx
        }
    }};
}

mod compat {
    use super::*;

    extern "C" {
        /// The exported symbol behind `ibv_query_port`. It only fills the
        /// leading part of `ibv_port_attr` that old providers know about.
        pub fn ibv_query_port(
            context: *mut ibv_context,
            port_num: u8,
            port_attr: *mut ibv_port_attr,
        ) -> c_int;
    }
}

/// Query the attributes of a port.
///
/// Uses the provider's extended `query_port` when there is one and falls
/// back to the compatibility entry point otherwise.
#[inline]
pub unsafe fn ___ibv_query_port(
    context: *mut ibv_context,
    port_num: u8,
    port_attr: *mut ibv_port_attr,
) -> c_int {
    let vctx = verbs_get_ctx_op!(context, query_port);
    if vctx.is_null() {
        std::ptr::write_bytes(port_attr, 0, 1);
        return compat::ibv_query_port(context, port_num, port_attr);
    }
    (*vctx).query_port.unwrap_unchecked()(
        context,
        port_num,
        port_attr,
        std::mem::size_of::<ibv_port_attr>(),
    )
}

/// Poll a CQ for work completions.
///
/// Returns a negative value on error, otherwise the number of completions
/// written to `wc`, at most `num_entries`.
#[inline]
pub unsafe fn ibv_poll_cq(cq: *mut ibv_cq, num_entries: c_int, wc: *mut ibv_wc) -> c_int {
    (*(*cq).context).ops.poll_cq.unwrap_unchecked()(cq, num_entries, wc)
}

/// Post a list of work requests to a send queue.
#[inline]
pub unsafe fn ibv_post_send(
    qp: *mut ibv_qp,
    wr: *mut ibv_send_wr,
    bad_wr: *mut *mut ibv_send_wr,
) -> c_int {
    (*(*qp).context).ops.post_send.unwrap_unchecked()(qp, wr, bad_wr)
}

/// Post a list of work requests to a receive queue.
#[inline]
pub unsafe fn ibv_post_recv(
    qp: *mut ibv_qp,
    wr: *mut ibv_recv_wr,
    bad_wr: *mut *mut ibv_recv_wr,
) -> c_int {
    (*(*qp).context).ops.post_recv.unwrap_unchecked()(qp, wr, bad_wr)
}
