use std::io;

/// Converts a C return value to a Rust `Result`.
///
/// `ibv_modify_qp` and friends return the errno directly rather than setting
/// the global `errno`.
#[inline(always)]
#[allow(dead_code)]
pub(crate) fn from_c_ret(ret: i32) -> io::Result<()> {
    match ret {
        0 => Ok(()),
        ret => Err(io::Error::from_raw_os_error(ret.abs())),
    }
}

/// Converts a NULL pointer returned from a C allocator into the last OS error.
#[inline(always)]
#[allow(dead_code)]
pub(crate) fn from_c_ptr<T>(ptr: *mut T) -> io::Result<std::ptr::NonNull<T>> {
    std::ptr::NonNull::new(ptr).ok_or_else(io::Error::last_os_error)
}

/// The errno carried by an I/O error, or `EIO` if it carries none.
#[inline]
pub(crate) fn errno_of(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}
