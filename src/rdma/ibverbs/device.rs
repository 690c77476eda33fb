use std::ffi::CStr;
use std::io;
use std::ptr::NonNull;

use crate::bindings::*;

/// An RDMA device. Transparently wraps a pointer to [`ibv_device`].
#[repr(transparent)]
pub(super) struct Device(NonNull<ibv_device>);

impl Device {
    pub fn as_raw(&self) -> *mut ibv_device {
        self.0.as_ptr()
    }

    pub fn name(&self) -> String {
        // SAFETY: FFI.
        match unsafe { ibv_get_device_name(self.as_raw()) } {
            // SAFETY: a non-null return value points to a valid C string.
            name if !name.is_null() => unsafe { CStr::from_ptr(name) }
                .to_string_lossy()
                .into_owned(),
            _ => "(unknown)".to_owned(),
        }
    }
}

/// The list of available RDMA devices, freed on drop. Devices must be
/// opened before the list goes away.
pub(super) struct DeviceList {
    list: NonNull<Device>,
    len: usize,
}

impl DeviceList {
    pub fn new() -> io::Result<Self> {
        let mut num_devices = 0;

        // SAFETY: FFI.
        let list = unsafe { ibv_get_device_list(&mut num_devices) };
        let list = NonNull::new(list.cast::<Device>()).ok_or_else(io::Error::last_os_error)?;
        Ok(Self {
            list,
            len: num_devices.max(0) as usize,
        })
    }

    pub fn as_slice(&self) -> &[Device] {
        // SAFETY: a non-null list returned by the driver holds `len`
        // contiguous device pointers, and `Device` is transparent over one.
        unsafe { std::slice::from_raw_parts(self.list.as_ptr(), self.len) }
    }
}

impl Drop for DeviceList {
    fn drop(&mut self) {
        // SAFETY: FFI.
        unsafe { ibv_free_device_list(self.list.as_ptr().cast()) };
    }
}
