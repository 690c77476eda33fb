use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Sub};

/// Memory region and queue pair access permissions.
///
/// Bit values follow `enum ibv_access_flags`.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct Permission(u32);

impl Permission {
    pub const EMPTY: Self = Self(0);
    pub const LOCAL_WRITE: Self = Self(1);
    pub const REMOTE_WRITE: Self = Self(1 << 1);
    pub const REMOTE_READ: Self = Self(1 << 2);
    pub const REMOTE_ATOMIC: Self = Self(1 << 3);

    /// Build from raw `ibv_access_flags` bits.
    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Check whether every permission in `other` is granted by `self`.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Permission {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permission {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Permission {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl Sub for Permission {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 & !rhs.0)
    }
}

impl From<Permission> for i32 {
    fn from(p: Permission) -> Self {
        p.0 as _
    }
}

impl fmt::Debug for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Permission, &str); 4] = [
            (Permission::LOCAL_WRITE, "LOCAL_WRITE"),
            (Permission::REMOTE_WRITE, "REMOTE_WRITE"),
            (Permission::REMOTE_READ, "REMOTE_READ"),
            (Permission::REMOTE_ATOMIC, "REMOTE_ATOMIC"),
        ];
        let mut set = f.debug_set();
        for (perm, name) in NAMES {
            if self.contains(perm) {
                set.entry(&format_args!("{}", name));
            }
        }
        set.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_and_sub() {
        let p = Permission::LOCAL_WRITE | Permission::REMOTE_WRITE;
        assert!(p.contains(Permission::REMOTE_WRITE));
        assert!(!p.contains(Permission::REMOTE_READ));
        assert_eq!(p - Permission::LOCAL_WRITE, Permission::REMOTE_WRITE);
        assert_eq!(i32::from(p), 3);
        assert!(Permission::EMPTY.contains(Permission::EMPTY));
    }
}
