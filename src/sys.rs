//! Raw kernel ABI for the binder driver: object type tags, transaction
//! flags, ioctl code arithmetic and the width-independent ioctls.

use nix::{ioctl_readwrite, ioctl_write_ptr};

/// Default AIDL binder device.
pub const DEFAULT_BINDER_DEVICE: &str = "/dev/binder";
/// Default HIDL (hwbinder) device.
pub const DEFAULT_HWBINDER_DEVICE: &str = "/dev/hwbinder";

/// The value passed to BINDER_SET_MAX_THREADS. Loopers are managed by this
/// library, not spawned by the kernel, so the kernel pool stays empty.
pub const DEFAULT_MAX_BINDER_THREADS: u32 = 0;

/// Size of the receive mapping, copied from ProcessState.cpp.
pub fn binder_vm_size() -> usize {
    (1024 * 1024) - page_size() * 2
}

pub fn page_size() -> usize {
    // sysconf(_SC_PAGESIZE) cannot realistically fail on Linux
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

pub const fn align4(n: usize) -> usize {
    (n + 3) & !3
}

pub const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

pub fn align_page(n: usize) -> usize {
    let page = page_size();
    (n + page - 1) & !(page - 1)
}

macro_rules! pack_chars {
    ($c1:expr, $c2:expr, $c3:expr, $c4:expr) => {
        ((($c1 as u32) << 24) | (($c2 as u32) << 16) | (($c3 as u32) << 8) | ($c4 as u32))
    };
}

const BINDER_TYPE_LARGE: u8 = 0x85;

/// Type tags shared by all flat binder objects (first word of the header).
pub const BINDER_TYPE_BINDER: u32 = pack_chars!(b's', b'b', b'*', BINDER_TYPE_LARGE);
pub const BINDER_TYPE_WEAK_BINDER: u32 = pack_chars!(b'w', b'b', b'*', BINDER_TYPE_LARGE);
pub const BINDER_TYPE_HANDLE: u32 = pack_chars!(b's', b'h', b'*', BINDER_TYPE_LARGE);
pub const BINDER_TYPE_WEAK_HANDLE: u32 = pack_chars!(b'w', b'h', b'*', BINDER_TYPE_LARGE);
pub const BINDER_TYPE_FD: u32 = pack_chars!(b'f', b'd', b'*', BINDER_TYPE_LARGE);
pub const BINDER_TYPE_FDA: u32 = pack_chars!(b'f', b'd', b'a', BINDER_TYPE_LARGE);
pub const BINDER_TYPE_PTR: u32 = pack_chars!(b'p', b't', b'*', BINDER_TYPE_LARGE);

/// flat_binder_object.flags
pub const FLAT_BINDER_FLAG_PRIORITY_MASK: u32 = 0x7f;
pub const FLAT_BINDER_FLAG_ACCEPTS_FDS: u32 = 0x100;

/// binder_buffer_object.flags
pub const BINDER_BUFFER_FLAG_HAS_PARENT: u32 = 0x01;

/// binder_transaction_data.flags
pub const TF_ONE_WAY: u32 = 0x01;
pub const TF_ROOT_OBJECT: u32 = 0x04;
pub const TF_STATUS_CODE: u32 = 0x08;
pub const TF_ACCEPT_FDS: u32 = 0x10;

bitflags! {
    /// Library-level transaction flags, independent of the wire encoding.
    pub struct TxFlags: u32 {
        const ONEWAY = 0x01;
    }
}

/*
 * Command and return codes carry the size of their payload in the ioctl-style
 * size field, which is how the read loop frames packets. These mirror the
 * kernel's _IOC macros.
 */
const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

pub const fn ioc(dir: u32, typ: u8, nr: u8, size: usize) -> u32 {
    (dir << 30) | ((size as u32) << 16) | ((typ as u32) << 8) | (nr as u32)
}

pub const fn io(typ: u8, nr: u8) -> u32 {
    ioc(IOC_NONE, typ, nr, 0)
}

pub const fn iow(typ: u8, nr: u8, size: usize) -> u32 {
    ioc(IOC_WRITE, typ, nr, size)
}

pub const fn ior(typ: u8, nr: u8, size: usize) -> u32 {
    ioc(IOC_READ, typ, nr, size)
}

pub const fn iowr(typ: u8, nr: u8, size: usize) -> u32 {
    ioc(IOC_READ | IOC_WRITE, typ, nr, size)
}

/// Payload byte count encoded in a command/return code.
pub const fn ioc_size(cmd: u32) -> usize {
    ((cmd >> 16) & 0x3fff) as usize
}

/// Protocol versions reported by BINDER_VERSION.
pub const BINDER_VERSION_32: i32 = 7;
pub const BINDER_VERSION_64: i32 = 8;

#[repr(C)]
pub struct BinderVersion {
    pub protocol_version: i32,
}

// The two width-independent ioctls. BINDER_WRITE_READ encodes the size of a
// width-dependent struct in its request code and is issued from io.rs.
ioctl_readwrite!(binder_read_version, b'b', 9, BinderVersion);
ioctl_write_ptr!(binder_set_max_threads, b'b', 5, u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioc_size_roundtrip() {
        let cmd = iow(b'c', 4, 4);
        assert_eq!(ioc_size(cmd), 4);
        assert_eq!(ioc_size(io(b'c', 12)), 0);
        assert_eq!(ioc_size(iowr(b'b', 1, 48)), 48);
    }

    #[test]
    fn object_type_tags() {
        // Spot-check against the values the kernel headers produce.
        assert_eq!(BINDER_TYPE_BINDER, 0x73622a85);
        assert_eq!(BINDER_TYPE_HANDLE, 0x73682a85);
        assert_eq!(BINDER_TYPE_FD, 0x66642a85);
        assert_eq!(BINDER_TYPE_FDA, 0x66646185);
        assert_eq!(BINDER_TYPE_PTR, 0x70742a85);
    }

    #[test]
    fn alignment() {
        assert_eq!(align4(0), 0);
        assert_eq!(align4(1), 4);
        assert_eq!(align4(4), 4);
        assert_eq!(align8(9), 16);
    }
}
