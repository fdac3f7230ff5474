//! Width-specific wire codec.
//!
//! There are (at least) two versions of the binder ioctl API, implemented by
//! 32-bit and 64-bit kernels. The ioctl codes and many of the command codes
//! are derived from the sizes of the structures passed between the driver and
//! userspace, so everything width-dependent is funnelled through the `Io`
//! trait. The two implementations are generated from a single macro body,
//! `IO32` and `IO64`; the right one is picked by the BINDER_VERSION ioctl at
//! device-open time.

use std::os::unix::io::RawFd;
use std::slice;

use byteorder::{ByteOrder, LittleEndian as LE};
use log::warn;

use crate::sys;
use crate::{STATUS_OK, STATUS_FAILED};

/// Read buffer size (lives on the looper stack, shouldn't be too large).
pub const READ_BUFFER_SIZE: usize = 128;

/// Maximum encoded sizes, used by callers to pre-allocate output buffers.
pub const MAX_POINTER_SIZE: usize = 8;
pub const MAX_COOKIE_SIZE: usize = MAX_POINTER_SIZE;
pub const MAX_BINDER_OBJECT_SIZE: usize = 24;
pub const MAX_BUFFER_OBJECT_SIZE: usize = 40;
pub const MAX_HANDLE_COOKIE_SIZE: usize = 12;
pub const MAX_PTR_COOKIE_SIZE: usize = 16;
pub const MAX_BC_TRANSACTION_SIZE: usize = 64;
pub const MAX_BC_TRANSACTION_SG_SIZE: usize = 72;

/// Driver command protocol (BC_*), with the width-dependent size fields
/// already folded into each code.
#[derive(Debug, Clone, Copy)]
pub struct BcCodes {
    pub transaction: u32,
    pub reply: u32,
    pub acquire_result: u32,
    pub free_buffer: u32,
    pub increfs: u32,
    pub acquire: u32,
    pub release: u32,
    pub decrefs: u32,
    pub increfs_done: u32,
    pub acquire_done: u32,
    pub attempt_acquire: u32,
    pub register_looper: u32,
    pub enter_looper: u32,
    pub exit_looper: u32,
    pub request_death_notification: u32,
    pub clear_death_notification: u32,
    pub dead_binder_done: u32,
    pub transaction_sg: u32,
    pub reply_sg: u32,
}

/// Driver return protocol (BR_*).
#[derive(Debug, Clone, Copy)]
pub struct BrCodes {
    pub error: u32,
    pub ok: u32,
    pub transaction: u32,
    pub reply: u32,
    pub acquire_result: u32,
    pub dead_reply: u32,
    pub transaction_complete: u32,
    pub increfs: u32,
    pub acquire: u32,
    pub release: u32,
    pub decrefs: u32,
    pub attempt_acquire: u32,
    pub noop: u32,
    pub spawn_looper: u32,
    pub finished: u32,
    pub dead_binder: u32,
    pub clear_death_notification_done: u32,
    pub failed_reply: u32,
}

/// Parent linkage for a buffer object: the index of the parent object in the
/// offsets array and the byte offset of the pointer field inside the parent.
#[derive(Debug, Clone, Copy)]
pub struct Parent {
    pub index: u32,
    pub offset: usize,
}

/// Decoded binder_buffer_object.
#[derive(Debug, Clone, Copy)]
pub struct BufferObject {
    pub data: u64,
    pub size: usize,
    pub parent_offset: usize,
    pub has_parent: bool,
}

/// Decoded flat_binder_object, as far as the reader needs it.
#[derive(Debug, Clone, Copy)]
pub enum FlatObject {
    /// A remote handle.
    Handle(u32),
    /// A null reference (BINDER header with a zero pointer).
    Null,
}

/// Decoded BR_TRANSACTION / BR_REPLY payload.
#[derive(Debug)]
pub struct TxData {
    pub status: i32,
    pub code: u32,
    pub flags: u32,
    pub pid: u32,
    pub euid: u32,
    pub target: u64,
    pub data: u64,
    pub size: usize,
    /// Validated object offsets into the data buffer, or None when the
    /// offsets table was absent or inconsistent.
    pub objects: Option<Vec<usize>>,
}

/// One side of a BINDER_WRITE_READ exchange.
#[derive(Debug, Default, Clone, Copy)]
pub struct IoBuf {
    pub ptr: u64,
    pub size: usize,
    pub consumed: usize,
}

impl IoBuf {
    pub fn new(ptr: *const u8, size: usize) -> Self {
        IoBuf { ptr: ptr as u64, size, consumed: 0 }
    }
}

pub trait Io: Send + Sync {
    fn version(&self) -> i32;
    fn pointer_size(&self) -> usize;
    fn bc(&self) -> &'static BcCodes;
    fn br(&self) -> &'static BrCodes;

    /// Size of the object, from the type tag in its header.
    fn object_size(&self, obj: &[u8]) -> usize;
    /// Size of the object's auxiliary data.
    fn object_data_size(&self, obj: &[u8]) -> usize;

    fn encode_pointer(&self, out: &mut [u8], ptr: u64) -> usize;
    fn encode_cookie(&self, out: &mut [u8], cookie: u64) -> usize;
    /// A present local object encodes as BINDER, a null one as WEAK_BINDER.
    fn encode_local_object(&self, out: &mut [u8], ptr: Option<u64>) -> usize;
    /// A present remote object encodes as HANDLE, a null one as BINDER
    /// with a zero pointer.
    fn encode_remote_object(&self, out: &mut [u8], handle: Option<u32>) -> usize;
    fn encode_fd_object(&self, out: &mut [u8], fd: RawFd) -> usize;
    fn encode_buffer_object(&self, out: &mut [u8], data: u64, size: usize,
        parent: Option<&Parent>) -> usize;
    fn encode_fda_object(&self, out: &mut [u8], num_fds: u32, parent: &Parent) -> usize;
    fn encode_handle_cookie(&self, out: &mut [u8], handle: u32) -> usize;
    fn encode_ptr_cookie(&self, out: &mut [u8], ptr: u64) -> usize;

    /// Builds BC_TRANSACTION data. The offsets array is materialized into
    /// `offsets_buf`, whose address is embedded in the encoded struct; the
    /// caller must keep it alive (and unmoved) until the ioctl completes.
    fn encode_transaction(&self, out: &mut [u8], handle: u32, code: u32,
        bytes: &[u8], flags: sys::TxFlags, offsets: &[usize],
        offsets_buf: &mut Vec<u8>) -> usize;
    fn encode_transaction_sg(&self, out: &mut [u8], handle: u32, code: u32,
        bytes: &[u8], flags: sys::TxFlags, offsets: &[usize],
        offsets_buf: &mut Vec<u8>, buffers_size: usize) -> usize;
    fn encode_reply(&self, out: &mut [u8], bytes: &[u8], offsets: &[usize],
        offsets_buf: &mut Vec<u8>) -> usize;
    fn encode_reply_sg(&self, out: &mut [u8], bytes: &[u8], offsets: &[usize],
        offsets_buf: &mut Vec<u8>, buffers_size: usize) -> usize;
    /// BC_REPLY carrying a bare status code. The address of `status` is
    /// embedded; the caller keeps it alive across the write.
    fn encode_status_reply(&self, out: &mut [u8], status: &i32) -> usize;

    fn decode_transaction_data(&self, data: &[u8]) -> TxData;
    fn decode_ptr_cookie(&self, data: &[u8]) -> u64;
    fn decode_cookie(&self, data: &[u8]) -> u64;
    /// Returns the handle if the object is a HANDLE, along with the
    /// consumed size; anything else decodes as no handle.
    fn decode_binder_handle(&self, obj: &[u8]) -> Option<(u32, usize)>;
    fn decode_binder_object(&self, obj: &[u8]) -> Option<(FlatObject, usize)>;
    fn decode_buffer_object(&self, data: &[u8]) -> Option<(BufferObject, usize)>;
    fn decode_fd_object(&self, data: &[u8]) -> Option<(RawFd, usize)>;

    /// Single BINDER_WRITE_READ ioctl consuming from `write` and filling
    /// `read` in place. Retries on EINTR; returns 0 or -errno.
    fn write_read(&self, fd: RawFd, write: Option<&mut IoBuf>,
        read: Option<&mut IoBuf>) -> i32;
}

/// Picks the codec matching a BINDER_VERSION value.
pub fn for_version(version: i32) -> Option<&'static dyn Io> {
    if version == IO32.version() {
        Some(&IO32)
    } else if version == IO64.version() {
        Some(&IO64)
    } else {
        None
    }
}

macro_rules! binder_io_impl {
    ($name:ident, $static_name:ident, $version:expr, $p:expr) => {
        pub struct $name(());

        impl $name {
            const P: usize = $p;
            /// binder_transaction_data: target + cookie + 4 x u32 + four
            /// pointer-sized fields.
            const TXD_SIZE: usize = 6 * $p + 16;
            const TXD_SG_SIZE: usize = Self::TXD_SIZE + $p;
            const FLAT_SIZE: usize = 8 + 2 * $p;
            const BUFFER_OBJECT_SIZE: usize = 8 + 4 * $p;
            const FDA_SIZE: usize = 8 + 3 * $p;
            const PTR_COOKIE_SIZE: usize = 2 * $p;
            const HANDLE_COOKIE_SIZE: usize = 4 + $p;
            const BWR_SIZE: usize = 6 * $p;
            const WRITE_READ: u32 = sys::iowr(b'b', 1, Self::BWR_SIZE);

            // Offsets inside binder_transaction_data.
            const TXD_CODE: usize = 2 * $p;
            const TXD_FLAGS: usize = 2 * $p + 4;
            const TXD_PID: usize = 2 * $p + 8;
            const TXD_EUID: usize = 2 * $p + 12;
            const TXD_DATA_SIZE: usize = 2 * $p + 16;
            const TXD_OFFSETS_SIZE: usize = 3 * $p + 16;
            const TXD_BUFFER: usize = 4 * $p + 16;
            const TXD_OFFSETS: usize = 5 * $p + 16;

            const BC: BcCodes = BcCodes {
                transaction: sys::iow(b'c', 0, Self::TXD_SIZE),
                reply: sys::iow(b'c', 1, Self::TXD_SIZE),
                acquire_result: sys::iow(b'c', 2, 4),
                free_buffer: sys::iow(b'c', 3, $p),
                increfs: sys::iow(b'c', 4, 4),
                acquire: sys::iow(b'c', 5, 4),
                release: sys::iow(b'c', 6, 4),
                decrefs: sys::iow(b'c', 7, 4),
                increfs_done: sys::iow(b'c', 8, Self::PTR_COOKIE_SIZE),
                acquire_done: sys::iow(b'c', 9, Self::PTR_COOKIE_SIZE),
                attempt_acquire: sys::iow(b'c', 10, 4 + Self::PTR_COOKIE_SIZE),
                register_looper: sys::io(b'c', 11),
                enter_looper: sys::io(b'c', 12),
                exit_looper: sys::io(b'c', 13),
                request_death_notification: sys::iow(b'c', 14, Self::HANDLE_COOKIE_SIZE),
                clear_death_notification: sys::iow(b'c', 15, Self::HANDLE_COOKIE_SIZE),
                dead_binder_done: sys::iow(b'c', 16, $p),
                transaction_sg: sys::iow(b'c', 17, Self::TXD_SG_SIZE),
                reply_sg: sys::iow(b'c', 18, Self::TXD_SG_SIZE),
            };

            const BR: BrCodes = BrCodes {
                error: sys::ior(b'r', 0, 4),
                ok: sys::io(b'r', 1),
                transaction: sys::ior(b'r', 2, Self::TXD_SIZE),
                reply: sys::ior(b'r', 3, Self::TXD_SIZE),
                acquire_result: sys::ior(b'r', 4, 4),
                dead_reply: sys::io(b'r', 5),
                transaction_complete: sys::io(b'r', 6),
                increfs: sys::ior(b'r', 7, Self::PTR_COOKIE_SIZE),
                acquire: sys::ior(b'r', 8, Self::PTR_COOKIE_SIZE),
                release: sys::ior(b'r', 9, Self::PTR_COOKIE_SIZE),
                decrefs: sys::ior(b'r', 10, Self::PTR_COOKIE_SIZE),
                attempt_acquire: sys::ior(b'r', 11, 4 + Self::PTR_COOKIE_SIZE),
                noop: sys::io(b'r', 12),
                spawn_looper: sys::io(b'r', 13),
                finished: sys::io(b'r', 14),
                dead_binder: sys::ior(b'r', 15, $p),
                clear_death_notification_done: sys::ior(b'r', 16, $p),
                failed_reply: sys::io(b'r', 17),
            };

            fn put_word(out: &mut [u8], off: usize, value: u64) {
                if Self::P == 4 {
                    LE::write_u32(&mut out[off..off + 4], value as u32);
                } else {
                    LE::write_u64(&mut out[off..off + 8], value);
                }
            }

            fn get_word(data: &[u8], off: usize) -> u64 {
                if Self::P == 4 {
                    LE::read_u32(&data[off..off + 4]) as u64
                } else {
                    LE::read_u64(&data[off..off + 8])
                }
            }

            fn fill_transaction_data(out: &mut [u8], handle: u32, code: u32,
                bytes: &[u8], tx_flags: u32, offsets: &[usize],
                offsets_buf: &mut Vec<u8>) {
                for b in out[..Self::TXD_SIZE].iter_mut() {
                    *b = 0;
                }
                Self::put_word(out, 0, handle as u64);
                LE::write_u32(&mut out[Self::TXD_CODE..], code);
                LE::write_u32(&mut out[Self::TXD_FLAGS..], tx_flags);
                Self::put_word(out, Self::TXD_DATA_SIZE, bytes.len() as u64);
                Self::put_word(out, Self::TXD_BUFFER, bytes.as_ptr() as u64);
                offsets_buf.clear();
                if !offsets.is_empty() {
                    offsets_buf.resize(offsets.len() * Self::P, 0);
                    for (i, off) in offsets.iter().enumerate() {
                        Self::put_word(offsets_buf, i * Self::P, *off as u64);
                    }
                    Self::put_word(out, Self::TXD_OFFSETS_SIZE,
                        offsets_buf.len() as u64);
                    Self::put_word(out, Self::TXD_OFFSETS,
                        offsets_buf.as_ptr() as u64);
                }
            }
        }

        impl Io for $name {
            fn version(&self) -> i32 {
                $version
            }

            fn pointer_size(&self) -> usize {
                Self::P
            }

            fn bc(&self) -> &'static BcCodes {
                &Self::BC
            }

            fn br(&self) -> &'static BrCodes {
                &Self::BR
            }

            fn object_size(&self, obj: &[u8]) -> usize {
                if obj.len() >= 4 {
                    match LE::read_u32(&obj[..4]) {
                        sys::BINDER_TYPE_BINDER
                        | sys::BINDER_TYPE_WEAK_BINDER
                        | sys::BINDER_TYPE_HANDLE
                        | sys::BINDER_TYPE_WEAK_HANDLE => Self::FLAT_SIZE,
                        sys::BINDER_TYPE_FD => Self::FLAT_SIZE,
                        sys::BINDER_TYPE_FDA => Self::FDA_SIZE,
                        sys::BINDER_TYPE_PTR => Self::BUFFER_OBJECT_SIZE,
                        _ => 0,
                    }
                } else {
                    0
                }
            }

            fn object_data_size(&self, obj: &[u8]) -> usize {
                if obj.len() >= 4 {
                    match LE::read_u32(&obj[..4]) {
                        sys::BINDER_TYPE_PTR => {
                            Self::get_word(obj, 8 + Self::P) as usize
                        }
                        sys::BINDER_TYPE_FDA => {
                            Self::get_word(obj, 8) as usize * 4
                        }
                        _ => 0,
                    }
                } else {
                    0
                }
            }

            fn encode_pointer(&self, out: &mut [u8], ptr: u64) -> usize {
                Self::put_word(out, 0, ptr);
                Self::P
            }

            fn encode_cookie(&self, out: &mut [u8], cookie: u64) -> usize {
                Self::put_word(out, 0, cookie);
                Self::P
            }

            fn encode_local_object(&self, out: &mut [u8], ptr: Option<u64>) -> usize {
                for b in out[..Self::FLAT_SIZE].iter_mut() {
                    *b = 0;
                }
                match ptr {
                    Some(ptr) => {
                        LE::write_u32(&mut out[0..], sys::BINDER_TYPE_BINDER);
                        LE::write_u32(&mut out[4..],
                            sys::FLAT_BINDER_FLAG_PRIORITY_MASK |
                            sys::FLAT_BINDER_FLAG_ACCEPTS_FDS);
                        Self::put_word(out, 8, ptr);
                    }
                    None => {
                        LE::write_u32(&mut out[0..], sys::BINDER_TYPE_WEAK_BINDER);
                    }
                }
                Self::FLAT_SIZE
            }

            fn encode_remote_object(&self, out: &mut [u8], handle: Option<u32>) -> usize {
                for b in out[..Self::FLAT_SIZE].iter_mut() {
                    *b = 0;
                }
                match handle {
                    Some(handle) => {
                        LE::write_u32(&mut out[0..], sys::BINDER_TYPE_HANDLE);
                        LE::write_u32(&mut out[4..], sys::FLAT_BINDER_FLAG_ACCEPTS_FDS);
                        Self::put_word(out, 8, handle as u64);
                    }
                    None => {
                        LE::write_u32(&mut out[0..], sys::BINDER_TYPE_BINDER);
                    }
                }
                Self::FLAT_SIZE
            }

            fn encode_fd_object(&self, out: &mut [u8], fd: RawFd) -> usize {
                for b in out[..Self::FLAT_SIZE].iter_mut() {
                    *b = 0;
                }
                LE::write_u32(&mut out[0..], sys::BINDER_TYPE_FD);
                LE::write_u32(&mut out[4..],
                    sys::FLAT_BINDER_FLAG_PRIORITY_MASK |
                    sys::FLAT_BINDER_FLAG_ACCEPTS_FDS);
                LE::write_u32(&mut out[8..], fd as u32);
                Self::FLAT_SIZE
            }

            fn encode_buffer_object(&self, out: &mut [u8], data: u64,
                size: usize, parent: Option<&Parent>) -> usize {
                for b in out[..Self::BUFFER_OBJECT_SIZE].iter_mut() {
                    *b = 0;
                }
                LE::write_u32(&mut out[0..], sys::BINDER_TYPE_PTR);
                Self::put_word(out, 8, data);
                Self::put_word(out, 8 + Self::P, size as u64);
                if let Some(parent) = parent {
                    LE::write_u32(&mut out[4..], sys::BINDER_BUFFER_FLAG_HAS_PARENT);
                    Self::put_word(out, 8 + 2 * Self::P, parent.index as u64);
                    Self::put_word(out, 8 + 3 * Self::P, parent.offset as u64);
                }
                Self::BUFFER_OBJECT_SIZE
            }

            fn encode_fda_object(&self, out: &mut [u8], num_fds: u32,
                parent: &Parent) -> usize {
                for b in out[..Self::FDA_SIZE].iter_mut() {
                    *b = 0;
                }
                LE::write_u32(&mut out[0..], sys::BINDER_TYPE_FDA);
                Self::put_word(out, 8, num_fds as u64);
                Self::put_word(out, 8 + Self::P, parent.index as u64);
                Self::put_word(out, 8 + 2 * Self::P, parent.offset as u64);
                Self::FDA_SIZE
            }

            fn encode_handle_cookie(&self, out: &mut [u8], handle: u32) -> usize {
                // We find the object by handle, so the handle is the cookie.
                LE::write_u32(&mut out[0..], handle);
                Self::put_word(out, 4, handle as u64);
                Self::HANDLE_COOKIE_SIZE
            }

            fn encode_ptr_cookie(&self, out: &mut [u8], ptr: u64) -> usize {
                // We never send cookies and don't expect them back.
                Self::put_word(out, 0, ptr);
                Self::put_word(out, Self::P, 0);
                Self::PTR_COOKIE_SIZE
            }

            fn encode_transaction(&self, out: &mut [u8], handle: u32, code: u32,
                bytes: &[u8], flags: sys::TxFlags, offsets: &[usize],
                offsets_buf: &mut Vec<u8>) -> usize {
                let tx_flags = if flags.contains(sys::TxFlags::ONEWAY) {
                    sys::TF_ONE_WAY
                } else {
                    sys::TF_ACCEPT_FDS
                };
                Self::fill_transaction_data(out, handle, code, bytes, tx_flags,
                    offsets, offsets_buf);
                Self::TXD_SIZE
            }

            fn encode_transaction_sg(&self, out: &mut [u8], handle: u32,
                code: u32, bytes: &[u8], flags: sys::TxFlags, offsets: &[usize],
                offsets_buf: &mut Vec<u8>, buffers_size: usize) -> usize {
                let n = self.encode_transaction(out, handle, code, bytes, flags,
                    offsets, offsets_buf);
                // The driver requires buffers to be 8-byte aligned
                Self::put_word(out, n, sys::align8(buffers_size) as u64);
                Self::TXD_SG_SIZE
            }

            fn encode_reply(&self, out: &mut [u8], bytes: &[u8],
                offsets: &[usize], offsets_buf: &mut Vec<u8>) -> usize {
                Self::fill_transaction_data(out, 0, 0, bytes, 0, offsets,
                    offsets_buf);
                Self::TXD_SIZE
            }

            fn encode_reply_sg(&self, out: &mut [u8], bytes: &[u8],
                offsets: &[usize], offsets_buf: &mut Vec<u8>,
                buffers_size: usize) -> usize {
                let n = self.encode_reply(out, bytes, offsets, offsets_buf);
                Self::put_word(out, n, sys::align8(buffers_size) as u64);
                Self::TXD_SG_SIZE
            }

            fn encode_status_reply(&self, out: &mut [u8], status: &i32) -> usize {
                for b in out[..Self::TXD_SIZE].iter_mut() {
                    *b = 0;
                }
                LE::write_u32(&mut out[Self::TXD_FLAGS..], sys::TF_STATUS_CODE);
                Self::put_word(out, Self::TXD_DATA_SIZE, 4);
                Self::put_word(out, Self::TXD_BUFFER, status as *const i32 as u64);
                Self::TXD_SIZE
            }

            fn decode_transaction_data(&self, data: &[u8]) -> TxData {
                let mut tx = TxData {
                    status: STATUS_OK,
                    code: LE::read_u32(&data[Self::TXD_CODE..]),
                    flags: 0,
                    pid: LE::read_u32(&data[Self::TXD_PID..]),
                    euid: LE::read_u32(&data[Self::TXD_EUID..]),
                    target: Self::get_word(data, 0),
                    data: Self::get_word(data, Self::TXD_BUFFER),
                    size: Self::get_word(data, Self::TXD_DATA_SIZE) as usize,
                    objects: None,
                };
                let flags = LE::read_u32(&data[Self::TXD_FLAGS..]);
                if flags & sys::TF_STATUS_CODE != 0 {
                    if tx.size == 4 && tx.data != 0 {
                        tx.status = unsafe { *(tx.data as *const i32) };
                    } else {
                        warn!("Malformed status payload ({} bytes)", tx.size);
                        tx.status = STATUS_FAILED;
                    }
                    tx.size = 0;
                } else {
                    if flags & sys::TF_ONE_WAY != 0 {
                        tx.flags |= sys::TxFlags::ONEWAY.bits();
                    }
                    let offsets_size =
                        Self::get_word(data, Self::TXD_OFFSETS_SIZE) as usize;
                    let offsets_ptr = Self::get_word(data, Self::TXD_OFFSETS);
                    let objcount = offsets_size / Self::P;
                    if objcount > 0 && offsets_ptr != 0 {
                        let table = unsafe {
                            slice::from_raw_parts(offsets_ptr as *const u8,
                                objcount * Self::P)
                        };
                        let mut offsets = Vec::with_capacity(objcount);
                        let mut min_offset = 0usize;
                        let mut valid = true;
                        for i in 0..objcount {
                            let off = Self::get_word(table, i * Self::P) as usize;
                            if off < min_offset ||
                                off + Self::FLAT_SIZE > tx.size {
                                warn!("Invalid offset");
                                valid = false;
                                break;
                            }
                            min_offset = off + Self::FLAT_SIZE;
                            offsets.push(off);
                        }
                        if valid {
                            tx.objects = Some(offsets);
                        }
                    }
                }
                tx
            }

            fn decode_ptr_cookie(&self, data: &[u8]) -> u64 {
                Self::get_word(data, 0)
            }

            fn decode_cookie(&self, data: &[u8]) -> u64 {
                Self::get_word(data, 0)
            }

            fn decode_binder_handle(&self, obj: &[u8]) -> Option<(u32, usize)> {
                if obj.len() >= Self::FLAT_SIZE &&
                    LE::read_u32(&obj[..4]) == sys::BINDER_TYPE_HANDLE {
                    Some((Self::get_word(obj, 8) as u32, Self::FLAT_SIZE))
                } else {
                    None
                }
            }

            fn decode_binder_object(&self, obj: &[u8]) -> Option<(FlatObject, usize)> {
                if obj.len() >= Self::FLAT_SIZE {
                    match LE::read_u32(&obj[..4]) {
                        sys::BINDER_TYPE_HANDLE => {
                            let handle = Self::get_word(obj, 8) as u32;
                            return Some((FlatObject::Handle(handle), Self::FLAT_SIZE));
                        }
                        sys::BINDER_TYPE_BINDER if Self::get_word(obj, 8) == 0 => {
                            return Some((FlatObject::Null, Self::FLAT_SIZE));
                        }
                        other => {
                            warn!("Unsupported binder object type 0x{:08x}", other);
                        }
                    }
                }
                None
            }

            fn decode_buffer_object(&self, data: &[u8]) -> Option<(BufferObject, usize)> {
                if data.len() >= Self::BUFFER_OBJECT_SIZE &&
                    LE::read_u32(&data[..4]) == sys::BINDER_TYPE_PTR {
                    let flags = LE::read_u32(&data[4..]);
                    Some((BufferObject {
                        data: Self::get_word(data, 8),
                        size: Self::get_word(data, 8 + Self::P) as usize,
                        parent_offset: Self::get_word(data, 8 + 3 * Self::P) as usize,
                        has_parent: flags & sys::BINDER_BUFFER_FLAG_HAS_PARENT != 0,
                    }, Self::BUFFER_OBJECT_SIZE))
                } else {
                    None
                }
            }

            fn decode_fd_object(&self, data: &[u8]) -> Option<(RawFd, usize)> {
                if data.len() >= Self::FLAT_SIZE &&
                    LE::read_u32(&data[..4]) == sys::BINDER_TYPE_FD {
                    Some((LE::read_u32(&data[8..]) as RawFd, Self::FLAT_SIZE))
                } else {
                    None
                }
            }

            fn write_read(&self, fd: RawFd, mut write: Option<&mut IoBuf>,
                mut read: Option<&mut IoBuf>) -> i32 {
                loop {
                    let mut bwr = [0u8; Self::BWR_SIZE];
                    if let Some(w) = write.as_deref() {
                        Self::put_word(&mut bwr, 0, (w.size - w.consumed) as u64);
                        Self::put_word(&mut bwr, 2 * Self::P,
                            w.ptr + w.consumed as u64);
                    }
                    if let Some(r) = read.as_deref() {
                        Self::put_word(&mut bwr, 3 * Self::P,
                            (r.size - r.consumed) as u64);
                        Self::put_word(&mut bwr, 5 * Self::P,
                            r.ptr + r.consumed as u64);
                    }
                    let ret = unsafe {
                        libc::ioctl(fd, Self::WRITE_READ as libc::c_ulong,
                            bwr.as_mut_ptr())
                    };
                    if ret >= 0 {
                        if let Some(w) = write.as_deref_mut() {
                            w.consumed += Self::get_word(&bwr, Self::P) as usize;
                        }
                        if let Some(r) = read.as_deref_mut() {
                            r.consumed += Self::get_word(&bwr, 4 * Self::P) as usize;
                        }
                        return 0;
                    }
                    let err = nix::errno::errno();
                    if err != libc::EINTR {
                        return -err;
                    }
                }
            }
        }

        pub static $static_name: $name = $name(());
    };
}

binder_io_impl!(Io32, IO32, sys::BINDER_VERSION_32, 4);
binder_io_impl!(Io64, IO64, sys::BINDER_VERSION_64, 8);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::TxFlags;

    #[test]
    fn command_codes_64() {
        // Well-known 64-bit values from the kernel headers.
        assert_eq!(IO64.br().transaction, 0x80407202);
        assert_eq!(IO64.br().reply, 0x80407203);
        assert_eq!(IO64.br().noop, 0x720c);
        assert_eq!(IO64.br().transaction_complete, 0x7206);
        assert_eq!(IO64.bc().enter_looper, 0x630c);
        assert_eq!(IO64.bc().exit_looper, 0x630d);
        assert_eq!(IO64.bc().free_buffer, 0x40086303);
        assert_eq!(sys::ioc_size(IO64.bc().transaction), 64);
        assert_eq!(sys::ioc_size(IO64.bc().transaction_sg), 72);
        assert_eq!(sys::ioc_size(IO32.bc().transaction), 40);
        assert_eq!(sys::ioc_size(IO32.bc().transaction_sg), 44);
    }

    #[test]
    fn object_sizes() {
        let io: &dyn Io = &IO64;
        let mut obj = [0u8; MAX_BUFFER_OBJECT_SIZE];
        assert_eq!(io.encode_local_object(&mut obj, Some(0x1234)), 24);
        assert_eq!(io.object_size(&obj), 24);
        assert_eq!(io.object_data_size(&obj), 0);

        assert_eq!(io.encode_buffer_object(&mut obj, 0xdead, 100, None), 40);
        assert_eq!(io.object_size(&obj), 40);
        assert_eq!(io.object_data_size(&obj), 100);

        let io32: &dyn Io = &IO32;
        assert_eq!(io32.encode_local_object(&mut obj, Some(0x1234)), 16);
        assert_eq!(io32.encode_buffer_object(&mut obj, 0xdead, 7, None), 24);
        assert_eq!(io32.object_data_size(&obj), 7);
    }

    #[test]
    fn flat_object_roundtrip() {
        for io in [&IO32 as &dyn Io, &IO64 as &dyn Io].iter() {
            let mut obj = [0u8; MAX_BINDER_OBJECT_SIZE];
            let n = io.encode_remote_object(&mut obj, Some(42));
            match io.decode_binder_object(&obj[..n]) {
                Some((FlatObject::Handle(h), eaten)) => {
                    assert_eq!(h, 42);
                    assert_eq!(eaten, n);
                }
                other => panic!("unexpected decode: {:?}", other),
            }
            assert_eq!(io.decode_binder_handle(&obj[..n]).unwrap().0, 42);

            let n = io.encode_remote_object(&mut obj, None);
            match io.decode_binder_object(&obj[..n]) {
                Some((FlatObject::Null, _)) => {}
                other => panic!("unexpected decode: {:?}", other),
            }
            assert!(io.decode_binder_handle(&obj[..n]).is_none());
        }
    }

    #[test]
    fn fd_object_roundtrip() {
        let io: &dyn Io = &IO64;
        let mut obj = [0u8; MAX_BINDER_OBJECT_SIZE];
        let n = io.encode_fd_object(&mut obj, 5);
        let (fd, eaten) = io.decode_fd_object(&obj[..n]).unwrap();
        assert_eq!(fd, 5);
        assert_eq!(eaten, n);
        // Not an fd object
        let n = io.encode_local_object(&mut obj, Some(1));
        assert!(io.decode_fd_object(&obj[..n]).is_none());
    }

    #[test]
    fn buffer_object_parent() {
        let io: &dyn Io = &IO64;
        let mut obj = [0u8; MAX_BUFFER_OBJECT_SIZE];
        let parent = Parent { index: 3, offset: 16 };
        let n = io.encode_buffer_object(&mut obj, 0xabcd, 32, Some(&parent));
        let (bo, eaten) = io.decode_buffer_object(&obj[..n]).unwrap();
        assert_eq!(eaten, n);
        assert!(bo.has_parent);
        assert_eq!(bo.data, 0xabcd);
        assert_eq!(bo.size, 32);
        assert_eq!(bo.parent_offset, 16);
    }

    #[test]
    fn transaction_roundtrip() {
        for io in [&IO32 as &dyn Io, &IO64 as &dyn Io].iter() {
            let payload = vec![1u8, 2, 3, 4, 0, 0, 0, 0, 5, 6, 7, 8,
                0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
            let offsets = vec![8usize];
            let mut offsets_buf = Vec::new();
            let mut out = [0u8; MAX_BC_TRANSACTION_SG_SIZE];
            let n = io.encode_transaction(&mut out, 7, 11, &payload,
                TxFlags::empty(), &offsets, &mut offsets_buf);
            assert_eq!(n, sys::ioc_size(io.bc().transaction));

            let tx = io.decode_transaction_data(&out[..n]);
            assert_eq!(tx.code, 11);
            assert_eq!(tx.target, 7);
            assert_eq!(tx.size, payload.len());
            assert_eq!(tx.data, payload.as_ptr() as u64);
            // Offset 8 leaves no room for a flat object in a 24-byte payload
            // on 64-bit, but exactly fits 8 + 16 on 32-bit.
            if io.pointer_size() == 4 {
                assert_eq!(tx.objects, Some(vec![8]));
            } else {
                assert_eq!(tx.objects, None);
            }
        }
    }

    #[test]
    fn oneway_flag_on_wire() {
        let io: &dyn Io = &IO64;
        let payload = [0u8; 4];
        let mut offsets_buf = Vec::new();
        let mut out = [0u8; MAX_BC_TRANSACTION_SG_SIZE];
        let n = io.encode_transaction(&mut out, 1, 2, &payload,
            TxFlags::ONEWAY, &[], &mut offsets_buf);
        let tx = io.decode_transaction_data(&out[..n]);
        assert_eq!(tx.flags & TxFlags::ONEWAY.bits(), TxFlags::ONEWAY.bits());
    }

    #[test]
    fn status_reply() {
        let io: &dyn Io = &IO64;
        let status: i32 = -22;
        let mut out = [0u8; MAX_BC_TRANSACTION_SIZE];
        let n = io.encode_status_reply(&mut out, &status);
        let tx = io.decode_transaction_data(&out[..n]);
        assert_eq!(tx.status, -22);
        assert_eq!(tx.size, 0);
    }

    #[test]
    fn version_selection() {
        assert!(for_version(7).is_some());
        assert!(for_version(8).is_some());
        assert!(for_version(9).is_none());
        assert_eq!(for_version(7).unwrap().pointer_size(), 4);
        assert_eq!(for_version(8).unwrap().pointer_size(), 8);
    }
}
