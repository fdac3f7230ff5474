//! Fast Message Queue: a shared-memory, lock-free ring buffer exchanged
//! over binder as a descriptor of memfd grantors, with an optional
//! futex-backed event flag.
//!
//! `read_ptr` and `write_ptr` are monotonically increasing byte counters,
//! not offsets; the ring position is counter mod ring size. Loads of the
//! other side's counter use acquire ordering, stores of our own use
//! release, and a side may read its own counter relaxed.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use log::warn;
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd::{close, ftruncate};

use crate::sys;
use crate::writer::Fds;
use crate::Error;

pub const GRANTOR_DESCRIPTOR_SIZE: usize = 24;
pub const MQ_DESCRIPTOR_SIZE: usize = 32;
pub const MQ_DESCRIPTOR_GRANTORS_OFFSET: usize = 0;
pub const MQ_DESCRIPTOR_FDS_OFFSET: usize = 16;

/* Grantor positions are fixed by the descriptor ABI. */
const READ_PTR_POS: usize = 0;
const WRITE_PTR_POS: usize = 1;
const DATA_PTR_POS: usize = 2;
const EVENT_FLAG_PTR_POS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FmqType {
    /// One reader; read never passes write.
    SyncReadWrite = 0,
    /// Many readers, each with a private read counter; the writer never
    /// waits and may overwrite unread data.
    UnsyncWrite = 1,
}

bitflags! {
    pub struct FmqFlags: u32 {
        /// Reserve and map a shared event flag word.
        const CONFIGURE_EVENT_FLAG = 0x01;
        /// Join an existing queue without zeroing the counters.
        const NO_RESET_POINTERS = 0x02;
    }
}

/// One entry of the descriptor's grantor vector (24 bytes on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantorDescriptor {
    pub flags: u32,
    pub fd_index: u32,
    pub offset: u32,
    pub extent: u64,
}

/// The serializable identity of a queue: grantors, backing descriptors,
/// item size and the sync flavor (32 bytes on the wire plus the vectors).
pub struct MqDescriptor {
    pub grantors: Vec<GrantorDescriptor>,
    pub fds: Fds,
    pub quantum: u32,
    pub flags: u32,
}

enum ReadCounter {
    /// Mapped into the shared region (sync queues).
    Shared(u64),
    /// Private to this reader (unsync queues).
    Private(Box<AtomicU64>),
}

pub struct Fmq {
    desc: MqDescriptor,
    ring: u64,
    write_ptr: u64,
    read: ReadCounter,
    event_flag: Option<u64>,
    mappings: Vec<(u64, usize)>,
    owned_fds: Vec<RawFd>,
}

// All shared state is reached through atomics; the mappings themselves are
// exclusively owned.
unsafe impl Send for Fmq {}
unsafe impl Sync for Fmq {}

fn build_grantors(queue_size: usize, num_fds: usize, event_flag: bool)
    -> Vec<GrantorDescriptor> {
    let count = if event_flag { EVENT_FLAG_PTR_POS + 1 } else { DATA_PTR_POS + 1 };
    let sizes = [
        8u64,               // read pointer counter
        8,                  // write pointer counter
        queue_size as u64,  // ring
        4,                  // event flag word
    ];
    let mut grantors = Vec::with_capacity(count);
    let mut offset = 0usize;
    for (pos, size) in sizes.iter().take(count).enumerate() {
        let (fd_index, grantor_offset) = if pos == DATA_PTR_POS && num_fds == 2 {
            // Ring supplied by the caller in its own fd
            (1, 0)
        } else {
            let current = offset;
            offset += *size as usize;
            (0, current)
        };
        grantors.push(GrantorDescriptor {
            flags: 0,
            fd_index,
            offset: sys::align8(grantor_offset) as u32,
            extent: *size,
        });
    }
    grantors
}

fn map_grantor(fds: &Fds, grantor: &GrantorDescriptor,
    mappings: &mut Vec<(u64, usize)>) -> Option<u64> {
    let fd = *fds.fds.get(grantor.fd_index as usize)?;
    let page_mask = (sys::page_size() - 1) as u32;
    // The mmap offset must be page aligned
    let map_offset = grantor.offset & !page_mask;
    let map_len = (grantor.offset - map_offset) as usize + grantor.extent as usize;
    match unsafe {
        mmap(ptr::null_mut(), map_len, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED, fd, map_offset as i64)
    } {
        Ok(address) => {
            mappings.push((address as u64, map_len));
            Some(address as u64 + (grantor.offset - map_offset) as u64)
        }
        Err(err) => {
            warn!("mmap failed: {}", err);
            None
        }
    }
}

impl Fmq {
    /// Creates a queue of `num_items` items of `item_size` bytes each. An
    /// external ring fd may be supplied together with its usable size; the
    /// memfd then carries only the counters (and the event flag).
    pub fn new(item_size: usize, num_items: usize, fmq_type: FmqType,
        flags: FmqFlags, external_fd: Option<RawFd>, buffer_size: usize)
        -> Result<Fmq, Error> {
        if item_size == 0 {
            warn!("Incorrect item size");
            return Err(Error::InvalidArgument);
        }
        if num_items == 0 {
            warn!("Empty queue requested");
            return Err(Error::InvalidArgument);
        }
        if num_items > usize::MAX / item_size {
            warn!("Requested message queue size too large");
            return Err(Error::InvalidArgument);
        }
        if external_fd.is_some() && num_items * item_size > buffer_size {
            warn!("The size needed for items ({}) is larger than the \
                supplied buffer size ({})", num_items * item_size, buffer_size);
            return Err(Error::InvalidArgument);
        }

        let configure_event_flag = flags.contains(FmqFlags::CONFIGURE_EVENT_FLAG);
        let queue_size = item_size * num_items;
        let mut meta_size = 2 * 8;
        if configure_event_flag {
            meta_size += 4;
        }
        let shmem_size = if external_fd.is_some() {
            sys::align_page(meta_size)
        } else {
            sys::align_page(sys::align8(queue_size) + meta_size)
        };

        let name = CString::new("MessageQueue").unwrap();
        let shmem_fd = memfd_create(&name, MemFdCreateFlag::MFD_CLOEXEC)?;
        if let Err(err) = ftruncate(shmem_fd, shmem_size as i64) {
            let _ = close(shmem_fd);
            return Err(err.into());
        }

        let mut fd_list = vec![shmem_fd];
        if let Some(fd) = external_fd {
            fd_list.push(fd);
        }
        let num_fds = fd_list.len();
        let desc = MqDescriptor {
            grantors: build_grantors(queue_size, num_fds, configure_event_flag),
            fds: Fds { fds: fd_list, ints: Vec::new() },
            quantum: item_size as u32,
            flags: fmq_type as u32,
        };

        let fmq = Fmq::map(desc, vec![shmem_fd])?;

        if !flags.contains(FmqFlags::NO_RESET_POINTERS) {
            fmq.read_counter().store(0, Ordering::Release);
            fmq.write_counter().store(0, Ordering::Release);
        } else if fmq_type != FmqType::SyncReadWrite {
            // Every unsync reader starts from its own zeroed counter
            fmq.read_counter().store(0, Ordering::Release);
        }
        Ok(fmq)
    }

    /// Opens the peer side of a queue from a received descriptor, taking
    /// ownership of its descriptors. Counters are left as the peer set
    /// them.
    pub fn from_descriptor(desc: MqDescriptor) -> Result<Fmq, Error> {
        let owned = desc.fds.fds.clone();
        Fmq::map(desc, owned)
    }

    fn map(desc: MqDescriptor, owned_fds: Vec<RawFd>) -> Result<Fmq, Error> {
        if desc.grantors.len() < DATA_PTR_POS + 1 || desc.quantum == 0 {
            return Err(Error::InvalidArgument);
        }
        let unsync = desc.flags == FmqType::UnsyncWrite as u32;
        let mut mappings = Vec::new();

        let read = if unsync {
            // Unsync queues have one read counter per reader
            ReadCounter::Private(Box::new(AtomicU64::new(0)))
        } else {
            match map_grantor(&desc.fds, &desc.grantors[READ_PTR_POS], &mut mappings) {
                Some(addr) => ReadCounter::Shared(addr),
                None => {
                    warn!("Read pointer is null");
                    return Err(Error::InvalidArgument);
                }
            }
        };
        let write_ptr = match map_grantor(&desc.fds,
            &desc.grantors[WRITE_PTR_POS], &mut mappings) {
            Some(addr) => addr,
            None => {
                warn!("Write pointer is null");
                return Err(Error::InvalidArgument);
            }
        };
        let ring = match map_grantor(&desc.fds, &desc.grantors[DATA_PTR_POS],
            &mut mappings) {
            Some(addr) => addr,
            None => {
                warn!("Ring buffer pointer is null");
                return Err(Error::InvalidArgument);
            }
        };
        let event_flag = if desc.grantors.len() > EVENT_FLAG_PTR_POS {
            let addr = map_grantor(&desc.fds, &desc.grantors[EVENT_FLAG_PTR_POS],
                &mut mappings);
            if addr.is_none() {
                warn!("Event flag pointer is null");
            }
            addr
        } else {
            None
        };

        Ok(Fmq {
            desc,
            ring,
            write_ptr,
            read,
            event_flag,
            mappings,
            owned_fds,
        })
    }

    pub fn descriptor(&self) -> &MqDescriptor {
        &self.desc
    }

    pub fn item_size(&self) -> usize {
        self.desc.quantum as usize
    }

    fn ring_size(&self) -> usize {
        self.desc.grantors[DATA_PTR_POS].extent as usize
    }

    fn read_counter(&self) -> &AtomicU64 {
        match &self.read {
            ReadCounter::Shared(addr) => unsafe { &*(*addr as *const AtomicU64) },
            ReadCounter::Private(counter) => counter,
        }
    }

    fn write_counter(&self) -> &AtomicU64 {
        unsafe { &*(self.write_ptr as *const AtomicU64) }
    }

    fn event_flag_word(&self) -> Option<&AtomicU32> {
        self.event_flag.map(|addr| unsafe { &*(addr as *const AtomicU32) })
    }

    fn available_to_read_bytes(&self, contiguous: bool) -> usize {
        let read = self.read_counter().load(Ordering::Acquire);
        let total = self.write_counter().load(Ordering::Acquire)
            .wrapping_sub(read) as usize;
        if contiguous {
            let size = self.ring_size();
            let ahead = size - (read as usize % size);
            ahead.min(total)
        } else {
            total
        }
    }

    fn available_to_write_bytes(&self, contiguous: bool) -> usize {
        let size = self.ring_size();
        let total = size - self.available_to_read_bytes(false);
        if contiguous {
            let write = self.write_counter().load(Ordering::Relaxed);
            let ahead = size - (write as usize % size);
            ahead.min(total)
        } else {
            total
        }
    }

    pub fn available_to_read(&self) -> usize {
        self.available_to_read_bytes(false) / self.item_size()
    }

    pub fn available_to_write(&self) -> usize {
        self.available_to_write_bytes(false) / self.item_size()
    }

    pub fn available_to_read_contiguous(&self) -> usize {
        self.available_to_read_bytes(true) / self.item_size()
    }

    pub fn available_to_write_contiguous(&self) -> usize {
        self.available_to_write_bytes(true) / self.item_size()
    }

    /// Position of the next `items` items to read, or None when the queue
    /// holds fewer than that. The returned region does not wrap; use
    /// `read` for transparent wrap-around.
    pub fn begin_read(&self, items: usize) -> Option<*const u8> {
        if items == 0 {
            return None;
        }
        let size = self.ring_size();
        let item_size = self.item_size();
        let write = self.write_counter().load(Ordering::Acquire);
        let read = self.read_counter().load(Ordering::Relaxed);
        if write % item_size as u64 != 0 || read % item_size as u64 != 0 {
            warn!("Unable to read data because of misaligned pointer");
            None
        } else if write.wrapping_sub(read) > size as u64 {
            // The writer lapped us (unsync); skip to the present
            self.read_counter().store(write, Ordering::Release);
            None
        } else if write.wrapping_sub(read) < (items * item_size) as u64 {
            None
        } else {
            Some((self.ring + read % size as u64) as *const u8)
        }
    }

    pub fn end_read(&self, items: usize) {
        if items == 0 {
            return;
        }
        let size = self.ring_size() as u64;
        let read = self.read_counter().load(Ordering::Relaxed);
        let write = self.write_counter().load(Ordering::Acquire);
        if write.wrapping_sub(read) > size {
            // Unsync overflow while we were reading
            self.read_counter().store(write, Ordering::Release);
        } else {
            self.read_counter().store(
                read + (items * self.item_size()) as u64, Ordering::Release);
        }
    }

    /// Position for writing `items` items. A sync queue refuses when the
    /// space isn't there; an unsync queue only refuses requests larger
    /// than the whole ring.
    pub fn begin_write(&self, items: usize) -> Option<*mut u8> {
        if items == 0 {
            return None;
        }
        let size = self.ring_size();
        let item_size = self.item_size();
        let sync = self.desc.flags == FmqType::SyncReadWrite as u32;
        if (sync && self.available_to_write() < items) || items > size / item_size {
            None
        } else {
            let write = self.write_counter().load(Ordering::Relaxed);
            if write % item_size as u64 != 0 {
                warn!("The write pointer has become misaligned");
                None
            } else {
                Some((self.ring + write % size as u64) as *mut u8)
            }
        }
    }

    pub fn end_write(&self, items: usize) {
        if items == 0 {
            return;
        }
        let write = self.write_counter().load(Ordering::Relaxed);
        self.write_counter().store(
            write + (items * self.item_size()) as u64, Ordering::Release);
    }

    /// Copies `items` items out of the queue, splitting the copy when the
    /// region wraps around the ring boundary.
    pub fn read(&self, data: &mut [u8], items: usize) -> bool {
        let item_size = self.item_size();
        assert!(data.len() >= items * item_size);
        let src = match self.begin_read(items) {
            Some(src) => src,
            None => return false,
        };
        let contiguous = self.available_to_read_contiguous();
        unsafe {
            if contiguous < items {
                ptr::copy_nonoverlapping(src, data.as_mut_ptr(),
                    contiguous * item_size);
                ptr::copy_nonoverlapping(self.ring as *const u8,
                    data.as_mut_ptr().add(contiguous * item_size),
                    (items - contiguous) * item_size);
            } else {
                ptr::copy_nonoverlapping(src, data.as_mut_ptr(),
                    items * item_size);
            }
        }
        self.end_read(items);
        true
    }

    /// Copies `items` items into the queue, wrapping as needed.
    pub fn write(&self, data: &[u8], items: usize) -> bool {
        let item_size = self.item_size();
        assert!(data.len() >= items * item_size);
        let dest = match self.begin_write(items) {
            Some(dest) => dest,
            None => return false,
        };
        let contiguous = self.available_to_write_contiguous();
        unsafe {
            if contiguous < items {
                ptr::copy_nonoverlapping(data.as_ptr(), dest,
                    contiguous * item_size);
                ptr::copy_nonoverlapping(data.as_ptr().add(contiguous * item_size),
                    self.ring as *mut u8, (items - contiguous) * item_size);
            } else {
                ptr::copy_nonoverlapping(data.as_ptr(), dest, items * item_size);
            }
        }
        self.end_write(items);
        true
    }

    /// Waits for any bit of `mask` to appear in the event flag. Timeout is
    /// -1 (forever), 0 (try) or milliseconds. On success the matching bits
    /// land in `state` (cleared in the flag); errors are -EINVAL, -ENOSYS
    /// (no event flag), -ETIMEDOUT or -EAGAIN (woken without a bit).
    pub fn wait_timeout(&self, mask: u32, state: &mut u32, timeout_ms: i32) -> i32 {
        let flag = match self.event_flag_word() {
            Some(flag) => flag,
            None => return -libc::ENOSYS,
        };
        if mask == 0 {
            return -libc::EINVAL;
        }
        let old = flag.fetch_and(!mask, Ordering::SeqCst);
        let set = old & mask;
        if set != 0 {
            *state = set;
            return 0;
        }
        if timeout_ms == 0 {
            return -libc::ETIMEDOUT;
        }
        let addr = flag as *const AtomicU32;
        let ret = if timeout_ms > 0 {
            let mut deadline = libc::timespec { tv_sec: 0, tv_nsec: 0 };
            unsafe {
                libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut deadline);
            }
            deadline.tv_sec += (timeout_ms / 1000) as libc::time_t;
            deadline.tv_nsec += ((timeout_ms % 1000) as libc::c_long) * 1_000_000;
            if deadline.tv_nsec >= 1_000_000_000 {
                deadline.tv_sec += 1;
                deadline.tv_nsec -= 1_000_000_000;
            }
            unsafe {
                libc::syscall(libc::SYS_futex, addr, libc::FUTEX_WAIT_BITSET,
                    old, &deadline as *const libc::timespec,
                    ptr::null::<u32>(), mask)
            }
        } else {
            unsafe {
                libc::syscall(libc::SYS_futex, addr, libc::FUTEX_WAIT_BITSET,
                    old, ptr::null::<libc::timespec>(), ptr::null::<u32>(), mask)
            }
        };
        if ret == -1 {
            let err = nix::errno::errno();
            return if err != 0 { -err } else { -libc::EFAULT };
        }
        let old = flag.fetch_and(!mask, Ordering::SeqCst);
        *state = old & mask;
        if *state != 0 {
            0
        } else {
            -libc::EAGAIN
        }
    }

    /// Sets bits in the event flag and wakes the waiters that asked for
    /// them. Waking is skipped when every bit was already set.
    pub fn wake(&self, mask: u32) -> i32 {
        let flag = match self.event_flag_word() {
            Some(flag) => flag,
            None => return -libc::ENOSYS,
        };
        if mask == 0 {
            return 0;
        }
        let old = flag.fetch_or(mask, Ordering::SeqCst);
        if (!old & mask) != 0 {
            let addr = flag as *const AtomicU32;
            let ret = unsafe {
                libc::syscall(libc::SYS_futex, addr, libc::FUTEX_WAKE_BITSET,
                    i32::MAX, ptr::null::<libc::timespec>(),
                    ptr::null::<u32>(), mask)
            };
            if ret == -1 {
                return -nix::errno::errno();
            }
        }
        0
    }
}

impl Drop for Fmq {
    fn drop(&mut self) {
        for (addr, len) in self.mappings.drain(..) {
            unsafe {
                let _ = munmap(addr as *mut _, len);
            }
        }
        for fd in self.owned_fds.drain(..) {
            let _ = close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn sync_queue(item_size: usize, num_items: usize) -> Fmq {
        Fmq::new(item_size, num_items, FmqType::SyncReadWrite,
            FmqFlags::empty(), None, 0).unwrap()
    }

    #[test]
    fn grantor_layout() {
        let grantors = build_grantors(32, 1, true);
        assert_eq!(grantors.len(), 4);
        assert_eq!(grantors[READ_PTR_POS].offset, 0);
        assert_eq!(grantors[WRITE_PTR_POS].offset, 8);
        assert_eq!(grantors[DATA_PTR_POS].offset, 16);
        assert_eq!(grantors[DATA_PTR_POS].extent, 32);
        assert_eq!(grantors[EVENT_FLAG_PTR_POS].offset, 48);
        // External ring uses the second fd at offset zero
        let grantors = build_grantors(32, 2, false);
        assert_eq!(grantors.len(), 3);
        assert_eq!(grantors[DATA_PTR_POS].fd_index, 1);
        assert_eq!(grantors[DATA_PTR_POS].offset, 0);
    }

    #[test]
    fn rejects_bad_geometry() {
        assert!(Fmq::new(0, 8, FmqType::SyncReadWrite, FmqFlags::empty(),
            None, 0).is_err());
        assert!(Fmq::new(4, 0, FmqType::SyncReadWrite, FmqFlags::empty(),
            None, 0).is_err());
    }

    #[test]
    fn sync_availability_invariant() {
        let q = sync_queue(4, 8);
        assert_eq!(q.available_to_read(), 0);
        assert_eq!(q.available_to_write(), 8);
        assert!(q.write(&1u32.to_le_bytes(), 1));
        assert_eq!(q.available_to_read(), 1);
        assert_eq!(q.available_to_write(), 7);
        assert_eq!(q.available_to_read() + q.available_to_write(), 8);
    }

    #[test]
    fn sync_refuses_overfill() {
        let q = sync_queue(4, 4);
        let data = [0u8; 16];
        assert!(q.write(&data, 4));
        assert!(!q.write(&data[..4], 1));
        let mut out = [0u8; 16];
        assert!(q.read(&mut out, 4));
        assert!(q.write(&data[..4], 1));
    }

    #[test]
    fn ring_wrap_preserves_order() {
        // Write 6, read 4, write 4 (wraps), read 6
        let q = sync_queue(4, 8);
        let items: Vec<u32> = (0..6).collect();
        let bytes: Vec<u8> = items.iter().flat_map(|i| i.to_le_bytes()).collect();
        assert!(q.write(&bytes, 6));

        let mut out = [0u8; 16];
        assert!(q.read(&mut out, 4));
        let got: Vec<u32> = out.chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(got, vec![0, 1, 2, 3]);

        let more: Vec<u8> = (6..10u32).flat_map(|i| i.to_le_bytes()).collect();
        assert!(q.write(&more, 4));

        let mut out = [0u8; 24];
        assert!(q.read(&mut out, 6));
        let got: Vec<u32> = out.chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(got, vec![4, 5, 6, 7, 8, 9]);
        assert_eq!(q.available_to_read(), 0);
    }

    #[test]
    fn unsync_overflow_snaps_reader() {
        let q = Fmq::new(4, 4, FmqType::UnsyncWrite, FmqFlags::empty(),
            None, 0).unwrap();
        let data = [7u8; 16];
        // The writer never refuses and laps the reader
        assert!(q.write(&data, 4));
        assert!(q.write(&data, 4));
        let mut out = [0u8; 4];
        // The reader detects the overflow and snaps to the present
        assert!(!q.read(&mut out, 1));
        assert_eq!(q.available_to_read(), 0);
        assert!(q.write(&[9, 9, 9, 9], 1));
        assert!(q.read(&mut out, 1));
        assert_eq!(out, [9, 9, 9, 9]);
    }

    #[test]
    fn event_flag_wait_and_wake() {
        let q = Arc::new(Fmq::new(4, 4, FmqType::SyncReadWrite,
            FmqFlags::CONFIGURE_EVENT_FLAG, None, 0).unwrap());

        // Already-set bits return immediately
        assert_eq!(q.wake(0x2), 0);
        let mut state = 0;
        assert_eq!(q.wait_timeout(0x2, &mut state, -1), 0);
        assert_eq!(state, 0x2);

        // try-wait on an empty flag times out
        assert_eq!(q.wait_timeout(0x2, &mut state, 0), -libc::ETIMEDOUT);

        let waiter = {
            let q = q.clone();
            thread::spawn(move || {
                let mut state = 0;
                let ret = q.wait_timeout(0x1, &mut state, 5000);
                (ret, state)
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(q.wake(0x1), 0);
        let (ret, state) = waiter.join().unwrap();
        assert_eq!(ret, 0);
        assert_eq!(state, 0x1);
    }

    #[test]
    fn event_flag_errors() {
        let q = sync_queue(4, 4);
        let mut state = 0;
        assert_eq!(q.wait_timeout(0x1, &mut state, -1), -libc::ENOSYS);
        assert_eq!(q.wake(0x1), -libc::ENOSYS);
        let q = Fmq::new(4, 4, FmqType::SyncReadWrite,
            FmqFlags::CONFIGURE_EVENT_FLAG, None, 0).unwrap();
        assert_eq!(q.wait_timeout(0, &mut state, -1), -libc::EINVAL);
    }

    #[test]
    fn descriptor_parcel_roundtrip() {
        use crate::io::IO64;
        use crate::reader::testutil::reader_for;
        use crate::writer::{Writer, WriterData};

        let q = Fmq::new(4, 8, FmqType::SyncReadWrite,
            FmqFlags::CONFIGURE_EVENT_FLAG, None, 0).unwrap();
        let mut data = WriterData::new(&IO64);
        let mut w = Writer::new(&mut data);
        w.append_fmq_descriptor(&q);
        // mqdesc + grantor vec + fds block + fd array
        let mut r = reader_for(&data);
        let desc = r.read_fmq_descriptor().unwrap();
        assert_eq!(desc.quantum, 4);
        assert_eq!(desc.flags, FmqType::SyncReadWrite as u32);
        assert_eq!(desc.grantors, q.descriptor().grantors);
        assert_eq!(desc.fds.fds, q.descriptor().fds.fds);
        assert!(r.at_end());
    }

    #[test]
    fn descriptor_reopens_queue() {
        use nix::fcntl::{fcntl, FcntlArg};
        let q = sync_queue(4, 8);
        assert!(q.write(&5u32.to_le_bytes(), 1));

        // A peer would receive dup'd descriptors through the parcel
        let fds = Fds {
            fds: q.descriptor().fds.fds.iter()
                .map(|fd| fcntl(*fd, FcntlArg::F_DUPFD_CLOEXEC(0)).unwrap())
                .collect(),
            ints: Vec::new(),
        };
        let desc = MqDescriptor {
            grantors: q.descriptor().grantors.clone(),
            fds,
            quantum: q.descriptor().quantum,
            flags: q.descriptor().flags,
        };
        let peer = Fmq::from_descriptor(desc).unwrap();
        let mut out = [0u8; 4];
        assert!(peer.read(&mut out, 1));
        assert_eq!(u32::from_le_bytes(out), 5);
        assert_eq!(q.available_to_read(), 0);
    }
}
