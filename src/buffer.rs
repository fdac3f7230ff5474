//! Ownership of received transaction memory.
//!
//! The kernel hands us transactions inside the driver's read-only mapping.
//! `BufferContents` is the single owner of one such region: dropping it
//! closes any FD objects the application didn't consume and returns the
//! region with exactly one `BC_FREE_BUFFER`. `Buffer` is a cheap view; a
//! reader can sub-slice it (nested buffer objects point into sibling regions
//! of the same kernel allocation) and every view keeps the root alive.

use std::slice;
use std::sync::{Arc, Mutex};

use log::warn;
use nix::unistd::close;

use crate::driver::Driver;
use crate::io::Io;

enum Backing {
    /// A region inside the driver mapping, freed through the driver.
    Kernel { driver: Arc<Driver>, ptr: u64, size: usize },
    /// Process-local bytes (locally built parcels and tests).
    Heap(Box<[u8]>),
}

pub struct BufferContents {
    io: &'static dyn Io,
    backing: Backing,
    /// Absolute addresses of the objects embedded in the region.
    objects: Vec<u64>,
    /// Objects whose descriptor ownership was transferred to the app.
    consumed_fds: Mutex<Vec<u64>>,
}

// The backing region is exclusively owned and only ever read.
unsafe impl Send for BufferContents {}
unsafe impl Sync for BufferContents {}

impl BufferContents {
    pub(crate) fn new_kernel(driver: Arc<Driver>, ptr: u64, size: usize,
        objects: Vec<u64>) -> Arc<Self> {
        Arc::new(BufferContents {
            io: driver.io(),
            backing: Backing::Kernel { driver, ptr, size },
            objects,
            consumed_fds: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn new_heap(io: &'static dyn Io, data: Box<[u8]>,
        objects: Vec<u64>) -> Arc<Self> {
        Arc::new(BufferContents {
            io,
            backing: Backing::Heap(data),
            objects,
            consumed_fds: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn data_addr(&self) -> u64 {
        match &self.backing {
            Backing::Kernel { ptr, .. } => *ptr,
            Backing::Heap(data) => data.as_ptr() as u64,
        }
    }

    pub(crate) fn size(&self) -> usize {
        match &self.backing {
            Backing::Kernel { size, .. } => *size,
            Backing::Heap(data) => data.len(),
        }
    }

    pub(crate) fn io(&self) -> &'static dyn Io {
        self.io
    }

    pub(crate) fn objects(&self) -> &[u64] {
        &self.objects
    }

    /// The reader transferred this FD object's descriptor to the app;
    /// don't close it when the region goes away.
    pub(crate) fn mark_fd_consumed(&self, addr: u64) {
        self.consumed_fds.lock().unwrap().push(addr);
    }
}

impl Drop for BufferContents {
    fn drop(&mut self) {
        if let Backing::Kernel { ref driver, ptr, size } = self.backing {
            let end = ptr + size as u64;
            let consumed = self.consumed_fds.lock().unwrap();
            for obj in &self.objects {
                if *obj >= end || consumed.contains(obj) {
                    continue;
                }
                let data = unsafe {
                    slice::from_raw_parts(*obj as *const u8, (end - obj) as usize)
                };
                if let Some((fd, _)) = self.io.decode_fd_object(data) {
                    // Opened by the kernel on our behalf
                    if let Err(err) = close(fd) {
                        warn!("Error closing fd {}: {}", fd, err);
                    }
                }
            }
            driver.free_buffer(ptr);
        }
    }
}

/// A view over (a part of) a received region. Cloning or sub-slicing never
/// frees anything; the last view to go away releases the root.
#[derive(Clone)]
pub struct Buffer {
    contents: Arc<BufferContents>,
    addr: u64,
    len: usize,
}

impl Buffer {
    pub(crate) fn from_contents(contents: Arc<BufferContents>) -> Self {
        let addr = contents.data_addr();
        let len = contents.size();
        Buffer { contents, addr, len }
    }

    /// A child view sharing ownership with `parent`. The address range is
    /// trusted to come from a decoded buffer object of the same
    /// transaction, which may point outside the parent's own span.
    pub(crate) fn new_with_parent(parent: &Buffer, addr: u64, len: usize) -> Self {
        Buffer { contents: parent.contents.clone(), addr, len }
    }

    pub(crate) fn contents(&self) -> &Arc<BufferContents> {
        &self.contents
    }

    pub(crate) fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            &[]
        } else {
            unsafe { slice::from_raw_parts(self.addr as *const u8, self.len) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::IO64;

    #[test]
    fn heap_backed_view() {
        let data: Box<[u8]> = vec![1, 2, 3, 4].into();
        let contents = BufferContents::new_heap(&IO64, data, Vec::new());
        let buf = Buffer::from_contents(contents);
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn subslice_shares_ownership() {
        let data: Box<[u8]> = vec![0u8; 16].into();
        let contents = BufferContents::new_heap(&IO64, data, Vec::new());
        let root = Buffer::from_contents(contents.clone());
        let child = Buffer::new_with_parent(&root, root.addr() + 4, 8);
        drop(root);
        // The child still reads valid memory because it holds the root alive
        assert_eq!(child.len(), 8);
        assert_eq!(child.as_slice(), &[0u8; 8]);
        assert_eq!(Arc::strong_count(&contents), 2);
    }
}
