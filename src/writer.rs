//! Append-only parcel builder.
//!
//! A parcel under construction is a growable byte vector, the offsets of the
//! binder objects embedded in it, the running `buffers_size` total the kernel
//! needs for scatter-gather layout, and a cleanup list. Buffer objects carry
//! raw pointers; anything they point at is either caller-owned for the
//! lifetime of the parcel or allocated from the parcel's own arena
//! (`memdup`/`strdup`/`alloc`), which keeps the memory alive until the parcel
//! is dropped.

use std::os::unix::io::RawFd;

use byteorder::{ByteOrder, LittleEndian as LE};
use log::warn;
use nix::fcntl::{fcntl, FcntlArg};
use nix::unistd::close;

use crate::cleanup::Cleanup;
use crate::io::{Io, Parent, MAX_BINDER_OBJECT_SIZE, MAX_BUFFER_OBJECT_SIZE};
use crate::object::{LocalObject, RemoteObject};
use crate::sys;
use std::sync::Arc;

/// Layout of a hidl_string body: {data*, len: u32, owns: u8}, padded to 16.
pub const HIDL_STRING_SIZE: usize = 16;
pub const HIDL_STRING_BUFFER_OFFSET: usize = 0;
/// Layout of a hidl_vec body: {data*, count: u32, owns: u8}, padded to 16.
pub const HIDL_VEC_SIZE: usize = 16;
pub const HIDL_VEC_BUFFER_OFFSET: usize = 0;

/// Header of an fds block (native-handle shaped): {version, num_fds, num_ints}, followed by
/// the descriptors and then the ints.
pub const FDS_HEADER_SIZE: usize = 12;

/// An fd block serialized as a parented buffer pair plus an FD_ARRAY object.
#[derive(Debug, Clone, Default)]
pub struct Fds {
    pub fds: Vec<RawFd>,
    pub ints: Vec<i32>,
}

impl Fds {
    pub fn total_size(&self) -> usize {
        FDS_HEADER_SIZE + 4 * (self.fds.len() + self.ints.len())
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let total = self.total_size();
        let mut out = vec![0u8; total];
        LE::write_u32(&mut out[0..], total as u32);
        LE::write_u32(&mut out[4..], self.fds.len() as u32);
        LE::write_u32(&mut out[8..], self.ints.len() as u32);
        let mut off = FDS_HEADER_SIZE;
        for fd in &self.fds {
            LE::write_i32(&mut out[off..], *fd);
            off += 4;
        }
        for i in &self.ints {
            LE::write_i32(&mut out[off..], *i);
            off += 4;
        }
        out
    }
}

/// Declarative description of a struct serialized as a nested buffer-object
/// graph, so that callers don't wire parent links by hand.
pub struct WriterType {
    pub name: &'static str,
    pub size: usize,
    pub fields: &'static [WriterField],
}

pub struct WriterField {
    pub name: &'static str,
    pub offset: usize,
    pub kind: WriterFieldKind,
}

pub enum WriterFieldKind {
    /// A plain pointer field to a fixed-size child struct.
    Pointer(&'static WriterType),
    /// An embedded hidl_string.
    HidlString,
    /// An embedded hidl_vec; element type None means raw bytes.
    HidlVec(Option<&'static WriterType>),
}

pub static TYPE_BYTE: WriterType = WriterType { name: "byte", size: 1, fields: &[] };
pub static TYPE_INT32: WriterType = WriterType { name: "int32", size: 4, fields: &[] };
pub static TYPE_HIDL_STRING: WriterType = WriterType {
    name: "hidl_string",
    size: HIDL_STRING_SIZE,
    fields: &[WriterField {
        name: "hidl_string.data.str",
        offset: 0,
        kind: WriterFieldKind::HidlString,
    }],
};

/// The mutable state behind a `Writer`, owned by LocalRequest/LocalReply.
pub struct WriterData {
    pub(crate) io: &'static dyn Io,
    pub(crate) bytes: Vec<u8>,
    pub(crate) offsets: Vec<usize>,
    pub(crate) buffers_size: usize,
    pub(crate) cleanup: Cleanup,
    arena: Vec<Box<[u8]>>,
}

/// Snapshot of a built parcel, as the driver consumes it.
pub struct OutputData<'a> {
    pub bytes: &'a [u8],
    pub offsets: &'a [usize],
    pub buffers_size: usize,
}

impl WriterData {
    pub fn new(io: &'static dyn Io) -> Self {
        WriterData {
            io,
            bytes: Vec::new(),
            offsets: Vec::new(),
            buffers_size: 0,
            cleanup: Cleanup::new(),
            arena: Vec::new(),
        }
    }

    pub fn output(&self) -> OutputData<'_> {
        OutputData {
            bytes: &self.bytes,
            offsets: &self.offsets,
            buffers_size: self.buffers_size,
        }
    }
}

/// The append-only surface over a parcel. Obtained from
/// `LocalRequest::writer()` / `LocalReply::writer()`.
pub struct Writer<'a> {
    data: &'a mut WriterData,
}

impl<'a> Writer<'a> {
    pub(crate) fn new(data: &'a mut WriterData) -> Self {
        Writer { data }
    }

    pub fn bytes_written(&self) -> usize {
        self.data.bytes.len()
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data.bytes
    }

    fn record_offset(&mut self, offset: usize) {
        self.data.offsets.push(offset);
    }

    fn push_u32(&mut self, value: u32) {
        let off = self.data.bytes.len();
        self.data.bytes.resize(off + 4, 0);
        LE::write_u32(&mut self.data.bytes[off..], value);
    }

    fn push_u64(&mut self, value: u64) {
        let off = self.data.bytes.len();
        self.data.bytes.resize(off + 8, 0);
        LE::write_u64(&mut self.data.bytes[off..], value);
    }

    /* Arena: transient allocations that must outlive individual appends but
     * die with the parcel. The returned address stays valid (and unmoved)
     * for the parcel's lifetime. */

    pub fn memdup(&mut self, data: &[u8]) -> u64 {
        let boxed: Box<[u8]> = data.into();
        let addr = boxed.as_ptr() as u64;
        self.data.arena.push(boxed);
        addr
    }

    pub fn strdup(&mut self, s: &str) -> u64 {
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        self.memdup(&bytes)
    }

    pub fn alloc(&mut self, size: usize) -> u64 {
        self.memdup_zeroed(size)
    }

    fn memdup_zeroed(&mut self, size: usize) -> u64 {
        let boxed: Box<[u8]> = vec![0u8; size].into();
        let addr = boxed.as_ptr() as u64;
        self.data.arena.push(boxed);
        addr
    }

    pub fn add_cleanup<F: FnOnce() + Send + 'static>(&mut self, action: F) {
        self.data.cleanup.add(action);
    }

    /* Primitives. Everything smaller than 4 bytes is padded to 4; 64-bit
     * values are appended without extra alignment, as the kernel parcel
     * format expects. */

    pub fn append_bool(&mut self, value: bool) {
        self.push_u32(value as u32);
    }

    pub fn append_i8(&mut self, value: i8) {
        self.push_u32(value as u8 as u32);
    }

    pub fn append_i16(&mut self, value: i16) {
        self.push_u32(value as u16 as u32);
    }

    pub fn append_i32(&mut self, value: i32) {
        self.push_u32(value as u32);
    }

    pub fn append_u32(&mut self, value: u32) {
        self.push_u32(value);
    }

    pub fn append_i64(&mut self, value: i64) {
        self.push_u64(value as u64);
    }

    pub fn append_u64(&mut self, value: u64) {
        self.push_u64(value);
    }

    pub fn append_f32(&mut self, value: f32) {
        self.push_u32(value.to_bits());
    }

    pub fn append_f64(&mut self, value: f64) {
        self.push_u64(value.to_bits());
    }

    /// Raw copy, no alignment.
    pub fn append_bytes(&mut self, data: &[u8]) {
        self.data.bytes.extend_from_slice(data);
    }

    /// i32 length prefix (-1 for empty) then the payload, FF-padded to a
    /// 4-byte multiple. That's how Android frames byte arrays.
    pub fn append_byte_array(&mut self, data: &[u8]) {
        if data.is_empty() {
            self.append_i32(-1);
        } else {
            let padded = sys::align4(data.len());
            self.append_i32(data.len() as i32);
            let off = self.data.bytes.len();
            self.data.bytes.resize(off + padded, 0xff);
            self.data.bytes[off..off + data.len()].copy_from_slice(data);
        }
    }

    /// UTF-8 with a NUL terminator, zero-padded to 4 bytes. A null string
    /// writes nothing at all.
    pub fn append_string8(&mut self, s: Option<&str>) {
        if let Some(s) = s {
            let len = s.len();
            let padded = sys::align4(len + 1);
            let off = self.data.bytes.len();
            self.data.bytes.resize(off + padded, 0);
            self.data.bytes[off..off + len].copy_from_slice(s.as_bytes());
        }
    }

    /// UTF-16: i32 unit count, the units, a NUL unit, zero padding to 4.
    /// Null writes -1; empty writes 0 followed by 0x0000 0xffff.
    pub fn append_string16(&mut self, s: Option<&str>) {
        match s {
            None => self.append_i32(-1),
            Some("") => {
                self.append_i32(0);
                let off = self.data.bytes.len();
                self.data.bytes.resize(off + 4, 0);
                LE::write_u16(&mut self.data.bytes[off + 2..], 0xffff);
            }
            Some(s) => {
                let units: Vec<u16> = s.encode_utf16().collect();
                self.append_string16_utf16(&units);
            }
        }
    }

    /// Same layout, bypassing UTF-8 conversion.
    pub fn append_string16_utf16(&mut self, units: &[u16]) {
        if units.is_empty() {
            self.append_string16(Some(""));
            return;
        }
        let padded = sys::align4((units.len() + 1) * 2);
        self.append_i32(units.len() as i32);
        let off = self.data.bytes.len();
        self.data.bytes.resize(off + padded, 0);
        for (i, unit) in units.iter().enumerate() {
            LE::write_u16(&mut self.data.bytes[off + i * 2..], *unit);
        }
    }

    /// Overwrites a previously appended i32, for sentinels and forward
    /// references.
    pub fn overwrite_i32(&mut self, offset: usize, value: i32) {
        if self.data.bytes.len() >= offset + 4 {
            LE::write_i32(&mut self.data.bytes[offset..], value);
        } else {
            warn!("Can't overwrite at {} as buffer is only {} bytes long",
                offset, self.data.bytes.len());
        }
    }

    /// AIDL parcelable framing: i32(1) + i32(len + 4) + payload, or i32(0)
    /// for null. Not guaranteed to work for any other parcelable kind.
    pub fn append_parcelable(&mut self, payload: Option<&[u8]>) {
        match payload {
            Some(payload) => {
                self.append_i32(1);
                self.append_i32(payload.len() as i32 + 4);
                self.append_bytes(payload);
            }
            None => self.append_i32(0),
        }
    }

    /* Objects. Every object append records its offset; buffer objects also
     * grow buffers_size by their 8-byte aligned length. */

    pub fn append_local_object(&mut self, obj: Option<&Arc<LocalObject>>) {
        let ptr = obj.map(|o| o.raw_ptr());
        let offset = self.data.bytes.len();
        self.data.bytes.resize(offset + MAX_BINDER_OBJECT_SIZE, 0);
        let n = self.data.io.encode_local_object(
            &mut self.data.bytes[offset..], ptr);
        self.data.bytes.truncate(offset + n);
        self.record_offset(offset);
        if let Some(obj) = obj {
            // The object must outlive the parcel that references it
            let strong = obj.clone();
            self.data.cleanup.add(move || drop(strong));
        }
    }

    pub fn append_remote_object(&mut self, obj: Option<&Arc<RemoteObject>>) {
        let handle = obj.map(|o| o.handle());
        let offset = self.data.bytes.len();
        self.data.bytes.resize(offset + MAX_BINDER_OBJECT_SIZE, 0);
        let n = self.data.io.encode_remote_object(
            &mut self.data.bytes[offset..], handle);
        self.data.bytes.truncate(offset + n);
        self.record_offset(offset);
    }

    /// Duplicates the descriptor with F_DUPFD_CLOEXEC so the caller keeps
    /// ownership of the one passed in; the dup is closed with the parcel.
    /// If the dup fails the original fd is encoded as-is.
    pub fn append_fd(&mut self, fd: RawFd) {
        let offset = self.data.bytes.len();
        self.data.bytes.resize(offset + MAX_BINDER_OBJECT_SIZE, 0);
        let encoded_fd = match fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(0)) {
            Ok(dupfd) => {
                self.data.cleanup.add(move || {
                    if let Err(err) = close(dupfd) {
                        warn!("Error closing fd {}: {}", dupfd, err);
                    }
                });
                dupfd
            }
            Err(err) => {
                warn!("Error dupping fd {}: {}", fd, err);
                fd
            }
        };
        let n = self.data.io.encode_fd_object(
            &mut self.data.bytes[offset..], encoded_fd);
        self.data.bytes.truncate(offset + n);
        self.record_offset(offset);
    }

    /// Appends a buffer object pointing at `data` (copied into the parcel
    /// arena). Returns the object index usable as a child's parent.
    pub fn append_buffer_object(&mut self, data: &[u8],
        parent: Option<&Parent>) -> u32 {
        let addr = self.memdup(data);
        unsafe { self.append_buffer_object_raw(addr, data.len(), parent) }
    }

    /// Appends a buffer object pointing at raw memory. The caller guarantees
    /// that `addr..addr+size` stays valid until the parcel is dropped (arena
    /// allocations qualify).
    pub unsafe fn append_buffer_object_raw(&mut self, addr: u64, size: usize,
        parent: Option<&Parent>) -> u32 {
        let index = self.data.offsets.len() as u32;
        let offset = self.data.bytes.len();
        self.data.bytes.resize(offset + MAX_BUFFER_OBJECT_SIZE, 0);
        let n = self.data.io.encode_buffer_object(
            &mut self.data.bytes[offset..], addr, size, parent);
        self.data.bytes.truncate(offset + n);
        self.record_offset(offset);
        // Each buffer has to be 8-byte aligned in the kernel's layout
        self.data.buffers_size += sys::align8(size);
        index
    }

    fn append_fda_object(&mut self, num_fds: u32, parent: &Parent) {
        let offset = self.data.bytes.len();
        self.data.bytes.resize(offset + MAX_BUFFER_OBJECT_SIZE, 0);
        let n = self.data.io.encode_fda_object(
            &mut self.data.bytes[offset..], num_fds, parent);
        self.data.bytes.truncate(offset + n);
        self.record_offset(offset);
    }

    /// An fds block: i64 total size, the parented block buffer, then the
    /// FD_ARRAY object. A null block writes just a zero size.
    pub fn append_fds(&mut self, fds: Option<&Fds>, parent: Option<&Parent>) {
        match fds {
            Some(fds) => {
                let block = fds.to_bytes();
                let addr = self.memdup(&block);
                self.append_fds_block(addr, block.len(), fds.fds.len() as u32,
                    parent);
            }
            None => self.append_i64(0),
        }
    }

    fn append_fds_block(&mut self, addr: u64, total: usize, num_fds: u32,
        parent: Option<&Parent>) {
        self.append_i64(total as i64);
        let index = unsafe {
            self.append_buffer_object_raw(addr, total, parent)
        };
        let fda_parent = Parent { index, offset: FDS_HEADER_SIZE };
        self.append_fda_object(num_fds, &fda_parent);
    }

    /// Serializes a queue identity: the descriptor struct, its grantor
    /// vector and the backing descriptors, ready to cross to a peer.
    pub fn append_fmq_descriptor(&mut self, queue: &crate::fmq::Fmq) {
        use crate::fmq::{GRANTOR_DESCRIPTOR_SIZE, MQ_DESCRIPTOR_SIZE,
            MQ_DESCRIPTOR_FDS_OFFSET, MQ_DESCRIPTOR_GRANTORS_OFFSET};

        let desc = queue.descriptor();
        let mut grantor_bytes =
            vec![0u8; desc.grantors.len() * GRANTOR_DESCRIPTOR_SIZE];
        for (i, grantor) in desc.grantors.iter().enumerate() {
            let out = &mut grantor_bytes[i * GRANTOR_DESCRIPTOR_SIZE..];
            LE::write_u32(&mut out[0..], grantor.flags);
            LE::write_u32(&mut out[4..], grantor.fd_index);
            LE::write_u32(&mut out[8..], grantor.offset);
            LE::write_u64(&mut out[16..], grantor.extent);
        }
        let vec_addr = self.memdup(&grantor_bytes);
        let fds_block = desc.fds.to_bytes();
        let fds_addr = self.memdup(&fds_block);

        let mut mqdesc = [0u8; MQ_DESCRIPTOR_SIZE];
        LE::write_u64(&mut mqdesc[0..], vec_addr);
        LE::write_u32(&mut mqdesc[8..], desc.grantors.len() as u32);
        mqdesc[12] = 1; // owns_buffer
        LE::write_u64(&mut mqdesc[16..], fds_addr);
        LE::write_u32(&mut mqdesc[24..], desc.quantum);
        LE::write_u32(&mut mqdesc[28..], desc.flags);
        let mq_addr = self.memdup(&mqdesc);

        let index = unsafe {
            self.append_buffer_object_raw(mq_addr, MQ_DESCRIPTOR_SIZE, None)
        };
        let grantors_parent = Parent {
            index,
            offset: MQ_DESCRIPTOR_GRANTORS_OFFSET,
        };
        unsafe {
            self.append_buffer_object_raw(vec_addr, grantor_bytes.len(),
                Some(&grantors_parent));
        }
        let fds_parent = Parent { index, offset: MQ_DESCRIPTOR_FDS_OFFSET };
        self.append_fds_block(fds_addr, fds_block.len(),
            desc.fds.fds.len() as u32, Some(&fds_parent));
    }

    /* HIDL containers. A string is a 16-byte descriptor buffer plus a child
     * buffer carrying the NUL-terminated bytes; a vec is a 16-byte header
     * plus a child carrying the element array. Children link back to the
     * pointer field of their parent. */

    fn build_hidl_string_struct(&mut self, s: Option<&str>) -> (u64, u64, usize) {
        let (str_addr, len) = match s {
            Some(s) => (self.strdup(s), s.len()),
            None => (0, 0),
        };
        let mut desc = [0u8; HIDL_STRING_SIZE];
        LE::write_u64(&mut desc[0..], str_addr);
        LE::write_u32(&mut desc[8..], len as u32);
        desc[12] = 1; // owns_buffer
        (self.memdup(&desc), str_addr, len)
    }

    pub fn append_hidl_string(&mut self, s: Option<&str>) {
        let (desc_addr, str_addr, len) = self.build_hidl_string_struct(s);
        let index = unsafe {
            self.append_buffer_object_raw(desc_addr, HIDL_STRING_SIZE, None)
        };
        let parent = Parent { index, offset: HIDL_STRING_BUFFER_OFFSET };
        unsafe {
            if str_addr != 0 {
                self.append_buffer_object_raw(str_addr, len + 1, Some(&parent));
            } else {
                self.append_buffer_object_raw(0, 0, Some(&parent));
            }
        }
    }

    /// Appends a vec<T> of `count` packed elements of `elem_size` bytes.
    pub fn append_hidl_vec(&mut self, base: &[u8], count: usize, elem_size: usize) {
        debug_assert_eq!(base.len(), count * elem_size);
        let payload_addr = if base.is_empty() { 0 } else { self.memdup(base) };
        let mut vec_desc = [0u8; HIDL_VEC_SIZE];
        LE::write_u64(&mut vec_desc[0..], payload_addr);
        LE::write_u32(&mut vec_desc[8..], count as u32);
        vec_desc[12] = 1; // owns_buffer
        let vec_addr = self.memdup(&vec_desc);

        // Every vector, even an empty one, requires two buffer objects
        let index = unsafe {
            self.append_buffer_object_raw(vec_addr, HIDL_VEC_SIZE, None)
        };
        let parent = Parent { index, offset: HIDL_VEC_BUFFER_OFFSET };
        unsafe {
            self.append_buffer_object_raw(payload_addr, base.len(), Some(&parent));
        }
    }

    pub fn append_hidl_string_vec(&mut self, strv: &[&str]) {
        let count = strv.len();

        // Build the hidl_string array first so its address is known
        let mut strings = vec![0u8; count * HIDL_STRING_SIZE];
        let mut addrs = Vec::with_capacity(count);
        for (i, s) in strv.iter().enumerate() {
            let addr = self.strdup(s);
            let desc = &mut strings[i * HIDL_STRING_SIZE..];
            LE::write_u64(&mut desc[0..], addr);
            LE::write_u32(&mut desc[8..], s.len() as u32);
            desc[12] = 1;
            addrs.push((addr, s.len()));
        }
        let strings_addr = if count > 0 { self.memdup(&strings) } else { 0 };

        let mut vec_desc = [0u8; HIDL_VEC_SIZE];
        LE::write_u64(&mut vec_desc[0..], strings_addr);
        LE::write_u32(&mut vec_desc[8..], count as u32);
        vec_desc[12] = 1;
        let vec_addr = self.memdup(&vec_desc);

        let vec_index = unsafe {
            self.append_buffer_object_raw(vec_addr, HIDL_VEC_SIZE, None)
        };
        let vec_parent = Parent { index: vec_index, offset: HIDL_VEC_BUFFER_OFFSET };

        if count > 0 {
            let str_parent_index = self.data.offsets.len() as u32;
            unsafe {
                self.append_buffer_object_raw(strings_addr,
                    count * HIDL_STRING_SIZE, Some(&vec_parent));
            }
            for (i, (addr, len)) in addrs.iter().enumerate() {
                let parent = Parent {
                    index: str_parent_index,
                    offset: i * HIDL_STRING_SIZE + HIDL_STRING_BUFFER_OFFSET,
                };
                unsafe {
                    self.append_buffer_object_raw(*addr, len + 1, Some(&parent));
                }
            }
        } else {
            unsafe {
                self.append_buffer_object_raw(0, 0, Some(&vec_parent));
            }
        }
    }

    /// Writes a struct described by `ty` as a buffer-object graph. The
    /// caller guarantees that `addr` points at `ty.size` bytes of memory
    /// valid for the parcel's lifetime (use the arena helpers), with any
    /// pointer fields also arena-backed.
    pub unsafe fn append_struct(&mut self, addr: u64, ty: &WriterType,
        parent: Option<&Parent>) {
        let index = self.append_buffer_object_raw(addr, ty.size, parent);
        self.append_struct_fields(addr, ty.fields, index);
    }

    /// Writes a top-level vec<T> of `count` elements located at `addr`
    /// without copying them. Allocates the vec header from the arena.
    pub unsafe fn append_struct_vec(&mut self, addr: u64, count: usize,
        ty: &'static WriterType) {
        let mut vec_desc = [0u8; HIDL_VEC_SIZE];
        LE::write_u64(&mut vec_desc[0..], addr);
        LE::write_u32(&mut vec_desc[8..], count as u32);
        vec_desc[12] = 1;
        let vec_addr = self.memdup(&vec_desc);
        let index = self.append_buffer_object_raw(vec_addr, HIDL_VEC_SIZE, None);
        let parent = Parent { index, offset: HIDL_VEC_BUFFER_OFFSET };
        let payload_index = self.data.offsets.len() as u32;
        self.append_buffer_object_raw(addr, count * ty.size, Some(&parent));
        for i in 0..count {
            self.append_struct_elem_fields(addr + (i * ty.size) as u64,
                ty.fields, payload_index, i * ty.size);
        }
    }

    unsafe fn append_struct_fields(&mut self, base: u64,
        fields: &[WriterField], parent_index: u32) {
        self.append_struct_elem_fields(base, fields, parent_index, 0)
    }

    unsafe fn append_struct_elem_fields(&mut self, base: u64,
        fields: &[WriterField], parent_index: u32, parent_base_offset: usize) {
        for field in fields {
            let field_addr = base + field.offset as u64;
            let parent = Parent {
                index: parent_index,
                offset: parent_base_offset + field.offset,
            };
            match &field.kind {
                WriterFieldKind::Pointer(ty) => {
                    let child = (field_addr as *const u64).read_unaligned();
                    self.append_struct(child, ty, Some(&parent));
                }
                WriterFieldKind::HidlString => {
                    let str_addr = (field_addr as *const u64).read_unaligned();
                    let len = ((field_addr + 8) as *const u32).read_unaligned();
                    let parent = Parent {
                        index: parent_index,
                        offset: parent_base_offset + field.offset
                            + HIDL_STRING_BUFFER_OFFSET,
                    };
                    if str_addr != 0 {
                        self.append_buffer_object_raw(str_addr,
                            len as usize + 1, Some(&parent));
                    } else {
                        self.append_buffer_object_raw(0, 0, Some(&parent));
                    }
                }
                WriterFieldKind::HidlVec(elem) => {
                    let data_addr = (field_addr as *const u64).read_unaligned();
                    let count = ((field_addr + 8) as *const u32).read_unaligned()
                        as usize;
                    let parent = Parent {
                        index: parent_index,
                        offset: parent_base_offset + field.offset
                            + HIDL_VEC_BUFFER_OFFSET,
                    };
                    match elem {
                        Some(ty) => {
                            let payload_index = self.data.offsets.len() as u32;
                            self.append_buffer_object_raw(data_addr,
                                count * ty.size, Some(&parent));
                            for i in 0..count {
                                self.append_struct_elem_fields(
                                    data_addr + (i * ty.size) as u64,
                                    ty.fields, payload_index, i * ty.size);
                            }
                        }
                        None => {
                            self.append_buffer_object_raw(data_addr, count,
                                Some(&parent));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::IO64;

    fn new_data() -> WriterData {
        WriterData::new(&IO64)
    }

    #[test]
    fn primitives_are_padded() {
        let mut data = new_data();
        let mut w = Writer::new(&mut data);
        w.append_bool(true);
        w.append_i8(-1);
        w.append_i16(0x1234);
        w.append_i32(42);
        assert_eq!(w.bytes_written(), 16);
        assert_eq!(&w.get_data()[..4], &[1, 0, 0, 0]);
        assert_eq!(&w.get_data()[4..8], &[0xff, 0, 0, 0]);
        w.append_i64(-2);
        assert_eq!(w.bytes_written(), 24);
        assert!(data.offsets.is_empty());
        assert_eq!(data.buffers_size, 0);
    }

    #[test]
    fn string8_layout() {
        let mut data = new_data();
        let mut w = Writer::new(&mut data);
        w.append_string8(Some("test"));
        // "test" + NUL padded to 8
        assert_eq!(w.get_data(), b"test\0\0\0\0");
        let mut data = new_data();
        let mut w = Writer::new(&mut data);
        w.append_string8(None);
        assert_eq!(w.bytes_written(), 0);
    }

    #[test]
    fn string16_layout() {
        let mut data = new_data();
        let mut w = Writer::new(&mut data);
        w.append_string16(Some("ab"));
        // len=2, 'a', 'b', NUL, padded to 4 => 4 + 8 bytes
        assert_eq!(w.get_data(),
            &[2, 0, 0, 0, b'a', 0, b'b', 0, 0, 0, 0, 0]);

        let mut data = new_data();
        let mut w = Writer::new(&mut data);
        w.append_string16(None);
        assert_eq!(w.get_data(), &[0xff, 0xff, 0xff, 0xff]);

        let mut data = new_data();
        let mut w = Writer::new(&mut data);
        w.append_string16(Some(""));
        assert_eq!(w.get_data(), &[0, 0, 0, 0, 0, 0, 0xff, 0xff]);
    }

    #[test]
    fn byte_array_ff_padding() {
        let mut data = new_data();
        let mut w = Writer::new(&mut data);
        w.append_byte_array(&[1, 2, 3, 4, 5]);
        assert_eq!(w.get_data(),
            &[5, 0, 0, 0, 1, 2, 3, 4, 5, 0xff, 0xff, 0xff]);

        let mut data = new_data();
        let mut w = Writer::new(&mut data);
        w.append_byte_array(&[]);
        assert_eq!(w.get_data(), &[0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn parcelable_framing() {
        let mut data = new_data();
        let mut w = Writer::new(&mut data);
        w.append_parcelable(Some(&[9, 9, 9, 9]));
        assert_eq!(w.get_data(), &[1, 0, 0, 0, 8, 0, 0, 0, 9, 9, 9, 9]);

        let mut data = new_data();
        let mut w = Writer::new(&mut data);
        w.append_parcelable(None);
        assert_eq!(w.get_data(), &[0, 0, 0, 0]);
    }

    #[test]
    fn overwrite_i32() {
        let mut data = new_data();
        let mut w = Writer::new(&mut data);
        w.append_i32(0);
        w.append_i32(7);
        w.overwrite_i32(0, 123);
        assert_eq!(&w.get_data()[..4], &123i32.to_le_bytes());
        assert_eq!(&w.get_data()[4..8], &7i32.to_le_bytes());
        // Out of bounds is ignored
        w.overwrite_i32(100, 1);
        assert_eq!(w.bytes_written(), 8);
    }

    #[test]
    fn buffer_object_bookkeeping() {
        let mut data = new_data();
        let mut w = Writer::new(&mut data);
        let index = w.append_buffer_object(&[1, 2, 3], None);
        assert_eq!(index, 0);
        let index = w.append_buffer_object(&[4, 5], Some(&Parent {
            index, offset: 0,
        }));
        assert_eq!(index, 1);
        assert_eq!(data.offsets.len(), 2);
        assert_eq!(data.offsets[0], 0);
        assert_eq!(data.offsets[1], MAX_BUFFER_OBJECT_SIZE);
        // Both lengths rounded up to 8
        assert_eq!(data.buffers_size, 16);
    }

    #[test]
    fn hidl_string_two_buffers() {
        let mut data = new_data();
        let mut w = Writer::new(&mut data);
        w.append_hidl_string(Some("hello"));
        assert_eq!(data.offsets.len(), 2);
        // 16-byte descriptor + 6 NUL-terminated bytes rounded to 8
        assert_eq!(data.buffers_size, 16 + 8);

        let mut data = new_data();
        let mut w = Writer::new(&mut data);
        w.append_hidl_string(None);
        assert_eq!(data.offsets.len(), 2);
        assert_eq!(data.buffers_size, 16);
    }

    #[test]
    fn hidl_string_vec_object_count() {
        let mut data = new_data();
        let mut w = Writer::new(&mut data);
        w.append_hidl_string_vec(&["hello", "world"]);
        // vec header + string array + one buffer per string
        assert_eq!(data.offsets.len(), 4);
        // 16 + 2*16 + 2*align8(6)
        assert_eq!(data.buffers_size, 16 + 32 + 16);

        let mut data = new_data();
        let mut w = Writer::new(&mut data);
        w.append_hidl_string_vec(&[]);
        assert_eq!(data.offsets.len(), 2);
        assert_eq!(data.buffers_size, 16);
    }

    #[test]
    fn fds_block() {
        let mut data = new_data();
        let mut w = Writer::new(&mut data);
        let fds = Fds { fds: vec![1, 2], ints: vec![7] };
        w.append_fds(Some(&fds), None);
        // i64 size prefix, then buffer object and fda object
        assert_eq!(data.offsets.len(), 2);
        assert_eq!(data.offsets[0], 8);
        let block = fds.to_bytes();
        assert_eq!(block.len(), FDS_HEADER_SIZE + 12);
        assert_eq!(&block[..4], &(24u32).to_le_bytes());
        assert_eq!(&block[4..8], &(2u32).to_le_bytes());
        assert_eq!(&block[8..12], &(1u32).to_le_bytes());

        let mut data = new_data();
        let mut w = Writer::new(&mut data);
        w.append_fds(None, None);
        assert_eq!(w.get_data(), &0u64.to_le_bytes());
        assert!(data.offsets.is_empty());
    }

    #[test]
    fn offsets_match_object_appends() {
        let mut data = new_data();
        let mut w = Writer::new(&mut data);
        w.append_i32(1);
        w.append_buffer_object(&[0; 8], None);
        w.append_string8(Some("x"));
        w.append_buffer_object(&[0; 8], None);
        assert_eq!(data.offsets.len(), 2);
        for off in &data.offsets {
            assert!(*off < data.bytes.len());
        }
    }
}
